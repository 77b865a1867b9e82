//! # Memshard
//!
//! A sharded client for memcached-compatible caches.
//!
//! One [`ShardedClient`] presents a single logical cache over a pool of
//! backend servers:
//!
//! - **Routing**: each key maps to one live backend through a
//!   consistent-hash ring whose membership tracks live connections, so a
//!   backend's departure or return redistributes only its own share of the
//!   keyspace.
//! - **Lifecycle**: one persistent connection per backend, reconnected
//!   automatically after failures and losses with a configurable delay.
//! - **Best effort**: runtime failures never reach callers. A lost
//!   connection, a timed-out command, or an empty ring all resolve to the
//!   verb's miss sentinel; a command that outlives its deadline also
//!   hard-closes its transport so the backend reconnects immediately.
//!
//! Multi-key verbs fan out one sub-command per owning backend in parallel
//! and consolidate the replies; fleet verbs (`flush_all`, `stats`,
//! `version`) address every live backend at once.

mod client;
mod dispatch;
mod manager;
mod router;

pub use client::ShardedClient;

// Re-export the construction and value types callers interact with.
pub use memshard_core::{ClientConfig, ConfigError, ServerAddr, DEFAULT_PORT};
pub use memshard_proto::{Connection, Connector, TcpConnector, Value};
