//! # Memshard Core
//!
//! Shared types for the memshard sharded cache client:
//!
//! - **Addresses**: [`ServerAddr`], the backend descriptor used both as the
//!   consistent-hash node label and as the key of the live-connection map.
//! - **Configuration**: [`ClientConfig`], the construction-time settings of a
//!   sharded client (server list, reconnect delay, command deadline).
//! - **Errors**: the error taxonomy. Only [`ConfigError`] ever reaches a
//!   caller; everything else in the system is logged and retried.

pub mod config;
pub mod error;

pub use config::{ClientConfig, ServerAddr, DEFAULT_PORT};
pub use error::{ConfigError, ConnectError};
