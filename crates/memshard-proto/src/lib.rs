//! # Memshard Proto
//!
//! Wire-level plumbing for the memshard sharded cache client:
//!
//! - **Codec** ([`codec`]): a `tokio_util` encoder/decoder pair for the
//!   memcached text protocol.
//! - **Connection** ([`connection`]): the per-backend command object. A
//!   cloneable handle over a spawned actor that owns the framed stream,
//!   pipelines requests in FIFO order, and fires a one-shot `lost` signal
//!   with a [`connection::LossReason`] when the stream closes.
//! - **Connector** ([`connector`]): the seam through which connections are
//!   opened. Production code uses [`connector::TcpConnector`]; tests plug in
//!   scripted fakes.

pub mod codec;
pub mod connection;
pub mod connector;

pub use codec::{Request, Response, StoreVerb, Value};
pub use connection::{CommandError, Connection, LossReason};
pub use connector::{Connector, TcpConnector};
