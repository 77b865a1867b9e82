//! Command dispatch: deadlines, fan-out, and consolidation.
//!
//! Every dispatched command is one terminal transition away from done:
//! a reply delivers the value, a deadline or connection loss delivers the
//! miss sentinel. A deadline additionally hard-closes the transport, which
//! resolves every other command in flight on it and hands the slot back to
//! the connection manager for an immediate reconnect.

use std::collections::HashMap;
use std::future::Future;

use tokio::time::timeout;
use tracing::debug;

use memshard_proto::{CommandError, Connection};

use crate::manager::ClientInner;

/// Runs one command against its connection under the configured deadline.
///
/// Any failure collapses to `None`: a lost connection resolves quietly, a
/// deadline aborts the transport first.
pub(crate) async fn issue<T, F>(inner: &ClientInner, conn: &Connection, command: F) -> Option<T>
where
    F: Future<Output = Result<T, CommandError>>,
{
    match timeout(inner.command_timeout, command).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            debug!(server = %conn.peer(), error = %e, "command resolved as miss");
            None
        }
        Err(_) => {
            debug!(server = %conn.peer(), "command deadline fired, aborting transport");
            conn.abort();
            None
        }
    }
}

/// Keys grouped by the backend the ring routes them to.
pub(crate) struct Buckets {
    /// One entry per live backend that owns at least one key.
    pub routed: Vec<(Connection, Vec<String>)>,
    /// Keys with no live backend; their results are the miss sentinel.
    pub unrouted: Vec<String>,
}

/// Partitions keys by routing, against one consistent snapshot of the ring.
pub(crate) fn partition<I>(inner: &ClientInner, keys: I) -> Buckets
where
    I: IntoIterator<Item = String>,
{
    let shared = inner.shared.lock();
    let mut by_backend: HashMap<u64, (Connection, Vec<String>)> = HashMap::new();
    let mut unrouted = Vec::new();
    for key in keys {
        match shared.router.client_for(&key) {
            Some(conn) => {
                by_backend
                    .entry(conn.generation())
                    .or_insert_with(|| (conn, Vec::new()))
                    .1
                    .push(key);
            }
            None => unrouted.push(key),
        }
    }
    Buckets {
        routed: by_backend.into_values().collect(),
        unrouted,
    }
}
