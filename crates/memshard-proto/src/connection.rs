//! The per-backend command object.
//!
//! [`Connection::spawn`] starts an actor task that owns the framed stream.
//! Requests are pipelined: the actor writes each command and queues one
//! responder, then resolves responders in FIFO order as replies arrive,
//! which preserves per-backend reply ordering. When the stream closes for
//! any reason, queued responders are dropped (their commands resolve as
//! lost) and the `lost` signal fires exactly once with a [`LossReason`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::debug;

use memshard_core::ServerAddr;

use crate::codec::{MemcacheCodec, ProtocolError, Request, Response, StoreVerb, Value};

/// Why a connection's stream closed.
///
/// Consumed by the connection manager's loss handler: [`LossReason::Aborted`]
/// is produced by the dispatcher's command-deadline abort and triggers an
/// immediate, unlogged reconnect; every other reason is logged and
/// reconnected after the retry delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// Hard-closed locally via [`Connection::abort`] after a command
    /// deadline fired.
    Aborted,
    /// Gracefully closed locally via [`Connection::close`].
    Closed,
    /// The server closed the stream.
    ServerClosed,
    /// Transport-level I/O failure.
    Io(String),
    /// The server sent bytes the codec could not interpret.
    Protocol(String),
}

impl LossReason {
    /// True for the deadline-abort reason that short-circuits the retry
    /// delay.
    pub fn is_abort(&self) -> bool {
        matches!(self, LossReason::Aborted)
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Aborted => write!(f, "aborted after command timeout"),
            LossReason::Closed => write!(f, "closed"),
            LossReason::ServerClosed => write!(f, "connection closed by server"),
            LossReason::Io(e) => write!(f, "I/O error: {e}"),
            LossReason::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

/// Errors observed by one in-flight command.
///
/// Never visible to library callers: the dispatcher collapses every variant
/// to the verb's miss sentinel.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The connection closed before a reply arrived.
    #[error("connection lost before a reply arrived")]
    Lost,

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with a reply shape the verb does not produce.
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

enum Op {
    Command {
        req: Request,
        reply: oneshot::Sender<Response>,
    },
    Close,
    Abort,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Cloneable handle to one backend connection.
///
/// All clones share the same actor; the command object is safely shared by
/// every concurrent command against its backend because the actor serializes
/// writes onto the single stream.
#[derive(Clone)]
pub struct Connection {
    generation: u64,
    peer: ServerAddr,
    ops: mpsc::UnboundedSender<Op>,
    lost: watch::Receiver<Option<LossReason>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Spawns the connection actor over an established stream.
    pub fn spawn<T>(io: T, peer: ServerAddr) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = watch::channel(None);
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(run(io, peer.clone(), ops_rx, lost_tx));
        Self {
            generation,
            peer,
            ops: ops_tx,
            lost: lost_rx,
        }
    }

    /// The backend this connection is bound to.
    pub fn peer(&self) -> &ServerAddr {
        &self.peer
    }

    /// Unique id of this connection instance, used to tell a stale loss
    /// notification from one concerning the current connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolves once, when the underlying stream has closed.
    pub async fn lost(&self) -> LossReason {
        let mut lost = self.lost.clone();
        let result = match lost.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or(LossReason::Closed),
            // Sender dropped without a reason: treat as a plain close.
            Err(_) => LossReason::Closed,
        };
        result
    }

    /// Hard-closes the transport. Pending commands resolve as lost; the
    /// `lost` signal fires with [`LossReason::Aborted`].
    pub fn abort(&self) {
        let _ = self.ops.send(Op::Abort);
    }

    /// Gracefully closes the transport.
    pub fn close(&self) {
        let _ = self.ops.send(Op::Close);
    }

    async fn roundtrip(&self, req: Request) -> Result<Response, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::Command { req, reply: tx })
            .map_err(|_| CommandError::Lost)?;
        match rx.await.map_err(|_| CommandError::Lost)? {
            Response::Error(msg) => Err(CommandError::Server(msg)),
            resp => Ok(resp),
        }
    }

    /// Retrieves one value.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CommandError> {
        let resp = self
            .roundtrip(Request::Get {
                keys: vec![key.to_owned()],
                with_cas: false,
            })
            .await?;
        match resp {
            Response::Values(values) => Ok(values.into_iter().find(|v| v.key == key)),
            other => Err(unexpected(other)),
        }
    }

    /// Retrieves one value with its CAS identifier.
    pub async fn gets(&self, key: &str) -> Result<Option<Value>, CommandError> {
        let resp = self
            .roundtrip(Request::Get {
                keys: vec![key.to_owned()],
                with_cas: true,
            })
            .await?;
        match resp {
            Response::Values(values) => Ok(values.into_iter().find(|v| v.key == key)),
            other => Err(unexpected(other)),
        }
    }

    /// Retrieves several values in one command. Missing keys are absent
    /// from the returned map.
    pub async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Value>, CommandError> {
        let resp = self
            .roundtrip(Request::Get {
                keys: keys.to_vec(),
                with_cas: false,
            })
            .await?;
        match resp {
            Response::Values(values) => Ok(values
                .into_iter()
                .map(|value| (value.key.clone(), value))
                .collect()),
            other => Err(unexpected(other)),
        }
    }

    async fn store(
        &self,
        verb: StoreVerb,
        key: &str,
        data: Bytes,
        flags: u32,
        exptime: u32,
        cas: Option<u64>,
    ) -> Result<bool, CommandError> {
        let resp = self
            .roundtrip(Request::Store {
                verb,
                key: key.to_owned(),
                flags,
                exptime,
                data,
                cas,
            })
            .await?;
        match resp {
            Response::Stored => Ok(true),
            Response::NotStored | Response::Exists | Response::NotFound => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Stores a value unconditionally.
    pub async fn set(
        &self,
        key: &str,
        data: Bytes,
        flags: u32,
        exptime: u32,
    ) -> Result<bool, CommandError> {
        self.store(StoreVerb::Set, key, data, flags, exptime, None)
            .await
    }

    /// Stores a value only if the key is absent.
    pub async fn add(
        &self,
        key: &str,
        data: Bytes,
        flags: u32,
        exptime: u32,
    ) -> Result<bool, CommandError> {
        self.store(StoreVerb::Add, key, data, flags, exptime, None)
            .await
    }

    /// Stores a value only if the key is present.
    pub async fn replace(
        &self,
        key: &str,
        data: Bytes,
        flags: u32,
        exptime: u32,
    ) -> Result<bool, CommandError> {
        self.store(StoreVerb::Replace, key, data, flags, exptime, None)
            .await
    }

    /// Appends to an existing value.
    pub async fn append(&self, key: &str, data: Bytes) -> Result<bool, CommandError> {
        self.store(StoreVerb::Append, key, data, 0, 0, None).await
    }

    /// Prepends to an existing value.
    pub async fn prepend(&self, key: &str, data: Bytes) -> Result<bool, CommandError> {
        self.store(StoreVerb::Prepend, key, data, 0, 0, None).await
    }

    /// Stores a value only if it is unchanged since the given CAS
    /// identifier was read.
    pub async fn cas(
        &self,
        key: &str,
        data: Bytes,
        flags: u32,
        exptime: u32,
        cas: u64,
    ) -> Result<bool, CommandError> {
        self.store(StoreVerb::Cas, key, data, flags, exptime, Some(cas))
            .await
    }

    /// Deletes a key. Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CommandError> {
        let resp = self
            .roundtrip(Request::Delete {
                key: key.to_owned(),
            })
            .await?;
        match resp {
            Response::Deleted => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Increments a numeric value. `None` when the key does not exist.
    pub async fn incr(&self, key: &str, amount: u64) -> Result<Option<u64>, CommandError> {
        let resp = self
            .roundtrip(Request::Incr {
                key: key.to_owned(),
                amount,
            })
            .await?;
        match resp {
            Response::Number(n) => Ok(Some(n)),
            Response::NotFound => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Decrements a numeric value. `None` when the key does not exist.
    pub async fn decr(&self, key: &str, amount: u64) -> Result<Option<u64>, CommandError> {
        let resp = self
            .roundtrip(Request::Decr {
                key: key.to_owned(),
                amount,
            })
            .await?;
        match resp {
            Response::Number(n) => Ok(Some(n)),
            Response::NotFound => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Invalidates every item on the backend.
    pub async fn flush_all(&self) -> Result<bool, CommandError> {
        match self.roundtrip(Request::FlushAll).await? {
            Response::Ok => Ok(true),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches server statistics.
    pub async fn stats(
        &self,
        arg: Option<&str>,
    ) -> Result<HashMap<String, String>, CommandError> {
        let resp = self
            .roundtrip(Request::Stats {
                arg: arg.map(str::to_owned),
            })
            .await?;
        match resp {
            Response::Stats(stats) => Ok(stats),
            // An empty stats reply is a bare END, indistinguishable on the
            // wire from an empty retrieval.
            Response::Values(values) if values.is_empty() => Ok(HashMap::new()),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches the server version string.
    pub async fn version(&self) -> Result<String, CommandError> {
        match self.roundtrip(Request::Version).await? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: Response) -> CommandError {
    CommandError::Unexpected(format!("{resp:?}"))
}

async fn run<T>(
    io: T,
    peer: ServerAddr,
    mut ops: mpsc::UnboundedReceiver<Op>,
    lost: watch::Sender<Option<LossReason>>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(io, MemcacheCodec::default());
    let mut pending: VecDeque<oneshot::Sender<Response>> = VecDeque::new();

    let reason = loop {
        tokio::select! {
            op = ops.recv() => match op {
                Some(Op::Command { req, reply }) => match framed.send(req).await {
                    Ok(()) => pending.push_back(reply),
                    Err(ProtocolError::Io(e)) => break LossReason::Io(e.to_string()),
                    // Local encode rejection (bad key, oversized value):
                    // nothing hit the wire, so only this command fails.
                    Err(e) => {
                        let _ = reply.send(Response::Error(e.to_string()));
                    }
                },
                Some(Op::Abort) => break LossReason::Aborted,
                // All handles dropped counts as a graceful close.
                Some(Op::Close) | None => break LossReason::Closed,
            },
            frame = framed.next() => match frame {
                Some(Ok(resp)) => match pending.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(resp);
                    }
                    None => break LossReason::Protocol("unsolicited reply".into()),
                },
                Some(Err(e)) => break loss_of(e),
                None => break LossReason::ServerClosed,
            },
        }
    };

    // Dropping queued responders resolves their commands as lost.
    drop(pending);
    if !reason.is_abort() {
        let _ = framed.close().await;
    }
    debug!(server = %peer, reason = %reason, "connection actor stopped");
    let _ = lost.send(Some(reason));
}

fn loss_of(e: ProtocolError) -> LossReason {
    match e {
        ProtocolError::Io(e) => LossReason::Io(e.to_string()),
        other => LossReason::Protocol(other.to_string()),
    }
}
