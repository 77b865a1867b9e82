//! Connection lifecycle management.
//!
//! One slot per configured backend, driven `Idle -> Connecting -> Connected
//! -> (loss) -> Connecting -> ...` until `disconnect()`. The router (live
//! map + ring), the pending-attempts set, and the disconnecting flag live
//! under a single mutex so the dispatcher always observes them in a
//! consistent state; nothing is awaited while the lock is held.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use memshard_core::ServerAddr;
use memshard_proto::{Connection, Connector};

use crate::router::Router;

pub(crate) struct Shared {
    pub router: Router,
    /// Abort handles of in-flight connection attempts, at most one per
    /// backend. Walked only by `disconnect()`.
    pending: std::collections::HashMap<ServerAddr, AbortHandle>,
    /// Once set, failures and losses are neither logged nor retried.
    /// Cleared only by `connect()` re-entry.
    disconnecting: bool,
}

pub(crate) struct ClientInner {
    pub servers: Vec<ServerAddr>,
    pub connector: Arc<dyn Connector>,
    pub retry_delay: Duration,
    pub command_timeout: Duration,
    pub shared: Mutex<Shared>,
}

impl ClientInner {
    pub fn new(
        servers: Vec<ServerAddr>,
        connector: Arc<dyn Connector>,
        retry_delay: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            servers,
            connector,
            retry_delay,
            command_timeout,
            shared: Mutex::new(Shared {
                router: Router::new(),
                pending: std::collections::HashMap::new(),
                disconnecting: false,
            }),
        }
    }

    /// Launches one connection attempt per idle backend and waits until
    /// every launched attempt has settled (connected, failed, or was
    /// cancelled). Clears the disconnecting flag. Never fails.
    pub async fn connect(self: &Arc<Self>) {
        let mut settled = Vec::new();
        {
            let mut shared = self.shared.lock();
            shared.disconnecting = false;
            for addr in self.servers.clone() {
                if shared.router.contains(&addr) || shared.pending.contains_key(&addr) {
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                self.launch_attempt(&mut shared, addr, Some(tx));
                settled.push(rx);
            }
        }
        for rx in settled {
            // A dropped sender (cancelled attempt) also counts as settled.
            let _ = rx.await;
        }
    }

    /// Sets the disconnecting flag, cancels pending attempts, and closes
    /// every live transport. Idempotent.
    pub fn disconnect(&self) {
        let drained = {
            let mut shared = self.shared.lock();
            shared.disconnecting = true;
            for (_, handle) in shared.pending.drain() {
                handle.abort();
            }
            shared.router.drain()
        };
        debug!(live = drained.len(), "disconnecting from all backends");
        for conn in drained {
            conn.close();
        }
    }

    /// Spawns a connection attempt for `addr` and records its abort handle.
    /// Caller must hold the lock and have verified the slot is idle.
    fn launch_attempt(
        self: &Arc<Self>,
        shared: &mut Shared,
        addr: ServerAddr,
        settled: Option<oneshot::Sender<()>>,
    ) {
        let inner = Arc::clone(self);
        let task_addr = addr.clone();
        let handle = tokio::spawn(async move {
            let result = inner.connector.connect(&task_addr).await;
            {
                let mut shared = inner.shared.lock();
                shared.pending.remove(&task_addr);
                match result {
                    Ok(conn) if shared.disconnecting => {
                        drop(shared);
                        conn.close();
                    }
                    Ok(conn) => {
                        debug!(server = %task_addr, "backend connected");
                        shared.router.insert(task_addr.clone(), conn.clone());
                        drop(shared);
                        inner.watch_loss(task_addr, conn);
                    }
                    Err(_) if shared.disconnecting => {}
                    Err(e) => {
                        warn!(server = %task_addr, error = %e, "connection attempt failed");
                        drop(shared);
                        inner.schedule_reconnect(task_addr);
                    }
                }
            }
            if let Some(settled) = settled {
                let _ = settled.send(());
            }
        })
        .abort_handle();
        shared.pending.insert(addr, handle);
    }

    /// Re-launches an attempt after the retry delay. The delayed task is
    /// not a pending attempt; it re-checks the slot and the disconnecting
    /// flag when it fires, so `disconnect()` never has to chase timers.
    fn schedule_reconnect(self: &Arc<Self>, addr: ServerAddr) {
        let inner = Arc::clone(self);
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut shared = inner.shared.lock();
            if shared.disconnecting
                || shared.router.contains(&addr)
                || shared.pending.contains_key(&addr)
            {
                return;
            }
            inner.launch_attempt(&mut shared, addr, None);
        });
    }

    /// Watches one connection's loss signal and drives the slot back to
    /// `Connecting`.
    fn watch_loss(self: &Arc<Self>, addr: ServerAddr, conn: Connection) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let reason = conn.lost().await;
            let mut shared = inner.shared.lock();
            if !shared.router.remove_if(&addr, conn.generation()) {
                return;
            }
            if shared.disconnecting {
                return;
            }
            if reason.is_abort() {
                // Deadline abort is not a real failure: reconnect now,
                // without logging.
                if !shared.pending.contains_key(&addr) {
                    inner.launch_attempt(&mut shared, addr, None);
                }
            } else {
                warn!(server = %addr, reason = %reason, "connection lost");
                drop(shared);
                inner.schedule_reconnect(addr);
            }
        });
    }

    /// Backends currently connected.
    pub fn live_backends(&self) -> Vec<ServerAddr> {
        self.shared
            .lock()
            .router
            .snapshot()
            .into_iter()
            .map(|(addr, _)| addr)
            .collect()
    }
}
