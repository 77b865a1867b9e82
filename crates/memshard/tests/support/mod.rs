//! Test doubles: a scripted connector handing out in-memory transports.
//!
//! Each accepted connection is one half of a `tokio::io::duplex` pipe; the
//! other half is kept so tests can read the exact bytes a command put on
//! the wire and script the backend's replies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use memshard::{Connection, Connector, ServerAddr};
use memshard_core::ConnectError;

/// How the connector answers attempts for one backend.
#[derive(Clone)]
pub enum Behavior {
    /// Yield a duplex-backed connection immediately.
    Accept,
    /// Fail immediately.
    Refuse,
    /// Block until the gate is released, then accept.
    Gated(Arc<Notify>),
    /// Never resolve.
    Hang,
}

#[derive(Default)]
struct Endpoint {
    behavior: Option<Behavior>,
    attempts: usize,
    servers: VecDeque<DuplexStream>,
}

/// Scripted [`Connector`] for driving the client without a network.
#[derive(Default)]
pub struct FakeConnector {
    endpoints: Mutex<HashMap<ServerAddr, Endpoint>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_behavior(&self, addr: &ServerAddr, behavior: Behavior) {
        self.endpoints
            .lock()
            .entry(addr.clone())
            .or_default()
            .behavior = Some(behavior);
    }

    /// Number of connection attempts made for one backend so far.
    pub fn attempts(&self, addr: &ServerAddr) -> usize {
        self.endpoints
            .lock()
            .get(addr)
            .map(|ep| ep.attempts)
            .unwrap_or(0)
    }

    /// Takes the backend half of the oldest accepted connection.
    pub fn take_server(&self, addr: &ServerAddr) -> DuplexStream {
        self.endpoints
            .lock()
            .get_mut(addr)
            .and_then(|ep| ep.servers.pop_front())
            .expect("no accepted connection for backend")
    }

    fn accept(&self, addr: &ServerAddr) -> Connection {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        self.endpoints
            .lock()
            .entry(addr.clone())
            .or_default()
            .servers
            .push_back(server_io);
        Connection::spawn(client_io, addr.clone())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: &ServerAddr) -> Result<Connection, ConnectError> {
        let behavior = {
            let mut endpoints = self.endpoints.lock();
            let endpoint = endpoints.entry(addr.clone()).or_default();
            endpoint.attempts += 1;
            endpoint.behavior.clone().unwrap_or(Behavior::Accept)
        };
        match behavior {
            Behavior::Accept => Ok(self.accept(addr)),
            Behavior::Refuse => Err(ConnectError::failed(addr.clone(), "connection refused")),
            Behavior::Gated(gate) => {
                gate.notified().await;
                Ok(self.accept(addr))
            }
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Reads from the backend half until `crlfs` line terminators have arrived.
pub async fn recv_until(server: &mut DuplexStream, crlfs: usize) -> String {
    let mut out = String::new();
    while out.matches("\r\n").count() < crlfs {
        let mut buf = vec![0u8; 8192];
        let n = server.read(&mut buf).await.expect("server side read");
        assert!(n > 0, "eof while waiting for {crlfs} lines; got {out:?}");
        out.push_str(std::str::from_utf8(&buf[..n]).expect("utf-8 request"));
    }
    out
}

/// Asserts that the client half has been closed.
pub async fn recv_eof(server: &mut DuplexStream) {
    let mut buf = vec![0u8; 64];
    let n = server.read(&mut buf).await.expect("server side read");
    assert_eq!(n, 0, "expected eof, read {:?}", &buf[..n]);
}

/// Writes a scripted reply to the backend half.
pub async fn send(server: &mut DuplexStream, reply: &str) {
    server
        .write_all(reply.as_bytes())
        .await
        .expect("server side write");
}

/// Lets spawned tasks (attempts, loss watchers, actors) run to quiescence.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Computes the partition the consistent-hash ring produces for the given
/// membership, independently of the client under test.
pub fn ring_partition(servers: &[ServerAddr], keys: &[&str]) -> HashMap<ServerAddr, Vec<String>> {
    let mut ring = hashring::HashRing::new();
    for server in servers {
        ring.add(server.clone());
    }
    let mut partition: HashMap<ServerAddr, Vec<String>> = HashMap::new();
    for key in keys {
        let owner = ring.get(key).expect("non-empty ring").clone();
        partition.entry(owner).or_default().push((*key).to_owned());
    }
    partition
}
