//! Opening connections to backends.
//!
//! The [`Connector`] trait is the seam between the connection manager and
//! the network: production code dials TCP through [`TcpConnector`], tests
//! substitute scripted fakes that hand out in-memory transports.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use memshard_core::{ConnectError, ServerAddr};

use crate::connection::Connection;

/// Opens one command channel to a backend.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to the given backend, yielding a live [`Connection`] or a
    /// failure. The caller owns retry policy; implementations make exactly
    /// one attempt.
    async fn connect(&self, addr: &ServerAddr) -> Result<Connection, ConnectError>;
}

/// Production connector: plain TCP with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Deadline for the TCP handshake.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm. Cache traffic is small and
    /// latency-sensitive, so this defaults to on.
    pub nodelay: bool,
    /// TCP keepalive probe interval, if keepalive is wanted.
    pub keepalive: Option<Duration>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            keepalive: Some(Duration::from_secs(30)),
        }
    }
}

impl TcpConnector {
    fn configure_socket(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(interval) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(interval);
            let socket = socket2::SockRef::from(stream);
            socket.set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &ServerAddr) -> Result<Connection, ConnectError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| ConnectError::timeout(addr.clone(), self.connect_timeout.as_secs()))?
        .map_err(|e| ConnectError::failed(addr.clone(), e.to_string()))?;

        self.configure_socket(&stream)
            .map_err(|e| ConnectError::failed(addr.clone(), e.to_string()))?;

        debug!(server = %addr, "connected");
        Ok(Connection::spawn(stream, addr.clone()))
    }
}
