//! Error types for the memshard client.
//!
//! The cache is best-effort: runtime failures (connection loss, command
//! timeouts, unroutable keys) collapse to cache misses and never surface as
//! errors. The only failures a caller sees are configuration errors raised
//! synchronously at construction time.

use thiserror::Error;

use crate::config::ServerAddr;

/// Errors raised while validating client configuration.
///
/// These are the only errors that propagate to callers of the public API;
/// they are raised synchronously by the client constructor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A server descriptor could not be parsed.
    #[error("invalid server address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The same server appears more than once in the configuration.
    #[error("duplicate server address: {addr}")]
    DuplicateServer { addr: ServerAddr },
}

impl ConfigError {
    /// Creates an invalid address error.
    pub fn invalid_address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Creates a duplicate server error.
    pub fn duplicate(addr: ServerAddr) -> Self {
        Self::DuplicateServer { addr }
    }
}

/// Errors raised while establishing a connection to a backend.
///
/// Never visible to callers: a failed attempt is logged and retried after
/// the configured delay.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// The connection attempt failed outright.
    #[error("failed to connect to {addr}: {reason}")]
    Failed { addr: ServerAddr, reason: String },

    /// The connection attempt did not complete within the connect timeout.
    #[error("connection to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: ServerAddr, timeout_secs: u64 },
}

impl ConnectError {
    /// Creates a connection failed error.
    pub fn failed(addr: ServerAddr, reason: impl Into<String>) -> Self {
        Self::Failed {
            addr,
            reason: reason.into(),
        }
    }

    /// Creates a connect timeout error.
    pub fn timeout(addr: ServerAddr, timeout_secs: u64) -> Self {
        Self::Timeout { addr, timeout_secs }
    }
}
