//! Client configuration: backend addresses and timing knobs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The port assumed when a server descriptor omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// Delay between a failed or lost connection and the next attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Deadline for a single dispatched command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Address of one backend cache server.
///
/// The rendered `host:port` form is the backend's identity throughout the
/// client: it labels the consistent-hash ring node, keys the live-connection
/// map, and tags log records and `stats`/`version` replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddr {
    /// Creates an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = ConfigError;

    /// Parses `"host:port"` or a bare `"host"` (which gets [`DEFAULT_PORT`]).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::invalid_address(s, "empty address"));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(ConfigError::invalid_address(s, "empty host"));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::invalid_address(s, "invalid port"))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl From<(String, u16)> for ServerAddr {
    fn from((host, port): (String, u16)) -> Self {
        Self::new(host, port)
    }
}

impl From<(&str, u16)> for ServerAddr {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

/// Construction-time settings for a sharded client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend servers. The set is fixed for the lifetime of the client;
    /// duplicates are rejected by [`ClientConfig::validate`].
    pub servers: Vec<ServerAddr>,
    /// Delay before reattempting a failed or lost connection.
    pub retry_delay: Duration,
    /// Deadline for one dispatched command. When it fires, the command
    /// resolves to a miss and the backend's transport is hard-closed.
    pub command_timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration with default timing for the given servers.
    pub fn new(servers: Vec<ServerAddr>) -> Self {
        Self {
            servers,
            retry_delay: DEFAULT_RETRY_DELAY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Creates a configuration by parsing `"host:port"` descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error if any descriptor is malformed.
    pub fn from_strs<I, S>(servers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let servers = servers
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(servers))
    }

    /// Sets the reconnect delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the per-command deadline.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// An empty server list is valid (every command resolves to a miss);
    /// duplicate addresses are not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for addr in &self.servers {
            if !seen.insert(addr) {
                return Err(ConfigError::duplicate(addr.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let addr: ServerAddr = "cache-1:11212".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("cache-1", 11212));
        assert_eq!(addr.to_string(), "cache-1:11212");
    }

    #[test]
    fn test_parse_bare_host_gets_default_port() {
        let addr: ServerAddr = "cache-1".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("cache-1", DEFAULT_PORT));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("".parse::<ServerAddr>().is_err());
        assert!(":11211".parse::<ServerAddr>().is_err());
        assert!("cache-1:".parse::<ServerAddr>().is_err());
        assert!("cache-1:notaport".parse::<ServerAddr>().is_err());
        assert!("cache-1:99999".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_strs(["a", "b:11212"]).unwrap();
        assert_eq!(config.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(config.servers.len(), 2);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = ClientConfig::from_strs(["a:1", "b:2", "a:1"]).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::duplicate(ServerAddr::new("a", 1)))
        );
    }

    #[test]
    fn test_validate_accepts_empty_list() {
        assert!(ClientConfig::new(Vec::new()).validate().is_ok());
    }
}
