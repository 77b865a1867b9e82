//! The public facade of the sharded client.
//!
//! One method per cache verb. Every verb resolves; none of them raise on an
//! absent backend, a lost connection, or a timed-out command. The miss
//! sentinel is `None` (or the empty collection for fleet verbs), so callers
//! treat the cache as advisory: a failure is indistinguishable from a miss.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;

use memshard_core::{ClientConfig, ConfigError, ServerAddr};
use memshard_proto::{CommandError, Connection, Connector, TcpConnector, Value};

use crate::dispatch::{self, Buckets};
use crate::manager::ClientInner;

/// A sharded memcached client.
///
/// Keys are distributed over the configured backends with consistent
/// hashing; ring membership tracks live connections, so a backend's
/// departure redistributes only its own share of the keyspace. Cloning is
/// cheap and all clones share the same connections.
///
/// # Example
///
/// ```no_run
/// use memshard::{ClientConfig, ShardedClient};
///
/// # async fn example() -> Result<(), memshard::ConfigError> {
/// let config = ClientConfig::from_strs(["cache-1:11211", "cache-2:11211"])?;
/// let client = ShardedClient::connected(config).await?;
///
/// client.set("greeting", "hello", 0, 0).await;
/// let value = client.get("greeting").await;
/// client.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ShardedClient {
    inner: Arc<ClientInner>,
}

impl ShardedClient {
    /// Creates a client over plain TCP without connecting. Call
    /// [`ShardedClient::connect`] to bring the backends up.
    ///
    /// # Errors
    ///
    /// Fails synchronously on configuration errors (duplicate servers).
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, Arc::new(TcpConnector::default()))
    }

    /// Creates a client with a custom connector (tests substitute fakes
    /// here), without connecting.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner::new(
                config.servers,
                connector,
                config.retry_delay,
                config.command_timeout,
            )),
        })
    }

    /// Creates a client over plain TCP and waits for the initial connection
    /// attempts to settle. Backends that could not be reached keep retrying
    /// in the background.
    pub async fn connected(config: ClientConfig) -> Result<Self, ConfigError> {
        let client = Self::new(config)?;
        client.connect().await;
        Ok(client)
    }

    /// Launches a connection attempt for every idle backend and resolves
    /// once each initial attempt has settled. Never fails; backends that
    /// failed keep retrying on the configured delay. Idempotent, and clears
    /// the effect of a previous [`ShardedClient::disconnect`].
    pub async fn connect(&self) {
        self.inner.connect().await;
    }

    /// Tears the client down: cancels in-flight connection attempts, closes
    /// every live transport, and stops all reconnection. Commands awaited
    /// across the teardown resolve to the miss sentinel. Idempotent;
    /// [`ShardedClient::connect`] brings the client back.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Backends currently connected.
    pub fn connected_backends(&self) -> Vec<ServerAddr> {
        self.inner.live_backends()
    }

    /// Routes one key and runs a command against its backend under the
    /// command deadline.
    async fn issue_on<T, F, Fut>(&self, key: &str, command: F) -> Option<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, CommandError>>,
    {
        let conn = self.inner.shared.lock().router.client_for(key)?;
        let fut = command(conn.clone());
        dispatch::issue(&self.inner, &conn, fut).await
    }

    /// Retrieves a value.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let k = key.to_owned();
        self.issue_on(key, |conn| async move { conn.get(&k).await })
            .await
            .flatten()
    }

    /// Retrieves a value together with its CAS identifier (see
    /// [`ShardedClient::check_and_set`]).
    pub async fn gets(&self, key: &str) -> Option<Value> {
        let k = key.to_owned();
        self.issue_on(key, |conn| async move { conn.gets(&k).await })
            .await
            .flatten()
    }

    /// Stores a value. `Some(true)` when the backend stored it.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        flags: u32,
        exptime: u32,
    ) -> Option<bool> {
        let (k, data) = (key.to_owned(), value.into());
        self.issue_on(key, |conn| async move {
            conn.set(&k, data, flags, exptime).await
        })
        .await
    }

    /// Stores a value only if the key is absent.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        flags: u32,
        exptime: u32,
    ) -> Option<bool> {
        let (k, data) = (key.to_owned(), value.into());
        self.issue_on(key, |conn| async move {
            conn.add(&k, data, flags, exptime).await
        })
        .await
    }

    /// Stores a value only if the key is present.
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        flags: u32,
        exptime: u32,
    ) -> Option<bool> {
        let (k, data) = (key.to_owned(), value.into());
        self.issue_on(key, |conn| async move {
            conn.replace(&k, data, flags, exptime).await
        })
        .await
    }

    /// Appends to an existing value.
    pub async fn append(&self, key: &str, value: impl Into<Bytes>) -> Option<bool> {
        let (k, data) = (key.to_owned(), value.into());
        self.issue_on(key, |conn| async move { conn.append(&k, data).await })
            .await
    }

    /// Prepends to an existing value.
    pub async fn prepend(&self, key: &str, value: impl Into<Bytes>) -> Option<bool> {
        let (k, data) = (key.to_owned(), value.into());
        self.issue_on(key, |conn| async move { conn.prepend(&k, data).await })
            .await
    }

    /// Stores a value only if it is unchanged since `cas` was read with
    /// [`ShardedClient::gets`].
    pub async fn check_and_set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        flags: u32,
        exptime: u32,
        cas: u64,
    ) -> Option<bool> {
        let (k, data) = (key.to_owned(), value.into());
        self.issue_on(key, |conn| async move {
            conn.cas(&k, data, flags, exptime, cas).await
        })
        .await
    }

    /// Deletes a key. `Some(true)` when the key existed.
    pub async fn delete(&self, key: &str) -> Option<bool> {
        let k = key.to_owned();
        self.issue_on(key, |conn| async move { conn.delete(&k).await })
            .await
    }

    /// Increments a numeric value, returning the new value.
    pub async fn increment(&self, key: &str, amount: u64) -> Option<u64> {
        let k = key.to_owned();
        self.issue_on(key, |conn| async move { conn.incr(&k, amount).await })
            .await
            .flatten()
    }

    /// Decrements a numeric value, returning the new value.
    pub async fn decrement(&self, key: &str, amount: u64) -> Option<u64> {
        let k = key.to_owned();
        self.issue_on(key, |conn| async move { conn.decr(&k, amount).await })
            .await
            .flatten()
    }

    /// Retrieves many keys at once, one sub-command per live backend that
    /// owns a share of them. Keys that are missing, unroutable, or whose
    /// backend failed are simply absent from the result.
    pub async fn get_multiple<I, S>(&self, keys: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Buckets { routed, .. } =
            dispatch::partition(&self.inner, keys.into_iter().map(Into::into));
        let maps = join_all(routed.into_iter().map(|(conn, bucket)| {
            let inner = Arc::clone(&self.inner);
            async move { dispatch::issue(&inner, &conn, conn.get_multi(&bucket)).await }
        }))
        .await;
        maps.into_iter().flatten().flatten().collect()
    }

    /// Stores many pairs, one `set` per pair issued in parallel to the
    /// owning backend. The result maps every input key to `Some(true)`
    /// (stored), `Some(false)` (not stored), or `None` (unroutable or
    /// failed).
    pub async fn set_multiple<I>(
        &self,
        items: I,
        flags: u32,
        exptime: u32,
    ) -> HashMap<String, Option<bool>>
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        let mut values: HashMap<String, Bytes> = items.into_iter().collect();
        let Buckets { routed, unrouted } =
            dispatch::partition(&self.inner, values.keys().cloned().collect::<Vec<_>>());

        let mut subcommands = Vec::new();
        for (conn, bucket) in routed {
            for key in bucket {
                if let Some(data) = values.remove(&key) {
                    subcommands.push((conn.clone(), key, data));
                }
            }
        }

        let mut results: HashMap<String, Option<bool>> =
            unrouted.into_iter().map(|key| (key, None)).collect();
        let stored = join_all(subcommands.into_iter().map(|(conn, key, data)| {
            let inner = Arc::clone(&self.inner);
            async move {
                let outcome =
                    dispatch::issue(&inner, &conn, conn.set(&key, data, flags, exptime)).await;
                (key, outcome)
            }
        }))
        .await;
        results.extend(stored);
        results
    }

    /// Deletes many keys, one `delete` per key issued in parallel to the
    /// owning backend. Result semantics as [`ShardedClient::set_multiple`].
    pub async fn delete_multiple<I, S>(&self, keys: I) -> HashMap<String, Option<bool>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Buckets { routed, unrouted } =
            dispatch::partition(&self.inner, keys.into_iter().map(Into::into));

        let mut results: HashMap<String, Option<bool>> =
            unrouted.into_iter().map(|key| (key, None)).collect();
        let deleted = join_all(routed.into_iter().flat_map(|(conn, bucket)| {
            bucket.into_iter().map(move |key| {
                let conn = conn.clone();
                (conn, key)
            })
        })
        .map(|(conn, key)| {
            let inner = Arc::clone(&self.inner);
            async move {
                let outcome = dispatch::issue(&inner, &conn, conn.delete(&key)).await;
                (key, outcome)
            }
        }))
        .await;
        results.extend(deleted);
        results
    }

    /// Invalidates every item on every live backend. One entry per live
    /// backend at dispatch time; `None` marks a backend that failed to
    /// answer. Resolves to an empty list when nothing is connected.
    pub async fn flush_all(&self) -> Vec<Option<bool>> {
        let snapshot = self.inner.shared.lock().router.snapshot();
        join_all(snapshot.into_iter().map(|(_, conn)| {
            let inner = Arc::clone(&self.inner);
            async move { dispatch::issue(&inner, &conn, conn.flush_all()).await }
        }))
        .await
    }

    /// Fetches statistics from every live backend, keyed by `host:port`.
    /// Backends that fail to answer are absent. Resolves to an empty map
    /// when nothing is connected.
    pub async fn stats(&self, arg: Option<&str>) -> HashMap<String, HashMap<String, String>> {
        let arg = arg.map(str::to_owned);
        let snapshot = self.inner.shared.lock().router.snapshot();
        let rows = join_all(snapshot.into_iter().map(|(addr, conn)| {
            let inner = Arc::clone(&self.inner);
            let arg = arg.clone();
            async move {
                let stats = dispatch::issue(&inner, &conn, conn.stats(arg.as_deref())).await;
                (addr, stats)
            }
        }))
        .await;
        rows.into_iter()
            .filter_map(|(addr, stats)| stats.map(|stats| (addr.to_string(), stats)))
            .collect()
    }

    /// Fetches the version string of every live backend, keyed by
    /// `host:port`. Semantics as [`ShardedClient::stats`].
    pub async fn version(&self) -> HashMap<String, String> {
        let snapshot = self.inner.shared.lock().router.snapshot();
        let rows = join_all(snapshot.into_iter().map(|(addr, conn)| {
            let inner = Arc::clone(&self.inner);
            async move {
                let version = dispatch::issue(&inner, &conn, conn.version()).await;
                (addr, version)
            }
        }))
        .await;
        rows.into_iter()
            .filter_map(|(addr, version)| version.map(|version| (addr.to_string(), version)))
            .collect()
    }
}
