//! Key-to-shard routing.
//!
//! The router owns the consistent-hash ring and the live-connection map
//! together: a backend joins or leaves both in one call, so the ring's node
//! set always equals the live map's keyset. Key distribution, tie-breaking,
//! and virtual-node policy are the ring's business; the router never
//! reorders or falls back.

use std::collections::HashMap;

use hashring::HashRing;

use memshard_core::ServerAddr;
use memshard_proto::Connection;

pub(crate) struct Router {
    ring: HashRing<ServerAddr>,
    live: HashMap<ServerAddr, Connection>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            ring: HashRing::new(),
            live: HashMap::new(),
        }
    }

    /// The connection responsible for a key, or `None` when no backend is
    /// live. Stable: a fixed membership and key always yield the same
    /// backend.
    pub fn client_for(&self, key: &str) -> Option<Connection> {
        self.ring
            .get(&key)
            .and_then(|addr| self.live.get(addr))
            .cloned()
    }

    /// True when a backend is currently connected.
    pub fn contains(&self, addr: &ServerAddr) -> bool {
        self.live.contains_key(addr)
    }

    /// Number of live backends.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Marks a backend live: inserts its connection and adds its ring node.
    pub fn insert(&mut self, addr: ServerAddr, conn: Connection) {
        debug_assert!(!self.live.contains_key(&addr));
        self.ring.add(addr.clone());
        self.live.insert(addr, conn);
    }

    /// Removes a backend, but only if the live connection is still the given
    /// generation. A stale loss notification for an already-replaced
    /// connection must not evict its successor.
    pub fn remove_if(&mut self, addr: &ServerAddr, generation: u64) -> bool {
        match self.live.get(addr) {
            Some(conn) if conn.generation() == generation => {
                self.live.remove(addr);
                self.ring.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Current live backends with their connections.
    pub fn snapshot(&self) -> Vec<(ServerAddr, Connection)> {
        self.live
            .iter()
            .map(|(addr, conn)| (addr.clone(), conn.clone()))
            .collect()
    }

    /// Empties the router, returning the connections that were live.
    pub fn drain(&mut self) -> Vec<Connection> {
        let drained: Vec<_> = self.live.drain().collect();
        for (addr, _) in &drained {
            self.ring.remove(addr);
        }
        drained.into_iter().map(|(_, conn)| conn).collect()
    }
}
