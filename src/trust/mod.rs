//! Denylist of misbehaving or unwanted remotes.
//!
//! Ban decisions are made by external callers (reactors observing
//! protocol violations); this layer only records and enforces them.

pub mod kv;

pub use kv::{KvStore, MemoryKv, SledKv};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::error::{P2pError, P2pResult};

/// Store key holding the serialized ban map.
pub const BANNED_PEER_KEY: &[u8] = b"BannedPeer";

/// How long a ban lasts, in seconds.
pub const DEFAULT_BAN_SECONDS: i64 = 3600;

/// IP denylist with TTL, persisted on every mutation.
///
/// The map is persisted inside the critical section so the in-memory
/// state always matches the on-disk blob. Expiry timestamps serialize as
/// RFC3339 strings.
pub struct BannedPeers {
    map: Mutex<HashMap<String, DateTime<Utc>>>,
    store: Arc<dyn KvStore>,
}

impl BannedPeers {
    /// Load the ban map from the store.
    pub fn load(store: Arc<dyn KvStore>) -> P2pResult<Self> {
        let map = match store.get(BANNED_PEER_KEY)? {
            Some(blob) => serde_json::from_slice(&blob)
                .map_err(|e| P2pError::Store(format!("corrupt ban map: {}", e)))?,
            None => HashMap::new(),
        };

        Ok(Self {
            map: Mutex::new(map),
            store,
        })
    }

    /// Ban an IP for the default duration.
    pub fn ban(&self, ip: &str) -> P2pResult<()> {
        self.ban_until(ip, Utc::now() + Duration::seconds(DEFAULT_BAN_SECONDS))
    }

    /// Ban an IP until an explicit expiry.
    pub fn ban_until(&self, ip: &str, until: DateTime<Utc>) -> P2pResult<()> {
        let mut map = self.map.lock().expect("lock poisoned");
        map.insert(ip.to_string(), until);
        self.persist(&map)
    }

    /// Enforce the ban for an IP. Expired entries are lazily deleted and
    /// the map re-persisted.
    pub fn check(&self, ip: &str) -> P2pResult<()> {
        let mut map = self.map.lock().expect("lock poisoned");

        if let Some(until) = map.get(ip) {
            if Utc::now() < *until {
                return Err(P2pError::ConnectBannedPeer);
            }
            map.remove(ip);
            self.persist(&map)?;
        }

        Ok(())
    }

    /// Whether an IP currently has an entry, expired or not.
    pub fn contains(&self, ip: &str) -> bool {
        self.map.lock().expect("lock poisoned").contains_key(ip)
    }

    /// Number of entries in the map.
    pub fn len(&self) -> usize {
        self.map.lock().expect("lock poisoned").len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, map: &HashMap<String, DateTime<Utc>>) -> P2pResult<()> {
        let blob = serde_json::to_vec(map)
            .map_err(|e| P2pError::Store(format!("serialize ban map: {}", e)))?;
        self.store.put(BANNED_PEER_KEY, &blob)
    }
}
