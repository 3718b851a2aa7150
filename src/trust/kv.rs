//! Key-value storage backends for the trust layer.
//!
//! Two implementations: `MemoryKv` for tests, `SledKv` for the node's
//! on-disk store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{P2pError, P2pResult};

/// Narrow key-value interface over the node's store.
pub trait KvStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> P2pResult<Option<Vec<u8>>>;

    /// Put a key-value pair.
    fn put(&self, key: &[u8], value: &[u8]) -> P2pResult<()>;

    /// Delete a key.
    fn delete(&self, key: &[u8]) -> P2pResult<()>;
}

/// In-memory backend for testing.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> P2pResult<Option<Vec<u8>>> {
        Ok(self.map.lock().expect("lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> P2pResult<()> {
        self.map
            .lock()
            .expect("lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> P2pResult<()> {
        self.map.lock().expect("lock poisoned").remove(key);
        Ok(())
    }
}

/// Persistent backend over sled.
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> P2pResult<Self> {
        let db = sled::open(path).map_err(|e| P2pError::Store(e.to_string()))?;
        Ok(Self { db })
    }
}

impl KvStore for SledKv {
    fn get(&self, key: &[u8]) -> P2pResult<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map(|value| value.map(|ivec| ivec.to_vec()))
            .map_err(|e| P2pError::Store(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> P2pResult<()> {
        self.db
            .insert(key, value)
            .map_err(|e| P2pError::Store(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| P2pError::Store(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> P2pResult<()> {
        self.db
            .remove(key)
            .map_err(|e| P2pError::Store(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| P2pError::Store(e.to_string()))?;
        Ok(())
    }
}
