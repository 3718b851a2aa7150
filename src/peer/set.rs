//! Indexed, size-bounded collection of live peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{P2pError, P2pResult};

use super::Peer;

struct Inner {
    by_id: HashMap<String, Arc<Peer>>,
    /// Peer ids in insertion order, for stable iteration.
    order: Vec<String>,
}

/// The set of connected peers.
///
/// Internally synchronized; `list` hands out a copied snapshot so no lock
/// is held while reactors run. No two peers share an id, the size never
/// exceeds the bound, and removal is idempotent.
pub struct PeerSet {
    max: usize,
    inner: Mutex<Inner>,
}

impl PeerSet {
    /// Create an empty set bounded at `max` peers.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Add a peer. Fails on duplicate id or when the set is full.
    pub fn add(&self, peer: Arc<Peer>) -> P2pResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");

        if inner.by_id.contains_key(peer.id()) {
            return Err(P2pError::DuplicatePeer);
        }
        if inner.by_id.len() >= self.max {
            return Err(P2pError::MaxPeersReached { max: self.max });
        }

        inner.order.push(peer.id().to_string());
        inner.by_id.insert(peer.id().to_string(), peer);
        Ok(())
    }

    /// Remove a peer by id. Returns the peer if it was present.
    pub fn remove(&self, id: &str) -> Option<Arc<Peer>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let removed = inner.by_id.remove(id);
        if removed.is_some() {
            inner.order.retain(|existing| existing != id);
        }
        removed
    }

    /// Look up a peer by id.
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.lock().expect("lock poisoned").by_id.get(id).cloned()
    }

    /// Whether a peer with this id is connected.
    pub fn has(&self, id: &str) -> bool {
        self.inner.lock().expect("lock poisoned").by_id.contains_key(id)
    }

    /// Snapshot of all peers in insertion order.
    pub fn list(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Number of connected peers.
    pub fn size(&self) -> usize {
        self.inner.lock().expect("lock poisoned").by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::make_test_peer;

    #[tokio::test]
    async fn test_add_get_remove() {
        let set = PeerSet::new(10);
        let peer = make_test_peer(1).await;
        let id = peer.id().to_string();

        set.add(peer).unwrap();
        assert_eq!(set.size(), 1);
        assert!(set.has(&id));
        assert!(set.get(&id).is_some());

        let removed = set.remove(&id);
        assert!(removed.is_some());
        assert_eq!(set.size(), 0);

        // Removal is idempotent.
        assert!(set.remove(&id).is_none());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_id() {
        let set = PeerSet::new(10);
        let first = make_test_peer(1).await;
        let second = make_test_peer(1).await;

        set.add(first).unwrap();
        assert!(matches!(set.add(second), Err(P2pError::DuplicatePeer)));
        assert_eq!(set.size(), 1);
    }

    #[tokio::test]
    async fn test_size_bound() {
        let set = PeerSet::new(2);
        set.add(make_test_peer(1).await).unwrap();
        set.add(make_test_peer(2).await).unwrap();

        let overflow = make_test_peer(3).await;
        assert!(matches!(
            set.add(overflow),
            Err(P2pError::MaxPeersReached { max: 2 })
        ));
        assert_eq!(set.size(), 2);
    }

    #[tokio::test]
    async fn test_list_is_insertion_ordered() {
        let set = PeerSet::new(10);
        let a = make_test_peer(1).await;
        let b = make_test_peer(2).await;
        let id_a = a.id().to_string();
        let id_b = b.id().to_string();

        set.add(a).unwrap();
        set.add(b).unwrap();

        let listed: Vec<String> = set.list().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(listed, vec![id_a, id_b]);
    }
}
