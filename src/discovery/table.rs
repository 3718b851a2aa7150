//! Kademlia-style node table.
//!
//! Nodes are grouped into buckets by the log of the XOR distance between
//! their id and ours. Each bucket is ordered least-recently-seen first;
//! a full bucket yields the oldest entry as an eviction candidate to be
//! liveness-challenged before replacement.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::netaddress::NetAddress;

/// Nodes kept per bucket.
pub const BUCKET_SIZE: usize = 16;

/// One bucket per possible log-distance.
const NUM_BUCKETS: usize = 256;

/// 256-bit node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// A uniformly random id, used as a lookup target during refresh.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl serde::de::Visitor<'_> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("64 hex characters")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<NodeId, E> {
                let bytes = hex::decode(v).map_err(E::custom)?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| E::custom("node id must be 32 bytes"))?;
                Ok(NodeId(bytes))
            }
        }

        deserializer.deserialize_str(NodeIdVisitor)
    }
}

/// A known node: identity plus UDP/TCP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The node's id.
    pub id: NodeId,
    /// IP address of the node.
    pub ip: IpAddr,
    /// TCP port for peer connections.
    pub tcp_port: u16,
    /// UDP port for discovery.
    pub udp_port: u16,
}

impl NodeRecord {
    /// The discovery endpoint.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// The dialable peer endpoint.
    pub fn tcp_addr(&self) -> NetAddress {
        NetAddress::new(self.ip, self.tcp_port)
    }
}

/// Log2 of the XOR distance between two ids; `None` when equal.
pub fn log_distance(a: &NodeId, b: &NodeId) -> Option<usize> {
    for (i, (x, y)) in a.0.iter().zip(b.0.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return Some(255 - (i * 8 + diff.leading_zeros() as usize));
        }
    }
    None
}

/// The node table. Not internally synchronized; the discovery driver
/// wraps it in a mutex and never holds the lock across I/O.
pub struct NodeTable {
    our_id: NodeId,
    buckets: Vec<Vec<NodeRecord>>,
}

impl NodeTable {
    /// Create an empty table centered on our id.
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            buckets: vec![Vec::new(); NUM_BUCKETS],
        }
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Whether the table holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Whether a node id is present.
    pub fn contains(&self, id: &NodeId) -> bool {
        match log_distance(&self.our_id, id) {
            Some(d) => self.buckets[d].iter().any(|n| n.id == *id),
            None => false,
        }
    }

    /// Record that a node was seen alive.
    ///
    /// Known nodes move to the most-recently-seen end (endpoint updated).
    /// Unknown nodes fill free bucket space. When the bucket is full the
    /// least-recently-seen entry is returned as an eviction candidate;
    /// the caller challenges it and calls [`NodeTable::replace`] if it
    /// fails to answer.
    pub fn note_seen(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        let distance = log_distance(&self.our_id, &record.id)?;
        let bucket = &mut self.buckets[distance];

        if let Some(pos) = bucket.iter().position(|n| n.id == record.id) {
            bucket.remove(pos);
            bucket.push(record);
            return None;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.push(record);
            return None;
        }

        bucket.first().cloned()
    }

    /// Remove a node by id.
    pub fn remove(&mut self, id: &NodeId) {
        if let Some(d) = log_distance(&self.our_id, id) {
            self.buckets[d].retain(|n| n.id != *id);
        }
    }

    /// Replace an evicted node with the candidate that triggered the
    /// challenge.
    pub fn replace(&mut self, evicted: &NodeId, candidate: NodeRecord) {
        self.remove(evicted);
        self.note_seen(candidate);
    }

    /// The `count` nodes closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes();
        nodes.sort_by_key(|n| log_distance(target, &n.id).unwrap_or(0));
        nodes.truncate(count);
        nodes
    }

    /// Fill `buf` with distinct random nodes; returns how many were
    /// written. Never blocks.
    pub fn read_random_nodes(&self, buf: &mut [NodeRecord]) -> usize {
        let mut nodes = self.nodes();
        nodes.shuffle(&mut rand::thread_rng());

        let n = buf.len().min(nodes.len());
        for (slot, node) in buf.iter_mut().zip(nodes.into_iter()) {
            *slot = node;
        }
        n
    }

    /// All known nodes.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.buckets.iter().flatten().cloned().collect()
    }
}
