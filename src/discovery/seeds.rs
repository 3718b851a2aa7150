//! Seed node configuration.
//!
//! Seeds are configured as a comma-separated `host:port` list. Each seed
//! is addressed by an enode URL whose id is the SHA-256 of the seed
//! string, and installed as a discovery fallback used while the node
//! table is empty.

use sha2::{Digest, Sha256};

use crate::error::{P2pError, P2pResult};
use crate::netaddress::NetAddress;

use super::table::{NodeId, NodeRecord};

/// Derive the deterministic node id for a seed string.
pub fn seed_node_id(seed: &str) -> NodeId {
    let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    NodeId(digest)
}

/// The enode URL for a seed, `enode://<hex(sha256(seed))>@host:port`.
pub fn seed_to_url(seed: &str) -> String {
    format!("enode://{}@{}", hex::encode(seed_node_id(seed).0), seed)
}

/// Parse an enode URL into a node record. The host must be an IP
/// literal; the TCP and UDP ports are the same.
pub fn parse_node_url(url: &str) -> P2pResult<NodeRecord> {
    let rest = url
        .strip_prefix("enode://")
        .ok_or_else(|| P2pError::InvalidNodeUrl(url.to_string()))?;

    let (id_hex, addr) = rest
        .split_once('@')
        .ok_or_else(|| P2pError::InvalidNodeUrl(url.to_string()))?;

    let id_bytes = hex::decode(id_hex).map_err(|_| P2pError::InvalidNodeUrl(url.to_string()))?;
    let id_bytes: [u8; 32] = id_bytes
        .try_into()
        .map_err(|_| P2pError::InvalidNodeUrl(url.to_string()))?;

    let addr: NetAddress = addr.parse()?;

    Ok(NodeRecord {
        id: NodeId(id_bytes),
        ip: addr.ip,
        tcp_port: addr.port,
        udp_port: addr.port,
    })
}

/// Expand the configured seed list into fallback node records.
pub fn seeds_from_config(seeds: &str) -> P2pResult<Vec<NodeRecord>> {
    let mut nodes = Vec::new();
    for seed in seeds.split(',') {
        let seed = seed.trim();
        if seed.is_empty() {
            continue;
        }
        nodes.push(parse_node_url(&seed_to_url(seed))?);
    }
    Ok(nodes)
}
