//! Node self-description exchanged at handshake.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};

/// Service capability bitfield advertised in [`NodeInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// Node serves the full chain; required of outbound peers.
    pub const FULL_NODE: ServiceFlags = ServiceFlags(1);

    /// Whether all bits of `flag` are set.
    pub fn contains(&self, flag: ServiceFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Set the bits of `flag`.
    pub fn insert(&mut self, flag: ServiceFlags) {
        self.0 |= flag.0;
    }
}

/// Identity and capability descriptor exchanged during the handshake.
///
/// The owning switch mutates the best-block fields under its node-info
/// lock; everyone else sees read copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Ed25519 public key identifying the node.
    pub pub_key: [u8; 32],
    /// Software version, `major.minor.patch`.
    pub version: String,
    /// Declared listen address, `ip:port`.
    pub listen_addr: String,
    /// Genesis block fingerprint; peers on a different genesis are rejected.
    pub genesis_hash: [u8; 32],
    /// Height of the best known block.
    pub best_height: u64,
    /// Hash of the best known block.
    pub best_hash: [u8; 32],
    /// Advertised service capabilities.
    pub service_flags: ServiceFlags,
}

impl NodeInfo {
    /// The peer id derived from the public key.
    pub fn peer_id(&self) -> String {
        hex::encode(self.pub_key)
    }

    /// The host part of the declared listen address.
    pub fn listen_host(&self) -> String {
        match self.listen_addr.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => self.listen_addr.clone(),
        }
    }

    /// Check protocol-level compatibility with a remote node.
    ///
    /// Versions are compatible when their major components match;
    /// both sides must share the genesis fingerprint.
    pub fn compatible_with(&self, other: &NodeInfo) -> P2pResult<()> {
        if version_major(&self.version) != version_major(&other.version) {
            return Err(P2pError::IncompatibleVersion {
                ours: self.version.clone(),
                theirs: other.version.clone(),
            });
        }

        if self.genesis_hash != other.genesis_hash {
            return Err(P2pError::WrongNetwork {
                ours: hex::encode(self.genesis_hash),
                theirs: hex::encode(other.genesis_hash),
            });
        }

        Ok(())
    }

    /// Record a new best block.
    pub(crate) fn update_best(&mut self, height: u64, hash: [u8; 32]) {
        self.best_height = height;
        self.best_hash = hash;
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (v{}, height={})",
            &self.peer_id()[..8.min(self.peer_id().len())],
            self.listen_addr,
            self.version,
            self.best_height
        )
    }
}

/// The major component of an `x.y.z` version string.
fn version_major(version: &str) -> Option<&str> {
    version.split('.').next()
}
