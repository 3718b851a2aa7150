//! P2P configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default maximum number of connected peers.
pub const DEFAULT_MAX_NUM_PEERS: usize = 50;

/// Default minimum number of outbound connections to maintain.
pub const DEFAULT_MIN_NUM_OUTBOUND_PEERS: usize = 3;

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outbound TCP connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-channel enqueue deadline for blocking sends.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between outbound-maintenance runs.
pub const OUTBOUND_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for the P2P switch.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Listen address, `[proto://]host:port`. Proto defaults to tcp.
    /// The port is reused for UDP discovery.
    pub listen_address: String,

    /// Chain identifier, advertised in the mDNS TXT record.
    pub chain_id: String,

    /// Comma-separated `host:port` seed list for discovery fallback.
    pub seeds: String,

    /// Data directory for on-disk state (discover.db).
    pub data_dir: PathBuf,

    /// Maximum number of connected peers (inbound + outbound).
    pub max_num_peers: usize,

    /// Minimum number of outbound peers the maintenance loop targets.
    pub min_num_outbound_peers: usize,

    /// Timeout for completing the handshake.
    pub handshake_timeout: Duration,

    /// Timeout for establishing outbound TCP connections.
    pub dial_timeout: Duration,

    /// Enqueue deadline for blocking channel sends.
    pub send_timeout: Duration,

    /// Whether to announce and browse for peers on the local network.
    pub lan_discoverable: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:46656".to_string(),
            chain_id: "mainnet".to_string(),
            seeds: String::new(),
            data_dir: PathBuf::from("."),
            max_num_peers: DEFAULT_MAX_NUM_PEERS,
            min_num_outbound_peers: DEFAULT_MIN_NUM_OUTBOUND_PEERS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            lan_discoverable: true,
        }
    }
}

impl P2pConfig {
    /// Create a new configuration with the specified listen address.
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            ..Default::default()
        }
    }

    /// Set the chain identifier.
    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = chain_id.into();
        self
    }

    /// Set the seed list.
    pub fn with_seeds(mut self, seeds: impl Into<String>) -> Self {
        self.seeds = seeds.into();
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    /// Set the maximum number of peers.
    pub fn with_max_num_peers(mut self, max: usize) -> Self {
        self.max_num_peers = max;
        self
    }

    /// Set the outbound target.
    pub fn with_min_num_outbound_peers(mut self, min: usize) -> Self {
        self.min_num_outbound_peers = min;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Enable or disable LAN discovery.
    pub fn with_lan_discoverable(mut self, enabled: bool) -> Self {
        self.lan_discoverable = enabled;
        self
    }
}

/// Split a listen string into protocol and address. Proto defaults to tcp.
pub fn protocol_and_address(listen_addr: &str) -> (&str, &str) {
    match listen_addr.split_once("://") {
        Some((proto, address)) => (proto, address),
        None => ("tcp", listen_addr),
    }
}
