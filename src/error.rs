//! P2P error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a wire frame.
    #[error("Wire encoding error: {0}")]
    Wire(String),

    /// Frame exceeds maximum allowed size.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Invalid network magic bytes.
    #[error("Invalid network magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake timed out.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Outbound TCP connect timed out.
    #[error("Dial timeout to {addr}")]
    DialTimeout { addr: SocketAddr },

    /// Software version incompatible with the remote.
    #[error("Incompatible version: ours {ours}, theirs {theirs}")]
    IncompatibleVersion { ours: String, theirs: String },

    /// Genesis hash mismatch during handshake.
    #[error("Wrong network: our genesis {ours}, their genesis {theirs}")]
    WrongNetwork { ours: String, theirs: String },

    /// Peer with the same id is already connected.
    #[error("Duplicate peer")]
    DuplicatePeer,

    /// Remote identity equals our own.
    #[error("Connect self")]
    ConnectSelf,

    /// Remote IP is on the denylist.
    #[error("Connect banned peer")]
    ConnectBannedPeer,

    /// Outbound peer does not advertise the full-node service flag.
    #[error("Outbound connect spv peer")]
    ConnectSpvPeer,

    /// Peer set is full.
    #[error("Max peers reached: {max}")]
    MaxPeersReached { max: usize },

    /// Peer not found by id.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Malformed network address or listen string.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed enode URL.
    #[error("Invalid node URL: {0}")]
    InvalidNodeUrl(String),

    /// Key-value store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// mDNS daemon failure.
    #[error("mDNS error: {0}")]
    Mdns(String),

    /// Internal channel send failed (receiver gone).
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Switch is already running.
    #[error("Switch already running")]
    AlreadyRunning,

    /// Switch is shut down.
    #[error("Switch shut down")]
    Shutdown,
}

impl P2pError {
    /// Policy rejections are expected during normal operation and are
    /// logged at Debug only.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            P2pError::DuplicatePeer
                | P2pError::ConnectSelf
                | P2pError::ConnectBannedPeer
                | P2pError::ConnectSpvPeer
        )
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
