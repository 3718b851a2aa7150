//! P2P networking for the bytomd blockchain node.
//!
//! This crate provides the peer-to-peer switch:
//!
//! - Peer lifecycle: handshake, identity and compatibility checks,
//!   bounded peer set, outbound maintenance, ban enforcement
//! - One multiplexed TCP connection per peer carrying prioritized
//!   channels, fanned out to subsystem reactors
//! - Peer discovery via a UDP Kademlia-style node table and an mDNS
//!   beacon on the local network
//! - A persisted denylist with TTL
//!
//! # Architecture
//!
//! The switch uses a task-per-peer architecture where each connection
//! runs a send scheduler and a receive dispatcher in their own tokio
//! tasks. Components communicate over channels.
//!
//! ```text
//! Switch
//! ├── Listener Task (accept incoming)
//! ├── Maintenance Task (outbound top-up, 10s)
//! ├── Event Task (peer teardown)
//! ├── Peer Task pair per peer (send scheduler, receive dispatcher)
//! └── Discovery Tasks (UDP table driver, mDNS responder/resolver)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use bytomd_p2p::{P2pConfig, Switch};
//! use bytomd_p2p::discovery::Network;
//! use bytomd_p2p::trust::SledKv;
//! use std::sync::Arc;
//!
//! let config = P2pConfig::new("0.0.0.0:46656");
//! let store = Arc::new(SledKv::open("trusthistory")?);
//! let switch = Switch::new(config, genesis_hash, height, hash, Some(discv), store)?;
//! switch.add_reactor("sync", sync_reactor);
//! switch.start().await?;
//! ```

pub mod config;
pub mod error;

pub mod connection;
pub mod discovery;
pub mod lan;
pub mod netaddress;
pub mod node_info;
pub mod peer;
pub mod reactor;
pub mod switch;
pub mod trust;
pub mod wire;

// Re-export main types
pub use config::P2pConfig;
pub use connection::{ChannelDescriptor, Frame, FrameCodec, MultiplexConn, TrafficStatus};
pub use discovery::{Discv, Network, NodeId, NodeRecord};
pub use error::{P2pError, P2pResult};
pub use lan::{LanDiscover, LanPeerEvent};
pub use netaddress::NetAddress;
pub use node_info::{NodeInfo, ServiceFlags};
pub use peer::{Direction, Peer, PeerSet};
pub use reactor::{Reactor, ReactorRegistry};
pub use switch::Switch;
