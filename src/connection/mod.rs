//! Multiplexed connection transport.
//!
//! This module provides:
//! - Length-prefixed frame codec shared by handshake and data phases
//! - The multiplexed connection with prioritized channels

pub mod codec;
pub mod mconn;

pub use codec::{Frame, FrameCodec, MAX_FRAME_SIZE, NETWORK_MAGIC};
pub use mconn::{ChannelDescriptor, MultiplexConn, TrafficStatus, DEFAULT_CHANNEL_CAPACITY};

pub(crate) use mconn::{FrameStream, SendBackend};
