//! Length-prefixed frame codec.
//!
//! Frames are encoded as:
//! - 4 bytes: network magic
//! - 4 bytes: big-endian frame length
//! - N bytes: bincode-serialized [`Frame`]

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{P2pError, P2pResult};
use crate::node_info::NodeInfo;
use crate::wire;

/// Network magic bytes identifying the bytomd wire protocol.
pub const NETWORK_MAGIC: [u8; 4] = [0x42, 0x54, 0x4D, 0x44]; // "BTMD"

/// Maximum frame size in bytes (10 MB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Header size: 4 bytes magic + 4 bytes length.
const HEADER_SIZE: usize = 8;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Handshake self-description; the first frame in each direction.
    NodeInfo(NodeInfo),
    /// Channel-tagged payload for a reactor.
    Data {
        /// The logical channel this payload belongs to.
        channel_id: u8,
        /// Opaque payload bytes, interpreted by the owning reactor.
        payload: Vec<u8>,
    },
}

/// Codec for length-prefixed frame transport.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Expected length of the current frame once the header is read.
    current_length: Option<usize>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self {
            current_length: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        if self.current_length.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let magic: [u8; 4] = src[0..4].try_into().expect("slice length checked");
            if magic != NETWORK_MAGIC {
                return Err(P2pError::InvalidMagic {
                    expected: NETWORK_MAGIC,
                    actual: magic,
                });
            }

            let length = u32::from_be_bytes(src[4..8].try_into().expect("slice length checked")) as usize;
            if length > MAX_FRAME_SIZE {
                return Err(P2pError::FrameTooLarge {
                    size: length,
                    max: MAX_FRAME_SIZE,
                });
            }

            self.current_length = Some(length);
        }

        let length = self.current_length.expect("set above");

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let frame_bytes = src.split_to(length);
        self.current_length = None;

        let frame: Frame = wire::deserialize(&frame_bytes)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = P2pError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> P2pResult<()> {
        let frame_bytes = wire::serialize(&frame)?;
        let length = frame_bytes.len();

        if length > MAX_FRAME_SIZE {
            return Err(P2pError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_slice(&NETWORK_MAGIC);
        dst.put_u32(length as u32);
        dst.put_slice(&frame_bytes);

        Ok(())
    }
}
