//! Deterministic binary encoding for wire frames and discovery packets.
//!
//! Uses fixed-size integer encoding and little-endian byte order so the
//! same value encodes identically on every platform.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{P2pError, P2pResult};

fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Serialize a value to bytes.
pub fn serialize<T: Serialize>(value: &T) -> P2pResult<Vec<u8>> {
    config()
        .serialize(value)
        .map_err(|e| P2pError::Wire(e.to_string()))
}

/// Deserialize a value from bytes. Trailing bytes are rejected.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> P2pResult<T> {
    config()
        .deserialize(bytes)
        .map_err(|e| P2pError::Wire(e.to_string()))
}
