//! Peer stream framing.
//!
//! Every peer-to-peer stream carries exactly two frames: a [`StreamHeader`]
//! naming the protocol and both endpoints, followed by one
//! [`Message`](tfagent_types::Message) record. Each frame is JSON prefixed
//! with a 4-byte big-endian length header.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Protocol identifier of message streams.
pub const PROTOCOL_ID: &str = "/tfagent/message/1.0.0";

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// First frame of every peer stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Protocol the stream was opened under.
    pub protocol: String,
    /// Node ID of the opening side.
    pub from: String,
    /// Node ID the opening side expects to reach.
    pub to: String,
}

impl StreamHeader {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_ID.to_string(),
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Encode a value to bytes (4-byte big-endian length + JSON).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON frame body.
pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}
