//! Data channel message envelope
//!
//! Every frame sent with `Peer::send_directly` is a JSON text frame of the
//! form `{"type": ..., "payload": ...}`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum serialized message size (SCTP default max message size)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Message sent peer-to-peer over a data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: Value,
}

impl ChannelMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize to a text frame
    ///
    /// Fails if the result exceeds [`MAX_MESSAGE_SIZE`].
    pub fn to_text(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "message of {} bytes exceeds maximum of {} bytes",
                text.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(text)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::SerializationError(e.to_string()))
    }
}
