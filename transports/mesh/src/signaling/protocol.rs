//! Signaling wire types
//!
//! Messages travel through the room's signaling transport as JSON objects of
//! the form `{to, from, sid, roomType, type, payload, broadcaster}`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of logical connection a peer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    /// Camera/microphone connection
    #[default]
    Video,
    /// One-way screen share
    Screen,
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomType::Video => write!(f, "video"),
            RoomType::Screen => write!(f, "screen"),
        }
    }
}

/// Signaling message `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Offer,
    Answer,
    Candidate,
    ConnectivityError,
    Mute,
    Unmute,
    EndOfCandidates,
    UnshareScreen,
    Control,
    NickChanged,
    Reaction,
    RaiseHand,
    /// Anything this side does not understand
    #[serde(other)]
    Unknown,
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Opaque session description produced or consumed by the connection primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Whether the candidate line advertises a relayed (TURN) address
    pub fn is_relay(&self) -> bool {
        self.candidate.contains(" typ relay")
    }
}

/// Envelope exchanged through the signaling transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Destination session id
    #[serde(default)]
    pub to: String,

    /// Sender session id, stamped by the transport on delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Secondary session id of the logical connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    #[serde(default)]
    pub room_type: RoomType,

    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Session id of the screen sharer, present on broadcaster-originated messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster: Option<String>,
}

impl SignalingMessage {
    /// New message with no sid, payload or broadcaster
    pub fn new(to: impl Into<String>, kind: MessageType) -> Self {
        Self {
            to: to.into(),
            from: None,
            sid: None,
            room_type: RoomType::Video,
            kind,
            payload: None,
            broadcaster: None,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_room_type(mut self, room_type: RoomType) -> Self {
        self.room_type = room_type;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: impl Into<String>) -> Self {
        self.broadcaster = Some(broadcaster.into());
        self
    }

    /// Decode the payload into a typed shape
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload.clone().ok_or_else(|| {
            Error::SignalingError(format!("{:?} message without payload", self.kind))
        })?;
        serde_json::from_value(payload).map_err(|e| {
            Error::SerializationError(format!("invalid {:?} payload: {}", self.kind, e))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::SerializationError(e.to_string()))
    }
}

/// Payload of `offer` and `answer` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    pub sdp: String,

    /// Sender display name, stripped before the description is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
}

impl SessionDescriptionPayload {
    pub fn new(description: SessionDescription, nick: Option<String>) -> Self {
        Self {
            sdp_type: description.sdp_type,
            sdp: description.sdp,
            nick,
        }
    }

    /// Split into the description and the nick hint
    pub fn into_parts(self) -> (SessionDescription, Option<String>) {
        (
            SessionDescription {
                sdp_type: self.sdp_type,
                sdp: self.sdp,
            },
            self.nick,
        )
    }
}

/// Payload of `candidate` messages, `{candidate: {candidate, sdpMid, sdpMLineIndex}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Payload of `mute`/`unmute` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub name: String,
}

/// Payload of room-level `control` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: String,

    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

/// Control action muting a participant for everyone
pub const FORCE_MUTE_ACTION: &str = "forceMute";
