//! Signaling transport seam
//!
//! The transport delivers signaling messages between participants of a room
//! and reports room membership changes. Implementations push inbound traffic
//! into an mpsc channel of [`TransportEvent`]s handed to the orchestrator.

use super::protocol::{RoomType, SignalingMessage};
use crate::config::IceServer;
use crate::Result;
use async_trait::async_trait;

/// Outbound side of a signaling transport
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Session id of the local participant
    fn session_id(&self) -> &str;

    /// Deliver a message to `message.to`
    async fn send(&self, message: SignalingMessage) -> Result<()>;

    /// Server-side features negotiated for this connection (e.g. "mcu")
    fn has_feature(&self, _feature: &str) -> bool {
        false
    }
}

/// Inbound traffic from a signaling transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Signaling message from another participant
    Message(SignalingMessage),

    /// Participant left the room (all room types when `room_type` is None)
    Remove {
        id: String,
        room_type: Option<RoomType>,
    },

    /// Replace the ICE server list
    StunServers(Vec<IceServer>),

    /// Append to the ICE server list
    TurnServers(Vec<IceServer>),
}
