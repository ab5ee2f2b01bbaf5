//! Events surfaced to the application

use crate::channels::ChannelMessage;
use crate::config::IceServer;
use crate::primitive::{IceConnectionState, PeerHandle, RemoteStream, SignalingState};
use crate::signaling::protocol::RoomType;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

/// Identity of a peer at the time an event was raised
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub handle: PeerHandle,
    pub id: String,
    pub sid: String,
    pub room_type: RoomType,
}

/// Mesh event delivered on the channel returned at construction
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    CreatedPeer(PeerRef),
    PeerStreamAdded {
        peer: PeerRef,
        stream: RemoteStream,
    },
    /// Peer ended and left the registry
    PeerStreamRemoved(PeerRef),
    /// Local connection failed; callers may try `restart_ice`
    IceFailed(PeerRef),
    /// Remote side reported its connection failed
    ConnectivityError(PeerRef),
    IceConnectionStateChange {
        peer: PeerRef,
        state: IceConnectionState,
    },
    SignalingStateChange {
        peer: PeerRef,
        state: SignalingState,
    },
    NegotiationNeeded(PeerRef),
    Mute {
        id: String,
        name: Option<String>,
    },
    Unmute {
        id: String,
        name: Option<String>,
    },
    UnshareScreen {
        id: String,
    },
    RaisedHand {
        id: String,
        raised: Value,
    },
    Nick {
        id: String,
        name: Value,
    },
    Reaction {
        id: String,
        reaction: Value,
    },
    /// Local participant was muted by someone else
    ForcedMute,
    ChannelOpen {
        peer: PeerRef,
        label: String,
    },
    ChannelClose {
        peer: PeerRef,
        label: String,
    },
    ChannelError {
        peer: PeerRef,
        label: String,
        error: String,
    },
    ChannelMessage {
        peer: PeerRef,
        label: String,
        message: ChannelMessage,
    },
    /// Negotiation or channel operation failed on a peer
    PeerError {
        peer: PeerRef,
        error: String,
    },
    IceServersUpdated {
        servers: Vec<IceServer>,
    },
}

/// Sender half of the mesh event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: MeshEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("No listener for mesh event: {:?}", e.0);
        }
    }
}
