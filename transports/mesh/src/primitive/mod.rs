//! Connection primitive abstraction
//!
//! A connection primitive is the media/data connection a `Peer` drives:
//! session descriptions, ICE candidates and data channels. Its asynchronous
//! notifications are pushed into a [`PrimitiveEventSink`] tagged with the
//! owning peer's handle, and processed one at a time by the orchestrator.
//!
//! Two implementations ship with the crate: [`memory`] (scriptable,
//! deterministic) and [`rtc`] (webrtc-rs).

pub mod memory;
pub mod rtc;

use crate::config::{PeerConnectionConfig, ReceiveMedia};
use crate::signaling::protocol::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Locally unique, monotonically assigned peer key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u64);

impl PeerHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Offer creation options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

impl From<ReceiveMedia> for OfferOptions {
    fn from(media: ReceiveMedia) -> Self {
        Self {
            offer_to_receive_audio: media.offer_to_receive_audio,
            offer_to_receive_video: media.offer_to_receive_video,
            ice_restart: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Remote media stream announced by the primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub track_ids: Vec<String>,
}

/// Bidirectional message channel multiplexed over a connection
#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Send a UTF-8 text frame. Only valid while open.
    async fn send_text(&self, text: String) -> Result<()>;
}

/// Capability the orchestrator drives for each remote peer
#[async_trait]
pub trait ConnectionPrimitive: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Add a remote candidate; `None` marks the end of remote candidates
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    async fn close(&self) -> Result<()>;
}

/// Builds one connection primitive per peer
#[async_trait]
pub trait PrimitiveFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConnectionConfig,
        events: PrimitiveEventSink,
    ) -> Result<Box<dyn ConnectionPrimitive>>;
}

/// Asynchronous notification raised by a connection primitive
#[derive(Debug, Clone)]
pub enum PrimitiveEvent {
    /// Local candidate gathered
    IceCandidate(IceCandidate),
    /// Local candidate gathering finished
    EndOfCandidates,
    IceConnectionStateChange(IceConnectionState),
    SignalingStateChange(SignalingState),
    NegotiationNeeded,
    StreamAdded(RemoteStream),
    StreamRemoved,
    /// Channel opened by the remote side
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen {
        label: String,
    },
    ChannelClose {
        label: String,
    },
    ChannelError {
        label: String,
        error: String,
    },
    ChannelMessage {
        label: String,
        data: String,
    },
}

/// A primitive event tagged with the peer it belongs to
#[derive(Debug, Clone)]
pub struct PrimitiveNotification {
    pub handle: PeerHandle,
    pub event: PrimitiveEvent,
}

/// Per-peer sender used by primitive callbacks
#[derive(Debug, Clone)]
pub struct PrimitiveEventSink {
    handle: PeerHandle,
    tx: mpsc::UnboundedSender<PrimitiveNotification>,
}

impl PrimitiveEventSink {
    pub(crate) fn new(handle: PeerHandle, tx: mpsc::UnboundedSender<PrimitiveNotification>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// Queue an event for the orchestrator. Events raised after the mesh
    /// shut down are discarded.
    pub fn emit(&self, event: PrimitiveEvent) {
        let notification = PrimitiveNotification {
            handle: self.handle,
            event,
        };
        if self.tx.send(notification).is_err() {
            trace!("Dropping primitive event for {}: mesh stopped", self.handle);
        }
    }
}
