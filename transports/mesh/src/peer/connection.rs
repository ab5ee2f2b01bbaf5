//! Per-peer negotiation state machine
//!
//! A `Peer` wraps one connection primitive for one remote participant
//! session. It turns inbound signaling messages into primitive calls, turns
//! primitive notifications into outbound signaling messages and mesh events,
//! and queues data channel messages until their channel opens.
//!
//! Peers never touch the registry directly: everything they produce is sent
//! as a [`PeerNotice`] and applied by the registry once the current
//! operation returns.

use super::lifecycle::{IceRestartBudget, PeerState};
use crate::channels::{ChannelMessage, ChannelTable};
use crate::config::{
    Capabilities, IceFailureReporting, IceTransportPolicy, MeshConfig, ReceiveMedia,
};
use crate::events::{MeshEvent, PeerRef};
use crate::primitive::{
    ChannelState, ConnectionPrimitive, DataChannel, IceConnectionState, OfferOptions, PeerHandle,
    PrimitiveEvent, RemoteStream, SignalingState,
};
use crate::signaling::protocol::{
    CandidatePayload, IceCandidate, MediaPayload, MessageType, RoomType, SdpType,
    SessionDescription, SessionDescriptionPayload, SignalingMessage,
};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

/// Generate a sid for a locally initiated connection
pub fn new_sid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Output of a peer, applied by the registry
#[derive(Debug)]
pub(crate) enum PeerNotice {
    Signal(SignalingMessage),
    Event(MeshEvent),
    Ended(PeerHandle),
}

/// Room-wide settings shared by every peer
#[derive(Debug, Clone)]
pub(crate) struct PeerSettings {
    pub nick: Option<String>,
    pub capabilities: Capabilities,
    pub enable_data_channels: bool,
    pub receive_media: ReceiveMedia,
    pub ice_failure_reporting: IceFailureReporting,
    pub ice_transport_policy: IceTransportPolicy,
    pub max_ice_restarts: u32,
    pub default_channel_label: String,
}

impl PeerSettings {
    pub fn new(config: &MeshConfig, capabilities: Capabilities) -> Self {
        Self {
            nick: config.nick.clone(),
            capabilities,
            enable_data_channels: config.enable_data_channels,
            receive_media: config.receive_media,
            ice_failure_reporting: config.ice_failure_reporting,
            ice_transport_policy: config.peer_connection.ice_transport_policy,
            max_ice_restarts: config.max_ice_restarts,
            default_channel_label: config.default_channel_label.clone(),
        }
    }
}

/// Options for `MeshRegistry::create_peer`
#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    /// Remote participant session id
    pub id: String,

    /// Generated when absent
    pub sid: Option<String>,

    pub room_type: RoomType,

    /// Overrides the room default when set
    pub enable_data_channels: Option<bool>,

    /// This side is the one sharing its screen
    pub share_my_screen: bool,

    /// Session id of the screen sharer
    pub broadcaster: Option<String>,

    /// Overrides the room default when set
    pub receive_media: Option<ReceiveMedia>,
}

impl PeerOptions {
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn screen(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            room_type: RoomType::Screen,
            enable_data_channels: Some(false),
            ..Self::default()
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_data_channels(mut self, enabled: bool) -> Self {
        self.enable_data_channels = Some(enabled);
        self
    }

    pub fn with_receive_media(mut self, media: ReceiveMedia) -> Self {
        self.receive_media = Some(media);
        self
    }

    /// Mark this side as the screen sharer
    pub fn sharing_screen(mut self, local_session_id: impl Into<String>) -> Self {
        self.share_my_screen = true;
        self.broadcaster = Some(local_session_id.into());
        self
    }
}

/// Connection to one remote participant session
pub struct Peer {
    handle: PeerHandle,
    id: String,
    sid: String,
    room_type: RoomType,
    share_my_screen: bool,
    broadcaster: Option<String>,
    enable_data_channels: bool,
    receive_media: ReceiveMedia,

    /// Remote display name from the first offer or answer carrying one
    nick: Option<String>,

    connection: Box<dyn ConnectionPrimitive>,
    channels: ChannelTable,
    remote_stream: Option<RemoteStream>,

    state: PeerState,
    closed: bool,
    awaiting_answer: bool,
    last_local_type: Option<SdpType>,
    local_failure_reported: bool,
    restarts: IceRestartBudget,

    settings: Arc<PeerSettings>,
    notices: mpsc::UnboundedSender<PeerNotice>,
}

impl Peer {
    pub(crate) fn new(
        handle: PeerHandle,
        options: PeerOptions,
        connection: Box<dyn ConnectionPrimitive>,
        settings: Arc<PeerSettings>,
        notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        Self {
            handle,
            sid: options.sid.unwrap_or_else(new_sid),
            id: options.id,
            room_type: options.room_type,
            share_my_screen: options.share_my_screen,
            broadcaster: options.broadcaster,
            enable_data_channels: options
                .enable_data_channels
                .unwrap_or(settings.enable_data_channels),
            receive_media: options.receive_media.unwrap_or(settings.receive_media),
            nick: None,
            connection,
            channels: ChannelTable::new(),
            remote_stream: None,
            state: PeerState::New,
            closed: false,
            awaiting_answer: false,
            last_local_type: None,
            local_failure_reported: false,
            restarts: IceRestartBudget::new(settings.max_ice_restarts),
            settings,
            notices,
        }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn room_type(&self) -> RoomType {
        self.room_type
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn broadcaster(&self) -> Option<&str> {
        self.broadcaster.as_deref()
    }

    pub fn shares_my_screen(&self) -> bool {
        self.share_my_screen
    }

    /// Screen peer on the sharing side
    pub fn is_broadcaster(&self) -> bool {
        self.room_type == RoomType::Screen && self.share_my_screen
    }

    /// Screen peer on the watching side
    pub fn is_viewer(&self) -> bool {
        self.room_type == RoomType::Screen && !self.share_my_screen
    }

    pub fn data_channels_enabled(&self) -> bool {
        self.enable_data_channels
    }

    /// Whether the last local description applied was an offer
    pub fn is_offerer(&self) -> bool {
        self.last_local_type == Some(SdpType::Offer)
    }

    pub fn is_awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    pub fn has_channel(&self, label: &str) -> bool {
        self.channels.contains(label)
    }

    /// Messages queued for `label` until it opens
    pub fn pending_count(&self, label: &str) -> usize {
        self.channels.pending_len(label)
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.connection.ice_connection_state()
    }

    pub fn restarts_remaining(&self) -> u32 {
        self.restarts.remaining()
    }

    /// An ICE restart is only issued by the offering side from a stable state
    pub fn can_restart_ice(&self) -> bool {
        !self.closed
            && self.is_offerer()
            && self.connection.signaling_state() == SignalingState::Stable
            && self.restarts.can_restart()
    }

    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            handle: self.handle,
            id: self.id.clone(),
            sid: self.sid.clone(),
            room_type: self.room_type,
        }
    }

    /// Open the default data channel (if enabled) and send an offer
    #[instrument(skip(self), fields(peer = %self.id, sid = %self.sid))]
    pub(crate) async fn start(&mut self) {
        if self.closed {
            warn!("Not starting closed peer");
            return;
        }

        if self.enable_data_channels {
            let label = self.settings.default_channel_label.clone();
            if self.get_data_channel(&label).await.is_err() {
                debug!("Continuing negotiation without data channel");
            }
        }

        self.offer(OfferOptions::from(self.receive_media)).await;
    }

    /// Renegotiate with fresh ICE credentials. Returns false if not allowed.
    #[instrument(skip(self), fields(peer = %self.id, sid = %self.sid))]
    pub(crate) async fn ice_restart(&mut self) -> bool {
        if !self.can_restart_ice() {
            debug!(
                offerer = self.is_offerer(),
                remaining = self.restarts.remaining(),
                "ICE restart not permitted"
            );
            return false;
        }

        self.restarts.record();
        info!(
            "Restarting ICE ({} attempt(s) left)",
            self.restarts.remaining()
        );

        let mut options = OfferOptions::from(self.receive_media);
        options.ice_restart = true;
        self.offer(options).await;
        true
    }

    async fn offer(&mut self, options: OfferOptions) {
        if self.state == PeerState::New {
            self.transition(PeerState::Negotiating);
        }

        let offer = match self.connection.create_offer(options).await {
            Ok(offer) => offer,
            Err(e) => {
                self.report_error("create offer", &e);
                return;
            }
        };

        if let Err(e) = self.connection.set_local_description(offer.clone()).await {
            self.report_error("apply local offer", &e);
            return;
        }

        self.last_local_type = Some(SdpType::Offer);
        self.awaiting_answer = true;

        let payload = SessionDescriptionPayload::new(offer, self.settings.nick.clone());
        self.send_payload(MessageType::Offer, &payload);
    }

    async fn answer(&mut self) {
        let answer = match self.connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.report_error("create answer", &e);
                return;
            }
        };

        if let Err(e) = self.connection.set_local_description(answer.clone()).await {
            self.report_error("apply local answer", &e);
            return;
        }

        self.last_local_type = Some(SdpType::Answer);

        let payload = SessionDescriptionPayload::new(answer, self.settings.nick.clone());
        self.send_payload(MessageType::Answer, &payload);
    }

    /// Apply one inbound signaling message
    pub(crate) async fn handle_message(&mut self, message: SignalingMessage) {
        if self.closed {
            debug!(
                peer = %self.id,
                kind = ?message.kind,
                "Dropping signaling message for closed peer"
            );
            return;
        }

        debug!(peer = %self.id, sid = %self.sid, kind = ?message.kind, "Handling signaling message");

        match message.kind {
            MessageType::Offer => {
                let Some(description) = self.take_description(&message) else {
                    return;
                };
                self.handle_offer(description).await;
            }
            MessageType::Answer => {
                if !self.awaiting_answer {
                    warn!(peer = %self.id, "Discarding answer: no offer outstanding");
                    return;
                }
                let Some(description) = self.take_description(&message) else {
                    return;
                };
                self.handle_answer(description).await;
            }
            MessageType::Candidate => match message.payload_as::<CandidatePayload>() {
                Ok(payload) => self.add_remote_candidate(Some(payload.candidate)).await,
                Err(e) => warn!(peer = %self.id, "Ignoring candidate: {}", e),
            },
            MessageType::EndOfCandidates => self.add_remote_candidate(None).await,
            MessageType::ConnectivityError => {
                if self.settings.ice_failure_reporting == IceFailureReporting::Symmetric
                    && self.local_failure_reported
                {
                    debug!(peer = %self.id, "Remote connectivity error already reported locally");
                    return;
                }
                self.emit(MeshEvent::ConnectivityError(self.peer_ref()));
            }
            MessageType::Mute | MessageType::Unmute => {
                let id = message.from.clone().unwrap_or_else(|| self.id.clone());
                let name = message.payload_as::<MediaPayload>().ok().map(|p| p.name);
                let event = if message.kind == MessageType::Mute {
                    MeshEvent::Mute { id, name }
                } else {
                    MeshEvent::Unmute { id, name }
                };
                self.emit(event);
            }
            MessageType::UnshareScreen => {
                self.emit(MeshEvent::UnshareScreen {
                    id: self.id.clone(),
                });
                if self.room_type == RoomType::Screen {
                    self.end().await;
                } else {
                    warn!(peer = %self.id, "unshareScreen received on a video peer");
                }
            }
            kind => {
                debug!(peer = %self.id, kind = ?kind, "Ignoring signaling message");
            }
        }
    }

    fn take_description(&mut self, message: &SignalingMessage) -> Option<SessionDescription> {
        match message.payload_as::<SessionDescriptionPayload>() {
            Ok(payload) => {
                let (description, nick) = payload.into_parts();
                if self.nick.is_none() {
                    self.nick = nick;
                }
                Some(description)
            }
            Err(e) => {
                warn!(peer = %self.id, "Ignoring {:?}: {}", message.kind, e);
                None
            }
        }
    }

    async fn handle_offer(&mut self, description: SessionDescription) {
        if self.state == PeerState::New {
            self.transition(PeerState::Negotiating);
        }

        if let Err(e) = self.connection.set_remote_description(description).await {
            self.report_error("apply remote offer", &e);
            return;
        }

        self.answer().await;
    }

    async fn handle_answer(&mut self, description: SessionDescription) {
        match self.connection.set_remote_description(description).await {
            Ok(()) => {
                self.awaiting_answer = false;
                debug!(peer = %self.id, "Remote answer applied");
            }
            Err(e) => self.report_error("apply remote answer", &e),
        }
    }

    async fn add_remote_candidate(&mut self, candidate: Option<IceCandidate>) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!(peer = %self.id, "Failed to add remote ICE candidate: {}", e);
        }
    }

    /// Queue a signaling message addressed to this peer
    pub(crate) fn send(&self, kind: MessageType, payload: Option<Value>) {
        let message = SignalingMessage {
            to: self.id.clone(),
            from: None,
            sid: Some(self.sid.clone()),
            room_type: self.room_type,
            kind,
            payload,
            broadcaster: self.broadcaster.clone(),
        };
        debug!(peer = %self.id, sid = %self.sid, kind = ?kind, "Sending signaling message");
        self.notify(PeerNotice::Signal(message));
    }

    fn send_payload<T: Serialize>(&self, kind: MessageType, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(kind, Some(value)),
            Err(e) => self.report_error(&format!("encode {:?}", kind), &Error::from(e)),
        }
    }

    /// Send over a data channel, queueing until it opens
    ///
    /// Returns true only if the message was handed to an open channel.
    pub(crate) async fn send_directly(&mut self, label: &str, kind: &str, payload: Value) -> bool {
        if self.closed {
            warn!(peer = %self.id, "Not sending '{}' to closed peer", kind);
            return false;
        }

        let message = ChannelMessage::new(kind, payload);
        let channel = match self.get_data_channel(label).await {
            Ok(channel) => channel,
            Err(_) => return false,
        };

        if channel.ready_state() != ChannelState::Open {
            debug!(peer = %self.id, label, "Channel not open, queueing '{}'", kind);
            self.channels.enqueue(label, message);
            return false;
        }

        // Open before its notification was applied: earlier messages go first
        if self.channels.pending_len(label) > 0 {
            self.flush_pending(label).await;
        }

        self.transmit(channel.as_ref(), &message).await
    }

    async fn transmit(&self, channel: &dyn DataChannel, message: &ChannelMessage) -> bool {
        let result = match message.to_text() {
            Ok(text) => channel.send_text(text).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.report_error(
                    &format!("send '{}' on channel '{}'", message.kind, channel.label()),
                    &e,
                );
                false
            }
        }
    }

    /// Look up a channel by label, creating it on first use
    pub(crate) async fn get_data_channel(&mut self, label: &str) -> Result<Arc<dyn DataChannel>> {
        if !self.settings.capabilities.data_channel_supported {
            let err = Error::DataChannelUnsupported;
            self.report_error("open data channel", &err);
            return Err(err);
        }

        if let Some(channel) = self.channels.get(label) {
            return Ok(channel);
        }

        if self.closed {
            return Err(Error::PeerClosed(self.id.clone()));
        }

        match self.connection.create_data_channel(label).await {
            Ok(channel) => {
                debug!(peer = %self.id, label, "Created data channel");
                self.channels.insert(channel.clone());
                Ok(channel)
            }
            Err(e) => {
                self.report_error(&format!("create data channel '{}'", label), &e);
                Err(e)
            }
        }
    }

    async fn flush_pending(&mut self, label: &str) {
        let Some(channel) = self.channels.get(label) else {
            return;
        };
        if channel.ready_state() != ChannelState::Open || self.channels.pending_len(label) == 0 {
            return;
        }

        let queued = self.channels.take_pending(label);
        debug!(peer = %self.id, label, "Flushing {} queued message(s)", queued.len());
        for message in queued {
            self.transmit(channel.as_ref(), &message).await;
        }
    }

    /// Apply one notification from the connection primitive
    pub(crate) async fn handle_primitive_event(&mut self, event: PrimitiveEvent) {
        if self.closed {
            trace!(peer = %self.id, "Ignoring {:?} on closed peer", event);
            return;
        }

        match event {
            PrimitiveEvent::IceCandidate(candidate) => self.on_local_candidate(candidate),
            PrimitiveEvent::EndOfCandidates => {
                debug!(peer = %self.id, "End of candidates");
                self.send(MessageType::EndOfCandidates, None);
            }
            PrimitiveEvent::IceConnectionStateChange(ice) => self.on_ice_state(ice),
            PrimitiveEvent::SignalingStateChange(state) => {
                self.emit(MeshEvent::SignalingStateChange {
                    peer: self.peer_ref(),
                    state,
                });
            }
            PrimitiveEvent::NegotiationNeeded => {
                self.emit(MeshEvent::NegotiationNeeded(self.peer_ref()));
            }
            PrimitiveEvent::StreamAdded(stream) => {
                if let Some(existing) = &self.remote_stream {
                    warn!(
                        peer = %self.id,
                        "Already have remote stream {}, ignoring {}",
                        existing.id,
                        stream.id
                    );
                    return;
                }
                info!(peer = %self.id, stream = %stream.id, "Remote stream added");
                self.remote_stream = Some(stream.clone());
                self.emit(MeshEvent::PeerStreamAdded {
                    peer: self.peer_ref(),
                    stream,
                });
            }
            PrimitiveEvent::StreamRemoved => {
                debug!(peer = %self.id, "Remote stream removed");
                self.end().await;
            }
            PrimitiveEvent::DataChannel(channel) => {
                debug!(peer = %self.id, label = channel.label(), "Remote opened data channel");
                self.channels.insert(channel);
            }
            PrimitiveEvent::ChannelOpen { label } => {
                self.emit(MeshEvent::ChannelOpen {
                    peer: self.peer_ref(),
                    label: label.clone(),
                });
                self.flush_pending(&label).await;
            }
            PrimitiveEvent::ChannelClose { label } => {
                self.emit(MeshEvent::ChannelClose {
                    peer: self.peer_ref(),
                    label,
                });
            }
            PrimitiveEvent::ChannelError { label, error } => {
                warn!(peer = %self.id, label = %label, "Data channel error: {}", error);
                self.emit(MeshEvent::ChannelError {
                    peer: self.peer_ref(),
                    label,
                    error,
                });
            }
            PrimitiveEvent::ChannelMessage { label, data } => {
                match ChannelMessage::from_text(&data) {
                    Ok(message) => self.emit(MeshEvent::ChannelMessage {
                        peer: self.peer_ref(),
                        label,
                        message,
                    }),
                    Err(e) => warn!(peer = %self.id, label = %label, "Undecodable channel message: {}", e),
                }
            }
        }
    }

    fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.settings.ice_transport_policy == IceTransportPolicy::Relay && !candidate.is_relay()
        {
            trace!(peer = %self.id, "Skipping non-relay candidate");
            return;
        }
        self.send_payload(MessageType::Candidate, &CandidatePayload { candidate });
    }

    fn on_ice_state(&mut self, ice: IceConnectionState) {
        self.transition(self.state.on_ice_state(ice));
        self.emit(MeshEvent::IceConnectionStateChange {
            peer: self.peer_ref(),
            state: ice,
        });

        match ice {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.restarts.reset();
                self.local_failure_reported = false;
            }
            IceConnectionState::Failed => self.on_ice_failed(),
            _ => {}
        }
    }

    fn on_ice_failed(&mut self) {
        let report = match self.settings.ice_failure_reporting {
            IceFailureReporting::OffererOnly => self.is_offerer(),
            IceFailureReporting::Symmetric => true,
        };
        if !report {
            debug!(peer = %self.id, "ICE failed on answering side, offerer reports");
            return;
        }

        warn!(peer = %self.id, sid = %self.sid, "ICE connection failed");
        self.local_failure_reported = true;
        self.emit(MeshEvent::IceFailed(self.peer_ref()));
        self.send(MessageType::ConnectivityError, None);
    }

    /// Close the connection and leave the mesh. Idempotent.
    pub(crate) async fn end(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.awaiting_answer = false;
        self.transition(PeerState::Closed);

        if let Err(e) = self.connection.close().await {
            warn!(peer = %self.id, "Error closing connection: {}", e);
        }

        let discarded = self.channels.clear();
        if discarded > 0 {
            warn!(
                peer = %self.id,
                "Ended with {} undelivered data channel message(s)",
                discarded
            );
        }

        info!(peer = %self.id, sid = %self.sid, room_type = %self.room_type, "Peer ended");
        self.notify(PeerNotice::Ended(self.handle));
    }

    fn transition(&mut self, next: PeerState) {
        if self.state != next {
            debug!("Peer {} state transition: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    fn report_error(&self, context: &str, err: &Error) {
        warn!(peer = %self.id, sid = %self.sid, "Failed to {}: {}", context, err);
        self.emit(MeshEvent::PeerError {
            peer: self.peer_ref(),
            error: format!("{}: {}", context, err),
        });
    }

    fn emit(&self, event: MeshEvent) {
        self.notify(PeerNotice::Event(event));
    }

    fn notify(&self, notice: PeerNotice) {
        if self.notices.send(notice).is_err() {
            trace!(peer = %self.id, "Registry gone, dropping notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServer;
    use crate::primitive::memory::{FailurePoint, MemoryHandle, MemoryPrimitive, PrimitiveCall};
    use crate::primitive::{PrimitiveEventSink, PrimitiveNotification};
    use serde_json::json;

    struct Fixture {
        peer: Peer,
        primitive: MemoryHandle,
        notices: mpsc::UnboundedReceiver<PeerNotice>,
        primitive_events: mpsc::UnboundedReceiver<PrimitiveNotification>,
    }

    impl Fixture {
        fn new(options: PeerOptions, config: &MeshConfig) -> Self {
            Self::with_capabilities(options, config, Capabilities::default())
        }

        fn with_capabilities(
            options: PeerOptions,
            config: &MeshConfig,
            capabilities: Capabilities,
        ) -> Self {
            let handle = PeerHandle::new(1);
            let (ptx, primitive_events) = mpsc::unbounded_channel();
            let (connection, primitive) = MemoryPrimitive::new(PrimitiveEventSink::new(handle, ptx));
            let (ntx, notices) = mpsc::unbounded_channel();
            let settings = Arc::new(PeerSettings::new(config, capabilities));
            let peer = Peer::new(handle, options, Box::new(connection), settings, ntx);
            Self {
                peer,
                primitive,
                notices,
                primitive_events,
            }
        }

        fn drain(&mut self) -> Vec<PeerNotice> {
            let mut out = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                out.push(notice);
            }
            out
        }

        /// Feed pending primitive notifications back into the peer
        async fn pump_primitive(&mut self) {
            while let Ok(notification) = self.primitive_events.try_recv() {
                self.peer.handle_primitive_event(notification.event).await;
            }
        }
    }

    fn signals(notices: &[PeerNotice]) -> Vec<&SignalingMessage> {
        notices
            .iter()
            .filter_map(|n| match n {
                PeerNotice::Signal(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn events(notices: &[PeerNotice]) -> Vec<&MeshEvent> {
        notices
            .iter()
            .filter_map(|n| match n {
                PeerNotice::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn offer_from(id: &str, sid: &str, nick: Option<&str>) -> SignalingMessage {
        let mut payload = json!({"type": "offer", "sdp": "v=0\r\ns=remote\r\n"});
        if let Some(nick) = nick {
            payload["nick"] = json!(nick);
        }
        SignalingMessage::new("local", MessageType::Offer)
            .with_from(id)
            .with_sid(sid)
            .with_payload(payload)
    }

    fn answer_from(id: &str, sid: &str) -> SignalingMessage {
        SignalingMessage::new("local", MessageType::Answer)
            .with_from(id)
            .with_sid(sid)
            .with_payload(json!({"type": "answer", "sdp": "v=0\r\ns=answer\r\n", "nick": "Alice"}))
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_noop() {
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &MeshConfig::default());

        f.peer.handle_message(answer_from("alice", "s1")).await;

        assert_eq!(f.peer.state(), PeerState::New);
        assert!(f.primitive.calls().is_empty());
        assert!(f.drain().is_empty());
        assert!(f.peer.nick().is_none());
    }

    #[tokio::test]
    async fn test_start_creates_channel_before_offer() {
        let config = MeshConfig::default().with_nick("me");
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &config);

        f.peer.start().await;

        let calls = f.primitive.calls();
        assert_eq!(calls[0], PrimitiveCall::CreateDataChannel("control".to_string()));
        assert!(matches!(calls[1], PrimitiveCall::CreateOffer(_)));
        assert_eq!(calls[2], PrimitiveCall::SetLocalDescription(SdpType::Offer));

        let notices = f.drain();
        let sent = signals(&notices);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Offer);
        assert_eq!(sent[0].to, "alice");
        assert_eq!(sent[0].sid.as_deref(), Some("s1"));

        let payload: SessionDescriptionPayload = sent[0].payload_as().unwrap();
        assert_eq!(payload.sdp_type, SdpType::Offer);
        assert!(payload.sdp.contains("m=application"));
        assert_eq!(payload.nick.as_deref(), Some("me"));

        assert_eq!(f.peer.state(), PeerState::Negotiating);
        assert!(f.peer.is_offerer());
        assert!(f.peer.is_awaiting_answer());
    }

    #[tokio::test]
    async fn test_screen_peer_starts_without_channel() {
        let mut f = Fixture::new(
            PeerOptions::screen("bob").sharing_screen("me"),
            &MeshConfig::default(),
        );

        f.peer.start().await;

        assert!(!f
            .primitive
            .calls()
            .iter()
            .any(|c| matches!(c, PrimitiveCall::CreateDataChannel(_))));
        let notices = f.drain();
        let sent = signals(&notices);
        assert_eq!(sent[0].room_type, RoomType::Screen);
        assert_eq!(sent[0].broadcaster.as_deref(), Some("me"));
        assert!(f.peer.is_broadcaster());
    }

    #[tokio::test]
    async fn test_offer_is_answered_and_nick_stripped() {
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &MeshConfig::default());

        f.peer.handle_message(offer_from("alice", "s1", Some("Alice"))).await;

        assert_eq!(f.peer.nick(), Some("Alice"));
        let remote = f.primitive.remote_description().unwrap();
        assert_eq!(remote.sdp_type, SdpType::Offer);
        assert!(!remote.sdp.contains("Alice"));

        let notices = f.drain();
        let sent = signals(&notices);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Answer);
        assert_eq!(sent[0].to, "alice");
        assert_eq!(sent[0].sid.as_deref(), Some("s1"));
        assert!(sent[0].payload.as_ref().unwrap().get("nick").is_none());
        assert!(!f.peer.is_offerer());
    }

    #[tokio::test]
    async fn test_answer_applies_once() {
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &MeshConfig::default());
        f.peer.start().await;
        f.drain();

        f.peer.handle_message(answer_from("alice", "s1")).await;
        assert_eq!(f.primitive.signaling_state(), SignalingState::Stable);
        assert!(!f.peer.is_awaiting_answer());
        assert_eq!(f.peer.nick(), Some("Alice"));

        let calls_before = f.primitive.calls().len();
        f.peer.handle_message(answer_from("alice", "s1")).await;
        assert_eq!(f.primitive.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());

        f.peer.end().await;
        f.peer.end().await;

        let ended = f
            .drain()
            .into_iter()
            .filter(|n| matches!(n, PeerNotice::Ended(_)))
            .count();
        assert_eq!(ended, 1);
        let closes = f
            .primitive
            .calls()
            .into_iter()
            .filter(|c| *c == PrimitiveCall::Close)
            .count();
        assert_eq!(closes, 1);
        assert!(f.peer.is_closed());
        assert!(f.peer.state().is_terminal());
    }

    #[tokio::test]
    async fn test_late_candidate_after_end_is_dropped() {
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &MeshConfig::default());
        f.peer.handle_message(offer_from("alice", "s1", None)).await;
        f.peer.end().await;
        f.drain();

        let candidate = SignalingMessage::new("local", MessageType::Candidate)
            .with_from("alice")
            .with_sid("s1")
            .with_payload(json!({"candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}}));
        f.peer.handle_message(candidate).await;

        assert!(!f
            .primitive
            .calls()
            .iter()
            .any(|c| matches!(c, PrimitiveCall::AddIceCandidate(_))));
        assert!(f.drain().is_empty());
        assert!(f.peer.is_closed());
    }

    #[tokio::test]
    async fn test_remote_candidates_reach_primitive() {
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &MeshConfig::default());
        f.peer.handle_message(offer_from("alice", "s1", None)).await;

        let candidate = SignalingMessage::new("local", MessageType::Candidate)
            .with_from("alice")
            .with_payload(json!({"candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}}));
        f.peer.handle_message(candidate).await;
        f.peer
            .handle_message(SignalingMessage::new("local", MessageType::EndOfCandidates))
            .await;

        let candidates = f.primitive.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].as_ref().unwrap().sdp_mid.as_deref(), Some("0"));
        assert!(candidates[1].is_none());
    }

    #[tokio::test]
    async fn test_pending_messages_flush_in_order_once() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());

        for n in 0..3 {
            assert!(!f.peer.send_directly("control", "chat", json!(n)).await);
        }
        assert_eq!(f.peer.pending_count("control"), 3);

        assert!(f.primitive.open_channel("control"));
        f.pump_primitive().await;

        let sent: Vec<ChannelMessage> = f
            .primitive
            .channel("control")
            .unwrap()
            .sent()
            .iter()
            .map(|t| ChannelMessage::from_text(t).unwrap())
            .collect();
        assert_eq!(sent.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(f.peer.pending_count("control"), 0);

        assert!(f.peer.send_directly("control", "chat", json!(3)).await);
        f.peer
            .handle_primitive_event(PrimitiveEvent::ChannelOpen {
                label: "control".to_string(),
            })
            .await;
        assert_eq!(f.primitive.channel("control").unwrap().sent().len(), 4);

        let opened = events(&f.drain())
            .iter()
            .filter(|e| matches!(e, MeshEvent::ChannelOpen { .. }))
            .count();
        assert_eq!(opened, 2);
    }

    #[tokio::test]
    async fn test_send_before_open_notice_keeps_queue_order() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());

        for n in 0..2 {
            assert!(!f.peer.send_directly("control", "chat", json!(n)).await);
        }

        // The channel reads open while its notification is still in flight
        assert!(f.primitive.open_channel("control"));
        assert!(f.peer.send_directly("control", "chat", json!(2)).await);
        assert_eq!(f.peer.pending_count("control"), 0);

        f.pump_primitive().await;

        let order: Vec<Value> = f
            .primitive
            .channel("control")
            .unwrap()
            .sent()
            .iter()
            .map(|t| ChannelMessage::from_text(t).unwrap().payload)
            .collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_received_channel_is_reused() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());

        let remote = f.primitive.receive_channel("control");
        f.pump_primitive().await;

        assert!(f.peer.send_directly("control", "ack", json!({"ok": true})).await);
        assert_eq!(remote.sent().len(), 1);
        assert!(!f
            .primitive
            .calls()
            .iter()
            .any(|c| matches!(c, PrimitiveCall::CreateDataChannel(_))));
    }

    #[tokio::test]
    async fn test_channel_messages_are_decoded() {
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &MeshConfig::default());

        f.primitive.deliver("control", r#"{"type":"chat","payload":"hi"}"#);
        f.primitive.deliver("control", "not json");
        f.pump_primitive().await;

        let notices = f.drain();
        let received = events(&notices);
        assert_eq!(received.len(), 1);
        match received[0] {
            MeshEvent::ChannelMessage {
                peer,
                label,
                message,
            } => {
                assert_eq!(peer.id, "alice");
                assert_eq!(peer.sid, "s1");
                assert_eq!(label, "control");
                assert_eq!(message.kind, "chat");
                assert_eq!(message.payload, json!("hi"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ice_failure_reported_by_offerer_only() {
        let mut offerer = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());
        offerer.peer.start().await;
        offerer.drain();
        offerer
            .peer
            .handle_primitive_event(PrimitiveEvent::IceConnectionStateChange(
                IceConnectionState::Failed,
            ))
            .await;
        let notices = offerer.drain();
        assert!(events(&notices)
            .iter()
            .any(|e| matches!(e, MeshEvent::IceFailed(_))));
        assert!(signals(&notices)
            .iter()
            .any(|m| m.kind == MessageType::ConnectivityError));

        let mut answerer = Fixture::new(PeerOptions::video("bob").with_sid("s1"), &MeshConfig::default());
        answerer.peer.handle_message(offer_from("bob", "s1", None)).await;
        answerer.drain();
        answerer
            .peer
            .handle_primitive_event(PrimitiveEvent::IceConnectionStateChange(
                IceConnectionState::Failed,
            ))
            .await;
        let notices = answerer.drain();
        assert!(!events(&notices)
            .iter()
            .any(|e| matches!(e, MeshEvent::IceFailed(_))));
        assert!(signals(&notices).is_empty());
    }

    #[tokio::test]
    async fn test_symmetric_reporting_deduplicates_remote_error() {
        let config =
            MeshConfig::default().with_ice_failure_reporting(IceFailureReporting::Symmetric);
        let mut f = Fixture::new(PeerOptions::video("bob").with_sid("s1"), &config);
        f.peer.handle_message(offer_from("bob", "s1", None)).await;
        f.drain();

        f.peer
            .handle_primitive_event(PrimitiveEvent::IceConnectionStateChange(
                IceConnectionState::Failed,
            ))
            .await;
        f.peer
            .handle_message(
                SignalingMessage::new("local", MessageType::ConnectivityError).with_from("bob"),
            )
            .await;

        let notices = f.drain();
        let reported: Vec<_> = events(&notices)
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::IceFailed(_) | MeshEvent::ConnectivityError(_)))
            .collect();
        assert_eq!(reported.len(), 1);
        assert!(matches!(reported[0], MeshEvent::IceFailed(_)));
    }

    #[tokio::test]
    async fn test_second_remote_stream_ignored() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());
        let first = RemoteStream {
            id: "stream-1".to_string(),
            track_ids: vec!["a".to_string()],
        };
        let second = RemoteStream {
            id: "stream-2".to_string(),
            track_ids: vec!["b".to_string()],
        };

        f.peer
            .handle_primitive_event(PrimitiveEvent::StreamAdded(first.clone()))
            .await;
        f.peer
            .handle_primitive_event(PrimitiveEvent::StreamAdded(second))
            .await;

        assert_eq!(f.peer.remote_stream(), Some(&first));
        let added = events(&f.drain())
            .iter()
            .filter(|e| matches!(e, MeshEvent::PeerStreamAdded { .. }))
            .count();
        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn test_stream_removed_ends_peer() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());
        f.peer
            .handle_primitive_event(PrimitiveEvent::StreamRemoved)
            .await;
        assert!(f.peer.is_closed());
        assert!(f.primitive.is_closed());
    }

    #[tokio::test]
    async fn test_unshare_screen_ends_screen_peer() {
        let mut f = Fixture::new(PeerOptions::screen("bob").with_sid("s2"), &MeshConfig::default());

        f.peer
            .handle_message(
                SignalingMessage::new("local", MessageType::UnshareScreen)
                    .with_from("bob")
                    .with_room_type(RoomType::Screen),
            )
            .await;

        let notices = f.drain();
        assert!(matches!(
            events(&notices)[0],
            MeshEvent::UnshareScreen { id } if id == "bob"
        ));
        assert!(notices.iter().any(|n| matches!(n, PeerNotice::Ended(_))));
        assert!(f.peer.is_closed());
    }

    #[tokio::test]
    async fn test_mute_carries_track_name() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());
        f.peer
            .handle_message(
                SignalingMessage::new("local", MessageType::Mute)
                    .with_from("alice")
                    .with_payload(json!({"name": "audio"})),
            )
            .await;

        let notices = f.drain();
        assert_eq!(
            events(&notices)[0],
            &MeshEvent::Mute {
                id: "alice".to_string(),
                name: Some("audio".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_offer_failure_reported_without_retry() {
        let mut f = Fixture::new(PeerOptions::video("alice"), &MeshConfig::default());
        f.primitive.fail_next(FailurePoint::CreateOffer);

        f.peer.start().await;

        let notices = f.drain();
        assert!(signals(&notices).is_empty());
        assert!(events(&notices)
            .iter()
            .any(|e| matches!(e, MeshEvent::PeerError { error, .. } if error.starts_with("create offer"))));
        let offers = f
            .primitive
            .calls()
            .into_iter()
            .filter(|c| matches!(c, PrimitiveCall::CreateOffer(_)))
            .count();
        assert_eq!(offers, 1);
        assert!(!f.peer.is_awaiting_answer());
    }

    #[tokio::test]
    async fn test_data_channel_unsupported() {
        let capabilities = Capabilities {
            data_channel_supported: false,
            screen_sharing_supported: true,
        };
        let mut f = Fixture::with_capabilities(
            PeerOptions::video("alice"),
            &MeshConfig::default(),
            capabilities,
        );

        assert!(!f.peer.send_directly("control", "chat", json!(1)).await);
        assert_eq!(f.peer.pending_count("control"), 0);
        assert!(events(&f.drain())
            .iter()
            .any(|e| matches!(e, MeshEvent::PeerError { .. })));
    }

    #[tokio::test]
    async fn test_relay_policy_filters_host_candidates() {
        let config = MeshConfig::default()
            .with_ice_servers(vec![IceServer::turn("turn:t.example.com", "u", "p")])
            .with_relay_only();
        let mut f = Fixture::new(PeerOptions::video("alice"), &config);

        f.primitive.gather_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        });
        f.primitive.gather_candidate(IceCandidate {
            candidate: "candidate:2 1 udp 41885439 203.0.113.9 3478 typ relay raddr 0.0.0.0 rport 0".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        });
        f.primitive.finish_gathering();
        f.pump_primitive().await;

        let notices = f.drain();
        let sent = signals(&notices);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageType::Candidate);
        let payload: CandidatePayload = sent[0].payload_as().unwrap();
        assert!(payload.candidate.is_relay());
        assert_eq!(sent[1].kind, MessageType::EndOfCandidates);
    }

    #[tokio::test]
    async fn test_ice_restart_only_from_stable_offerer() {
        let config = MeshConfig::default().with_max_ice_restarts(1);
        let mut f = Fixture::new(PeerOptions::video("alice").with_sid("s1"), &config);

        assert!(!f.peer.ice_restart().await);

        f.peer.start().await;
        assert!(!f.peer.can_restart_ice());
        f.peer.handle_message(answer_from("alice", "s1")).await;
        assert!(f.peer.can_restart_ice());
        f.drain();

        assert!(f.peer.ice_restart().await);
        assert!(matches!(
            f.primitive.calls().iter().rev().nth(1),
            Some(PrimitiveCall::CreateOffer(options)) if options.ice_restart
        ));
        assert!(f.peer.is_awaiting_answer());
        assert_eq!(signals(&f.drain())[0].kind, MessageType::Offer);

        f.peer.handle_message(answer_from("alice", "s1")).await;
        assert!(!f.peer.ice_restart().await);

        f.peer
            .handle_primitive_event(PrimitiveEvent::IceConnectionStateChange(
                IceConnectionState::Connected,
            ))
            .await;
        assert_eq!(f.peer.restarts_remaining(), 1);
        assert_eq!(f.peer.state(), PeerState::Connected);
    }
}
