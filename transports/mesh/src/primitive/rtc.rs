//! webrtc-rs backed connection primitive
//!
//! Callbacks registered on the `RTCPeerConnection` never touch peer state
//! directly: they translate the webrtc-rs notification into a
//! [`PrimitiveEvent`] and push it into the peer's [`PrimitiveEventSink`].

use super::{
    ChannelState, ConnectionPrimitive, DataChannel, IceConnectionState, OfferOptions,
    PrimitiveEvent, PrimitiveEventSink, PrimitiveFactory, RemoteStream, SignalingState,
};
use crate::config::{IceServer, IceTransportPolicy, PeerConnectionConfig};
use crate::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Creates webrtc-rs peer connections sharing one media engine
pub struct RtcPrimitiveFactory {
    api: API,
}

impl RtcPrimitiveFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self { api })
    }
}

impl fmt::Debug for RtcPrimitiveFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcPrimitiveFactory").finish_non_exhaustive()
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn rtc_configuration(config: &PeerConnectionConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
        ice_transport_policy: match config.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        ..Default::default()
    }
}

#[async_trait]
impl PrimitiveFactory for RtcPrimitiveFactory {
    async fn create(
        &self,
        config: &PeerConnectionConfig,
        events: PrimitiveEventSink,
    ) -> Result<Box<dyn ConnectionPrimitive>> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await
                .map_err(|e| {
                    Error::WebRtcError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let primitive = RtcPrimitive {
            peer_connection,
            events,
            receivers_added: AtomicBool::new(false),
        };
        primitive.register_handlers();

        debug!("Created webrtc peer connection for {}", primitive.events.handle());
        Ok(Box::new(primitive))
    }
}

/// One webrtc-rs peer connection
pub struct RtcPrimitive {
    peer_connection: Arc<RTCPeerConnection>,
    events: PrimitiveEventSink,
    receivers_added: AtomicBool,
}

impl RtcPrimitive {
    fn register_handlers(&self) {
        let sink = self.events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(PrimitiveEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        })),
                        Err(e) => {
                            warn!("Failed to serialize local candidate: {}", e);
                            None
                        }
                    },
                    None => Some(PrimitiveEvent::EndOfCandidates),
                };
                if let Some(event) = event {
                    sink.emit(event);
                }
                Box::pin(async {})
            }));

        let sink = self.events.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state| {
                sink.emit(PrimitiveEvent::IceConnectionStateChange(ice_state(state)));
                Box::pin(async {})
            }));

        let sink = self.events.clone();
        self.peer_connection
            .on_signaling_state_change(Box::new(move |state| {
                sink.emit(PrimitiveEvent::SignalingStateChange(signaling_state(state)));
                Box::pin(async {})
            }));

        let sink = self.events.clone();
        self.peer_connection
            .on_negotiation_needed(Box::new(move || {
                sink.emit(PrimitiveEvent::NegotiationNeeded);
                Box::pin(async {})
            }));

        // One StreamAdded per remote stream, not per track
        let sink = self.events.clone();
        let remote_tracks = Arc::new(Mutex::new(RemoteTracks::default()));
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let stream_id = track.stream_id();
                if remote_tracks.lock().started(&stream_id) {
                    info!(
                        "Remote stream {} added for {} (kind={})",
                        stream_id,
                        sink.handle(),
                        track.kind()
                    );
                    sink.emit(PrimitiveEvent::StreamAdded(RemoteStream {
                        id: stream_id.clone(),
                        track_ids: vec![track.id()],
                    }));
                }

                // Nothing renders remote media here; the read loop only
                // watches for the track to end
                let (sink, remote_tracks) = (sink.clone(), Arc::clone(&remote_tracks));
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!("Remote track {} of stream {} ended", track.id(), stream_id);
                    if remote_tracks.lock().ended(&stream_id) {
                        sink.emit(PrimitiveEvent::StreamRemoved);
                    }
                });
                Box::pin(async {})
            }));

        let sink = self.events.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |data_channel| {
                debug!(
                    "Remote data channel {} announced for {}",
                    data_channel.label(),
                    sink.handle()
                );
                sink.emit(PrimitiveEvent::DataChannel(Arc::new(RtcDataChannel {
                    inner: Arc::clone(&data_channel),
                })));
                observe_channel(&data_channel, &sink);
                Box::pin(async {})
            }));
    }
}

/// Live remote tracks per stream
///
/// Only the first stream counts as the peer's remote stream; it is removed
/// once every one of its tracks has ended.
#[derive(Debug, Default)]
struct RemoteTracks {
    primary: Option<String>,
    live: HashMap<String, usize>,
    removed: bool,
}

impl RemoteTracks {
    /// Count a new track; true if it opens a stream not seen before
    fn started(&mut self, stream_id: &str) -> bool {
        let new_stream = !self.live.contains_key(stream_id);
        *self.live.entry(stream_id.to_string()).or_default() += 1;
        if self.primary.is_none() {
            self.primary = Some(stream_id.to_string());
        }
        new_stream
    }

    /// Count an ended track; true exactly once, when the primary stream has no live tracks left
    fn ended(&mut self, stream_id: &str) -> bool {
        let Some(count) = self.live.get_mut(stream_id) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count > 0 || self.removed || self.primary.as_deref() != Some(stream_id) {
            return false;
        }
        self.removed = true;
        true
    }
}

/// Route a channel's lifecycle and messages into the sink
fn observe_channel(channel: &Arc<RTCDataChannel>, sink: &PrimitiveEventSink) {
    let label = channel.label().to_string();

    let (on_open_sink, on_open_label) = (sink.clone(), label.clone());
    channel.on_open(Box::new(move || {
        on_open_sink.emit(PrimitiveEvent::ChannelOpen {
            label: on_open_label,
        });
        Box::pin(async {})
    }));

    let (on_close_sink, on_close_label) = (sink.clone(), label.clone());
    channel.on_close(Box::new(move || {
        on_close_sink.emit(PrimitiveEvent::ChannelClose {
            label: on_close_label.clone(),
        });
        Box::pin(async {})
    }));

    let (on_error_sink, on_error_label) = (sink.clone(), label.clone());
    channel.on_error(Box::new(move |err| {
        on_error_sink.emit(PrimitiveEvent::ChannelError {
            label: on_error_label.clone(),
            error: err.to_string(),
        });
        Box::pin(async {})
    }));

    let on_message_sink = sink.clone();
    channel.on_message(Box::new(move |msg| {
        on_message_sink.emit(PrimitiveEvent::ChannelMessage {
            label: label.clone(),
            data: String::from_utf8_lossy(&msg.data).into_owned(),
        });
        Box::pin(async {})
    }));
}

fn ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError("Rollback is not supported".to_string()));
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse session description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::SdpError("Unspecified session description type".to_string()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

impl RtcPrimitive {
    async fn add_receivers(&self, options: OfferOptions) -> Result<()> {
        if self.receivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let kinds = [
            (options.offer_to_receive_audio, RTPCodecType::Audio),
            (options.offer_to_receive_video, RTPCodecType::Video),
        ];
        for (wanted, kind) in kinds {
            if !wanted {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to add transceiver: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionPrimitive for RtcPrimitive {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        self.add_receivers(options).await?;

        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()> {
        // An empty candidate string signals end-of-candidates to webrtc-rs
        let init = match candidate {
            Some(candidate) => RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                ..Default::default()
            },
            None => RTCIceCandidateInit::default(),
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create channel: {}", e)))?;

        observe_channel(&channel, &self.events);
        Ok(Arc::new(RtcDataChannel { inner: channel }))
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.peer_connection.signaling_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        ice_state(self.peer_connection.ice_connection_state())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing webrtc peer connection for {}", self.events.handle());
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}

/// [`DataChannel`] over an `RTCDataChannel`
pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.inner.label())
            .field("state", &self.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn ready_state(&self) -> ChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::WebRtcError(format!("Failed to send on {}: {}", self.label(), e)))
    }
}
