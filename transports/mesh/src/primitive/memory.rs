//! In-memory connection primitive
//!
//! Follows the same signaling-state rules as a real peer connection but
//! produces synthetic SDP and never touches the network. Every call is
//! recorded, failures can be injected per operation, and a [`MemoryHandle`]
//! lets the caller raise the asynchronous notifications a real primitive
//! would (candidates, ICE state, channel open, remote streams).

use super::{
    ChannelState, ConnectionPrimitive, DataChannel, IceConnectionState, OfferOptions, PeerHandle,
    PrimitiveEvent, PrimitiveEventSink, PrimitiveFactory, RemoteStream, SignalingState,
};
use crate::config::PeerConnectionConfig;
use crate::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A recorded call into the primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveCall {
    CreateOffer(OfferOptions),
    CreateAnswer,
    SetLocalDescription(SdpType),
    SetRemoteDescription(SdpType),
    AddIceCandidate(Option<IceCandidate>),
    CreateDataChannel(String),
    Close,
}

/// Operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    CreateDataChannel,
}

#[derive(Debug, Default)]
struct MemoryState {
    calls: Vec<PrimitiveCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: SignalingState,
    ice: IceConnectionState,
    candidates: Vec<Option<IceCandidate>>,
    channels: Vec<Arc<MemoryDataChannel>>,
    closed: bool,
    offers_created: u32,
    failures: HashSet<FailurePoint>,
}

impl MemoryState {
    fn enter(&mut self, call: PrimitiveCall, point: Option<FailurePoint>) -> Result<()> {
        self.calls.push(call);
        if self.closed {
            return Err(Error::PeerClosed("memory primitive closed".to_string()));
        }
        if let Some(point) = point {
            if self.failures.remove(&point) {
                return Err(Error::WebRtcError(format!("injected failure: {:?}", point)));
            }
        }
        Ok(())
    }
}

/// Data channel backed by a vector of sent frames
#[derive(Debug)]
pub struct MemoryDataChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<String>>,
}

impl MemoryDataChannel {
    fn new(label: &str, state: ChannelState) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Frames sent so far, oldest first
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if *self.state.lock() != ChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "channel '{}' is not open",
                self.label
            )));
        }
        self.sent.lock().push(text);
        Ok(())
    }
}

/// In-memory connection primitive
pub struct MemoryPrimitive {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPrimitive {
    /// Create a primitive and the handle used to inspect and drive it
    pub fn new(events: PrimitiveEventSink) -> (Self, MemoryHandle) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        let handle = MemoryHandle {
            state: state.clone(),
            events,
        };
        (Self { state }, handle)
    }
}

#[async_trait]
impl ConnectionPrimitive for MemoryPrimitive {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.enter(
            PrimitiveCall::CreateOffer(options),
            Some(FailurePoint::CreateOffer),
        )?;

        state.offers_created += 1;
        let mut sdp = format!(
            "v=0\r\no=memory {} 0 IN IP4 127.0.0.1\r\ns=-\r\n",
            state.offers_created
        );
        if options.offer_to_receive_audio {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        }
        if options.offer_to_receive_video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        if !state.channels.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        if options.ice_restart {
            sdp.push_str("a=ice-options:ice-restart\r\n");
        }
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.enter(PrimitiveCall::CreateAnswer, Some(FailurePoint::CreateAnswer))?;

        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::SdpError(format!(
                "cannot answer in signaling state {:?}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer("v=0\r\no=memory 0 0 IN IP4 127.0.0.1\r\ns=-\r\n"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(
            PrimitiveCall::SetLocalDescription(description.sdp_type),
            Some(FailurePoint::SetLocalDescription),
        )?;

        state.signaling = match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (SdpType::Rollback, _) => SignalingState::Stable,
            (sdp_type, current) => {
                return Err(Error::SdpError(format!(
                    "cannot apply local {:?} in signaling state {:?}",
                    sdp_type, current
                )))
            }
        };
        state.local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(
            PrimitiveCall::SetRemoteDescription(description.sdp_type),
            Some(FailurePoint::SetRemoteDescription),
        )?;

        state.signaling = match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (SdpType::Rollback, _) => SignalingState::Stable,
            (sdp_type, current) => {
                return Err(Error::SdpError(format!(
                    "cannot apply remote {:?} in signaling state {:?}",
                    sdp_type, current
                )))
            }
        };
        state.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(
            PrimitiveCall::AddIceCandidate(candidate.clone()),
            Some(FailurePoint::AddIceCandidate),
        )?;

        if state.remote.is_none() {
            return Err(Error::IceCandidateError(
                "no remote description".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let mut state = self.state.lock();
        state.enter(
            PrimitiveCall::CreateDataChannel(label.to_string()),
            Some(FailurePoint::CreateDataChannel),
        )?;

        let channel = Arc::new(MemoryDataChannel::new(label, ChannelState::Connecting));
        state.channels.push(channel.clone());
        Ok(channel)
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(PrimitiveCall::Close);
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        for channel in &state.channels {
            channel.set_state(ChannelState::Closed);
        }
        Ok(())
    }
}

/// Inspection and control side of a [`MemoryPrimitive`]
#[derive(Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
    events: PrimitiveEventSink,
}

impl MemoryHandle {
    /// Handle of the peer owning this primitive
    pub fn peer(&self) -> PeerHandle {
        self.events.handle()
    }

    pub fn calls(&self) -> Vec<PrimitiveCall> {
        self.state.lock().calls.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Remote candidates accepted so far (`None` = end of candidates)
    pub fn candidates(&self) -> Vec<Option<IceCandidate>> {
        self.state.lock().candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Most recent channel with this label
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryDataChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .rev()
            .find(|c| c.label == label)
            .cloned()
    }

    /// Make the next call at `point` fail
    pub fn fail_next(&self, point: FailurePoint) {
        self.state.lock().failures.insert(point);
    }

    /// Mark a channel open and report it. Returns false if no such channel.
    pub fn open_channel(&self, label: &str) -> bool {
        match self.channel(label) {
            Some(channel) => {
                channel.set_state(ChannelState::Open);
                self.events.emit(PrimitiveEvent::ChannelOpen {
                    label: label.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Simulate the remote side opening a channel
    pub fn receive_channel(&self, label: &str) -> Arc<MemoryDataChannel> {
        let channel = Arc::new(MemoryDataChannel::new(label, ChannelState::Open));
        self.state.lock().channels.push(channel.clone());
        self.events
            .emit(PrimitiveEvent::DataChannel(channel.clone()));
        self.events.emit(PrimitiveEvent::ChannelOpen {
            label: label.to_string(),
        });
        channel
    }

    /// Simulate a message arriving on a channel
    pub fn deliver(&self, label: &str, data: impl Into<String>) {
        self.events.emit(PrimitiveEvent::ChannelMessage {
            label: label.to_string(),
            data: data.into(),
        });
    }

    pub fn set_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        self.events
            .emit(PrimitiveEvent::IceConnectionStateChange(ice));
    }

    pub fn gather_candidate(&self, candidate: IceCandidate) {
        self.events.emit(PrimitiveEvent::IceCandidate(candidate));
    }

    pub fn finish_gathering(&self) {
        self.events.emit(PrimitiveEvent::EndOfCandidates);
    }

    pub fn add_stream(&self, stream: RemoteStream) {
        self.events.emit(PrimitiveEvent::StreamAdded(stream));
    }

    pub fn remove_stream(&self) {
        self.events.emit(PrimitiveEvent::StreamRemoved);
    }

    pub fn emit(&self, event: PrimitiveEvent) {
        self.events.emit(event);
    }
}

/// Factory producing [`MemoryPrimitive`]s and remembering their handles
#[derive(Default)]
pub struct MemoryPrimitiveFactory {
    created: Mutex<Vec<MemoryHandle>>,
}

impl MemoryPrimitiveFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handles(&self) -> Vec<MemoryHandle> {
        self.created.lock().clone()
    }

    pub fn handle_for(&self, peer: PeerHandle) -> Option<MemoryHandle> {
        self.created
            .lock()
            .iter()
            .find(|h| h.peer() == peer)
            .cloned()
    }

    pub fn last(&self) -> Option<MemoryHandle> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PrimitiveFactory for MemoryPrimitiveFactory {
    async fn create(
        &self,
        _config: &PeerConnectionConfig,
        events: PrimitiveEventSink,
    ) -> Result<Box<dyn ConnectionPrimitive>> {
        let (primitive, handle) = MemoryPrimitive::new(events);
        self.created.lock().push(handle);
        Ok(Box::new(primitive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::PrimitiveNotification;
    use tokio::sync::mpsc;

    fn primitive() -> (
        MemoryPrimitive,
        MemoryHandle,
        mpsc::UnboundedReceiver<PrimitiveNotification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (primitive, handle) = MemoryPrimitive::new(PrimitiveEventSink::new(PeerHandle::new(1), tx));
        (primitive, handle, rx)
    }

    #[tokio::test]
    async fn test_offer_answer_state_machine() {
        let (offerer, offerer_handle, _rx1) = primitive();
        let (answerer, answerer_handle, _rx2) = primitive();

        let offer = offerer.create_offer(OfferOptions::default()).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(offerer.signaling_state(), SignalingState::HaveLocalOffer);

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(offerer_handle.signaling_state(), SignalingState::Stable);
        assert_eq!(answerer_handle.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_answer_without_offer_rejected() {
        let (primitive, _handle, _rx) = primitive();
        let result = primitive
            .set_remote_description(SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(result, Err(Error::SdpError(_))));
        assert!(primitive.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_offer_mentions_existing_channel() {
        let (primitive, _handle, _rx) = primitive();
        primitive.create_data_channel("control").await.unwrap();
        let offer = primitive.create_offer(OfferOptions::default()).await.unwrap();
        assert!(offer.sdp.contains("m=application"));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let (primitive, handle, _rx) = primitive();
        handle.fail_next(FailurePoint::CreateOffer);

        assert!(primitive.create_offer(OfferOptions::default()).await.is_err());
        assert!(primitive.create_offer(OfferOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_send_requires_open() {
        let (primitive, handle, mut rx) = primitive();
        let channel = primitive.create_data_channel("control").await.unwrap();

        assert!(channel.send_text("early".to_string()).await.is_err());

        assert!(handle.open_channel("control"));
        channel.send_text("late".to_string()).await.unwrap();

        assert_eq!(handle.channel("control").unwrap().sent(), vec!["late"]);
        let notification = rx.recv().await.unwrap();
        assert!(matches!(
            notification.event,
            PrimitiveEvent::ChannelOpen { ref label } if label == "control"
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_further_calls() {
        let (primitive, handle, _rx) = primitive();
        primitive.close().await.unwrap();

        assert!(handle.is_closed());
        assert!(matches!(
            primitive.add_ice_candidate(None).await,
            Err(Error::PeerClosed(_))
        ));
        assert_eq!(primitive.ice_connection_state(), IceConnectionState::Closed);
    }
}
