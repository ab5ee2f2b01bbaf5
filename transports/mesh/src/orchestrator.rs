//! Mesh orchestrator
//!
//! Owns one signaling transport, the registry of peers and the dispatcher,
//! and processes inbound transport events and primitive notifications one
//! at a time. Whatever the peers queue for the wire is flushed to the
//! transport after every operation.

use crate::config::{Capabilities, MeshConfig};
use crate::events::{MeshEvent, PeerRef};
use crate::peer::{MediaKind, MeshRegistry, PeerOptions};
use crate::primitive::{PeerHandle, PrimitiveFactory, PrimitiveNotification};
use crate::signaling::dispatcher::MCU_FEATURE;
use crate::signaling::protocol::{MessageType, RoomType, SignalingMessage};
use crate::signaling::{SignalingDispatcher, SignalingTransport, TransportEvent};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Drives a full mesh of peers for one local session
pub struct MeshOrchestrator<T: SignalingTransport> {
    transport: T,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    registry: MeshRegistry,
    dispatcher: SignalingDispatcher,
    outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    primitive: mpsc::UnboundedReceiver<PrimitiveNotification>,
}

impl<T: SignalingTransport> MeshOrchestrator<T> {
    /// Create an orchestrator
    ///
    /// # Arguments
    ///
    /// * `transport` - Outbound signaling for the local session
    /// * `inbound` - Events the transport delivers for the local session
    /// * `config` - Room configuration, validated here
    /// * `capabilities` - What the platform supports
    /// * `factory` - Builds one connection primitive per peer
    ///
    /// Returns the orchestrator and the receiver of [`MeshEvent`]s.
    pub fn new(
        transport: T,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        config: MeshConfig,
        capabilities: Capabilities,
        factory: Arc<dyn PrimitiveFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MeshEvent>)> {
        let dispatcher = SignalingDispatcher::new(transport.session_id(), &config)
            .with_mcu(transport.has_feature(MCU_FEATURE));
        let (registry, channels) = MeshRegistry::new(config, capabilities, factory)?;

        info!(session = %transport.session_id(), "Mesh orchestrator created");

        Ok((
            Self {
                transport,
                inbound,
                registry,
                dispatcher,
                outbound: channels.outbound,
                primitive: channels.primitive,
            },
            channels.events,
        ))
    }

    pub fn session_id(&self) -> &str {
        self.transport.session_id()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn registry(&self) -> &MeshRegistry {
        &self.registry
    }

    /// Direct registry access; call [`flush`](Self::flush) afterwards
    pub fn registry_mut(&mut self) -> &mut MeshRegistry {
        &mut self.registry
    }

    /// Create a video peer for `session` and send it an offer
    #[instrument(skip(self), fields(local = %self.session_id()))]
    pub async fn connect(&mut self, session: &str) -> Result<PeerRef> {
        let peer = self.registry.create_peer(PeerOptions::video(session)).await?;
        self.registry.start_peer(peer.handle).await?;
        self.flush().await;
        Ok(peer)
    }

    /// Connect to every listed session that has no video peer yet
    pub async fn join_call<I, S>(&mut self, sessions: I) -> Result<Vec<PeerRef>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut connected = Vec::new();
        for session in sessions {
            let session = session.as_ref();
            if session == self.session_id() {
                continue;
            }
            if !self
                .registry
                .get_peers(Some(session), Some(RoomType::Video))
                .is_empty()
            {
                debug!(session = %session, "Already connected");
                continue;
            }
            connected.push(self.connect(session).await?);
        }
        info!("Joined call with {} new peer(s)", connected.len());
        Ok(connected)
    }

    /// Offer the local screen to `session`
    #[instrument(skip(self), fields(local = %self.session_id()))]
    pub async fn share_screen_with(&mut self, session: &str) -> Result<PeerRef> {
        let options = PeerOptions::screen(session).sharing_screen(self.session_id());
        let peer = self.registry.create_peer(options).await?;
        self.registry.start_peer(peer.handle).await?;
        self.flush().await;
        Ok(peer)
    }

    pub async fn stop_screen_share(&mut self) {
        self.registry.stop_screen_share().await;
        self.flush().await;
    }

    /// End every peer
    pub async fn leave_call(&mut self) {
        info!(session = %self.session_id(), "Leaving call");
        self.registry.end_all().await;
        self.flush().await;
    }

    pub async fn send_to_all(&mut self, kind: MessageType, payload: Option<Value>) {
        self.registry.send_to_all(kind, payload);
        self.flush().await;
    }

    /// Send over one peer's data channel; false means queued until open
    pub async fn send_directly(
        &mut self,
        handle: PeerHandle,
        label: &str,
        kind: &str,
        payload: Value,
    ) -> Result<bool> {
        let sent = self
            .registry
            .send_directly(handle, label, kind, payload)
            .await;
        self.flush().await;
        sent
    }

    pub async fn send_directly_to_all(&mut self, label: &str, kind: &str, payload: Value) {
        self.registry.send_directly_to_all(label, kind, payload).await;
        self.flush().await;
    }

    pub async fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        self.registry.set_media_enabled(kind, enabled);
        self.flush().await;
    }

    /// Ask a peer to renegotiate ICE; false when it may not restart
    pub async fn restart_ice(&mut self, handle: PeerHandle) -> Result<bool> {
        let restarted = self.registry.ice_restart(handle).await;
        self.flush().await;
        restarted
    }

    /// Apply one event from the signaling transport
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        let result = match event {
            TransportEvent::Message(message) => {
                self.dispatcher.dispatch(&mut self.registry, message).await
            }
            TransportEvent::Remove { id, room_type } => {
                self.dispatcher
                    .handle_remove(&mut self.registry, &id, room_type)
                    .await;
                Ok(())
            }
            TransportEvent::StunServers(servers) => {
                let servers = self.registry.set_stun_servers(servers).to_vec();
                self.registry.emit(MeshEvent::IceServersUpdated { servers });
                Ok(())
            }
            TransportEvent::TurnServers(servers) => {
                let servers = self.registry.add_turn_servers(servers).to_vec();
                self.registry.emit(MeshEvent::IceServersUpdated { servers });
                Ok(())
            }
        };
        self.flush().await;
        result
    }

    pub async fn handle_primitive_event(&mut self, notification: PrimitiveNotification) {
        self.registry.handle_primitive_event(notification).await;
        self.flush().await;
    }

    /// Hand queued signaling messages to the transport, in order
    ///
    /// A message that cannot be delivered is logged and dropped.
    pub async fn flush(&mut self) {
        while let Ok(message) = self.outbound.try_recv() {
            debug!(to = %message.to, kind = ?message.kind, "Sending signaling message");
            if let Err(e) = self.transport.send(message).await {
                warn!(retryable = e.is_retryable(), "Failed to send signaling message: {}", e);
            }
        }
    }

    /// Wait for and process exactly one event
    ///
    /// Transport events take priority over primitive notifications. Returns
    /// false once the inbound transport stream has ended.
    pub async fn step(&mut self) -> Result<bool> {
        tokio::select! {
            biased;

            event = self.inbound.recv() => match event {
                Some(event) => self.handle_transport_event(event).await?,
                None => return Ok(false),
            },

            Some(notification) = self.primitive.recv() => {
                self.handle_primitive_event(notification).await;
            }
        }
        Ok(true)
    }

    /// Process events until the transport goes away, then leave the call
    pub async fn run(mut self) {
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_peer_error() => debug!("Signaling event for stale peer: {}", e),
                Err(e) => warn!("Failed to handle signaling event: {}", e),
            }
        }
        debug!(session = %self.session_id(), "Inbound signaling closed");
        self.leave_call().await;
    }
}
