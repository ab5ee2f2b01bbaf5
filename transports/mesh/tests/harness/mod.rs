//! Mesh integration test harness
//!
//! Provides infrastructure for integration testing of the mesh with:
//! - An in-process signaling relay shared by every session
//! - Orchestrators backed by scriptable in-memory primitives
//! - Raw relay participants for hand-crafted signaling
//! - Helpers to run every orchestrator until the room is quiet
//!
//! Basic usage pattern:
//!
//! 1. Create a `MeshHarness`
//! 2. Add orchestrated sessions with `harness.node()`, raw ones with `harness.raw()`
//! 3. Drive them through `node.mesh` or raw sends, then `settle`
//! 4. Inspect registries, primitives and collected events

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use remotemedia_mesh::primitive::memory::{MemoryHandle, MemoryPrimitiveFactory};
use remotemedia_mesh::signaling::protocol::{SessionDescription, SessionDescriptionPayload};
use remotemedia_mesh::{
    Capabilities, LocalRelay, MeshConfig, MeshEvent, MeshOrchestrator, MessageType, PeerHandle,
    RelayTransport, RoomType, SignalingMessage, SignalingTransport, TransportEvent,
};
use tokio::sync::mpsc;

/// How long a node waits for its next event before it counts as idle
const IDLE: Duration = Duration::from_millis(20);

/// Upper bound on settle rounds, guards against event ping-pong
const MAX_ROUNDS: usize = 64;

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Mesh error: {0}")]
    MeshError(#[from] remotemedia_mesh::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Missing: {0}")]
    Missing(String),
}

/// Install a test log subscriber once (honours RUST_LOG)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Room of sessions sharing one relay
#[derive(Default)]
pub struct MeshHarness {
    pub relay: LocalRelay,
}

impl MeshHarness {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    /// Join an orchestrated session with default configuration
    pub fn node(&self, session: &str) -> TestNode {
        self.node_with(session, MeshConfig::default())
    }

    pub fn node_with(&self, session: &str, config: MeshConfig) -> TestNode {
        let (transport, inbound) = self.relay.join(session);
        let factory = Arc::new(MemoryPrimitiveFactory::new());
        let (mesh, events) = MeshOrchestrator::new(
            transport,
            inbound,
            config,
            Capabilities::default(),
            factory.clone(),
        )
        .expect("valid mesh configuration");

        TestNode {
            mesh,
            events,
            factory,
            seen: Vec::new(),
        }
    }

    /// Join a session without an orchestrator
    pub fn raw(&self, session: &str) -> RawSession {
        let (transport, inbound) = self.relay.join(session);
        RawSession { transport, inbound }
    }
}

/// Orchestrated session under test
pub struct TestNode {
    pub mesh: MeshOrchestrator<RelayTransport>,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    pub factory: Arc<MemoryPrimitiveFactory>,
    /// Every event collected so far, in order
    pub seen: Vec<MeshEvent>,
}

impl TestNode {
    /// Process one event, failing if none arrives in time
    pub async fn step_once(&mut self) -> HarnessResult<bool> {
        let stepped = tokio::time::timeout(Duration::from_secs(1), self.mesh.step())
            .await
            .map_err(|_| HarnessError::Timeout(format!("{} got no event", self.session())))??;
        self.collect();
        Ok(stepped)
    }

    /// Process events until idle; returns how many were processed
    pub async fn drain(&mut self) -> HarnessResult<usize> {
        let mut processed = 0;
        loop {
            match tokio::time::timeout(IDLE, self.mesh.step()).await {
                Ok(Ok(true)) => processed += 1,
                Ok(Ok(false)) | Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        self.collect();
        Ok(processed)
    }

    pub fn session(&self) -> &str {
        self.mesh.session_id()
    }

    /// Move pending events into `seen`
    pub fn collect(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }

    /// Take every collected event
    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        self.collect();
        std::mem::take(&mut self.seen)
    }

    /// Handle of the single peer for `id` in `room_type`
    pub fn peer_handle(&self, id: &str, room_type: RoomType) -> HarnessResult<PeerHandle> {
        let peers = self.mesh.registry().get_peers(Some(id), Some(room_type));
        match peers.as_slice() {
            [peer] => Ok(peer.handle),
            other => Err(HarnessError::Missing(format!(
                "expected one {} peer for {}, found {}",
                room_type,
                id,
                other.len()
            ))),
        }
    }

    /// In-memory primitive backing a peer
    pub fn primitive(&self, handle: PeerHandle) -> HarnessResult<MemoryHandle> {
        self.factory
            .handle_for(handle)
            .ok_or_else(|| HarnessError::Missing(format!("primitive for {}", handle)))
    }
}

/// Run every node until a full round processes nothing
pub async fn settle(nodes: &mut [&mut TestNode]) -> HarnessResult<()> {
    for _ in 0..MAX_ROUNDS {
        let mut progressed = false;
        for node in nodes.iter_mut() {
            if node.drain().await? > 0 {
                progressed = true;
            }
        }
        if !progressed {
            return Ok(());
        }
    }
    Err(HarnessError::Timeout("mesh did not settle".to_string()))
}

/// Relay participant driven by hand
pub struct RawSession {
    pub transport: RelayTransport,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl RawSession {
    pub async fn send(&self, message: SignalingMessage) -> HarnessResult<()> {
        self.transport.send(message).await?;
        Ok(())
    }

    /// Send an offer to `to`
    pub async fn offer(&self, to: &str, sid: &str, room_type: RoomType) -> HarnessResult<()> {
        self.send(offer_message(to, sid, room_type)).await
    }

    /// Next signaling message delivered to this session
    pub async fn next_message(&mut self) -> HarnessResult<SignalingMessage> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), self.inbound.recv())
                .await
                .map_err(|_| HarnessError::Timeout("no signaling message".to_string()))?
                .ok_or_else(|| HarnessError::Missing("relay stream closed".to_string()))?;
            if let TransportEvent::Message(message) = event {
                return Ok(message);
            }
        }
    }

    /// Every signaling message delivered so far
    pub fn drain_messages(&mut self) -> Vec<SignalingMessage> {
        let mut messages = Vec::new();
        while let Ok(event) = self.inbound.try_recv() {
            if let TransportEvent::Message(message) = event {
                messages.push(message);
            }
        }
        messages
    }
}

/// Offer message with a throwaway SDP body
pub fn offer_message(to: &str, sid: &str, room_type: RoomType) -> SignalingMessage {
    let payload = SessionDescriptionPayload::new(
        SessionDescription::offer("v=0\r\no=raw 0 0 IN IP4 127.0.0.1\r\ns=-\r\n"),
        None,
    );
    SignalingMessage::new(to, MessageType::Offer)
        .with_sid(sid)
        .with_room_type(room_type)
        .with_payload(serde_json::to_value(payload).expect("payload encodes"))
}
