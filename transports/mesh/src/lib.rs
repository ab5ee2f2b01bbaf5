//! Full-mesh peer connection orchestration for RemoteMedia rooms
//!
//! This crate negotiates one connection per remote participant (and per
//! screen share) over an abstract signaling transport, routes inbound
//! signaling to the right peer, and multiplexes data-channel messaging.
//!
//! # Features
//!
//! - **Mesh topology**: one peer per remote session and room type, keyed by sid
//! - **Offer/answer negotiation**: with ICE candidates and ICE restarts
//! - **Data channels**: `{type, payload}` messages, queued until the channel opens
//! - **Screen sharing**: separate `screen` peers alongside camera peers
//! - **Pluggable primitives**: webrtc-rs or a deterministic in-memory primitive
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  SignalingTransport (relay, WebSocket, ...)            │
//! │  ↓ TransportEvent                    ↑ SignalingMessage│
//! │  MeshOrchestrator                                      │
//! │  ├─ SignalingDispatcher (route by from/roomType/sid)   │
//! │  └─ MeshRegistry (ordered peers, fan-out)              │
//! │      └─ Peer (negotiation, channels, ICE policy)       │
//! │          └─ ConnectionPrimitive (webrtc-rs / memory)   │
//! │  ↓ MeshEvent                                           │
//! │  Application                                           │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_mesh::{IceServer, MeshConfig};
//!
//! let config = MeshConfig::default()
//!     .with_nick("alice")
//!     .with_ice_servers(vec![IceServer::stun("stun:stun.l.google.com:19302")]);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.default_channel_label, "control");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use remotemedia_mesh::primitive::rtc::RtcPrimitiveFactory;
//! use remotemedia_mesh::{Capabilities, LocalRelay, MeshConfig, MeshOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn example() -> remotemedia_mesh::Result<()> {
//! let relay = LocalRelay::new();
//! let (transport, inbound) = relay.join("alice");
//! let factory = Arc::new(RtcPrimitiveFactory::new()?);
//!
//! let (mut mesh, mut events) = MeshOrchestrator::new(
//!     transport,
//!     inbound,
//!     MeshConfig::public_stun(),
//!     Capabilities::default(),
//!     factory,
//! )?;
//!
//! mesh.join_call(relay.members()).await?;
//! while mesh.step().await? {
//!     while let Ok(event) = events.try_recv() {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod peer;
pub mod primitive;
pub mod signaling;

// Re-exports for public API
pub use channels::ChannelMessage;
pub use config::{
    Capabilities, IceFailureReporting, IceServer, IceTransportPolicy, MeshConfig,
    PeerConnectionConfig, ReceiveMedia,
};
pub use error::{Error, Result};
pub use events::{MeshEvent, PeerRef};
pub use orchestrator::MeshOrchestrator;
pub use peer::{MediaKind, MeshRegistry, Peer, PeerOptions, PeerState};
pub use primitive::PeerHandle;
pub use signaling::{
    LocalRelay, MessageType, RelayTransport, RoomType, SignalingMessage, SignalingTransport,
    TransportEvent,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
