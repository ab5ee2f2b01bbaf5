//! Peer management
//!
//! - `connection`: per-peer negotiation state machine
//! - `lifecycle`: logical peer state and ICE restart budget
//! - `manager`: the mesh registry owning every peer of a room

pub mod connection;
pub mod lifecycle;
pub mod manager;

pub use connection::{new_sid, Peer, PeerOptions};
pub use lifecycle::{IceRestartBudget, PeerState};
pub use manager::{MediaKind, MeshChannels, MeshRegistry};
