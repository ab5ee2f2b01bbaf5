//! Signaling: wire protocol, transport seam and inbound dispatch
//!
//! - `protocol`: JSON envelope and payload shapes
//! - `transport`: the transport adapter trait and inbound event type
//! - `relay`: in-process transport connecting several local sessions
//! - `dispatcher`: routes inbound messages to peers by session id and sid

pub mod dispatcher;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use dispatcher::SignalingDispatcher;
pub use protocol::{MessageType, RoomType, SignalingMessage};
pub use relay::{LocalRelay, RelayTransport};
pub use transport::{SignalingTransport, TransportEvent};
