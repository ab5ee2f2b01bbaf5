//! Data channel messaging
//!
//! - `messages`: `{type, payload}` envelope carried over data channels
//! - `table`: per-peer channel lookup and pending-send queues

pub mod messages;
pub mod table;

pub use messages::{ChannelMessage, MAX_MESSAGE_SIZE};
pub use table::ChannelTable;
