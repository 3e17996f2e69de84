//! Broadcast groups for pushing messages to connected clients
//!
//! The multiplexer only needs `send_to_group`; the hub facade additionally
//! manages group membership when clients subscribe and unsubscribe.

pub mod channel;
pub mod memory;

pub use channel::{BroadcastChannel, GroupMembership, HubMessage};
pub use memory::{MemoryHub, SentMessage};
