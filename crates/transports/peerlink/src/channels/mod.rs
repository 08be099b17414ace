//! Outbound data-channel plumbing

pub mod send_queue;

pub use send_queue::{ChannelSlot, QueueSettings, SendQueue};
