//! Signal relay: rendezvous server, wire protocol, and client

pub mod client;
pub mod handler;
pub mod protocol;
pub mod relay;
pub mod server;

pub use client::SignalingClient;
pub use protocol::{ChannelId, Destination, Notification, PeerId, SignalPayload};
pub use relay::{Admission, JoinOutcome, SignalRelay, MAX_CHANNEL_MEMBERS};
pub use server::{RelayServer, RelayServerHandle};
