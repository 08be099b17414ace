//! Peer-to-peer data channels with a rendezvous signal relay
//!
//! Two halves share one wire protocol (JSON-RPC 2.0 over WebSocket):
//!
//! - **Relay**: admits peers under unique identities, announces the live
//!   peer list, pairs peers through two-member channels, and forwards
//!   opaque signaling payloads.
//! - **Session**: negotiates a WebRTC connection through the relay and
//!   sends text/binary payloads over an ordered data channel, deferring
//!   sends while the transport buffer is above the high watermark.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   JSON-RPC / WS   ┌─────────────┐   JSON-RPC / WS   ┌──────────────┐
//! │ PeerSession  │ ◄───────────────► │ RelayServer │ ◄───────────────► │ PeerSession  │
//! │ ├─ Signaling │                   │ SignalRelay │                   │ ├─ Signaling │
//! │ ├─ SendQueue │                   └─────────────┘                   │ ├─ SendQueue │
//! │ └─ PeerConn  │ ◄──────────── data channel (SCTP/DTLS) ───────────► │ └─ PeerConn  │
//! └──────────────┘                                                     └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use peerlink::{PeerSession, RelayConfig, RelayServer, SessionConfig};
//!
//! let relay = RelayServer::new(RelayConfig::default())?.start().await?;
//! let config = SessionConfig::with_signal_server(relay.url());
//!
//! let alice = PeerSession::connect_relay(config.clone(), "alice").await?;
//! let bob = PeerSession::connect_relay(config, "bob").await?;
//! let mut incoming = bob.take_incoming().unwrap();
//!
//! alice.connect("bob").await?;
//! alice.send_async("hi").await?;
//! assert_eq!(incoming.recv().await, Some("hi".into()));
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod payload;
pub mod peer;
pub mod poll;
pub mod sdp;
pub mod signaling;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{RelayConfig, SessionConfig, TurnServerConfig, HIGH_WATERMARK};
pub use error::{Error, Result};
pub use payload::{Payload, MAX_MESSAGE_SIZE};
pub use peer::{PeerSession, SessionDebugState, SessionState};
pub use signaling::{
    ChannelId, Destination, PeerId, RelayServer, RelayServerHandle, SignalingClient,
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
