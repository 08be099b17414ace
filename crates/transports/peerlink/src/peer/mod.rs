//! Peer connections and the sessions built on them
//!
//! - [`capability`] - the connection/channel seam the session drives
//! - [`rtc`] - webrtc-rs implementation of that seam
//! - [`session`] - offer/answer/ICE negotiation and reliable sends

pub mod capability;
pub mod rtc;
pub mod session;

pub use capability::{
    ConnectionState, DataChannel, DataChannelEvent, DataChannelState, PeerConnection,
    PeerConnectionEvent,
};
pub use rtc::{RtcDataChannel, RtcPeerConnection};
pub use session::{PeerSession, SessionDebugState, SessionState};
