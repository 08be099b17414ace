//! Transport capability seam
//!
//! A session drives negotiation through [`PeerConnection`] and moves bytes
//! through [`DataChannel`]. Both are implemented on top of webrtc-rs
//! ([`super::rtc`]) and by an in-memory loopback for tests.
//!
//! Callback-style transport events are surfaced as an unbounded event stream
//! that the owner takes exactly once.

use crate::payload::Payload;
use crate::signaling::protocol::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Aggregate connection state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing negotiated
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Transport usable
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed locally
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Readiness of a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataChannelState::Connecting => "connecting",
            DataChannelState::Open => "open",
            DataChannelState::Closing => "closing",
            DataChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events raised by a peer connection
pub enum PeerConnectionEvent {
    /// Local candidate gathered; forward it to the remote
    IceCandidate(IceCandidate),
    /// Remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// Aggregate connection state changed
    StateChange(ConnectionState),
}

impl fmt::Debug for PeerConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerConnectionEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerConnectionEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
            PeerConnectionEvent::StateChange(s) => f.debug_tuple("StateChange").field(s).finish(),
        }
    }
}

/// Events raised by a data channel
#[derive(Debug, Clone, PartialEq)]
pub enum DataChannelEvent {
    Open,
    Close,
    Error(String),
    /// Message received from the remote
    Message(Payload),
    /// Buffered amount fell to or below the low threshold
    BufferedAmountLow,
}

/// Ordered, reliable data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> String;

    /// Current readiness
    fn ready_state(&self) -> DataChannelState;

    /// Bytes queued in the transport and not yet sent
    async fn buffered_amount(&self) -> usize;

    /// Threshold at or below which [`DataChannelEvent::BufferedAmountLow`] fires
    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Hand a payload to the transport; returns bytes accepted
    async fn send(&self, payload: &Payload) -> Result<usize>;

    /// Take the event stream; `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// Offer/answer/candidate primitives of a peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an ordered, reliable data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; fails before a remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Current aggregate state
    fn connection_state(&self) -> ConnectionState;

    /// Take the event stream; `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>;

    async fn close(&self) -> Result<()>;
}
