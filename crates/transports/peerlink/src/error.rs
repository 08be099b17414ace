//! Error types for the signal relay and peer sessions

use crate::signaling::protocol::error_codes;

/// Result type alias using the peerlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying signals or driving a peer session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Claimed peer identity is empty or contains characters outside `[A-Za-z0-9_-]`
    #[error("invalid peerId '{0}'")]
    InvalidPeerId(String),

    /// Another live connection already holds this identity
    #[error("peer with id '{0}' already connected")]
    PeerAlreadyConnected(String),

    /// A request other than `handshake` arrived before admission
    #[error("handshake required before '{0}'")]
    HandshakeRequired(String),

    /// Relay rejected the handshake; carries the relay's reason verbatim
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    /// Signal addressed to an identity that is not connected
    #[error("unknown receiver '{0}'")]
    UnknownReceiver(String),

    /// Channel id is empty or contains characters outside `[A-Za-z0-9_-]`
    #[error("invalid channel id '{0}'")]
    InvalidChannelId(String),

    /// Channel already has two members
    #[error("max clients reached for channel '{0}'")]
    ChannelFull(String),

    /// Sender tried to signal a channel it has not joined
    #[error("peer '{peer_id}' is not a member of channel '{channel_id}'")]
    NotChannelMember {
        /// Sending peer
        peer_id: String,
        /// Addressed channel
        channel_id: String,
    },

    /// Relay answered a request with an error object
    #[error("relay error {code}: {message}")]
    Relay {
        /// JSON-RPC error code
        code: i32,
        /// Relay's message
        message: String,
    },

    /// Offer/answer/candidate creation or application failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Payload larger than the local cap
    #[error("message too big, allowed are {limit} bytes, but message has {actual} bytes")]
    MessageTooBig {
        /// Maximum accepted byte length
        limit: usize,
        /// Byte length of the rejected payload
        actual: usize,
    },

    /// Payload kind cannot be sent over a data channel
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),

    /// Data channel did not reach `open` within the bound
    #[error("datachannel is not open")]
    ChannelNotOpen,

    /// Data channel closed while entries were still queued
    #[error("datachannel closed")]
    ChannelClosed,

    /// Underlying byte-level send failed
    #[error("send failed: {0}")]
    TransportSend(String),

    /// Bounded wait exceeded
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Session is bound to another remote, or already closed
    #[error("Session error: {0}")]
    Session(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ChannelNotOpen
                | Error::TransportSend(_)
                | Error::Negotiation(_)
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }

    /// Check if this error rejects a connection at handshake time
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPeerId(_) | Error::PeerAlreadyConnected(_) | Error::AdmissionRejected(_)
        )
    }

    /// Check if this error is a recoverable relay routing problem
    pub fn is_routing_error(&self) -> bool {
        match self {
            Error::UnknownReceiver(_)
            | Error::InvalidChannelId(_)
            | Error::ChannelFull(_)
            | Error::NotChannelMember { .. } => true,
            Error::Relay { code, .. } => matches!(
                *code,
                error_codes::UNKNOWN_RECEIVER
                    | error_codes::INVALID_CHANNEL_ID
                    | error_codes::CHANNEL_FULL
                    | error_codes::NOT_CHANNEL_MEMBER
            ),
            _ => false,
        }
    }

    /// Check if this error rejects a single payload
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Error::MessageTooBig { .. } | Error::UnsupportedMessageType(_)
        )
    }

    /// JSON-RPC error code the relay reports for this error
    pub fn rpc_code(&self) -> i32 {
        match self {
            Error::InvalidPeerId(_) => error_codes::INVALID_PEER_ID,
            Error::PeerAlreadyConnected(_) => error_codes::PEER_ALREADY_CONNECTED,
            Error::HandshakeRequired(_) => error_codes::HANDSHAKE_REQUIRED,
            Error::UnknownReceiver(_) => error_codes::UNKNOWN_RECEIVER,
            Error::InvalidChannelId(_) => error_codes::INVALID_CHANNEL_ID,
            Error::ChannelFull(_) => error_codes::CHANNEL_FULL,
            Error::NotChannelMember { .. } => error_codes::NOT_CHANNEL_MEMBER,
            Error::Relay { code, .. } => *code,
            Error::Serialization(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Rebuild a typed error from a relay error object
    pub fn from_rpc(code: i32, message: String) -> Self {
        match code {
            error_codes::INVALID_PEER_ID | error_codes::PEER_ALREADY_CONNECTED => {
                Error::AdmissionRejected(message)
            }
            _ => Error::Relay { code, message },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}
