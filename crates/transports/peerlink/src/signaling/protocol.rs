//! JSON-RPC 2.0 relay protocol types
//!
//! Every frame on the relay WebSocket is a JSON-RPC 2.0 request, response,
//! error, or notification. Requests flow client → relay; notifications flow
//! relay → client (`peers`, `initiate`, `signal`).

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Relay method names
pub mod methods {
    /// First request on every connection; claims an identity
    pub const HANDSHAKE: &str = "handshake";
    /// Join a two-member rendezvous channel
    pub const CHANNEL: &str = "channel";
    /// Forward an opaque payload to a peer or channel
    pub const SIGNAL: &str = "signal";
    /// List live peer identities
    pub const PEER_LIST: &str = "peer.list";
    /// Relay → client: live identity list changed
    pub const PEERS: &str = "peers";
    /// Relay → client: you are the offering side for a channel
    pub const INITIATE: &str = "initiate";
}

/// Standard JSON-RPC 2.0 error codes plus relay-specific codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Signal addressed to an identity that is not connected
    pub const UNKNOWN_RECEIVER: i32 = -32000;

    /// Claimed identity is malformed
    pub const INVALID_PEER_ID: i32 = -32010;

    /// Claimed identity is held by another live connection
    pub const PEER_ALREADY_CONNECTED: i32 = -32011;

    /// Channel id is malformed
    pub const INVALID_CHANNEL_ID: i32 = -32012;

    /// Channel already has two members
    pub const CHANNEL_FULL: i32 = -32013;

    /// Channel-addressed signal from a non-member
    pub const NOT_CHANNEL_MEMBER: i32 = -32014;

    /// Request sent before a successful handshake
    pub const HANDSHAKE_REQUIRED: i32 = -32015;
}

static IDENTITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identity pattern compiles"));

fn is_valid_identity(s: &str) -> bool {
    IDENTITY_PATTERN.is_match(s)
}

/// Identity of a peer connected to the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a claimed identity
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if is_valid_identity(&s) {
            Ok(Self(s))
        } else {
            Err(Error::InvalidPeerId(s))
        }
    }

    /// Borrow the identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a two-member rendezvous channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    /// Validate and wrap a channel name
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if is_valid_identity(&s) {
            Ok(Self(s))
        } else {
            Err(Error::InvalidChannelId(s))
        }
    }

    /// Borrow the channel name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing key for a signal: one peer, or the other member of a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Deliver to a single connected peer
    Peer(PeerId),
    /// Deliver to every other member of a channel
    Channel(ChannelId),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Peer(id) => write!(f, "peer:{}", id),
            Destination::Channel(id) => write!(f, "channel:{}", id),
        }
    }
}

/// JSON-RPC 2.0 request (or notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Result data
    pub result: Value,

    /// Request ID this response corresponds to
    pub id: Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Error details
    pub error: ErrorObject,

    /// Request ID this error corresponds to
    pub id: Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any frame a client can receive from the relay
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IncomingFrame {
    /// Successful reply to a request
    Response(JsonRpcResponse),
    /// Error reply to a request
    Error(JsonRpcError),
    /// Relay-initiated notification
    Notification(JsonRpcRequest),
}

/// Parameters for `handshake`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeParams {
    /// Claimed identity; validated by the relay
    pub peer_id: String,
}

/// Parameters for `channel`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelParams {
    /// Channel to join; validated by the relay
    pub channel_id: String,
}

/// Parameters for a client → relay `signal`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SignalParams {
    /// Peer-addressed signal
    Peer {
        /// Receiver identity
        to: String,
        /// Opaque payload
        signal: Value,
    },
    /// Channel-addressed signal
    Channel {
        /// Channel whose other member receives the payload
        channel_id: String,
        /// Opaque payload
        data: Value,
    },
}

impl SignalParams {
    /// Build params for a destination
    pub fn new(destination: &Destination, payload: Value) -> Self {
        match destination {
            Destination::Peer(to) => SignalParams::Peer {
                to: to.to_string(),
                signal: payload,
            },
            Destination::Channel(channel_id) => SignalParams::Channel {
                channel_id: channel_id.to_string(),
                data: payload,
            },
        }
    }
}

/// Parameters for a relay → client `signal` notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DeliveredSignal {
    /// Peer-addressed signal, tagged with the sender
    Peer {
        /// Sender identity
        from: PeerId,
        /// Opaque payload, byte-for-byte as sent
        signal: Value,
    },
    /// Channel-addressed signal
    Channel {
        /// Channel the payload was sent on
        channel_id: ChannelId,
        /// Opaque payload, byte-for-byte as sent
        data: Value,
    },
}

/// Parameters for a `peers` notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeersParams {
    /// Live identities in admission order
    pub peers: Vec<PeerId>,
}

/// Parameters for an `initiate` notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitiateParams {
    /// Channel the receiver should send an offer on
    pub channel_id: ChannelId,
}

/// Relay → client notification
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Live identity list changed
    Peers(Vec<PeerId>),
    /// Receiver is the offering side for a channel
    Initiate(ChannelId),
    /// Forwarded signal
    Signal(DeliveredSignal),
}

impl Notification {
    /// Get the method name
    pub fn method_name(&self) -> &'static str {
        match self {
            Notification::Peers(_) => methods::PEERS,
            Notification::Initiate(_) => methods::INITIATE,
            Notification::Signal(_) => methods::SIGNAL,
        }
    }

    /// Encode as a JSON-RPC notification
    pub fn to_request(&self) -> Result<JsonRpcRequest> {
        let params = match self {
            Notification::Peers(peers) => serde_json::to_value(PeersParams {
                peers: peers.clone(),
            })?,
            Notification::Initiate(channel_id) => serde_json::to_value(InitiateParams {
                channel_id: channel_id.clone(),
            })?,
            Notification::Signal(signal) => serde_json::to_value(signal)?,
        };
        Ok(JsonRpcRequest::new(self.method_name(), params, None))
    }

    /// Decode a JSON-RPC notification
    pub fn from_request(request: JsonRpcRequest) -> Result<Self> {
        match request.method.as_str() {
            methods::PEERS => {
                let params: PeersParams = serde_json::from_value(request.params)?;
                Ok(Notification::Peers(params.peers))
            }
            methods::INITIATE => {
                let params: InitiateParams = serde_json::from_value(request.params)?;
                Ok(Notification::Initiate(params.channel_id))
            }
            methods::SIGNAL => Ok(Notification::Signal(serde_json::from_value(
                request.params,
            )?)),
            other => Err(Error::Serialization(format!(
                "Unknown notification method: {}",
                other
            ))),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        self.to_request()?.to_json()
    }
}

/// Session description as carried inside offer/answer signals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// `offer` or `answer`
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an offer SDP
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an answer SDP
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer half of the handshake
    Offer,
    /// Answer half of the handshake
    Answer,
}

/// ICE candidate as carried inside candidate signals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Payload sessions put inside `signal`/`data`; the relay never reads it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SignalPayload {
    /// `{"offer": {...}}`
    Offer(SessionDescription),
    /// `{"answer": {...}}`
    Answer(SessionDescription),
    /// `{"candidate": {...}}`
    Candidate(IceCandidate),
}

impl SignalPayload {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::Candidate(_) => "candidate",
        }
    }
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: &str, params: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::Serialization(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Serialization(format!("Failed to deserialize JSON-RPC request: {}", e))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::Serialization(format!("Failed to serialize JSON-RPC response: {}", e))
        })
    }
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: String, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code,
                message,
                data: None,
            },
            id,
        }
    }

    /// Create a JSON-RPC error from a relay error
    pub fn from_error(err: &Error, id: Value) -> Self {
        Self::new(err.rpc_code(), err.to_string(), id)
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::Serialization(format!("Failed to serialize JSON-RPC error: {}", e))
        })
    }
}
