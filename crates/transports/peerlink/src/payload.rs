//! Outbound/inbound data-channel payloads and their wire byte length

use crate::{Error, Result};
use bytes::Bytes;
use serde_json::Value;

/// Largest payload `send_async` accepts (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A message carried over a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text, delivered as a string message
    Text(String),
    /// Raw bytes, delivered as a binary message
    Binary(Bytes),
}

impl Payload {
    /// Bytes this payload occupies on the wire
    pub fn byte_length(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    /// Whether this is a text payload
    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    /// Borrow the payload as bytes (text is its UTF-8 encoding)
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Binary(b) => b,
        }
    }

    /// Rebuild a payload from a received frame
    pub fn from_wire(data: Bytes, is_string: bool) -> Self {
        if is_string {
            match String::from_utf8(data.to_vec()) {
                Ok(s) => Payload::Text(s),
                Err(_) => Payload::Binary(data),
            }
        } else {
            Payload::Binary(data)
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(v))
    }
}

impl From<&[u8]> for Payload {
    fn from(v: &[u8]) -> Self {
        Payload::Binary(Bytes::copy_from_slice(v))
    }
}

/// Loosely-typed values (e.g. from a JSON bridge) only map to text
impl TryFrom<Value> for Payload {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Payload::Text(s)),
            Value::Null => Err(Error::UnsupportedMessageType("null".to_string())),
            Value::Bool(_) => Err(Error::UnsupportedMessageType("boolean".to_string())),
            Value::Number(_) => Err(Error::UnsupportedMessageType("number".to_string())),
            Value::Array(_) => Err(Error::UnsupportedMessageType("array".to_string())),
            Value::Object(_) => Err(Error::UnsupportedMessageType("object".to_string())),
        }
    }
}

/// Check a payload against `limit` and return its byte length
pub fn validate_message(payload: &Payload, limit: usize) -> Result<usize> {
    let length = payload.byte_length();
    if length > limit {
        return Err(Error::MessageTooBig {
            limit,
            actual: length,
        });
    }
    Ok(length)
}
