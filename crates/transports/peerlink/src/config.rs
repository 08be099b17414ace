//! Configuration types for the relay server and peer sessions

use crate::payload::MAX_MESSAGE_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Buffered bytes above which queued sends are deferred (1 MiB)
pub const HIGH_WATERMARK: usize = 1024 * 1024;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to
    pub bind_address: SocketAddr,

    /// Largest accepted WebSocket frame in bytes (default: 1 MiB)
    pub max_frame_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3333)),
            max_frame_size: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < 1024 {
            return Err(Error::InvalidConfig(
                "max_frame_size must be at least 1024 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Peer session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Relay WebSocket URL (ws:// or wss://)
    pub signal_server_url: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label of the locally created data channel
    pub channel_label: String,

    /// Bound on waiting for the connection to report "connected" (default: 10s)
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Bound on a drain waiting for the channel to open (default: 5s)
    #[serde(with = "duration_ms")]
    pub channel_open_timeout: Duration,

    /// Interval between readiness checks (default: 100ms)
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Delay before retrying a drain deferred by backpressure (default: 100ms)
    #[serde(with = "duration_ms")]
    pub backpressure_retry_delay: Duration,

    /// Buffered-byte threshold for deferring sends (default: 1 MiB)
    pub high_watermark: usize,

    /// Largest payload accepted by `send_async` (default: 64 KiB)
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signal_server_url: "ws://localhost:3333".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            channel_label: "data".to_string(),
            connect_timeout: Duration::from_secs(10),
            channel_open_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            backpressure_retry_delay: Duration::from_millis(100),
            high_watermark: HIGH_WATERMARK,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    /// Config pointing at a specific relay, defaults otherwise
    pub fn with_signal_server(url: impl Into<String>) -> Self {
        Self {
            signal_server_url: url.into(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the relay URL is not ws:// or wss://
    /// - a STUN/TURN URL has the wrong scheme
    /// - any timeout or interval is zero
    /// - the message cap is zero or not below the high watermark
    pub fn validate(&self) -> Result<()> {
        if !self.signal_server_url.starts_with("ws://")
            && !self.signal_server_url.starts_with("wss://")
        {
            return Err(Error::InvalidConfig(format!(
                "signal_server_url must start with ws:// or wss://, got '{}'",
                self.signal_server_url
            )));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun: or stuns:, got '{}'",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got '{}'",
                    turn.url
                )));
            }
        }

        if self.channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }

        if self.connect_timeout.is_zero()
            || self.channel_open_timeout.is_zero()
            || self.poll_interval.is_zero()
            || self.backpressure_retry_delay.is_zero()
        {
            return Err(Error::InvalidConfig(
                "timeouts and intervals must be non-zero".to_string(),
            ));
        }

        if self.max_message_size == 0 || self.max_message_size >= self.high_watermark {
            return Err(Error::InvalidConfig(format!(
                "max_message_size ({}) must be non-zero and below high_watermark ({})",
                self.max_message_size, self.high_watermark
            )));
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
