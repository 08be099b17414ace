//! Narrow session-description attribute extraction
//!
//! Only the `max-message-size` attribute is read; nothing else in the
//! description is interpreted.

use regex::Regex;
use std::sync::LazyLock;

/// Value assumed when the remote description does not announce a limit
pub const DEFAULT_REMOTE_MAX_MESSAGE_SIZE: usize = 65535;

static MAX_MESSAGE_SIZE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"a=max-message-size:\s*(\d+)").expect("max-message-size pattern compiles")
});

/// Read `a=max-message-size` from an SDP, falling back to 65535
pub fn remote_max_message_size(sdp: &str) -> usize {
    MAX_MESSAGE_SIZE_ATTR
        .captures(sdp)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .unwrap_or(DEFAULT_REMOTE_MAX_MESSAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_present() {
        let sdp = "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=sctp-port:5000\r\na=max-message-size:262144\r\n";
        assert_eq!(remote_max_message_size(sdp), 262144);
    }

    #[test]
    fn test_whitespace_after_colon() {
        assert_eq!(remote_max_message_size("a=max-message-size:   1024\r\n"), 1024);
    }

    #[test]
    fn test_attribute_missing() {
        assert_eq!(remote_max_message_size("v=0\r\n"), 65535);
    }

    #[test]
    fn test_attribute_not_numeric() {
        assert_eq!(remote_max_message_size("a=max-message-size:lots\r\n"), 65535);
    }

    #[test]
    fn test_attribute_overflow_falls_back() {
        let sdp = "a=max-message-size:999999999999999999999999999\r\n";
        assert_eq!(remote_max_message_size(sdp), 65535);
    }

    #[test]
    fn test_zero_is_adopted() {
        // 0 means "no limit" in RFC 8841; it is reported as-is
        assert_eq!(remote_max_message_size("a=max-message-size:0\r\n"), 0);
    }
}
