//! Failure taxonomy for the stream engine.
//!
//! Every failure raised inside a decode attempt is translated at the decode loop
//! boundary into a `StreamError` carrying one `ErrorKind`. Nothing else crosses
//! into consumer code: the state machine turns these into lifecycle events.

use std::fmt;

/// Category of a stream failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed source descriptor. The upstream validator is the primary gate.
    Validation,
    /// Open/handshake failure, or no first frame within the initial-connect timeout.
    Connection,
    /// Unsupported or malformed compressed payload.
    Codec,
    /// Mid-stream I/O failure or a watchdog-detected stall.
    Network,
    /// Clean end of stream.
    Disconnected,
    /// Retry schedule exhausted. Terminal until a manual restart.
    MaxRetriesExceeded,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Connection => "connection",
            ErrorKind::Codec => "codec",
            ErrorKind::Network => "network",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified stream failure with a human-readable detail.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("[{}] {message}", .kind.as_str().to_uppercase())]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Codec, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, message)
    }

    pub fn max_retries(attempts: usize) -> Self {
        Self::new(
            ErrorKind::MaxRetriesExceeded,
            format!("maximum reconnection attempts ({attempts}) exceeded"),
        )
    }

    /// Operator-facing explanation of this failure.
    ///
    /// Backend messages are matched against well-known OS/FFmpeg phrases first;
    /// the kind decides the fallback.
    pub fn user_message(&self) -> &'static str {
        if let Some(message) = describe_failure(&self.message) {
            return message;
        }
        match self.kind {
            ErrorKind::Validation => "Invalid source: the address could not be understood.",
            ErrorKind::Connection => {
                "Connection error: Unable to connect to the video source. Please check your URL and try again."
            }
            ErrorKind::Codec => "Unsupported video codec: the stream cannot be decoded.",
            ErrorKind::Network => "Network error: the stream stopped delivering frames.",
            ErrorKind::Disconnected => "Stream ended: the source closed the stream.",
            ErrorKind::MaxRetriesExceeded => {
                "Maximum reconnection attempts exceeded. Press start to try again."
            }
        }
    }
}

fn describe_failure(detail: &str) -> Option<&'static str> {
    const PATTERNS: &[(&[&str], &str)] = &[
        (
            &["timeout", "timed out"],
            "Connection timeout: The server is not responding. Please check if the URL is correct and the server is online.",
        ),
        (
            &["no such file", "errno 2"],
            "File not found: The video file does not exist. Please check the file path.",
        ),
        (
            &["errno 5", "i/o error"],
            "Camera not found: No camera device detected. Please check if your camera is connected and not in use by another application.",
        ),
        (
            &["connection refused", "errno 111"],
            "Connection refused: The server rejected the connection. Please verify the URL and server status.",
        ),
        (
            &["network unreachable", "errno 101"],
            "Network unreachable: Cannot reach the server. Please check your network connection and the URL.",
        ),
        (
            &["name or service not known", "getaddrinfo failed"],
            "Host not found: The server address is invalid or unreachable. Please check the URL.",
        ),
        (
            &["invalid data found", "unknown format"],
            "Invalid video format: The file format is not supported. Please use MP4, AVI, MKV, MOV, or FLV.",
        ),
        (
            &["no video stream"],
            "No video stream found: The source does not contain a valid video stream.",
        ),
        (
            &["permission denied", "errno 13"],
            "Permission denied: You don't have permission to access this file or device.",
        ),
    ];

    let lower = detail.to_lowercase();
    PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lower.contains(needle)))
        .map(|(_, message)| *message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_tag() {
        let err = StreamError::network("socket closed");
        assert_eq!(err.to_string(), "[NETWORK] socket closed");
    }

    #[test]
    fn user_message_prefers_detail_patterns() {
        let err = StreamError::connection("Connection refused (os error 111)");
        assert!(err.user_message().starts_with("Connection refused"));

        let err = StreamError::connection("operation Timed Out after 10s");
        assert!(err.user_message().starts_with("Connection timeout"));
    }

    #[test]
    fn user_message_falls_back_to_kind() {
        let err = StreamError::max_retries(5);
        assert!(err.message.contains('5'));
        assert!(err.user_message().starts_with("Maximum reconnection attempts"));

        let err = StreamError::codec("bitstream garbage");
        assert!(err.user_message().starts_with("Unsupported video codec"));
    }
}
