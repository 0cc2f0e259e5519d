//! Structured error types for the NodeTool client
//!
//! Decode and protocol errors are recovered where they happen (logged, frame
//! dropped). Everything else surfaces through a `Result` or through a
//! session's completion.

use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for NodeTool client operations
#[derive(Error, Debug)]
pub enum NodetoolError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Missing endpoint, clashing type registration, unusable settings
    #[error("configuration error: {message}")]
    Configuration { message: String },

    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// Handshake rejected or transport failure while connecting
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// Connect attempt exceeded its deadline
    #[error("connection timed out after {duration:?}")]
    ConnectTimeout { duration: Duration },

    /// Operation requires an established connection
    #[error("not connected")]
    NotConnected,

    // =========================================================================
    // Wire Errors
    // =========================================================================
    /// Malformed frame bytes
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Value could not be encoded (unregistered shape, missing field)
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Frame that cannot be routed (unknown job id, missing fields)
    #[error("protocol error: {message}")]
    Protocol { message: String },

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Terminal failure reported by the server or synthesized locally
    #[error("session failed: {message}")]
    Session { message: String },

    /// Wait aborted locally
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("HTTP error: {message}")]
    Http { status: Option<u16>, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodetoolError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Check if the error is transient. The client never retries on its own;
    /// this only informs a caller-side retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::ConnectTimeout { .. } => true,
            Self::Http { status, .. } => {
                matches!(status, None | Some(429) | Some(500) | Some(502) | Some(503) | Some(504))
            }
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Configuration { .. }
            | Self::NotConnected
            | Self::Decode(_)
            | Self::Serialization { .. }
            | Self::Protocol { .. }
            | Self::Session { .. }
            | Self::Cancelled => false,
        }
    }

    /// Errors that are recovered locally and must never abort a connection
    pub fn is_recoverable_frame_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Protocol { .. })
    }
}

impl From<reqwest::Error> for NodetoolError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

/// Malformed frame bytes. Keeps the original bytes for inspection.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("decode error at bytes {}..{}: {message}", range.start, range.end)]
pub struct DecodeError {
    pub message: String,
    /// Offending byte range within `bytes`
    pub range: Range<usize>,
    pub bytes: Vec<u8>,
}

impl DecodeError {
    pub fn new(message: impl Into<String>, range: Range<usize>, bytes: &[u8]) -> Self {
        Self {
            message: message.into(),
            range,
            bytes: bytes.to_vec(),
        }
    }

    /// The slice of the original frame that failed to decode
    pub fn offending_bytes(&self) -> &[u8] {
        let end = self.range.end.min(self.bytes.len());
        let start = self.range.start.min(end);
        &self.bytes[start..end]
    }
}

pub type Result<T, E = NodetoolError> = std::result::Result<T, E>;
