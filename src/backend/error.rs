//! Error types for the stream backends.

use std::time::Duration;

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Error text fragments that indicate the backend could not be reached.
const CONNECTIVITY_MARKERS: &[&str] = &[
    "connection",
    "connect",
    "refused",
    "reset by peer",
    "broken pipe",
    "timed out",
    "timeout",
    "went away",
    "unreachable",
    "loading",
    "unexpected eof",
];

/// Errors that can occur when talking to a stream backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An I/O error occurred during communication.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server returned an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The reply data was malformed or unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reply type did not match what was expected.
    #[error("unexpected response type: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// The expected type description.
        expected: &'static str,
        /// The actual type description.
        actual: String,
    },

    /// The connection to the server was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting or waiting for a reply took too long.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An error from the `redis` crate driver.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl BackendError {
    /// Returns true if the failure means the backend is unreachable.
    ///
    /// Structured variants are checked first, then the error text.
    pub fn is_connection(&self) -> bool {
        match self {
            BackendError::Io(_) | BackendError::ConnectionClosed | BackendError::Timeout(_) => {
                true
            }
            BackendError::Redis(e)
                if e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout() =>
            {
                true
            }
            other => looks_like_connection_failure(&other.to_string()),
        }
    }

    /// Returns true if this is the `BUSYGROUP` reply to a group create.
    pub fn is_busy_group(&self) -> bool {
        match self {
            BackendError::Server(msg) => msg.starts_with("BUSYGROUP"),
            BackendError::Redis(e) => {
                e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
            }
            _ => false,
        }
    }

    /// Returns true if the stream or consumer group named in the command
    /// does not exist.
    pub fn is_no_group(&self) -> bool {
        match self {
            BackendError::Server(msg) => msg.starts_with("NOGROUP"),
            BackendError::Redis(e) => {
                e.code() == Some("NOGROUP") || e.to_string().contains("NOGROUP")
            }
            _ => false,
        }
    }
}

/// Classify free-form error text as a connectivity problem.
pub fn looks_like_connection_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    CONNECTIVITY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
