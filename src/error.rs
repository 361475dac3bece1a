//! Error types for redstream
//!
//! One variant per failure category. Connection and message-processing
//! failures are absorbed by the consume loop's backoff and reclaim
//! machinery; configuration and caller errors surface immediately.

use thiserror::Error;

use crate::backend::BackendError;
use crate::types::EntryId;

/// Boxed error carried as the cause of a stream failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for redstream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors surfaced by producers, consumers and configuration loading.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The backend could not be reached
    #[error("stream backend unreachable for '{stream}': {message}")]
    Connection {
        /// Stream being accessed
        stream: String,
        /// What was being attempted
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Append or trim failed for a reason other than connectivity
    #[error("publish to stream '{stream}' failed: {message}")]
    Publish {
        /// Stream being written
        stream: String,
        /// What was being attempted
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// The read or reclaim cycle itself failed
    #[error("consume from stream '{stream}' (group '{group}', consumer '{consumer}') failed: {message}")]
    Consume {
        /// Stream being read
        stream: String,
        /// Consumer group
        group: String,
        /// Consumer name
        consumer: String,
        /// What was being attempted
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// The handler rejected an entry; it stays pending for reclaim
    #[error("processing entry {id} from stream '{stream}' failed on attempt {attempt}: {message}")]
    MessageProcessing {
        /// Stream the entry belongs to
        stream: String,
        /// Entry ID
        id: EntryId,
        /// Delivery count at the time of the failure
        attempt: u64,
        /// Handler failure text
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// The entry payload could not be decoded into an envelope
    #[error("poison message {id} in stream '{stream}': {reason}")]
    Poison {
        /// Stream the entry belongs to
        stream: String,
        /// Entry ID
        id: EntryId,
        /// Why decoding failed
        reason: String,
    },

    /// An envelope could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration or unsupported driver
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A caller passed invalid input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StreamError {
    /// Wrap a backend failure on `stream`, classifying it as a connection
    /// failure or a publish failure.
    pub fn from_backend(stream: &str, op: &str, err: BackendError) -> Self {
        let message = format!("{} failed: {}", op, err);
        if err.is_connection() {
            StreamError::Connection {
                stream: stream.to_string(),
                message,
                source: Some(Box::new(err)),
            }
        } else {
            StreamError::Publish {
                stream: stream.to_string(),
                message,
                source: Some(Box::new(err)),
            }
        }
    }

    /// Returns true if the backend was unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, StreamError::Connection { .. })
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Connection { .. } | StreamError::MessageProcessing { .. }
        )
    }

    /// Returns true for errors caused by the caller or the configuration.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StreamError::Configuration(_)
                | StreamError::InvalidArgument(_)
                | StreamError::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_connection_failure_classified() {
        let err = StreamError::from_backend("orders", "XADD", BackendError::ConnectionClosed);
        assert!(err.is_connection());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_backend_server_failure_is_publish() {
        let err = StreamError::from_backend(
            "orders",
            "XADD",
            BackendError::Server("WRONGTYPE Operation against a key".into()),
        );
        assert!(matches!(err, StreamError::Publish { ref stream, .. } if stream == "orders"));
        assert!(!err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_caller_errors() {
        assert!(StreamError::InvalidArgument("max_len".into()).is_caller_error());
        assert!(StreamError::Configuration("driver".into()).is_caller_error());
        let poison = StreamError::Poison {
            stream: "s".into(),
            id: EntryId::new(1, 0),
            reason: "bad json".into(),
        };
        assert!(!poison.is_caller_error());
        assert_eq!(poison.to_string(), "poison message 1-0 in stream 's': bad json");
    }
}
