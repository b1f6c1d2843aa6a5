//! Error types for the shape engine.

use shapesync_core::DbError;
use shapesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while streaming or applying a shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the request can be retried.
        retryable: bool,
    },

    /// The server answered with a status the stream cannot continue past.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, or a summary of it.
        message: String,
    },

    /// The response could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A required response header was absent.
    #[error("response is missing the {0} header")]
    MissingHeader(&'static str),

    /// Applying a batch to the local database failed.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// A change could not be turned into local writes.
    #[error("cannot apply change {key}: {reason}")]
    InvalidChange {
        /// Row key of the change.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Every retry attempt failed.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final failure.
        last: Box<SyncError>,
    },

    /// The stream was aborted through its abort signal.
    #[error("stream aborted")]
    Aborted,

    /// The stream stopped before the awaited condition was met.
    #[error("stream stopped: {0}")]
    Stopped(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a status error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates an invalid change error.
    pub fn invalid_change(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChange {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..=599).contains(status)
            }
            SyncError::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid url").is_retryable());
        assert!(SyncError::status(503, "unavailable").is_retryable());
        assert!(SyncError::status(429, "slow down").is_retryable());
        assert!(!SyncError::status(400, "bad where clause").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::Aborted.is_retryable());
        assert!(!SyncError::Protocol(ProtocolError::MalformedBody("x".into())).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::RetriesExhausted {
            attempts: 3,
            last: Box::new(SyncError::status(502, "bad gateway")),
        };
        assert_eq!(
            err.to_string(),
            "gave up after 3 attempts: server returned 502: bad gateway"
        );

        let err: SyncError = DbError::MissingResult.into();
        assert!(err.to_string().starts_with("database error"));
    }
}
