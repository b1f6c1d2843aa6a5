//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding shape-log responses.
///
/// Every variant describes a response the client cannot make sense of, so
/// the stream treats all of them as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The response body is not a JSON array of envelopes.
    #[error("malformed response body: {0}")]
    MalformedBody(String),

    /// A single envelope in the body is missing required fields.
    #[error("invalid message at index {index}: {reason}")]
    InvalidMessage {
        /// Position of the envelope within the body.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The server sent a control value this client does not know.
    #[error("unknown control message: {0}")]
    UnknownControl(String),

    /// The schema header could not be decoded.
    #[error("invalid schema header: {0}")]
    InvalidSchema(String),

    /// A column value could not be converted to its declared type.
    #[error("cannot parse {type_name} value {raw:?}: {reason}")]
    ValueParse {
        /// Declared Postgres type name.
        type_name: String,
        /// Raw value as received.
        raw: String,
        /// Parser diagnostic.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates an invalid message error.
    pub fn invalid_message(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            index,
            reason: reason.into(),
        }
    }

    /// Creates a value parse error.
    pub fn value_parse(
        type_name: impl Into<String>,
        raw: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ValueParse {
            type_name: type_name.into(),
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid_message(3, "missing key");
        assert_eq!(err.to_string(), "invalid message at index 3: missing key");

        let err = ProtocolError::value_parse("int4", "abc", "invalid digit");
        assert!(err.to_string().contains("int4"));
        assert!(err.to_string().contains("abc"));
    }
}
