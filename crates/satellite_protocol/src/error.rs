//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing, decoding or converting protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame carried a message type tag outside the catalog.
    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(u8),

    /// A frame announced a payload larger than the decoder accepts.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A payload could not be decoded as the tagged message.
    #[error("failed to decode {message_type}: {message}")]
    Decode {
        /// Name of the message being decoded.
        message_type: &'static str,
        /// Decoder error description.
        message: String,
    },

    /// A column type has no row codec.
    #[error("unknown data type: {0}")]
    UnknownDataType(String),

    /// Row data does not line up with the relation.
    #[error("invalid row data: {0}")]
    InvalidRow(String),

    /// A JSON row snapshot could not be parsed or produced.
    #[error("json error: {0}")]
    Json(String),

    /// A change referenced a table with no known relation.
    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    /// An oplog row carried an unrecognised operation type.
    #[error("unknown operation type: {0}")]
    UnknownOpType(String),

    /// An oplog timestamp could not be parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl ProtocolError {
    /// Creates a decode error for the given message type.
    pub fn decode(message_type: &'static str, message: impl ToString) -> Self {
        Self::Decode {
            message_type,
            message: message.to_string(),
        }
    }

    /// Creates an invalid row error.
    pub fn invalid_row(message: impl Into<String>) -> Self {
        Self::InvalidRow(message.into())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnexpectedMessageType(42);
        assert_eq!(err.to_string(), "unexpected message type: 42");

        let err = ProtocolError::FrameTooLarge {
            size: 20,
            limit: 10,
        };
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn json_conversion() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
