//! Error types for the replication engine.

use satellite_protocol::messages::sat_error_resp::ErrorCode;
use satellite_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type SatelliteResult<T> = Result<T, SatelliteError>;

/// Result type for database adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by a database adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Any SQLite failure.
    #[error("sqlite error: {message}")]
    Sqlite {
        /// Error message.
        message: String,
        /// Extended SQLite result code, when known.
        code: Option<i32>,
    },

    /// A foreign key constraint failed, usually at commit.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
}

impl AdapterError {
    /// Creates a generic SQLite error without a result code.
    pub fn sqlite(message: impl Into<String>) -> Self {
        Self::Sqlite {
            message: message.into(),
            code: None,
        }
    }
}

impl From<rusqlite::Error> for AdapterError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Self::ForeignKeyViolation(
                    message
                        .clone()
                        .unwrap_or_else(|| "FOREIGN KEY constraint failed".into()),
                )
            }
            rusqlite::Error::SqliteFailure(failure, _) => Self::Sqlite {
                message: err.to_string(),
                code: Some(failure.extended_code),
            },
            _ => Self::sqlite(err.to_string()),
        }
    }
}

/// Errors that can occur in the replication client or process.
#[derive(Error, Debug, Clone)]
pub enum SatelliteError {
    /// Inbound replication was already started or is starting.
    #[error("replication already started")]
    ReplicationAlreadyStarted,

    /// Inbound replication is not running.
    #[error("replication not started")]
    ReplicationNotStarted,

    /// No response arrived within the configured timeout.
    #[error("{request} timed out")]
    Timeout {
        /// Name of the request that timed out.
        request: &'static str,
    },

    /// A message arrived that nothing was waiting for.
    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(String),

    /// The server broke the replication protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An operation was called in a state that does not allow it.
    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    /// Authentication was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server answered a request with an error.
    #[error("server error: {code:?}")]
    Server {
        /// Error code sent by the server.
        code: ErrorCode,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// No transport is open.
    #[error("not connected to server")]
    NotConnected,

    /// The transport closed while a request was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] AdapterError),

    /// Wire protocol or oplog model error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Required system tables are missing.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// An applied migration no longer matches its bundled definition.
    #[error("migration {name} does not match the applied version: {reason}")]
    MigrationMismatch {
        /// Migration name.
        name: String,
        /// What differs.
        reason: String,
    },

    /// An acknowledgement points past what was sent.
    #[error("invalid position {position}: {reason}")]
    InvalidPosition {
        /// Acknowledged row id.
        position: u64,
        /// Why it was rejected.
        reason: String,
    },
}

impl SatelliteError {
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

    /// Creates a protocol violation.
    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SatelliteError::Transport { retryable, .. } => *retryable,
            SatelliteError::Timeout { .. } => true,
            SatelliteError::ConnectionClosed => true,
            SatelliteError::NotConnected => true,
            SatelliteError::Server { code } => *code == ErrorCode::Internal,
            _ => false,
        }
    }

    /// Returns true if the process cannot run with this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SatelliteError::InvalidSchema(_) | SatelliteError::MigrationMismatch { .. }
        )
    }

    /// Stable code name of the error, as reported to hosts.
    pub fn code(&self) -> &'static str {
        match self {
            SatelliteError::ReplicationAlreadyStarted => "REPLICATION_ALREADY_STARTED",
            SatelliteError::ReplicationNotStarted => "REPLICATION_NOT_STARTED",
            SatelliteError::Timeout { .. } => "TIMEOUT",
            SatelliteError::UnexpectedMessageType(_) => "UNEXPECTED_MESSAGE_TYPE",
            SatelliteError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            SatelliteError::UnexpectedState(_) => "UNEXPECTED_STATE",
            SatelliteError::Auth(_) => "AUTH_ERROR",
            SatelliteError::Server { .. } => "SERVER_ERROR",
            SatelliteError::Transport { .. } => "CONNECTION_FAILED",
            SatelliteError::NotConnected => "NOT_CONNECTED",
            SatelliteError::ConnectionClosed => "CONNECTION_CLOSED",
            SatelliteError::Database(AdapterError::ForeignKeyViolation(_)) => {
                "FOREIGN_KEY_VIOLATION"
            }
            SatelliteError::Database(_) => "INTERNAL",
            SatelliteError::Protocol(ProtocolError::UnknownDataType(_)) => "UNKNOWN_DATA_TYPE",
            SatelliteError::Protocol(_) => "PROTOCOL_VIOLATION",
            SatelliteError::InvalidSchema(_) => "INVALID_SCHEMA",
            SatelliteError::MigrationMismatch { .. } => "MIGRATION_MISMATCH",
            SatelliteError::InvalidPosition { .. } => "INVALID_POSITION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SatelliteError::transport_retryable("connection refused").is_retryable());
        assert!(!SatelliteError::transport_fatal("bad address").is_retryable());
        assert!(SatelliteError::Timeout { request: "auth" }.is_retryable());
        assert!(SatelliteError::Server {
            code: ErrorCode::Internal
        }
        .is_retryable());
        assert!(!SatelliteError::Server {
            code: ErrorCode::AuthFailed
        }
        .is_retryable());
        assert!(!SatelliteError::ReplicationAlreadyStarted.is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SatelliteError::InvalidSchema("missing oplog".into()).is_fatal());
        assert!(!SatelliteError::NotConnected.is_fatal());
    }

    #[test]
    fn codes() {
        assert_eq!(SatelliteError::Timeout { request: "x" }.code(), "TIMEOUT");
        assert_eq!(
            SatelliteError::from(AdapterError::ForeignKeyViolation("fk".into())).code(),
            "FOREIGN_KEY_VIOLATION"
        );
        assert_eq!(
            SatelliteError::from(ProtocolError::UnknownDataType("JSONB".into())).code(),
            "UNKNOWN_DATA_TYPE"
        );
    }

    #[test]
    fn error_display() {
        let err = SatelliteError::Timeout {
            request: "start replication",
        };
        assert_eq!(err.to_string(), "start replication timed out");

        let err = SatelliteError::InvalidPosition {
            position: 9,
            reason: "not sent yet".into(),
        };
        assert!(err.to_string().contains('9'));
    }
}
