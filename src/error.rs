//! Error types for the synchronization engine.

use crate::transport::{ServerError, ServerErrorKind};
use crate::types::ConnectionState;
use thiserror::Error;

/// Main error type for client operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtmError {
    #[error("Not subscribed: {0}")]
    NotSubscribed(String),

    #[error("Already subscribed: {0}")]
    AlreadySubscribed(String),

    #[error("Stream channel not joined: {0}")]
    NotJoined(String),

    #[error("Topic {topic} not joined on stream channel {channel}")]
    TopicNotJoined { channel: String, topic: String },

    #[error("Major revision conflict: expected {expected}, current {actual}")]
    RevisionConflict { expected: i64, actual: i64 },

    #[error("Lock not held by this user: {0}")]
    LockNotHeld(String),

    #[error("Lock {lock} owner mismatch: expected {expected:?}, actual {actual:?}")]
    OwnerMismatch {
        lock: String,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock {lock} is held by {owner}")]
    LockHeldByOther { lock: String, owner: String },

    #[error("Connection not ready (state {0})")]
    ConnectionNotReady(ConnectionState),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Already logged in")]
    AlreadyLoggedIn,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },
}

impl From<serde_json::Error> for RtmError {
    fn from(e: serde_json::Error) -> Self {
        RtmError::Serialization(e.to_string())
    }
}

impl From<ServerError> for RtmError {
    fn from(e: ServerError) -> Self {
        let ServerError { kind, message } = e;
        match kind {
            ServerErrorKind::NotSubscribed => RtmError::NotSubscribed(message),
            ServerErrorKind::NotJoined => RtmError::NotJoined(message),
            ServerErrorKind::RevisionConflict { expected, actual } => {
                RtmError::RevisionConflict { expected, actual }
            }
            ServerErrorKind::NotFound => RtmError::NotFound(message),
            ServerErrorKind::LockNotHeld => RtmError::LockNotHeld(message),
            ServerErrorKind::LockHeldByOther { owner } => RtmError::LockHeldByOther {
                lock: message,
                owner,
            },
            ServerErrorKind::OwnerMismatch { expected, actual } => RtmError::OwnerMismatch {
                lock: message,
                expected,
                actual,
            },
            ServerErrorKind::Disconnected => {
                RtmError::ConnectionNotReady(ConnectionState::Disconnected)
            }
            ServerErrorKind::InvalidArgument => RtmError::InvalidArgument(message),
            ServerErrorKind::Other(code) => RtmError::Server { code, message },
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, RtmError>;
