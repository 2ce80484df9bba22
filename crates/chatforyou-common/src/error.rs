//! Common error types for ChatForYou.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A signaling frame whose `id` is not part of the protocol.
    #[error("unknown signaling message id '{0}'")]
    UnknownMessage(String),

    /// A known message id with a payload that does not match its shape.
    #[error("malformed '{id}' message: {reason}")]
    Malformed { id: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
