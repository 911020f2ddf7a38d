//! Error types shared by the persistence backends.

use thiserror::Error;

/// Errors raised by a [`Persistence`](crate::Persistence) backend.
///
/// The payloads are strings so the error stays `Clone`; the dispatcher hands
/// the same failure to several error paths.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// Reading or writing the backing store failed.
    #[error("persistence I/O error: {0}")]
    Io(String),

    /// The stored document could not be encoded or decoded.
    #[error("persistence serialization error: {0}")]
    Serialization(String),

    /// A stored conversation key could not be decoded.
    #[error("invalid conversation key '{key}': {reason}")]
    InvalidKey {
        /// The raw encoded key.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// Backend-specific failure.
    #[error("persistence backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    /// Creates a backend error from any message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;
