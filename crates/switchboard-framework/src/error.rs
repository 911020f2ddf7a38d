//! Error types for the Switchboard framework.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use switchboard_core::{BoxedUpdate, ConversationKey, PersistenceError};

/// Boxed error returned by user callbacks.
pub use tower::BoxError;

/// An error shared between every error handler that receives it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors raised by the dispatcher itself.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The persistence backend failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A persistent conversation was registered on a dispatcher without persistence.
    #[error("conversation '{name}' is persistent but the dispatcher has no persistence")]
    PersistenceRequired {
        /// Name of the conversation handler.
        name: String,
    },

    /// A handler or dispatcher was configured inconsistently.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A filter or handler pattern failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// [`Dispatcher::run`](crate::Dispatcher::run) was called twice.
    #[error("dispatcher is already running")]
    AlreadyRunning,

    /// The update queue was closed on the receiving side.
    #[error("update queue is closed")]
    QueueClosed,

    /// A bounded update queue is full.
    #[error("update queue is full")]
    QueueFull,
}

impl DispatchError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

// =============================================================================
// Error routing
// =============================================================================

/// Where a routed error came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// A handler callback failed.
    Handler {
        /// The handler's name.
        handler: String,
    },
    /// Writing namespaces or conversation state back failed.
    Persistence,
    /// A scheduled job failed.
    Job {
        /// The job's name.
        name: String,
    },
    /// A conversation timeout handler failed.
    ConversationTimeout {
        /// The conversation handler's name.
        handler: String,
        /// The conversation that timed out.
        key: ConversationKey,
    },
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler { handler } => write!(f, "handler '{handler}'"),
            Self::Persistence => f.write_str("persistence"),
            Self::Job { name } => write!(f, "job '{name}'"),
            Self::ConversationTimeout { handler, key } => {
                write!(f, "timeout of conversation {key} in '{handler}'")
            }
        }
    }
}

/// An error nobody handled.
///
/// Recorded when no error handler is registered.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The update being processed, if any.
    pub update: Option<BoxedUpdate>,
    /// The error.
    pub error: SharedError,
    /// Where the error came from.
    pub source: ErrorSource,
}
