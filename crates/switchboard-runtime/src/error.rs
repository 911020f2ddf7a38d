//! Runtime error types.

use thiserror::Error;

use switchboard_core::PersistenceError;
use switchboard_framework::DispatchError;

pub use crate::config::{ConfigError, ConfigResult};

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The dispatcher could not be built or stopped with an error.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The persistence backend could not be opened.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// `run` was called on a runtime that already ran.
    #[error("Runtime has already been started")]
    AlreadyStarted,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
