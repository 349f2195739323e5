//! Error types for sync-validation.

use sync_core::LifecycleError;
use sync_store::DbError;

/// Main error type for validation manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] DbError),

    /// `start()` was called more than once.
    #[error("validation manager has already been started")]
    AlreadyStarted,

    /// `stop()` was called on a manager that is not running.
    #[error("validation manager is not running")]
    NotRunning,

    /// `start()` was called outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

impl From<LifecycleError> for ValidationError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::AlreadyStarted => ValidationError::AlreadyStarted,
            LifecycleError::NotRunning => ValidationError::NotRunning,
        }
    }
}

/// Result type alias for validation manager operations.
pub type Result<T> = std::result::Result<T, ValidationError>;
