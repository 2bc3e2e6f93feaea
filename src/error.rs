//! Error types for Tollgate.

use thiserror::Error;

use crate::ratelimit::StorageError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid rate limit policy or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend failures
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from the storage backend rather than from
    /// caller-supplied configuration.
    pub fn is_storage(&self) -> bool {
        matches!(self, TollgateError::Storage(_))
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
