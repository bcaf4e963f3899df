//! Error types for the blob plane.

use rekindle_error::CommonError;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the object store and dedup index.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Common errors (I/O, cancellation, etc.).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Object key does not exist in the store.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Opaque failure from the storage client.
    #[error("storage error: {0}")]
    Client(String),

    /// Failure from the dedup index.
    #[error("dedup index error: {0}")]
    Index(String),
}

impl StoreError {
    /// Creates a new client error.
    #[must_use]
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    /// Returns true if the error is a missing-key miss.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
