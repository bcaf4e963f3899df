//! Error types for snapshot management.

use rekindle_error::CommonError;
use rekindle_store::StoreError;
use thiserror::Error;

/// Result type alias for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors produced by the snapshot manager.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Common errors (I/O, not found, already exists, cancellation).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Acquire of a snapshot whose creation has not been committed yet.
    #[error("snapshot not ready: {0}")]
    NotReady(String),

    /// Delete (or re-commit) of an already committed snapshot.
    #[error("snapshot already committed: {0}")]
    AlreadyCommitted(String),

    /// Downloaded data does not match its content address or declared size.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Failure from the object store or dedup index.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SnapshotError {
    /// Creates a new integrity error.
    #[must_use]
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Returns true if this is a missing-revision (or missing-object) error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Common(CommonError::NotFound(_)) | Self::Store(StoreError::NotFound(_))
        )
    }

    /// Returns true if this is an already-exists error.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::Common(CommonError::AlreadyExists(_)))
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
