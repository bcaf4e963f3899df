//! Error types for the coordinator.

use rekindle_error::CommonError;
use rekindle_snapshot::SnapshotError;
use rekindle_vmm::VmmError;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the coordinator.
///
/// Inner error kinds propagate unchanged; the coordinator only attaches
/// context strings and never swallows a core error.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Common errors (not found, already exists, timeout, cancellation).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Error from the snapshot manager.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Error from the hypervisor control plane.
    #[error("VMM error: {0}")]
    Vmm(#[from] VmmError),

    /// Snapshot miss with no remote storage configured to fall back to.
    #[error("snapshot unavailable and remote storage disabled: {0}")]
    RemoteUnavailable(String),

    /// Opaque failure from the container runtime collaborator.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Opaque failure from the network manager collaborator.
    #[error("network error: {0}")]
    Network(String),
}

impl CoreError {
    /// Returns true if this is a missing-resource error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Common(e) => e.is_not_found(),
            Self::Snapshot(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if this is an already-exists error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Common(e) => e.is_already_exists(),
            Self::Snapshot(e) => e.is_already_exists(),
            _ => false,
        }
    }

    /// Returns true if the operation was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Common(CommonError::Cancelled(_)))
            || matches!(
                self,
                Self::Snapshot(SnapshotError::Common(CommonError::Cancelled(_)))
            )
    }
}
