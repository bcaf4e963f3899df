//! Error types for the hypervisor facade.

use thiserror::Error;

/// Result type alias for VMM operations.
pub type Result<T> = std::result::Result<T, VmmError>;

/// Errors surfaced by the hypervisor control plane.
///
/// The coordinator treats these as opaque apart from the message; it never
/// inspects hypervisor internals.
#[derive(Debug, Error)]
pub enum VmmError {
    /// No VM with this id is known to the hypervisor.
    #[error("unknown VM: {0}")]
    UnknownVm(String),

    /// A VM with this id already exists.
    #[error("VM already exists: {0}")]
    AlreadyExists(String),

    /// The VM is not in a state that permits the requested operation.
    #[error("invalid VM state: {0}")]
    InvalidState(String),

    /// Opaque failure reported by the hypervisor.
    #[error("hypervisor error: {0}")]
    Api(String),

    /// Host-side I/O failure while producing or consuming snapshot files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmmError {
    /// Creates an opaque hypervisor error.
    #[must_use]
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }
}
