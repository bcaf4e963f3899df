//! Common error types for rekindle.
//!
//! This crate provides the unified error vocabulary shared across the
//! rekindle crates. Crate-specific error enums wrap [`CommonError`] with
//! `#[error(transparent)]` so that the error *kind* propagates unchanged
//! while each layer attaches its own context string.

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
