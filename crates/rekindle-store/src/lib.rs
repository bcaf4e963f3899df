//! Blob plane for rekindle snapshots.
//!
//! Two pieces live here:
//!
//! - [`ObjectStore`]: put/get of content-addressed memory chunks and
//!   per-revision snapshot objects, backed by an S3-compatible endpoint
//!   ([`S3Store`]) or by memory ([`MemoryStore`]) for tests and
//!   orchestrator-less development.
//! - [`DedupIndex`]: an advisory existence store for chunk hashes that saves
//!   redundant uploads. Correctness never depends on it; a missed or wiped
//!   entry only costs one idempotent re-put.

mod error;
mod index;
mod memory;
mod object;

pub use error::{Result, StoreError};
pub use index::{DedupIndex, TtlIndex};
pub use memory::MemoryStore;
pub use object::{ObjectStore, S3Config, S3Store};
