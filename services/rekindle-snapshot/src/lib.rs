//! Snapshot records and the snapshot manager.
//!
//! A snapshot is the pair (guest memory image, VMM device state) of a paused
//! microVM plus a self-describing info file, keyed by the function revision
//! that produced it. The [`SnapshotManager`] owns the `revision → record`
//! map and the `INIT → READY → DELETED` lifecycle: the coordinator calls
//! [`SnapshotManager::init_snapshot`] before the hypervisor writes any
//! files and [`SnapshotManager::commit_snapshot`] once they are complete, so
//! the manager never assumes files exist before commit.
//!
//! With a remote store configured, the memory image is chunked into
//! fixed-size blocks deduplicated across revisions via SHA-256
//! content-addressing, and any node can reconstruct a snapshot from the
//! object store alone.

mod error;
mod info;
mod manager;
mod record;
pub mod sparse;

pub use error::{Result, SnapshotError};
pub use info::{SnapshotInfo, INFO_FORMAT_VERSION};
pub use manager::{SnapshotManager, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_TTL};
pub use record::Snapshot;
