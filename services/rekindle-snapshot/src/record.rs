//! The snapshot record.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Basename of the guest memory image inside a snapshot directory.
pub(crate) const MEM_FILE_NAME: &str = "mem";
/// Basename of the VMM device-state blob.
pub(crate) const SNAP_FILE_NAME: &str = "snap";
/// Basename of the snapshot info file.
pub(crate) const INFO_FILE_NAME: &str = "info";

/// Metadata and file locations of one captured VM image.
///
/// Records are handed out by the manager as clones; a record with
/// `is_ready() == false` is only ever visible to the init/commit/delete
/// protocol, never to `acquire_snapshot`. Once ready, the record is
/// immutable until deleted and its files may be read concurrently by any
/// number of VM boots.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Function revision this snapshot belongs to.
    pub revision: String,
    /// Originating container image reference (informational).
    pub image: String,
    /// Directory holding the materialized files.
    pub base_dir: PathBuf,
    /// Path to the raw guest memory image.
    pub mem_file_path: PathBuf,
    /// Path to the VMM device-state blob.
    pub snapshot_file_path: PathBuf,
    /// Path to the self-describing info file.
    pub info_file_path: PathBuf,
    /// Ordered SHA-256 hex digests of the memory image's chunks.
    pub mem_chunks: Vec<String>,
    /// Total bytes of the memory image.
    pub mem_size: u64,
    /// VM that produced the snapshot, if created locally.
    pub owner_vm_id: Option<String>,
    /// Flips false → true exactly once, on commit.
    pub(crate) ready: bool,
}

impl Snapshot {
    /// Creates an uncommitted record rooted at `<base_root>/<revision>`.
    #[must_use]
    pub(crate) fn new(
        revision: &str,
        base_root: &Path,
        image: &str,
        owner_vm_id: Option<String>,
    ) -> Self {
        let base_dir = base_root.join(revision);
        Self {
            revision: revision.to_string(),
            image: image.to_string(),
            mem_file_path: base_dir.join(MEM_FILE_NAME),
            snapshot_file_path: base_dir.join(SNAP_FILE_NAME),
            info_file_path: base_dir.join(INFO_FILE_NAME),
            base_dir,
            mem_chunks: Vec::new(),
            mem_size: 0,
            owner_vm_id,
            ready: false,
        }
    }

    /// Returns true once the snapshot has been committed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Creates the snapshot directory.
    pub(crate) fn create_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }

    /// Removes the snapshot directory and everything in it. Best-effort.
    pub(crate) fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.base_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(revision = %self.revision, error = %e, "snapshot dir cleanup failed");
            }
        }
    }

    /// Object-store key of this snapshot's info file.
    #[must_use]
    pub fn info_object_key(&self) -> String {
        format!("{}/{}", self.revision, INFO_FILE_NAME)
    }

    /// Object-store key of this snapshot's device-state file.
    #[must_use]
    pub fn snap_object_key(&self) -> String {
        format!("{}/{}", self.revision, SNAP_FILE_NAME)
    }
}
