//! The on-disk snapshot info file.
//!
//! Self-describing and versioned: one format-version byte followed by a JSON
//! payload of the record's persistent fields. File locations are stored as
//! basenames so a snapshot can be reconstructed under any base directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapshotError};
use crate::record::Snapshot;

/// Current info file format version.
pub const INFO_FORMAT_VERSION: u8 = 1;

/// Persistent fields of a snapshot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Function revision.
    pub revision: String,
    /// Originating container image reference.
    pub image: String,
    /// Basename of the memory image file.
    pub mem_file: String,
    /// Basename of the device-state file.
    pub snapshot_file: String,
    /// Basename of this info file.
    pub info_file: String,
    /// Ordered SHA-256 hex digests of the memory image's chunks.
    pub mem_chunks: Vec<String>,
    /// Total bytes of the memory image.
    pub mem_size: u64,
}

impl SnapshotInfo {
    /// Extracts the persistent fields from a record.
    #[must_use]
    pub fn from_record(snapshot: &Snapshot) -> Self {
        Self {
            revision: snapshot.revision.clone(),
            image: snapshot.image.clone(),
            mem_file: file_name(&snapshot.mem_file_path),
            snapshot_file: file_name(&snapshot.snapshot_file_path),
            info_file: file_name(&snapshot.info_file_path),
            mem_chunks: snapshot.mem_chunks.clone(),
            mem_size: snapshot.mem_size,
        }
    }

    /// Encodes the info file: version byte, then the JSON payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| SnapshotError::integrity(format!("encoding snapshot info: {e}")))?;
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(INFO_FORMAT_VERSION);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decodes and validates an info file.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&version, payload) = data
            .split_first()
            .ok_or_else(|| SnapshotError::integrity("snapshot info file is empty"))?;
        if version != INFO_FORMAT_VERSION {
            return Err(SnapshotError::integrity(format!(
                "unsupported snapshot info version {version}"
            )));
        }

        let info: Self = serde_json::from_slice(payload)
            .map_err(|e| SnapshotError::integrity(format!("decoding snapshot info: {e}")))?;

        for digest in &info.mem_chunks {
            if digest.len() != 64 || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
            {
                return Err(SnapshotError::integrity(format!(
                    "malformed chunk digest {digest:?} in snapshot info"
                )));
            }
        }
        Ok(info)
    }

    /// Writes the encoded info file to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }

    /// Reads and decodes an info file from `path`.
    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
