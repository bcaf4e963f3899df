//! Snapshot lifecycle and remote transfer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rekindle_error::CommonError;
use rekindle_store::{DedupIndex, ObjectStore};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SnapshotError};
use crate::info::SnapshotInfo;
use crate::record::Snapshot;

/// Default memory-chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default TTL recorded against uploaded chunk hashes.
pub const DEFAULT_CHUNK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Remote {
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn DedupIndex>,
}

/// Manages the snapshots stored on this node.
///
/// One mutex guards the `revision → record` map; it is held for lookups,
/// inserts, deletes and `ready` transitions only, never across file or
/// network I/O. That is safe because a non-ready record is visible only to
/// the init/commit/delete protocol, `acquire_snapshot` rejects non-ready
/// records under the lock, and only commit flips the flag (false → true,
/// exactly once).
///
/// Local-only, remote, and remote-with-dedup operation are configurations of
/// this one type: the object store and dedup index are injected at
/// construction.
pub struct SnapshotManager {
    snapshots: Mutex<HashMap<String, Snapshot>>,
    base_dir: PathBuf,
    chunk_size: usize,
    chunk_ttl: Duration,
    remote: Option<Remote>,
}

impl SnapshotManager {
    /// Creates a manager rooted at `base_dir`.
    ///
    /// The base directory is wiped and recreated: snapshots are a node-local
    /// cache of what the object store (or a running VM) can reproduce.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let _ = std::fs::remove_dir_all(&base_dir);
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            snapshots: Mutex::new(HashMap::new()),
            base_dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_ttl: DEFAULT_CHUNK_TTL,
            remote: None,
        })
    }

    /// Sets the memory-chunk size. Fixed for the manager's lifetime; all
    /// chunking of a given byte sequence is deterministic given this value.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the TTL recorded against uploaded chunk hashes.
    #[must_use]
    pub fn with_chunk_ttl(mut self, ttl: Duration) -> Self {
        self.chunk_ttl = ttl;
        self
    }

    /// Enables remote storage with the given object store and dedup index.
    #[must_use]
    pub fn with_remote(mut self, store: Arc<dyn ObjectStore>, index: Arc<dyn DedupIndex>) -> Self {
        self.remote = Some(Remote { store, index });
        self
    }

    /// Returns true if a remote object store is configured.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// The chunk size this manager was built with.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Creates the remote bucket if missing. Called once at startup when
    /// remote storage is enabled.
    pub async fn ensure_remote(&self) -> Result<()> {
        self.remote()?.store.ensure_bucket().await?;
        Ok(())
    }

    /// Registers a new, uncommitted snapshot for `revision` and creates its
    /// directory.
    ///
    /// The record stays invisible to [`Self::acquire_snapshot`] until
    /// [`Self::commit_snapshot`] runs. Directory-creation failure rolls the
    /// insert back.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the revision is already registered.
    pub fn init_snapshot(
        &self,
        revision: &str,
        image: &str,
        vm_id: Option<&str>,
    ) -> Result<Snapshot> {
        let snapshot = {
            let mut snapshots = self.lock()?;
            if snapshots.contains_key(revision) {
                return Err(CommonError::already_exists(format!("snapshot {revision}")).into());
            }
            let snapshot = Snapshot::new(
                revision,
                &self.base_dir,
                image,
                vm_id.map(str::to_string),
            );
            snapshots.insert(revision.to_string(), snapshot.clone());
            snapshot
        };

        debug!(revision, image, "initializing snapshot");

        if let Err(e) = snapshot.create_dir() {
            if let Ok(mut snapshots) = self.lock() {
                snapshots.remove(revision);
            }
            return Err(SnapshotError::from(e));
        }

        Ok(snapshot)
    }

    /// Marks the snapshot for `revision` ready for use.
    ///
    /// # Errors
    ///
    /// `NotFound` if the revision is unknown, `AlreadyCommitted` if it was
    /// committed before.
    pub fn commit_snapshot(&self, revision: &str) -> Result<()> {
        let mut snapshots = self.lock()?;
        let snapshot = snapshots
            .get_mut(revision)
            .ok_or_else(|| CommonError::not_found(format!("snapshot {revision}")))?;
        if snapshot.ready {
            return Err(SnapshotError::AlreadyCommitted(revision.to_string()));
        }
        snapshot.ready = true;
        debug!(revision, "snapshot committed");
        Ok(())
    }

    /// Returns the committed snapshot for `revision`.
    ///
    /// The returned record is a stable clone; its files stay on disk at
    /// least until the record is deleted, so concurrent readers (and VM
    /// boots) are safe.
    ///
    /// # Errors
    ///
    /// `NotFound` if the revision is unknown, `NotReady` if its creation has
    /// not been committed.
    pub fn acquire_snapshot(&self, revision: &str) -> Result<Snapshot> {
        let snapshots = self.lock()?;
        let snapshot = snapshots
            .get(revision)
            .ok_or_else(|| CommonError::not_found(format!("snapshot {revision}")))?;
        if !snapshot.ready {
            return Err(SnapshotError::NotReady(revision.to_string()));
        }
        Ok(snapshot.clone())
    }

    /// Removes an uncommitted snapshot and its directory.
    ///
    /// Committed snapshots are evicted through a separate path; deleting one
    /// through this API fails with `AlreadyCommitted`.
    pub fn delete_snapshot(&self, revision: &str) -> Result<()> {
        let snapshot = {
            let mut snapshots = self.lock()?;
            match snapshots.entry(revision.to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    if entry.get().ready {
                        return Err(SnapshotError::AlreadyCommitted(revision.to_string()));
                    }
                    entry.remove()
                }
                std::collections::hash_map::Entry::Vacant(_) => {
                    return Err(CommonError::not_found(format!("snapshot {revision}")).into());
                }
            }
        };

        snapshot.cleanup();
        debug!(revision, "snapshot deleted");
        Ok(())
    }

    /// Serializes the info file for `revision` next to its other files.
    ///
    /// Called once the hypervisor has produced the snapshot files; uploads
    /// rewrite the file after populating the chunk list.
    pub fn write_info(&self, revision: &str) -> Result<()> {
        let snapshot = self.lookup(revision)?;
        SnapshotInfo::from_record(&snapshot).write_to(&snapshot.info_file_path)
    }

    /// Uploads the snapshot for `revision` to remote storage.
    ///
    /// The memory file is read in fixed windows (the last one may be short
    /// and is never padded); each window is content-addressed by its SHA-256
    /// digest, probed against the dedup index, and put to the object store
    /// on a miss. The device-state file goes up as one object; the info
    /// file, now carrying the chunk list, is uploaded last, so a re-invoked
    /// upload after any failure converges on the same object-store state.
    ///
    /// Valid sources are the snapshot being created by the coordinator
    /// (files complete, commit pending) and an already committed snapshot.
    pub async fn upload_snapshot(&self, revision: &str, cancel: &CancellationToken) -> Result<()> {
        let remote = self.remote()?;
        let mut snapshot = self.lookup(revision)?;

        info!(revision, "uploading snapshot");
        SnapshotInfo::from_record(&snapshot).write_to(&snapshot.info_file_path)?;

        let (mem_chunks, mem_size) = self
            .chunk_and_upload(&snapshot.mem_file_path, remote, cancel)
            .await?;

        {
            let mut snapshots = self.lock()?;
            let record = snapshots
                .get_mut(revision)
                .ok_or_else(|| CommonError::not_found(format!("snapshot {revision}")))?;
            record.mem_chunks = mem_chunks.clone();
            record.mem_size = mem_size;
        }
        snapshot.mem_chunks = mem_chunks;
        snapshot.mem_size = mem_size;

        SnapshotInfo::from_record(&snapshot).write_to(&snapshot.info_file_path)?;

        remote
            .store
            .put_file(&snapshot.snap_object_key(), &snapshot.snapshot_file_path)
            .await?;
        remote
            .store
            .put_file(&snapshot.info_object_key(), &snapshot.info_file_path)
            .await?;

        info!(
            revision,
            chunks = snapshot.mem_chunks.len(),
            mem_size,
            "snapshot uploaded"
        );
        Ok(())
    }

    /// Downloads and reconstructs the snapshot for `revision` from remote
    /// storage, committing it locally on success.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the revision is already present locally. Any
    /// failure mid-download rolls the local record back and propagates;
    /// a retried download then starts clean.
    pub async fn download_snapshot(
        &self,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let remote = self.remote()?;
        let snapshot = self.init_snapshot(revision, "", None)?;

        info!(revision, "downloading snapshot");
        if let Err(e) = self.fetch_into(&snapshot, remote, cancel).await {
            if let Err(rollback) = self.delete_snapshot(revision) {
                warn!(revision, error = %rollback, "rolling back failed download");
            }
            return Err(e);
        }

        self.commit_snapshot(revision)?;
        self.acquire_snapshot(revision)
    }

    fn remote(&self) -> Result<&Remote> {
        self.remote
            .as_ref()
            .ok_or_else(|| CommonError::config("remote storage not configured").into())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Snapshot>>> {
        self.snapshots
            .lock()
            .map_err(|_| CommonError::internal("snapshot map lock poisoned").into())
    }

    /// Clone of the record for `revision`, ready or not.
    fn lookup(&self, revision: &str) -> Result<Snapshot> {
        let snapshots = self.lock()?;
        snapshots
            .get(revision)
            .cloned()
            .ok_or_else(|| CommonError::not_found(format!("snapshot {revision}")).into())
    }

    /// Chunks the memory file in read order and uploads missing chunks.
    async fn chunk_and_upload(
        &self,
        mem_path: &Path,
        remote: &Remote,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, u64)> {
        let mut file = tokio::fs::File::open(mem_path).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut chunks = Vec::new();
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CommonError::cancelled("uploading memory chunks").into());
            }

            let n = read_window(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;

            let digest = hash_chunk(&buf[..n]);
            let uploaded = remote.index.probe(&digest).await?;
            if !uploaded {
                remote
                    .store
                    .put(&digest, Bytes::copy_from_slice(&buf[..n]))
                    .await?;
                remote.index.record(&digest, self.chunk_ttl).await?;
            }
            chunks.push(digest);
        }

        Ok((chunks, total))
    }

    /// Downloads info, device state and memory chunks into the record's
    /// files, verifying every chunk against its content address.
    async fn fetch_into(
        &self,
        snapshot: &Snapshot,
        remote: &Remote,
        cancel: &CancellationToken,
    ) -> Result<()> {
        remote
            .store
            .get_to_file(&snapshot.info_object_key(), &snapshot.info_file_path)
            .await?;
        let info = SnapshotInfo::read_from(&snapshot.info_file_path)?;
        if info.revision != snapshot.revision {
            return Err(SnapshotError::integrity(format!(
                "info file names revision {}, expected {}",
                info.revision, snapshot.revision
            )));
        }

        remote
            .store
            .get_to_file(&snapshot.snap_object_key(), &snapshot.snapshot_file_path)
            .await?;

        let mut mem_file = tokio::fs::File::create(&snapshot.mem_file_path).await?;
        let mut total: u64 = 0;
        for digest in &info.mem_chunks {
            if cancel.is_cancelled() {
                return Err(CommonError::cancelled("reconstructing memory file").into());
            }

            let data = remote.store.get(digest).await?;
            if hash_chunk(&data) != *digest {
                return Err(SnapshotError::integrity(format!(
                    "chunk {digest} does not match its content address"
                )));
            }
            mem_file.write_all(&data).await?;
            total += data.len() as u64;
        }
        mem_file.sync_all().await?;

        if total != info.mem_size {
            return Err(SnapshotError::integrity(format!(
                "memory file is {total} bytes, info declares {}",
                info.mem_size
            )));
        }

        let mut snapshots = self.lock()?;
        let record = snapshots
            .get_mut(&snapshot.revision)
            .ok_or_else(|| CommonError::not_found(format!("snapshot {}", snapshot.revision)))?;
        record.image = info.image;
        record.mem_chunks = info.mem_chunks;
        record.mem_size = info.mem_size;
        Ok(())
    }
}

/// SHA-256 hex digest of a chunk.
fn hash_chunk(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fills `buf` from `file`, tolerating short reads; returns bytes read,
/// zero at EOF. Keeps chunk boundaries fixed regardless of how the kernel
/// slices reads.
async fn read_window(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekindle_store::{MemoryStore, TtlIndex};

    const CHUNK: usize = 1024;

    fn local_manager(dir: &Path) -> SnapshotManager {
        SnapshotManager::new(dir.join("snaps"))
            .unwrap()
            .with_chunk_size(CHUNK)
    }

    fn remote_manager(
        dir: &Path,
        store: &Arc<MemoryStore>,
        index: &Arc<TtlIndex>,
    ) -> SnapshotManager {
        SnapshotManager::new(dir.join("snaps"))
            .unwrap()
            .with_chunk_size(CHUNK)
            .with_remote(
                Arc::clone(store) as Arc<dyn ObjectStore>,
                Arc::clone(index) as Arc<dyn DedupIndex>,
            )
    }

    /// Registers a committed snapshot whose memory file holds `mem`.
    fn seed_snapshot(mgr: &SnapshotManager, revision: &str, mem: &[u8]) {
        let snap = mgr.init_snapshot(revision, "img", Some("vm-0")).unwrap();
        std::fs::write(&snap.mem_file_path, mem).unwrap();
        std::fs::write(&snap.snapshot_file_path, b"device-state").unwrap();
        mgr.commit_snapshot(revision).unwrap();
    }

    /// `count` distinct chunk-sized blocks, block `i` filled with `fill(i)`.
    fn patterned(count: usize, fill: impl Fn(usize) -> u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(count * CHUNK);
        for i in 0..count {
            data.extend(std::iter::repeat(fill(i)).take(CHUNK));
        }
        data
    }

    #[test]
    fn init_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = local_manager(dir.path());

        mgr.init_snapshot("rev-1", "img", None).unwrap();
        let err = mgr.init_snapshot("rev-1", "img", None).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn init_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = local_manager(dir.path());

        let snap = mgr.init_snapshot("rev-1", "img", Some("vm-7")).unwrap();
        assert!(snap.base_dir.is_dir());
        assert_eq!(snap.owner_vm_id.as_deref(), Some("vm-7"));
    }

    #[test]
    fn acquire_rejects_missing_and_unready() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = local_manager(dir.path());

        assert!(mgr.acquire_snapshot("rev-1").unwrap_err().is_not_found());

        mgr.init_snapshot("rev-1", "img", None).unwrap();
        let err = mgr.acquire_snapshot("rev-1").unwrap_err();
        assert!(matches!(err, SnapshotError::NotReady(_)));

        mgr.commit_snapshot("rev-1").unwrap();
        let snap = mgr.acquire_snapshot("rev-1").unwrap();
        assert!(snap.is_ready());
    }

    #[test]
    fn commit_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = local_manager(dir.path());

        assert!(mgr.commit_snapshot("rev-1").unwrap_err().is_not_found());

        mgr.init_snapshot("rev-1", "img", None).unwrap();
        mgr.commit_snapshot("rev-1").unwrap();
        let err = mgr.commit_snapshot("rev-1").unwrap_err();
        assert!(matches!(err, SnapshotError::AlreadyCommitted(_)));
    }

    #[test]
    fn delete_only_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = local_manager(dir.path());

        let snap = mgr.init_snapshot("rev-1", "img", None).unwrap();
        mgr.delete_snapshot("rev-1").unwrap();
        assert!(!snap.base_dir.exists());
        assert!(mgr.acquire_snapshot("rev-1").unwrap_err().is_not_found());

        mgr.init_snapshot("rev-2", "img", None).unwrap();
        mgr.commit_snapshot("rev-2").unwrap();
        let err = mgr.delete_snapshot("rev-2").unwrap_err();
        assert!(matches!(err, SnapshotError::AlreadyCommitted(_)));
    }

    #[test]
    fn concurrent_acquires_observe_identical_records() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(local_manager(dir.path()));
        seed_snapshot(&mgr, "rev-1", b"bytes");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || mgr.acquire_snapshot("rev-1").unwrap())
            })
            .collect();

        let reference = mgr.acquire_snapshot("rev-1").unwrap();
        for handle in handles {
            let snap = handle.join().unwrap();
            assert!(snap.is_ready());
            assert_eq!(snap.revision, reference.revision);
            assert_eq!(snap.mem_file_path, reference.mem_file_path);
            assert_eq!(snap.mem_chunks, reference.mem_chunks);
            assert_eq!(snap.mem_size, reference.mem_size);
        }
    }

    #[tokio::test]
    async fn upload_requires_remote() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = local_manager(dir.path());
        seed_snapshot(&mgr, "rev-1", b"bytes");

        let err = mgr
            .upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Common(CommonError::Config(_))));
    }

    #[tokio::test]
    async fn upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());

        // Two and a half chunks; the short tail must survive unpadded.
        let mut mem = patterned(2, |i| i as u8 + 1);
        mem.extend(std::iter::repeat(0xCD).take(CHUNK / 2));

        let uploader = remote_manager(&dir.path().join("a"), &store, &index);
        seed_snapshot(&uploader, "rev-1", &mem);
        uploader
            .upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();

        let uploaded = uploader.acquire_snapshot("rev-1").unwrap();
        assert_eq!(uploaded.mem_chunks.len(), 3);
        assert_eq!(uploaded.mem_size, mem.len() as u64);

        let downloader = remote_manager(&dir.path().join("b"), &store, &index);
        let snap = downloader
            .download_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();

        assert!(snap.is_ready());
        assert_eq!(snap.mem_chunks, uploaded.mem_chunks);
        assert_eq!(snap.image, "img");
        assert_eq!(std::fs::read(&snap.mem_file_path).unwrap(), mem);
        assert_eq!(
            std::fs::read(&snap.snapshot_file_path).unwrap(),
            b"device-state"
        );
    }

    #[tokio::test]
    async fn chunking_is_deterministic_across_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        let mem = patterned(3, |i| (i * 3) as u8 + 1);
        seed_snapshot(&mgr, "rev-a", &mem);
        seed_snapshot(&mgr, "rev-b", &mem);
        mgr.upload_snapshot("rev-a", &CancellationToken::new())
            .await
            .unwrap();
        mgr.upload_snapshot("rev-b", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            mgr.acquire_snapshot("rev-a").unwrap().mem_chunks,
            mgr.acquire_snapshot("rev-b").unwrap().mem_chunks
        );
    }

    #[tokio::test]
    async fn shared_prefix_uploads_only_new_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        // rev-a: chunks [1, 2, 3, 4]; rev-b shares the first three.
        let mem_a = patterned(4, |i| i as u8 + 1);
        let mut mem_b = patterned(3, |i| i as u8 + 1);
        mem_b.extend(std::iter::repeat(0xEE).take(CHUNK));

        seed_snapshot(&mgr, "rev-a", &mem_a);
        mgr.upload_snapshot("rev-a", &CancellationToken::new())
            .await
            .unwrap();
        // 4 chunks + info + snap objects.
        assert_eq!(store.object_count(), 6);
        assert_eq!(index.len(), 4);

        seed_snapshot(&mgr, "rev-b", &mem_b);
        mgr.upload_snapshot("rev-b", &CancellationToken::new())
            .await
            .unwrap();
        // Exactly one new chunk plus rev-b's two per-revision objects.
        assert_eq!(store.object_count(), 9);
        assert_eq!(index.len(), 5);
    }

    #[tokio::test]
    async fn upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        seed_snapshot(&mgr, "rev-1", &patterned(4, |i| i as u8 + 1));
        mgr.upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();
        let first = store.object_count();

        mgr.upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.object_count(), first);
    }

    #[tokio::test]
    async fn wiped_index_still_uploads_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        seed_snapshot(&mgr, "rev-1", &patterned(2, |i| i as u8 + 1));
        mgr.upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();

        index.wipe();
        // Re-upload after a wipe re-puts chunks (idempotent) and repopulates
        // the index; the store converges on the same state.
        let before = store.object_count();
        mgr.upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.object_count(), before);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_chunk_fails_download_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());

        let uploader = remote_manager(&dir.path().join("a"), &store, &index);
        seed_snapshot(&uploader, "rev-1", &patterned(3, |i| i as u8 + 1));
        uploader
            .upload_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap();

        let victim = uploader.acquire_snapshot("rev-1").unwrap().mem_chunks[1].clone();
        store
            .put(&victim, Bytes::from_static(b"corrupted"))
            .await
            .unwrap();

        let downloader = remote_manager(&dir.path().join("b"), &store, &index);
        let err = downloader
            .download_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Integrity(_)));

        // The partial local record is gone; a later attempt starts clean.
        assert!(downloader
            .acquire_snapshot("rev-1")
            .unwrap_err()
            .is_not_found());
        assert!(downloader.init_snapshot("rev-1", "", None).is_ok());
    }

    #[tokio::test]
    async fn missing_remote_snapshot_rolls_back_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        let err = mgr
            .download_snapshot("rev-absent", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        // Rollback freed the revision for a retry.
        assert!(mgr.init_snapshot("rev-absent", "", None).is_ok());
    }

    #[tokio::test]
    async fn download_of_local_revision_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        seed_snapshot(&mgr, "rev-1", b"bytes");
        let err = mgr
            .download_snapshot("rev-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn cancelled_upload_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(TtlIndex::new());
        let mgr = remote_manager(dir.path(), &store, &index);

        seed_snapshot(&mgr, "rev-1", &patterned(2, |i| i as u8 + 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = mgr.upload_snapshot("rev-1", &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Common(CommonError::Cancelled(_))
        ));
        // The local snapshot is untouched.
        assert!(mgr.acquire_snapshot("rev-1").is_ok());
    }
}
