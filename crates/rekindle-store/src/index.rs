//! Advisory dedup index for chunk hashes.
//!
//! Probing the object store per chunk is expensive, so uploads first consult
//! this index. It is advisory: a false "absent" answer only triggers a
//! redundant idempotent put, and the whole index may be wiped at any time.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Result, StoreError};

/// Existence store for uploaded chunk hashes.
///
/// Implementations may expire entries; expiry must err on the side of
/// "absent" so a stale entry never suppresses a needed upload for longer
/// than its TTL.
#[async_trait]
pub trait DedupIndex: Send + Sync + 'static {
    /// Returns true if the chunk with this hash is believed uploaded.
    async fn probe(&self, hash: &str) -> Result<bool>;

    /// Marks the chunk as uploaded for at least `ttl`.
    async fn record(&self, hash: &str, ttl: Duration) -> Result<()>;
}

/// In-process TTL table.
///
/// A networked backend (the deployment's shared cache) plugs in behind
/// [`DedupIndex`]; this implementation keeps single-node uploads cheap and
/// gives tests deterministic behavior.
#[derive(Default)]
pub struct TtlIndex {
    entries: RwLock<HashMap<String, Instant>>,
}

impl TtlIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry. Safe by contract; only causes re-uploads.
    pub fn wipe(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Number of live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|e| e.values().filter(|deadline| **deadline > now).count())
            .unwrap_or(0)
    }

    /// Returns true if the index holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DedupIndex for TtlIndex {
    async fn probe(&self, hash: &str) -> Result<bool> {
        let now = Instant::now();
        let hit = {
            let entries = self
                .entries
                .read()
                .map_err(|_| StoreError::Index("lock poisoned".to_string()))?;
            entries.get(hash).map(|deadline| *deadline > now)
        };
        match hit {
            Some(true) => Ok(true),
            Some(false) => {
                // Expired entry, drop it.
                if let Ok(mut entries) = self.entries.write() {
                    entries.remove(hash);
                }
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn record(&self, hash: &str, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Index("lock poisoned".to_string()))?;
        entries.insert(hash.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "4ee48284e58bd747eac59f807f45a169ce10e4444e00566c80bd2470293f5d64";

    #[tokio::test]
    async fn probe_after_record() {
        let index = TtlIndex::new();
        assert!(!index.probe(HASH).await.unwrap());
        index.record(HASH, Duration::from_secs(60)).await.unwrap();
        assert!(index.probe(HASH).await.unwrap());
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn expired_entry_reads_absent() {
        let index = TtlIndex::new();
        index.record(HASH, Duration::ZERO).await.unwrap();
        assert!(!index.probe(HASH).await.unwrap());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn wipe_is_safe() {
        let index = TtlIndex::new();
        index.record(HASH, Duration::from_secs(60)).await.unwrap();
        index.wipe();
        assert!(!index.probe(HASH).await.unwrap());
    }
}
