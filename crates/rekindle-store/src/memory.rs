//! In-memory object store.
//!
//! Used by tests and orchestrator-less development. Same contract as the S3
//! backend: idempotent puts, read-after-write per key, `NotFound` on miss.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::object::ObjectStore;

/// HashMap-backed object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects. Dedup tests count uploads with this.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| StoreError::client("lock poisoned"))?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .map_err(|_| StoreError::client("lock poisoned"))?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
