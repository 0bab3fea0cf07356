use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{ObjectMetadata, ObjectStore};
use silt_core::{CoreError, CoreResult};

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Overwrites an object in place without going through `put`.
    pub(crate) fn replace(&self, key: &str, data: Bytes) {
        self.objects.write().insert(key.to_string(), data);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        if key.is_empty() {
            return Err(CoreError::validation("object key must not be empty"));
        }
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::not_found("object", key))
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        let now = Utc::now();
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| ObjectMetadata {
                key: k.clone(),
                size_bytes: v.len() as u64,
                last_modified: now,
            })
            .collect())
    }
}
