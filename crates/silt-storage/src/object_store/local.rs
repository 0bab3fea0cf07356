//! Local filesystem implementation of ObjectStore
//!
//! Objects are stored as files with the key as the relative path. Writes go
//! to a sibling temp file first and are renamed into place, so a crashed
//! flush never leaves a half-written binlog under its final key.

use super::{ObjectMetadata, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use silt_core::{CoreError, CoreResult};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const TMP_SUFFIX: &str = ".tmp";

/// Local filesystem object store
///
/// # Example
///
/// ```rust,no_run
/// use silt_storage::object_store::{LocalObjectStore, ObjectStore};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> silt_core::CoreResult<()> {
///     let store = LocalObjectStore::new("./silt-data").await?;
///     store.put("coll/1/7/insert_log", Bytes::from("...")).await?;
///     let objects = store.list("coll/1/").await?;
///     println!("Found {} objects", objects.len());
///     Ok(())
/// }
/// ```
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

impl LocalObjectStore {
    /// Create a new local object store, creating the base directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IoError` if directory creation fails
    pub async fn new(base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_dir).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }

    /// Recursively list all files under a directory
    fn list_recursive<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<Vec<PathBuf>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut results = Vec::new();

            let mut read_dir = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;

                if metadata.is_file() {
                    results.push(path);
                } else if metadata.is_dir() {
                    let mut sub_results = self.list_recursive(&path).await?;
                    results.append(&mut sub_results);
                }
            }

            Ok(results)
        })
    }
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        if key.is_empty() {
            return Err(CoreError::validation("object key must not be empty"));
        }

        let path = self.full_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        let path = self.full_path(key);

        let data = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found("object", key)
            } else {
                CoreError::from(e)
            }
        })?;

        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        Ok(tokio::fs::try_exists(self.full_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        match tokio::fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        // Walk from the deepest directory fully named by the prefix.
        let dir_part = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let start = self.full_path(dir_part);
        if !tokio::fs::try_exists(&start).await? {
            return Ok(Vec::new());
        }
        if !tokio::fs::metadata(&start).await?.is_dir() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for path in self.list_recursive(&start).await? {
            let Some(key) = self.path_to_key(&path) else {
                continue;
            };
            if !key.starts_with(prefix) || key.ends_with(TMP_SUFFIX) {
                continue;
            }
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                results.push(ObjectMetadata {
                    key,
                    size_bytes: metadata.len(),
                    last_modified: modified_at(&metadata),
                });
            }
        }
        results.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(results)
    }
}
