//! Object store abstraction for binlog persistence
//!
//! Backends:
//! - in-memory (default, tests)
//! - local filesystem (CLI data directories)
//! - failure-injecting mock (executor failure paths)

mod local;
mod memory;
mod mock;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use mock::{CallHistoryEntry, MockFailure, MockObjectStore, MockOperation};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use silt_core::CoreResult;

/// Object metadata returned by list operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification timestamp
    pub last_modified: DateTime<Utc>,
}

/// S3-like interface for binlog storage
///
/// All implementations must be thread-safe (Send + Sync) and support
/// concurrent operations. Keys are UTF-8 strings treated as opaque identifiers.
///
/// # Error Handling
///
/// - `CoreError::NotFound` - Object does not exist (get)
/// - `CoreError::StorageError` - Backend-specific error
/// - `CoreError::IoError` - I/O error (local filesystem only)
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Put object (overwrites if exists)
    ///
    /// # Errors
    ///
    /// - `CoreError::StorageError` if the operation fails
    /// - `CoreError::ValidationError` if key is empty
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()>;

    /// Get object
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if object does not exist
    /// - `CoreError::StorageError` if the operation fails
    async fn get(&self, key: &str) -> CoreResult<Bytes>;

    /// Check if object exists
    async fn exists(&self, key: &str) -> CoreResult<bool>;

    /// Delete object (idempotent)
    async fn delete(&self, key: &str) -> CoreResult<()>;

    /// List objects whose keys start with `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>>;
}
