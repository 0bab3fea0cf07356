//! Failure-injecting object store for testing
//!
//! Wraps a [`MemoryObjectStore`] and lets tests script failures per
//! operation and key pattern, so executor failure paths (unreadable
//! sources, failed target writes, corrupted binlogs) can be exercised
//! deterministically.
//!
//! # Examples
//!
//! ```rust
//! use silt_storage::object_store::{MockObjectStore, MockFailure, MockOperation, ObjectStore};
//! use bytes::Bytes;
//!
//! # async fn example() -> silt_core::CoreResult<()> {
//! let mock = MockObjectStore::new();
//!
//! // Every put under the target prefix fails until the rule is cleared.
//! mock.fail_always(MockOperation::Put, Some("c/1/9/"), MockFailure::Permanent("403 Forbidden"));
//!
//! assert!(mock.put("c/1/9/insert_log", Bytes::from("x")).await.is_err());
//! assert!(mock.put("c/1/8/insert_log", Bytes::from("x")).await.is_ok());
//! assert_eq!(mock.failed_calls(MockOperation::Put), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

use super::{MemoryObjectStore, ObjectMetadata, ObjectStore};
use silt_core::{CoreError, CoreResult};

/// Scripted failure outcome.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Transient backend error. Examples: 500, 503, timeout.
    Transient(&'static str),

    /// Permanent backend error. Examples: 403, 400.
    Permanent(&'static str),

    /// Success (consumes a scripted slot without failing).
    Ok,
}

impl MockFailure {
    fn to_error(&self) -> Option<CoreError> {
        match self {
            MockFailure::Transient(msg) => {
                Some(CoreError::StorageError(format!("Transient: {}", msg)))
            }
            MockFailure::Permanent(msg) => {
                Some(CoreError::StorageError(format!("Permanent: {}", msg)))
            }
            MockFailure::Ok => None,
        }
    }
}

/// Operation a failure rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOperation {
    Put,
    Get,
    Exists,
    Delete,
    List,
}

impl MockOperation {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Exists => "exists",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    operation: MockOperation,
    /// Substring the key must contain; `None` matches every key.
    key_pattern: Option<String>,
    failure: MockFailure,
    /// Remaining matches; `None` never runs out.
    remaining: Option<usize>,
}

impl FailureRule {
    fn matches(&self, operation: MockOperation, key: &str) -> bool {
        self.operation == operation
            && self
                .key_pattern
                .as_deref()
                .map_or(true, |pattern| key.contains(pattern))
    }
}

/// Call history entry.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    /// Operation type: "put", "get", "exists", "delete", "list".
    pub operation: &'static str,

    /// Object key (the prefix for list).
    pub key: String,

    /// Whether operation succeeded.
    pub success: bool,

    /// Timestamp of operation.
    pub timestamp: Instant,
}

/// Failure-injecting object store.
pub struct MockObjectStore {
    inner: MemoryObjectStore,
    rules: RwLock<Vec<FailureRule>>,
    latency: Duration,
    call_history: RwLock<Vec<CallHistoryEntry>>,
}

impl MockObjectStore {
    /// Create a mock with no latency and no failures.
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Create a mock that sleeps `latency` before every operation.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            rules: RwLock::new(Vec::new()),
            latency,
            call_history: RwLock::new(Vec::new()),
        }
    }

    /// Fail the next `times` matching calls.
    pub fn fail_next(
        &self,
        operation: MockOperation,
        key_pattern: Option<&str>,
        failure: MockFailure,
        times: usize,
    ) {
        self.rules.write().push(FailureRule {
            operation,
            key_pattern: key_pattern.map(str::to_string),
            failure,
            remaining: Some(times),
        });
    }

    /// Fail every matching call until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(
        &self,
        operation: MockOperation,
        key_pattern: Option<&str>,
        failure: MockFailure,
    ) {
        self.rules.write().push(FailureRule {
            operation,
            key_pattern: key_pattern.map(str::to_string),
            failure,
            remaining: None,
        });
    }

    /// Remove every scripted failure.
    pub fn clear_failures(&self) {
        self.rules.write().clear();
    }

    /// Flip a byte in the middle of a stored object so checksum
    /// verification fails on the next read.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    pub async fn corrupt(&self, key: &str) -> CoreResult<()> {
        let data = self.inner.get(key).await?;
        let mut bytes = data.to_vec();
        if bytes.is_empty() {
            bytes.push(0xFF);
        } else {
            let mid = bytes.len() / 2;
            bytes[mid] ^= 0xFF;
        }
        self.inner.replace(key, Bytes::from(bytes));
        Ok(())
    }

    /// Get call history for assertions.
    pub fn get_call_history(&self) -> Vec<CallHistoryEntry> {
        self.call_history.read().clone()
    }

    /// Clear call history.
    pub fn clear_history(&self) {
        self.call_history.write().clear();
    }

    /// Number of successful calls of one operation.
    pub fn successful_calls(&self, operation: MockOperation) -> usize {
        self.count_calls(operation, true)
    }

    /// Number of failed calls of one operation.
    pub fn failed_calls(&self, operation: MockOperation) -> usize {
        self.count_calls(operation, false)
    }

    /// Check if key exists in storage, bypassing failure rules.
    pub async fn contains_key(&self, key: &str) -> bool {
        matches!(self.inner.exists(key).await, Ok(true))
    }

    fn count_calls(&self, operation: MockOperation, success: bool) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|entry| entry.operation == operation.as_str() && entry.success == success)
            .count()
    }

    /// Returns the scripted error for this call, consuming a slot if limited.
    fn check_failure(&self, operation: MockOperation, key: &str) -> Option<CoreError> {
        let mut rules = self.rules.write();
        let index = rules.iter().position(|rule| {
            rule.matches(operation, key) && rule.remaining.map_or(true, |left| left > 0)
        })?;
        let rule = &mut rules[index];
        if let Some(left) = rule.remaining.as_mut() {
            *left -= 1;
        }
        let error = rule.failure.to_error();
        if rule.remaining == Some(0) {
            rules.remove(index);
        }
        error
    }

    fn record_call(&self, operation: MockOperation, key: &str, success: bool) {
        self.call_history.write().push(CallHistoryEntry {
            operation: operation.as_str(),
            key: key.to_string(),
            success,
            timestamp: Instant::now(),
        });
    }

    async fn before(&self, operation: MockOperation, key: &str) -> CoreResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.check_failure(operation, key) {
            self.record_call(operation, key, false);
            return Err(error);
        }
        Ok(())
    }

    fn after<T>(&self, operation: MockOperation, key: &str, result: CoreResult<T>) -> CoreResult<T> {
        self.record_call(operation, key, result.is_ok());
        result
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        self.before(MockOperation::Put, key).await?;
        let result = self.inner.put(key, data).await;
        self.after(MockOperation::Put, key, result)
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        self.before(MockOperation::Get, key).await?;
        let result = self.inner.get(key).await;
        self.after(MockOperation::Get, key, result)
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        self.before(MockOperation::Exists, key).await?;
        let result = self.inner.exists(key).await;
        self.after(MockOperation::Exists, key, result)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.before(MockOperation::Delete, key).await?;
        let result = self.inner.delete(key).await;
        self.after(MockOperation::Delete, key, result)
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        self.before(MockOperation::List, prefix).await?;
        let result = self.inner.list(prefix).await;
        self.after(MockOperation::List, prefix, result)
    }
}
