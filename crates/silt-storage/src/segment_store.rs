//! Segment store: growing buffers, seal/flush, and insert-log reads.
//!
//! Rows of a growing segment live in memory until the segment is sealed and
//! its insert log written. Readers get rows either from that buffer or from
//! the decoded binlog, cached by object key.

use std::collections::HashMap;
use std::sync::Arc;

use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use silt_core::{
    CollectionId, CoreError, CoreResult, IdAllocator, Row, SegmentBucket, SegmentDescriptor,
    SegmentId, SegmentState, TimestampOracle,
};

use crate::binlog::{self, BinlogKind};
use crate::catalog::{SegmentCatalog, SegmentView};
use crate::object_store::ObjectStore;

/// Rows shared between the buffer or cache and readers.
pub type SharedRows = Arc<Vec<Row>>;

/// Insert logs kept decoded unless configured otherwise.
pub const DEFAULT_ROW_CACHE_CAPACITY: u64 = 256;

/// Owns segment payloads; metadata lives in the [`SegmentCatalog`].
pub struct SegmentStore {
    catalog: Arc<SegmentCatalog>,
    object_store: Arc<dyn ObjectStore>,
    ids: Arc<IdAllocator>,
    oracle: Arc<TimestampOracle>,
    max_rows: u64,
    /// Growing segment currently accepting rows, per bucket.
    active: Mutex<HashMap<(CollectionId, SegmentBucket), SegmentId>>,
    /// Rows of segments whose insert log is not written yet.
    buffers: RwLock<HashMap<SegmentId, SharedRows>>,
    /// Decoded insert logs by object key, bounded by entry count.
    cache: Cache<String, SharedRows>,
    /// Serializes flushes so a segment is written once.
    flush_lock: tokio::sync::Mutex<()>,
}

impl SegmentStore {
    pub fn new(
        catalog: Arc<SegmentCatalog>,
        object_store: Arc<dyn ObjectStore>,
        ids: Arc<IdAllocator>,
        oracle: Arc<TimestampOracle>,
        max_rows: u64,
    ) -> Self {
        Self {
            catalog,
            object_store,
            ids,
            oracle,
            max_rows: max_rows.max(1),
            active: Mutex::new(HashMap::new()),
            buffers: RwLock::new(HashMap::new()),
            cache: Cache::builder()
                .max_capacity(DEFAULT_ROW_CACHE_CAPACITY)
                .build(),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replaces the row cache with one holding at most `capacity` insert logs.
    #[must_use]
    pub fn with_row_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache = Cache::builder().max_capacity(capacity.max(1)).build();
        self
    }

    pub fn catalog(&self) -> &Arc<SegmentCatalog> {
        &self.catalog
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Appends rows to the bucket's growing segment, opening a new one when
    /// needed. Segments reaching `max_rows` are sealed; their ids are
    /// returned so the caller can flush them.
    pub fn append(
        &self,
        collection: CollectionId,
        bucket: SegmentBucket,
        rows: Vec<Row>,
    ) -> CoreResult<Vec<SegmentId>> {
        let mut sealed = Vec::new();
        let mut active = self.active.lock();
        let mut rest = rows.as_slice();

        while !rest.is_empty() {
            let segment_id = match active.get(&(collection, bucket)) {
                Some(id) => *id,
                None => {
                    let id = self.ids.segment();
                    self.catalog
                        .register(SegmentDescriptor::growing(id, collection, bucket))?;
                    self.buffers.write().insert(id, Arc::new(Vec::new()));
                    active.insert((collection, bucket), id);
                    debug!(collection_id = %collection, segment_id = %id, %bucket, "Opened growing segment");
                    id
                }
            };

            let current = self
                .catalog
                .get(segment_id)
                .map_or(0, |view| view.descriptor.row_count);
            let room = self.max_rows.saturating_sub(current).max(1) as usize;
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            rest = tail;

            let row_count = self.catalog.append_rows(segment_id, chunk)?;
            {
                let mut buffers = self.buffers.write();
                let buffer = buffers.entry(segment_id).or_default();
                Arc::make_mut(buffer).extend_from_slice(chunk);
            }

            if row_count >= self.max_rows {
                self.seal_locked(&mut active, collection, bucket, segment_id)?;
                sealed.push(segment_id);
            }
        }

        Ok(sealed)
    }

    fn seal_locked(
        &self,
        active: &mut HashMap<(CollectionId, SegmentBucket), SegmentId>,
        collection: CollectionId,
        bucket: SegmentBucket,
        segment_id: SegmentId,
    ) -> CoreResult<()> {
        self.catalog
            .transition(segment_id, SegmentState::Growing, SegmentState::Sealed, |_| {})?;
        active.remove(&(collection, bucket));
        debug!(collection_id = %collection, segment_id = %segment_id, "Sealed segment");
        Ok(())
    }

    /// Seals every non-empty growing segment of `collection`.
    pub fn seal_collection(&self, collection: CollectionId) -> CoreResult<Vec<SegmentId>> {
        let mut active = self.active.lock();
        let targets: Vec<(SegmentBucket, SegmentId)> = active
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|((_, bucket), id)| (*bucket, *id))
            .collect();

        let mut sealed = Vec::new();
        for (bucket, id) in targets {
            let has_rows = self
                .catalog
                .get(id)
                .is_some_and(|view| view.descriptor.row_count > 0);
            if has_rows {
                self.seal_locked(&mut active, collection, bucket, id)?;
                sealed.push(id);
            }
        }
        Ok(sealed)
    }

    /// Writes the insert log of a sealed segment and marks it Flushed.
    ///
    /// A segment that is already flushed is left alone. If the write fails
    /// the segment stays Sealed with its buffer so a later flush retries.
    pub async fn flush_segment(&self, segment_id: SegmentId) -> CoreResult<()> {
        let _guard = self.flush_lock.lock().await;
        self.flush_segment_locked(segment_id).await
    }

    async fn flush_segment_locked(&self, segment_id: SegmentId) -> CoreResult<()> {
        let view = self
            .catalog
            .get(segment_id)
            .ok_or_else(|| CoreError::not_found("segment", segment_id.to_string()))?;
        if view.descriptor.state != SegmentState::Sealed {
            return Ok(());
        }

        let rows = self
            .buffers
            .read()
            .get(&segment_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::internal(format!("sealed segment {segment_id} has no row buffer"))
            })?;

        let descriptor = &view.descriptor;
        let key = binlog::log_key(
            descriptor.collection_id,
            descriptor.partition_id,
            segment_id,
            BinlogKind::Insert,
        );
        let data = binlog::encode_insert_log(&rows)?;
        let size = data.len();
        self.object_store.put(&key, data).await?;

        let flushed_ts = self.oracle.allocate();
        let log_key = key.clone();
        self.catalog.transition(
            segment_id,
            SegmentState::Sealed,
            SegmentState::Flushed,
            move |d| {
                d.insert_log = Some(log_key);
                d.flushed_ts = Some(flushed_ts);
            },
        )?;

        self.cache.insert(key.clone(), rows).await;
        self.buffers.write().remove(&segment_id);

        info!(
            collection_id = %descriptor.collection_id,
            segment_id = %segment_id,
            rows = descriptor.row_count,
            bytes = size,
            key = %key,
            "Flushed segment"
        );
        Ok(())
    }

    /// Seals and flushes every growing or sealed segment of `collection`,
    /// then persists pending delta logs. Returns the flushed segment ids.
    pub async fn flush_collection(&self, collection: CollectionId) -> CoreResult<Vec<SegmentId>> {
        self.seal_collection(collection)?;

        let _guard = self.flush_lock.lock().await;
        let sealed: Vec<SegmentId> = self
            .catalog
            .snapshot_collection(collection)
            .segments
            .iter()
            .filter(|s| s.descriptor.state == SegmentState::Sealed)
            .map(|s| s.descriptor.segment_id)
            .collect();

        for id in &sealed {
            self.flush_segment_locked(*id).await?;
        }
        self.persist_deltas_locked(collection).await?;

        Ok(sealed)
    }

    async fn persist_deltas_locked(&self, collection: CollectionId) -> CoreResult<()> {
        for pending in self.catalog.pending_deltas(collection) {
            let descriptor = &pending.descriptor;
            let key = binlog::log_key(
                descriptor.collection_id,
                descriptor.partition_id,
                descriptor.segment_id,
                BinlogKind::Delta,
            );
            let data = binlog::encode_delta_log(&pending.deltas)?;
            self.object_store.put(&key, data).await?;
            self.catalog
                .mark_deltas_persisted(descriptor.segment_id, pending.deltas.len(), key)?;
            debug!(
                segment_id = %descriptor.segment_id,
                deltas = pending.deltas.len(),
                "Persisted delta log"
            );
        }
        Ok(())
    }

    /// Rows of a segment for readers.
    ///
    /// Served from the in-memory buffer while the segment is growing or being
    /// flushed, otherwise from the (cached) insert log.
    pub async fn read_rows(&self, view: &SegmentView) -> CoreResult<SharedRows> {
        let segment_id = view.descriptor.segment_id;
        if let Some(rows) = self.buffers.read().get(&segment_id).cloned() {
            return Ok(rows);
        }

        // The snapshot may predate the flush that removed the buffer.
        let key = match &view.descriptor.insert_log {
            Some(key) => key.clone(),
            None => self
                .catalog
                .get(segment_id)
                .and_then(|v| v.descriptor.insert_log)
                .ok_or_else(|| {
                    CoreError::internal(format!("segment {segment_id} has no readable rows"))
                })?,
        };

        if let Some(rows) = self.cache.get(&key).await {
            return Ok(rows);
        }
        let rows = Arc::new(self.read_insert_log(&key).await?);
        self.cache.insert(key, rows.clone()).await;
        Ok(rows)
    }

    /// Reads and verifies an insert log straight from the object store.
    pub async fn read_insert_log(&self, key: &str) -> CoreResult<Vec<Row>> {
        let data = self.object_store.get(key).await?;
        binlog::decode_insert_log(key, &data)
    }

    /// Deletes every log of a retired segment and evicts it from the cache.
    pub async fn purge_segment(&self, descriptor: &SegmentDescriptor) -> CoreResult<()> {
        for key in [&descriptor.insert_log, &descriptor.delta_log].into_iter().flatten() {
            self.cache.invalidate(key).await;
            if let Err(e) = self.object_store.delete(key).await {
                warn!(segment_id = %descriptor.segment_id, key = %key, error = %e, "Failed to delete segment log");
                return Err(e);
            }
        }
        self.buffers.write().remove(&descriptor.segment_id);
        Ok(())
    }

    /// Caches an insert log the executor just wrote.
    pub async fn cache_rows(&self, key: String, rows: SharedRows) {
        self.cache.insert(key, rows).await;
    }
}
