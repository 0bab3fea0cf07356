//! Collection handle.
//!
//! Every operation first checks that the handle's connection alias is
//! still registered. Inserts and deletes take the collection's DML lock
//! while they allocate their timestamp and apply to the catalog, so a
//! delete always sees every key inserted before its timestamp.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use silt_core::{
    CollectionDescriptor, CollectionId, CollectionSchema, CompactionStateSummary, CoreError,
    CoreResult, DistanceMetric, IndexDescriptor, PartitionDescriptor, PartitionId, PlanGroupId,
    PlanStatus, Row, SegmentBucket, SegmentState, ShardId, Timestamp,
};
use silt_query::{
    PkExpr, QueryContext, QueryRequest, QueryResponse, SearchRequest, SearchResponse,
};

use crate::server::ServerInner;
use crate::types::{DeleteResult, Entity, InsertResult, QuerySegmentInfo};

pub(crate) struct CollectionState {
    descriptor: RwLock<CollectionDescriptor>,
    dml: Mutex<()>,
    last_group: Mutex<Option<PlanGroupId>>,
    loaded: AtomicBool,
}

impl CollectionState {
    pub(crate) fn new(descriptor: CollectionDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            dml: Mutex::new(()),
            last_group: Mutex::new(None),
            loaded: AtomicBool::new(false),
        }
    }
}

/// Routes a primary key to a shard.
fn shard_for(pk: i64, shards: u32) -> ShardId {
    let mut x = pk as u64;
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    ShardId::new(x % u64::from(shards.max(1)))
}

/// Client-side handle on one collection, bound to a connection alias.
#[derive(Clone)]
pub struct Collection {
    server: Arc<ServerInner>,
    alias: String,
    state: Arc<CollectionState>,
}

impl Collection {
    pub(crate) fn new(server: Arc<ServerInner>, alias: String, state: Arc<CollectionState>) -> Self {
        Self {
            server,
            alias,
            state,
        }
    }

    fn ensure_connected(&self) -> CoreResult<()> {
        self.server.connections.ensure_connected(&self.alias)
    }

    fn ensure_loaded(&self) -> CoreResult<()> {
        if self.state.loaded.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoreError::invalid_state(format!(
                "collection `{}` is not loaded",
                self.name()
            )))
        }
    }

    pub fn id(&self) -> CollectionId {
        self.state.descriptor.read().collection_id
    }

    pub fn name(&self) -> String {
        self.state.descriptor.read().schema.name.clone()
    }

    pub fn schema(&self) -> CollectionSchema {
        self.state.descriptor.read().schema.clone()
    }

    pub fn descriptor(&self) -> CollectionDescriptor {
        self.state.descriptor.read().clone()
    }

    fn partition_id(&self, partition: Option<&str>) -> CoreResult<PartitionId> {
        let descriptor = self.state.descriptor.read();
        match partition {
            None => Ok(descriptor.default_partition()),
            Some(name) => descriptor
                .partition(name)
                .map(|p| p.partition_id)
                .ok_or_else(|| CoreError::not_found("partition", name)),
        }
    }

    /// # Errors
    ///
    /// `AlreadyExists` if the collection already has a partition `name`.
    pub fn create_partition(&self, name: &str) -> CoreResult<PartitionId> {
        self.ensure_connected()?;
        if name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "partition name cannot be empty".to_string(),
            ));
        }
        let mut descriptor = self.state.descriptor.write();
        if descriptor.partition(name).is_some() {
            return Err(CoreError::already_exists("partition", name));
        }
        let partition_id = self.server.ids.partition();
        descriptor.partitions.push(PartitionDescriptor {
            partition_id,
            name: name.to_string(),
        });
        info!(collection_id = %descriptor.collection_id, partition = name, %partition_id, "Partition created");
        Ok(partition_id)
    }

    pub fn partitions(&self) -> CoreResult<Vec<PartitionDescriptor>> {
        self.ensure_connected()?;
        Ok(self.state.descriptor.read().partitions.clone())
    }

    /// Inserts `entities` into `partition` (the default one when `None`).
    ///
    /// Rows are routed to shards by primary-key hash and appended to each
    /// shard's growing segment. Segments that fill up are sealed and
    /// flushed before this returns.
    pub async fn insert(
        &self,
        entities: Vec<Entity>,
        partition: Option<&str>,
    ) -> CoreResult<InsertResult> {
        self.ensure_connected()?;
        if entities.is_empty() {
            return Err(CoreError::ValidationError(
                "insert requires at least one entity".to_string(),
            ));
        }
        let partition_id = self.partition_id(partition)?;
        let (collection_id, dimension, shards) = {
            let descriptor = self.state.descriptor.read();
            (
                descriptor.collection_id,
                descriptor.schema.dimension as usize,
                descriptor.schema.shards_num,
            )
        };
        if let Some(bad) = entities.iter().find(|e| e.vector.len() != dimension) {
            return Err(CoreError::ValidationError(format!(
                "vector dimension mismatch for pk {}: expected {dimension}, got {}",
                bad.pk,
                bad.vector.len()
            )));
        }

        let primary_keys: Vec<i64> = entities.iter().map(|e| e.pk).collect();
        let (timestamp, sealed) = {
            let _dml = self.state.dml.lock();
            let timestamp = self.server.oracle.allocate();
            let mut by_shard: BTreeMap<ShardId, Vec<Row>> = BTreeMap::new();
            for entity in entities {
                let row = Row {
                    pk: entity.pk,
                    ts: timestamp,
                    vector: entity.vector,
                    fields: entity.fields,
                };
                by_shard.entry(shard_for(row.pk, shards)).or_default().push(row);
            }
            let mut sealed = Vec::new();
            for (shard, rows) in by_shard {
                let bucket = SegmentBucket::new(shard, partition_id);
                sealed.extend(self.server.store.append(collection_id, bucket, rows)?);
            }
            (timestamp, sealed)
        };

        for segment_id in &sealed {
            self.server.store.flush_segment(*segment_id).await?;
        }
        if !sealed.is_empty() {
            self.server.scheduler.signal(collection_id);
        }

        debug!(
            collection_id = %collection_id,
            rows = primary_keys.len(),
            %timestamp,
            sealed = sealed.len(),
            "Inserted entities"
        );
        Ok(InsertResult {
            primary_keys,
            timestamp,
        })
    }

    /// Deletes every visible row whose primary key matches `expr`.
    pub async fn delete(&self, expr: &str) -> CoreResult<DeleteResult> {
        self.ensure_connected()?;
        let (collection_id, primary_field) = {
            let descriptor = self.state.descriptor.read();
            (descriptor.collection_id, descriptor.schema.primary_field.clone())
        };
        let expr = PkExpr::parse(expr, &primary_field)?;

        let (timestamp, delete_count) = {
            let _dml = self.state.dml.lock();
            let timestamp = self.server.oracle.allocate();
            let count = self.server.store.catalog().apply_delete(
                collection_id,
                |pk| expr.matches(pk),
                timestamp,
            );
            (timestamp, count)
        };
        if delete_count > 0 {
            self.server.scheduler.signal(collection_id);
        }

        debug!(collection_id = %collection_id, %expr, delete_count, %timestamp, "Deleted entities");
        Ok(DeleteResult {
            timestamp,
            delete_count,
        })
    }

    /// Seals and flushes every growing segment with rows, then persists
    /// pending delete records.
    pub async fn flush(&self) -> CoreResult<()> {
        self.ensure_connected()?;
        let collection_id = self.id();
        let flushed = self.server.store.flush_collection(collection_id).await?;
        self.server.scheduler.signal(collection_id);
        info!(collection_id = %collection_id, segments = flushed.len(), "Collection flushed");
        Ok(())
    }

    /// Flushes, then reports the rows held by sealed and flushed segments.
    /// Deletes are not subtracted.
    pub async fn num_entities(&self) -> CoreResult<u64> {
        self.count_entities(None).await
    }

    /// [`num_entities`](Self::num_entities) restricted to one partition.
    pub async fn partition_num_entities(&self, partition: &str) -> CoreResult<u64> {
        self.count_entities(Some(partition)).await
    }

    async fn count_entities(&self, partition: Option<&str>) -> CoreResult<u64> {
        self.flush().await?;
        let partition_id = match partition {
            Some(name) => Some(self.partition_id(Some(name))?),
            None => None,
        };
        let snapshot = self.server.registry.segments_for(self.id());
        Ok(snapshot
            .descriptors()
            .filter(|d| d.state != SegmentState::Growing)
            .filter(|d| partition_id.map_or(true, |p| d.partition_id == p))
            .map(|d| d.row_count)
            .sum())
    }

    /// Manual compaction trigger. Returns the plan group id, which the
    /// handle also remembers for the state and wait calls below.
    pub fn compact(&self) -> CoreResult<PlanGroupId> {
        self.ensure_connected()?;
        let group_id = self.server.scheduler.compact(self.id());
        *self.state.last_group.lock() = Some(group_id);
        Ok(group_id)
    }

    fn last_group(&self) -> CoreResult<PlanGroupId> {
        self.state.last_group.lock().ok_or_else(|| {
            CoreError::invalid_state(format!(
                "no compaction has been triggered on collection `{}`",
                self.name()
            ))
        })
    }

    /// State of the last compaction triggered through this collection.
    pub fn get_compaction_state(&self) -> CoreResult<CompactionStateSummary> {
        self.ensure_connected()?;
        self.compaction_state(self.last_group()?)
    }

    pub fn compaction_state(&self, group_id: PlanGroupId) -> CoreResult<CompactionStateSummary> {
        self.ensure_connected()?;
        self.server.scheduler.tracker().group_summary(group_id)
    }

    /// Plans of the last compaction triggered through this collection.
    pub fn get_compaction_plans(&self) -> CoreResult<Vec<PlanStatus>> {
        self.ensure_connected()?;
        self.compaction_plans(self.last_group()?)
    }

    pub fn compaction_plans(&self, group_id: PlanGroupId) -> CoreResult<Vec<PlanStatus>> {
        self.ensure_connected()?;
        self.server.scheduler.tracker().group_plans(group_id)
    }

    /// Waits for the last compaction group to finish.
    ///
    /// # Errors
    ///
    /// `Timeout` once `timeout` (or `client.default_wait_timeout`) elapses;
    /// the plans keep running.
    pub async fn wait_for_compaction_completed(
        &self,
        timeout: Option<Duration>,
    ) -> CoreResult<CompactionStateSummary> {
        self.ensure_connected()?;
        let group_id = self.last_group()?;
        let timeout = timeout.unwrap_or_else(|| self.server.config.client.default_wait_timeout());
        self.server
            .scheduler
            .tracker()
            .wait_group(group_id, timeout)
            .await
    }

    pub fn load(&self) -> CoreResult<()> {
        self.ensure_connected()?;
        self.state.loaded.store(true, Ordering::Release);
        info!(collection_id = %self.id(), "Collection loaded");
        Ok(())
    }

    pub fn release(&self) -> CoreResult<()> {
        self.ensure_connected()?;
        self.state.loaded.store(false, Ordering::Release);
        info!(collection_id = %self.id(), "Collection released");
        Ok(())
    }

    /// Segments a reader of the loaded collection sees right now.
    pub fn get_query_segment_info(&self) -> CoreResult<Vec<QuerySegmentInfo>> {
        self.ensure_connected()?;
        self.ensure_loaded()?;
        let snapshot = self.server.registry.segments_for(self.id());
        Ok(snapshot
            .descriptors()
            .map(|d| QuerySegmentInfo {
                segment_id: d.segment_id,
                state: d.state,
                partition_id: d.partition_id,
                shard_id: d.shard_id,
                num_rows: d.row_count,
            })
            .collect())
    }

    /// Records the metric searches on `field` must use.
    pub fn create_index(&self, field: &str, metric: DistanceMetric) -> CoreResult<()> {
        self.ensure_connected()?;
        let mut descriptor = self.state.descriptor.write();
        if field != descriptor.schema.vector_field {
            return Err(CoreError::ValidationError(format!(
                "cannot index field `{field}`: only the vector field `{}` is indexable",
                descriptor.schema.vector_field
            )));
        }
        descriptor.index = Some(IndexDescriptor {
            field: field.to_string(),
            metric,
        });
        info!(collection_id = %descriptor.collection_id, field, %metric, "Index created");
        Ok(())
    }

    pub fn index(&self) -> Option<IndexDescriptor> {
        self.state.descriptor.read().index.clone()
    }

    /// Resolves the read timestamp: the latest one when `travel_ts` is
    /// `None`, otherwise `travel_ts` as long as it lies inside retention.
    fn read_timestamp(&self, travel_ts: Option<Timestamp>) -> CoreResult<Timestamp> {
        let now = self.server.oracle.allocate();
        let Some(travel_ts) = travel_ts else {
            return Ok(now);
        };
        let horizon = now.saturating_sub(self.server.config.retention.retention_duration());
        if travel_ts < horizon {
            return Err(CoreError::ValidationError(format!(
                "travel timestamp {travel_ts} is older than the retention horizon {horizon}"
            )));
        }
        Ok(travel_ts)
    }

    fn query_context(&self) -> QueryContext {
        let (collection_id, schema, index) = {
            let descriptor = self.state.descriptor.read();
            (
                descriptor.collection_id,
                descriptor.schema.clone(),
                descriptor.index.clone(),
            )
        };
        let snapshot = self.server.registry.segments_for(collection_id);
        QueryContext {
            schema,
            index,
            segments: snapshot.segments,
            catalog_version: snapshot.version,
        }
    }

    /// Rows whose primary key matches `expr`, visible at `travel_ts`.
    pub async fn query(
        &self,
        expr: &str,
        output_fields: &[&str],
        travel_ts: Option<Timestamp>,
    ) -> CoreResult<QueryResponse> {
        self.ensure_connected()?;
        self.ensure_loaded()?;
        let ctx = self.query_context();
        let request = QueryRequest {
            expr: PkExpr::parse(expr, &ctx.schema.primary_field)?,
            output_fields: output_fields.iter().map(|f| (*f).to_string()).collect(),
            travel_ts: self.read_timestamp(travel_ts)?,
        };
        self.server.engine.query(&ctx, &request).await
    }

    /// Brute-force top-`limit` search, visible at `travel_ts`.
    pub async fn search(
        &self,
        vectors: Vec<Vec<f32>>,
        metric: DistanceMetric,
        limit: usize,
        travel_ts: Option<Timestamp>,
    ) -> CoreResult<SearchResponse> {
        self.ensure_connected()?;
        self.ensure_loaded()?;
        let ctx = self.query_context();
        let request = SearchRequest {
            vectors,
            metric,
            limit,
            travel_ts: self.read_timestamp(travel_ts)?,
        };
        self.server.engine.search(&ctx, &request).await
    }
}
