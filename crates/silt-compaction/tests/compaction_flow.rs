//! Compaction flow tests against an in-memory object store
//!
//! Covers manual merges, delete folding inside and outside the retention
//! window, failed executions, automatic triggers and GC of retired sources.

use std::sync::Arc;
use std::time::Duration;

use silt_compaction::{visible_rows, CompactionScheduler, QuerySegmentRegistry};
use silt_core::{
    CollectionId, CompactionTrigger, GroupState, IdAllocator, PartitionId, PlanState, Row,
    SegmentBucket, SegmentId, SegmentState, ShardId, SiltConfig, Timestamp, TimestampOracle,
};
use silt_storage::object_store::{MockFailure, MockObjectStore, MockOperation};
use silt_storage::{SegmentCatalog, SegmentStore};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    store: Arc<SegmentStore>,
    oracle: Arc<TimestampOracle>,
    objects: Arc<MockObjectStore>,
    scheduler: CompactionScheduler,
    collection: CollectionId,
}

impl Harness {
    fn new(config: SiltConfig) -> Self {
        Self::with_objects(config, MockObjectStore::new())
    }

    fn with_objects(config: SiltConfig, objects: MockObjectStore) -> Self {
        let objects = Arc::new(objects);
        let ids = Arc::new(IdAllocator::default());
        let oracle = Arc::new(TimestampOracle::new());
        let store = Arc::new(SegmentStore::new(
            Arc::new(SegmentCatalog::new()),
            objects.clone(),
            ids.clone(),
            oracle.clone(),
            config.segment.max_rows,
        ));
        let scheduler =
            CompactionScheduler::new(&config, store.clone(), ids, oracle.clone()).unwrap();
        Self {
            store,
            oracle,
            objects,
            scheduler,
            collection: CollectionId::new(),
        }
    }

    fn bucket() -> SegmentBucket {
        SegmentBucket::new(ShardId::new(0), PartitionId::new(1))
    }

    /// Inserts `count` rows starting at `first_pk` and flushes them into
    /// their own segment.
    async fn insert_segment(&self, first_pk: i64, count: i64) {
        let rows = (first_pk..first_pk + count)
            .map(|pk| Row::new(pk, self.oracle.allocate(), vec![pk as f32, 0.5]))
            .collect();
        self.store
            .append(self.collection, Self::bucket(), rows)
            .unwrap();
        self.store.flush_collection(self.collection).await.unwrap();
    }

    fn delete(&self, pks: &[i64]) -> usize {
        let ts = self.oracle.allocate();
        self.store
            .catalog()
            .apply_delete(self.collection, |pk| pks.contains(&pk), ts)
    }

    fn visible_segments(&self) -> Vec<silt_storage::SegmentView> {
        QuerySegmentRegistry::new(self.store.catalog().clone())
            .segments_for(self.collection)
            .segments
    }

    fn state_of(&self, id: SegmentId) -> SegmentState {
        self.store.catalog().get(id).unwrap().descriptor.state
    }

    async fn compact_and_wait(&self) -> silt_core::CompactionStateSummary {
        let group = self.scheduler.compact(self.collection);
        self.scheduler
            .tracker()
            .wait_group(group, WAIT)
            .await
            .unwrap()
    }

    async fn visible_pks(&self, read_ts: Timestamp) -> Vec<i64> {
        let visible = visible_rows(&self.store, &self.visible_segments(), read_ts)
            .await
            .unwrap();
        let mut pks: Vec<i64> = visible.rows.iter().map(|r| r.pk).collect();
        pks.sort_unstable();
        pks
    }
}

fn config_with_retention(secs: u64) -> SiltConfig {
    let mut config = SiltConfig::default();
    config.compaction.enable_auto = false;
    config.retention.retention_duration_secs = secs;
    config
}

#[tokio::test]
async fn test_manual_merge_combines_flushed_segments() {
    let h = Harness::new(config_with_retention(3600));
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;
    h.insert_segment(20, 10).await;
    let sources: Vec<SegmentId> = h
        .visible_segments()
        .iter()
        .map(|s| s.descriptor.segment_id)
        .collect();
    assert_eq!(sources.len(), 3);

    let summary = h.compact_and_wait().await;
    assert_eq!(summary.state, GroupState::Completed);
    assert_eq!((summary.completed, summary.failed), (1, 0));

    let visible = h.visible_segments();
    assert_eq!(visible.len(), 1);
    let target = &visible[0].descriptor;
    assert_eq!(target.row_count, 30);
    assert_eq!(target.state, SegmentState::Flushed);
    assert_eq!(target.compaction_from, sources);
    for id in sources {
        assert_eq!(h.state_of(id), SegmentState::Compacted);
    }
    assert_eq!(h.visible_pks(Timestamp::MAX).await, (0..30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_deletes_inside_retention_are_carried_not_applied() {
    let h = Harness::new(config_with_retention(3600));
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;
    let before_delete = h.oracle.allocate();
    assert_eq!(h.delete(&[1, 2, 11]), 3);

    h.compact_and_wait().await;

    let visible = h.visible_segments();
    assert_eq!(visible.len(), 1);
    // Rows stay physically present so reads inside the window still see them.
    assert_eq!(visible[0].descriptor.row_count, 20);
    assert_eq!(visible[0].deltas.len(), 3);
    assert_eq!(h.visible_pks(Timestamp::MAX).await.len(), 17);
    assert_eq!(h.visible_pks(before_delete).await.len(), 20);
}

#[tokio::test]
async fn test_deletes_outside_retention_are_applied() {
    let h = Harness::new(config_with_retention(0));
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;
    h.delete(&[0, 1, 2, 3, 4]);

    h.compact_and_wait().await;

    let visible = h.visible_segments();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].descriptor.row_count, 15);
    assert!(visible[0].deltas.is_empty());
    assert_eq!(h.visible_pks(Timestamp::MAX).await, (5..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_single_segment_delta_merge_needs_enough_deletes() {
    let h = Harness::new(config_with_retention(0));
    h.insert_segment(0, 10).await;

    h.delete(&[0]);
    let summary = h.compact_and_wait().await;
    assert_eq!(summary.completed + summary.failed, 0);

    h.delete(&[1, 2]);
    let summary = h.compact_and_wait().await;
    assert_eq!(summary.completed, 1);
    let visible = h.visible_segments();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].descriptor.row_count, 7);
}

#[tokio::test]
async fn test_fully_deleted_target_is_dropped() {
    let h = Harness::new(config_with_retention(0));
    h.insert_segment(0, 5).await;
    h.insert_segment(5, 5).await;
    h.delete(&(0..10).collect::<Vec<_>>());

    let summary = h.compact_and_wait().await;
    assert_eq!(summary.completed, 1);
    assert!(h.visible_segments().is_empty());
    assert!(h.visible_pks(Timestamp::MAX).await.is_empty());

    h.scheduler
        .run_trigger_cycle(h.oracle.allocate())
        .await
        .unwrap();
    assert!(h.store.catalog().snapshot().segments.is_empty());
    assert!(h.store.catalog().collections().is_empty());
}

#[tokio::test]
async fn test_failed_target_write_keeps_sources() {
    let h = Harness::new(config_with_retention(3600));
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;
    let before: Vec<SegmentId> = h
        .visible_segments()
        .iter()
        .map(|s| s.descriptor.segment_id)
        .collect();

    h.objects.fail_always(
        MockOperation::Put,
        Some("insert_log"),
        MockFailure::Permanent("403 Forbidden"),
    );
    let group = h.scheduler.compact(h.collection);
    let summary = h.scheduler.tracker().wait_group(group, WAIT).await.unwrap();
    assert_eq!((summary.completed, summary.failed), (0, 1));

    let plans = h.scheduler.tracker().group_plans(group).unwrap();
    assert!(plans[0].failure.as_deref().unwrap().contains("403"));
    assert!(h.store.catalog().get(plans[0].plan.target).is_none());
    for view in h.visible_segments() {
        assert_eq!(view.descriptor.state, SegmentState::Flushed);
        assert!(view.descriptor.claimed_by.is_none());
    }
    assert_eq!(h.visible_pks(Timestamp::MAX).await.len(), 20);

    h.objects.clear_failures();
    let summary = h.compact_and_wait().await;
    assert_eq!(summary.completed, 1);
    for id in before {
        assert_eq!(h.state_of(id), SegmentState::Compacted);
    }
}

#[tokio::test]
async fn test_corrupted_source_fails_plan() {
    let h = Harness::new(config_with_retention(3600));
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;
    let key = h.visible_segments()[0]
        .descriptor
        .insert_log
        .clone()
        .unwrap();
    h.objects.corrupt(&key).await.unwrap();

    let summary = h.compact_and_wait().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(h.visible_segments().len(), 2);
}

#[tokio::test]
async fn test_delete_during_execution_lands_on_target() {
    let h = Harness::with_objects(
        config_with_retention(3600),
        MockObjectStore::with_latency(Duration::from_millis(50)),
    );
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;

    let group = h.scheduler.compact(h.collection);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.delete(&[3, 15]), 2);
    h.scheduler.tracker().wait_group(group, WAIT).await.unwrap();

    let visible = h.visible_segments();
    assert_eq!(visible.len(), 1);
    let mut deleted: Vec<i64> = visible[0].deltas.iter().map(|d| d.pk).collect();
    deleted.sort_unstable();
    assert_eq!(deleted, vec![3, 15]);
    assert_eq!(h.visible_pks(Timestamp::MAX).await.len(), 18);
}

#[tokio::test]
async fn test_one_plan_per_bucket_and_group_includes_in_flight() {
    let h = Harness::with_objects(
        config_with_retention(3600),
        MockObjectStore::with_latency(Duration::from_millis(50)),
    );
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;

    let first = h.scheduler.compact(h.collection);
    let second = h.scheduler.compact(h.collection);
    let first_plans = h.scheduler.tracker().group_plans(first).unwrap();
    let second_plans = h.scheduler.tracker().group_plans(second).unwrap();
    assert_eq!(first_plans.len(), 1);
    assert_eq!(second_plans.len(), 1);
    assert_eq!(first_plans[0].plan.plan_id, second_plans[0].plan.plan_id);

    let summary = h.scheduler.tracker().wait_group(second, WAIT).await.unwrap();
    assert_eq!(summary.completed, 1);
}

fn auto_config() -> SiltConfig {
    let mut config = config_with_retention(3600);
    config.segment.max_rows = 100;
    config.compaction.segment_count_threshold = 10;
    config
}

#[tokio::test]
async fn test_segment_count_threshold_triggers_merge() {
    let h = Harness::new(auto_config());
    for i in 0..10 {
        h.insert_segment(i * 2, 2).await;
    }

    let mut handles = h
        .scheduler
        .run_trigger_cycle(h.oracle.allocate())
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    let plan_id = handles[0].plan_id();
    assert_eq!(handles[0].wait(WAIT).await.unwrap(), PlanState::Completed);

    let status = h.scheduler.tracker().status(plan_id).unwrap();
    assert_eq!(status.plan.trigger, CompactionTrigger::SegmentCount);
    assert_eq!(status.plan.sources.len(), 10);
    assert_eq!(h.visible_segments().len(), 1);
}

#[tokio::test]
async fn test_below_count_threshold_does_nothing() {
    let h = Harness::new(auto_config());
    for i in 0..9 {
        h.insert_segment(i * 2, 2).await;
    }

    let handles = h
        .scheduler
        .run_trigger_cycle(h.oracle.allocate())
        .await
        .unwrap();
    assert!(handles.is_empty());
    assert_eq!(h.visible_segments().len(), 9);
}

#[tokio::test]
async fn test_idle_bucket_is_merged_after_interval() {
    let h = Harness::new(auto_config());
    h.insert_segment(0, 5).await;
    h.insert_segment(5, 5).await;

    let later = h.oracle.allocate().saturating_add(Duration::from_secs(61));
    let mut handles = h.scheduler.run_trigger_cycle(later).await.unwrap();
    assert_eq!(handles.len(), 1);
    handles[0].wait(WAIT).await.unwrap();
    let status = h.scheduler.tracker().status(handles[0].plan_id()).unwrap();
    assert_eq!(status.plan.trigger, CompactionTrigger::TimeInterval);
}

#[tokio::test]
async fn test_gc_forgets_retired_sources_and_finished_plans() {
    let mut config = config_with_retention(0);
    config.compaction.plan_history_secs = 0;
    let h = Harness::new(config);
    h.insert_segment(0, 10).await;
    h.insert_segment(10, 10).await;
    let sources: Vec<(SegmentId, String)> = h
        .visible_segments()
        .iter()
        .map(|s| {
            (
                s.descriptor.segment_id,
                s.descriptor.insert_log.clone().unwrap(),
            )
        })
        .collect();

    let group = h.scheduler.compact(h.collection);
    h.scheduler.tracker().wait_group(group, WAIT).await.unwrap();
    let plan_id = h.scheduler.tracker().group_plans(group).unwrap()[0].plan.plan_id;
    h.scheduler
        .run_trigger_cycle(h.oracle.allocate())
        .await
        .unwrap();

    for (id, key) in sources {
        assert!(h.store.catalog().get(id).is_none());
        assert!(!h.objects.contains_key(&key).await);
    }
    assert_eq!(h.store.catalog().snapshot().segments.len(), 1);
    assert!(h.scheduler.tracker().status(plan_id).is_none());
    assert!(h.scheduler.tracker().group_plans(group).is_err());
    assert_eq!(h.scheduler.tracker().plan_count(), 0);
}

#[tokio::test]
async fn test_background_worker_merges_on_signal() {
    let mut config = auto_config();
    config.compaction.enable_auto = true;
    config.compaction.trigger_interval_ms = 3_600_000;
    let h = Harness::new(config);

    h.scheduler.start();
    assert!(h.scheduler.is_running());
    // The first interval tick fires immediately; wait it out.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for i in 0..10 {
        h.insert_segment(i * 2, 2).await;
    }
    h.scheduler.signal(h.collection);

    let deadline = tokio::time::Instant::now() + WAIT;
    while h.visible_segments().len() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "worker never merged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.scheduler.shutdown();
    assert!(!h.scheduler.is_running());
}
