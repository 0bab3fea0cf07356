//! Compaction scheduler.
//!
//! Owns the planner, the executor and the garbage collector. Manual
//! triggers go through [`CompactionScheduler::compact`]; automatic ones run
//! from a background worker that wakes on a fixed interval or when a flush
//! signals a collection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use silt_core::config::CompactionConfig;
use silt_core::{
    CollectionId, CoreError, CoreResult, IdAllocator, PlanGroupId, PlanId, SiltConfig, Timestamp,
    TimestampOracle,
};
use silt_storage::SegmentStore;

use crate::executor::CompactionExecutor;
use crate::gc::GarbageCollector;
use crate::planner::{materialize, CompactionPlanner, PlanCandidate, PlanContext, PlannerPolicy};
use crate::tracker::{PlanHandle, PlanTracker};

const SIGNAL_BUFFER: usize = 64;

/// Outcome of submitting a batch of candidates.
#[derive(Default)]
struct Submitted {
    handles: Vec<PlanHandle>,
    /// Plans that already held a candidate's bucket when it was submitted.
    joined: Vec<PlanId>,
}

struct SchedulerCore {
    planner: CompactionPlanner,
    executor: CompactionExecutor,
    gc: GarbageCollector,
    store: Arc<SegmentStore>,
    ids: Arc<IdAllocator>,
    oracle: Arc<TimestampOracle>,
    retention: Duration,
    plan_history: Duration,
}

impl SchedulerCore {
    fn context(&self, now: Timestamp) -> PlanContext {
        PlanContext::at(now, self.retention)
    }

    fn submit_all(
        &self,
        collection: CollectionId,
        candidates: Vec<PlanCandidate>,
        ctx: PlanContext,
    ) -> Submitted {
        let mut submitted = Submitted::default();
        for candidate in candidates {
            let bucket = candidate.bucket;
            let plan = materialize(candidate, collection, &self.ids, ctx);
            let plan_id = plan.plan_id;
            match self.executor.submit(plan) {
                Ok(handle) => submitted.handles.push(handle),
                // A concurrent flush or plan got there first; the next
                // trigger re-evaluates the bucket.
                Err(e) => {
                    warn!(plan_id = %plan_id, error = %e, "Compaction plan not submitted");
                    if let Some(existing) =
                        self.executor.tracker().in_flight_plan(collection, bucket)
                    {
                        submitted.joined.push(existing);
                    }
                }
            }
        }
        submitted
    }

    fn trigger_auto(&self, collection: CollectionId, now: Timestamp) -> Vec<PlanHandle> {
        let ctx = self.context(now);
        let snapshot = self.store.catalog().snapshot_collection(collection);
        let in_flight = self.executor.tracker().in_flight_buckets(collection);
        let candidates = self
            .planner
            .plan_auto(&snapshot.segments, &in_flight, ctx);
        if candidates.is_empty() {
            return Vec::new();
        }
        debug!(collection_id = %collection, candidates = candidates.len(), "Automatic trigger produced candidates");
        self.submit_all(collection, candidates, ctx).handles
    }

    async fn run_cycle(&self, now: Timestamp) -> CoreResult<Vec<PlanHandle>> {
        let mut handles = Vec::new();
        for collection in self.store.catalog().collections() {
            handles.extend(self.trigger_auto(collection, now));
        }
        self.gc.collect(now).await?;
        let pruned = self.executor.tracker().prune(self.plan_history);
        if pruned > 0 {
            debug!(pruned, "Forgot finished compaction plans");
        }
        Ok(handles)
    }
}

/// Drives manual and automatic compaction.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use silt_compaction::CompactionScheduler;
/// use silt_core::{IdAllocator, SiltConfig, TimestampOracle};
/// use silt_storage::{MemoryObjectStore, SegmentCatalog, SegmentStore};
///
/// # async fn example() -> silt_core::CoreResult<()> {
/// let config = SiltConfig::default();
/// let ids = Arc::new(IdAllocator::default());
/// let oracle = Arc::new(TimestampOracle::new());
/// let store = Arc::new(SegmentStore::new(
///     Arc::new(SegmentCatalog::new()),
///     Arc::new(MemoryObjectStore::new()),
///     ids.clone(),
///     oracle.clone(),
///     config.segment.max_rows,
/// ));
/// let scheduler = CompactionScheduler::new(&config, store, ids, oracle)?;
/// scheduler.start();
/// # Ok(())
/// # }
/// ```
pub struct CompactionScheduler {
    core: Arc<SchedulerCore>,
    config: CompactionConfig,
    signals: mpsc::Sender<CollectionId>,
    signal_rx: Mutex<Option<mpsc::Receiver<CollectionId>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionScheduler {
    /// # Errors
    ///
    /// `Config` if the compaction section fails validation.
    pub fn new(
        config: &SiltConfig,
        store: Arc<SegmentStore>,
        ids: Arc<IdAllocator>,
        oracle: Arc<TimestampOracle>,
    ) -> CoreResult<Self> {
        config
            .compaction
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let policy = PlannerPolicy::from_config(&config.compaction, config.segment.max_rows);
        let tracker = Arc::new(PlanTracker::new());
        let executor = CompactionExecutor::new(
            store.clone(),
            oracle.clone(),
            tracker,
            config.compaction.max_parallel_plans,
        );
        let retention = config.retention.retention_duration();
        let (signals, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

        Ok(Self {
            core: Arc::new(SchedulerCore {
                planner: CompactionPlanner::new(policy),
                executor,
                gc: GarbageCollector::new(store.clone(), retention),
                store,
                ids,
                oracle,
                retention,
                plan_history: config.compaction.plan_history(),
            }),
            config: config.compaction.clone(),
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            worker: Mutex::new(None),
        })
    }

    pub fn tracker(&self) -> &Arc<PlanTracker> {
        self.core.executor.tracker()
    }

    pub fn executor(&self) -> &CompactionExecutor {
        &self.core.executor
    }

    /// Manual trigger for one collection.
    ///
    /// Plans every bucket that has something to compact and records a group
    /// holding the new plans plus any plan of the collection already in
    /// flight. A collection with nothing to compact gets an empty group,
    /// which reports Completed straight away.
    pub fn compact(&self, collection: CollectionId) -> PlanGroupId {
        let now = self.core.oracle.allocate();
        let ctx = self.core.context(now);
        let tracker = self.tracker();

        let snapshot = self.core.store.catalog().snapshot_collection(collection);
        let mut plans: Vec<PlanId> = tracker.in_flight_plans(collection);
        let in_flight = tracker.in_flight_buckets(collection);
        let candidates = self
            .core
            .planner
            .plan_manual(&snapshot.segments, &in_flight, ctx);

        let Submitted { handles, joined } = self.core.submit_all(collection, candidates, ctx);
        plans.extend(handles.iter().map(PlanHandle::plan_id));
        for plan_id in joined {
            if !plans.contains(&plan_id) {
                plans.push(plan_id);
            }
        }

        let group_id = self.core.ids.plan_group();
        info!(
            collection_id = %collection,
            group_id = %group_id,
            new_plans = handles.len(),
            plans = plans.len(),
            "Manual compaction triggered"
        );
        tracker.record_group(group_id, plans);
        group_id
    }

    /// One automatic pass over every collection at `now`, followed by a GC
    /// pass and pruning of old plan records. Returns handles of the
    /// submitted plans.
    pub async fn run_trigger_cycle(&self, now: Timestamp) -> CoreResult<Vec<PlanHandle>> {
        self.core.run_cycle(now).await
    }

    /// Runs the automatic trigger for one collection at `now`.
    pub fn trigger_collection(&self, collection: CollectionId, now: Timestamp) -> Vec<PlanHandle> {
        self.core.trigger_auto(collection, now)
    }

    /// Asks the worker to evaluate `collection` soon. Dropped silently when
    /// automatic compaction is off or the queue is full.
    pub fn signal(&self, collection: CollectionId) {
        if !self.config.enable_auto {
            return;
        }
        if let Err(e) = self.signals.try_send(collection) {
            debug!(collection_id = %collection, error = %e, "Compaction signal dropped");
        }
    }

    /// Starts the background trigger loop. No-op when automatic compaction
    /// is disabled or the worker is already running.
    pub fn start(&self) {
        if !self.config.enable_auto {
            info!("Automatic compaction disabled");
            return;
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Compaction worker already running");
            return;
        }
        let Some(mut signal_rx) = self.signal_rx.lock().take() else {
            warn!("Compaction worker cannot be restarted after shutdown");
            return;
        };

        let core = self.core.clone();
        let interval = self.config.trigger_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = core.oracle.allocate();
                        if let Err(e) = core.run_cycle(now).await {
                            error!(error = %e, "Compaction trigger cycle failed");
                        }
                    }
                    Some(collection) = signal_rx.recv() => {
                        let now = core.oracle.allocate();
                        core.trigger_auto(collection, now);
                    }
                }
            }
        });

        *worker = Some(handle);
        info!("Compaction worker started (interval: {:?})", interval);
    }

    /// Stops the background loop. Plans already submitted keep running.
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            info!("Compaction worker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Drop for CompactionScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::{
        CompactionKind, CompactionPlan, CompactionTrigger, PartitionId, SegmentBucket, SegmentId,
        ShardId,
    };
    use silt_storage::{MemoryObjectStore, SegmentCatalog};

    fn scheduler() -> CompactionScheduler {
        let mut config = SiltConfig::default();
        config.compaction.enable_auto = false;
        let ids = Arc::new(IdAllocator::default());
        let oracle = Arc::new(TimestampOracle::new());
        let store = Arc::new(SegmentStore::new(
            Arc::new(SegmentCatalog::new()),
            Arc::new(MemoryObjectStore::new()),
            ids.clone(),
            oracle.clone(),
            config.segment.max_rows,
        ));
        CompactionScheduler::new(&config, store, ids, oracle).unwrap()
    }

    fn bucket() -> SegmentBucket {
        SegmentBucket::new(ShardId::new(0), PartitionId::new(1))
    }

    #[tokio::test]
    async fn test_rejected_candidate_joins_plan_holding_its_bucket() {
        let scheduler = scheduler();
        let collection = CollectionId::new();
        let holder = CompactionPlan {
            plan_id: PlanId::new(7_000),
            collection_id: collection,
            bucket: bucket(),
            sources: vec![SegmentId::new(900)],
            target: SegmentId::new(901),
            kind: CompactionKind::Merge,
            trigger: CompactionTrigger::TimeInterval,
            retention_cutoff: Timestamp::ZERO,
            created_at: chrono::Utc::now(),
        };
        scheduler.tracker().register(&holder).unwrap();

        // The bucket was free when planned, then taken before submission.
        let candidate = PlanCandidate {
            bucket: bucket(),
            sources: vec![SegmentId::new(1), SegmentId::new(2)],
            kind: CompactionKind::Merge,
            trigger: CompactionTrigger::Manual,
        };
        let ctx = scheduler.core.context(scheduler.core.oracle.allocate());
        let submitted = scheduler.core.submit_all(collection, vec![candidate], ctx);

        assert!(submitted.handles.is_empty());
        assert_eq!(submitted.joined, vec![holder.plan_id]);
    }

    #[tokio::test]
    async fn test_manual_group_includes_plan_in_flight() {
        let scheduler = scheduler();
        let collection = CollectionId::new();
        let holder = CompactionPlan {
            plan_id: PlanId::new(7_001),
            collection_id: collection,
            bucket: bucket(),
            sources: vec![SegmentId::new(900)],
            target: SegmentId::new(901),
            kind: CompactionKind::Merge,
            trigger: CompactionTrigger::DeleteRatio,
            retention_cutoff: Timestamp::ZERO,
            created_at: chrono::Utc::now(),
        };
        scheduler.tracker().register(&holder).unwrap();

        let group = scheduler.compact(collection);
        let plans = scheduler.tracker().group_plans(group).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].plan.plan_id, holder.plan_id);
    }
}
