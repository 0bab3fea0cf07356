//! Compaction executor.
//!
//! `submit` claims a plan's sources and spawns its execution on the tokio
//! runtime, bounded by a semaphore. Execution reads each source's insert
//! log straight from the object store, folds the delete records it saw at
//! start, writes the target logs and swaps the target into the catalog in
//! one transition. Any failure releases the claims and leaves the sources
//! as they were.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use silt_core::metrics::{
    COMPACTION_DURATION, COMPACTION_IN_FLIGHT, COMPACTION_PLANS, COMPACTION_REMOVED,
};
use silt_core::{
    CompactionKind, CompactionPlan, CoreError, CoreResult, DeltaRecord, PlanState, Row,
    SegmentDescriptor, SegmentId, Timestamp, TimestampOracle,
};
use silt_storage::binlog::{self, BinlogKind};
use silt_storage::{SegmentStore, SwapTarget};

use crate::tracker::{PlanHandle, PlanTracker};
use crate::visibility::apply_retention;

/// Runs compaction plans.
#[derive(Clone)]
pub struct CompactionExecutor {
    store: Arc<SegmentStore>,
    oracle: Arc<TimestampOracle>,
    tracker: Arc<PlanTracker>,
    permits: Arc<Semaphore>,
}

impl CompactionExecutor {
    pub fn new(
        store: Arc<SegmentStore>,
        oracle: Arc<TimestampOracle>,
        tracker: Arc<PlanTracker>,
        max_parallel_plans: usize,
    ) -> Self {
        Self {
            store,
            oracle,
            tracker,
            permits: Arc::new(Semaphore::new(max_parallel_plans.max(1))),
        }
    }

    pub fn tracker(&self) -> &Arc<PlanTracker> {
        &self.tracker
    }

    /// Claims the plan's sources and starts executing it in the background.
    ///
    /// # Errors
    ///
    /// - `InvalidState` for a plan without sources, a bucket that already
    ///   has a plan in flight, or a source that cannot be claimed
    /// - `NotFound` for an unknown source
    pub fn submit(&self, plan: CompactionPlan) -> CoreResult<PlanHandle> {
        if plan.sources.is_empty() {
            return Err(CoreError::invalid_state(format!(
                "plan {} has no sources",
                plan.plan_id
            )));
        }
        if plan.has_source(plan.target) {
            return Err(CoreError::invalid_state(format!(
                "plan {} targets one of its sources",
                plan.plan_id
            )));
        }

        let rx = self.tracker.register(&plan)?;
        if let Err(e) = self.store.catalog().claim(&plan.sources, plan.plan_id) {
            self.tracker.discard(plan.plan_id);
            return Err(e);
        }

        info!(
            plan_id = %plan.plan_id,
            collection_id = %plan.collection_id,
            bucket = %plan.bucket,
            sources = ?plan.sources,
            target = %plan.target,
            trigger = %plan.trigger,
            "Submitted compaction plan"
        );

        let handle = PlanHandle::new(plan.plan_id, rx);
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run(plan).await;
        });
        Ok(handle)
    }

    async fn run(&self, plan: CompactionPlan) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                self.fail(&plan, format!("executor shut down: {e}")).await;
                return;
            }
        };

        self.tracker
            .set_state(plan.plan_id, PlanState::Executing, None);
        COMPACTION_IN_FLIGHT.inc();
        let started = Instant::now();

        let result = self.execute(&plan).await;

        COMPACTION_IN_FLIGHT.dec();
        COMPACTION_DURATION
            .with_label_values(&[kind_label(plan.kind)])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                COMPACTION_PLANS
                    .with_label_values(&[plan.trigger.as_str(), "completed"])
                    .inc();
                self.tracker
                    .set_state(plan.plan_id, PlanState::Completed, None);
                info!(
                    plan_id = %plan.plan_id,
                    target = %plan.target,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Compaction plan completed"
                );
            }
            Err(e) => self.fail(&plan, e.to_string()).await,
        }
    }

    async fn fail(&self, plan: &CompactionPlan, reason: String) {
        error!(plan_id = %plan.plan_id, reason = %reason, "Compaction plan failed");
        self.store.catalog().release(&plan.sources, plan.plan_id);

        for kind in [BinlogKind::Insert, BinlogKind::Delta] {
            let key = binlog::log_key(
                plan.collection_id,
                plan.bucket.partition_id,
                plan.target,
                kind,
            );
            if let Err(e) = self.store.object_store().delete(&key).await {
                warn!(plan_id = %plan.plan_id, key = %key, error = %e, "Failed to remove partial target");
            }
        }

        COMPACTION_PLANS
            .with_label_values(&[plan.trigger.as_str(), "failed"])
            .inc();
        self.tracker
            .set_state(plan.plan_id, PlanState::Failed, Some(reason));
    }

    /// Executes a claimed plan. Sources are untouched unless this returns Ok.
    async fn execute(&self, plan: &CompactionPlan) -> CoreResult<()> {
        let catalog = self.store.catalog();
        let snapshot = catalog.snapshot_collection(plan.collection_id);

        let mut rows: Vec<Row> = Vec::new();
        let mut deltas: Vec<DeltaRecord> = Vec::new();
        let mut consumed: HashMap<SegmentId, usize> = HashMap::new();
        let mut prior_cutoff: Option<Timestamp> = None;

        for id in &plan.sources {
            let view = snapshot
                .get(*id)
                .ok_or_else(|| CoreError::not_found("segment", id.to_string()))?;
            if view.descriptor.claimed_by != Some(plan.plan_id) {
                return Err(CoreError::invalid_state(format!(
                    "source {id} is not claimed by plan {}",
                    plan.plan_id
                )));
            }
            let key = view.descriptor.insert_log.as_deref().ok_or_else(|| {
                CoreError::invalid_state(format!("source {id} has no insert log"))
            })?;

            rows.extend(self.store.read_insert_log(key).await?);
            deltas.extend(view.deltas.iter().copied());
            consumed.insert(*id, view.deltas.len());
            prior_cutoff = prior_cutoff.max(view.descriptor.compacted_cutoff);
        }

        let retained = apply_retention(&rows, &deltas, plan.retention_cutoff);
        let target = self.build_target(plan, &retained.rows, prior_cutoff);

        let mut descriptor = target;
        if !retained.rows.is_empty() {
            let key = binlog::log_key(
                plan.collection_id,
                plan.bucket.partition_id,
                plan.target,
                BinlogKind::Insert,
            );
            let data = binlog::encode_insert_log(&retained.rows)?;
            self.store.object_store().put(&key, data).await?;
            descriptor.insert_log = Some(key);
        }
        if !retained.carried.is_empty() {
            let key = binlog::log_key(
                plan.collection_id,
                plan.bucket.partition_id,
                plan.target,
                BinlogKind::Delta,
            );
            let data = binlog::encode_delta_log(&retained.carried)?;
            self.store.object_store().put(&key, data).await?;
            descriptor.delta_log = Some(key);
        }

        let insert_log = descriptor.insert_log.clone();
        let pks: Vec<i64> = retained.rows.iter().map(|r| r.pk).collect();
        let retired_ts = self.oracle.allocate();
        catalog.swap(
            plan,
            &consumed,
            SwapTarget {
                descriptor,
                deltas: retained.carried.clone(),
                pks,
            },
            retired_ts,
        )?;

        COMPACTION_REMOVED
            .with_label_values(&["rows"])
            .inc_by(retained.removed_rows as u64);
        COMPACTION_REMOVED
            .with_label_values(&["deletes"])
            .inc_by(retained.applied_deletes as u64);

        info!(
            plan_id = %plan.plan_id,
            kind = kind_label(plan.kind),
            rows_in = rows.len(),
            rows_out = retained.rows.len(),
            deletes_applied = retained.applied_deletes,
            deletes_carried = retained.carried.len(),
            "Compaction target written"
        );

        if let Some(key) = insert_log {
            self.store.cache_rows(key, Arc::new(retained.rows)).await;
        }
        Ok(())
    }

    fn build_target(
        &self,
        plan: &CompactionPlan,
        rows: &[Row],
        prior_cutoff: Option<Timestamp>,
    ) -> SegmentDescriptor {
        let mut target =
            SegmentDescriptor::growing(plan.target, plan.collection_id, plan.bucket);
        target.row_count = rows.len() as u64;
        for row in rows {
            target.min_ts = target.min_ts.min(row.ts);
            target.max_ts = target.max_ts.max(row.ts);
        }
        let now = self.oracle.allocate();
        target.flushed_ts = Some(now);
        target.last_compacted_ts = Some(now);
        target.compacted_cutoff = Some(
            prior_cutoff.map_or(plan.retention_cutoff, |c| c.max(plan.retention_cutoff)),
        );
        target.compaction_from = plan.sources.clone();
        target
    }
}

fn kind_label(kind: CompactionKind) -> &'static str {
    match kind {
        CompactionKind::Merge => "merge",
        CompactionKind::DeltaMerge => "delta_merge",
    }
}
