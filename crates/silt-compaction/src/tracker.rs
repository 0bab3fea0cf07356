//! Plan state tracking.
//!
//! Every submitted plan gets a record holding its [`PlanStatus`] and a
//! `watch` channel; handles and group waits subscribe to the channel. The
//! tracker also enforces one in-flight plan per (collection, bucket).
//! Finished plans and old groups are forgotten by [`PlanTracker::prune`].

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;

use silt_core::{
    CollectionId, CompactionPlan, CompactionStateSummary, CoreError, CoreResult, PlanGroupId,
    PlanId, PlanState, PlanStatus, SegmentBucket,
};

struct PlanRecord {
    status: PlanStatus,
    tx: watch::Sender<PlanState>,
    finished_at: Option<Instant>,
}

struct GroupRecord {
    plans: Vec<PlanId>,
    recorded_at: Instant,
}

#[derive(Default)]
struct TrackerInner {
    plans: HashMap<PlanId, PlanRecord>,
    in_flight: HashMap<(CollectionId, SegmentBucket), PlanId>,
    groups: HashMap<PlanGroupId, GroupRecord>,
}

/// Registry of plans, plan groups and in-flight buckets.
#[derive(Default)]
pub struct PlanTracker {
    inner: RwLock<TrackerInner>,
}

impl PlanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new pending plan.
    ///
    /// # Errors
    ///
    /// `InvalidState` if its bucket already has a plan in flight.
    pub fn register(&self, plan: &CompactionPlan) -> CoreResult<watch::Receiver<PlanState>> {
        let mut inner = self.inner.write();
        let key = (plan.collection_id, plan.bucket);
        if let Some(existing) = inner.in_flight.get(&key) {
            return Err(CoreError::invalid_state(format!(
                "bucket {} already has plan {existing} in flight",
                plan.bucket
            )));
        }
        let (tx, rx) = watch::channel(PlanState::Pending);
        inner.in_flight.insert(key, plan.plan_id);
        inner.plans.insert(
            plan.plan_id,
            PlanRecord {
                status: PlanStatus {
                    plan: plan.clone(),
                    state: PlanState::Pending,
                    failure: None,
                },
                tx,
                finished_at: None,
            },
        );
        Ok(rx)
    }

    /// Drops a plan that never started (its claim failed).
    pub fn discard(&self, plan_id: PlanId) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.plans.remove(&plan_id) {
            let key = (record.status.plan.collection_id, record.status.plan.bucket);
            if inner.in_flight.get(&key) == Some(&plan_id) {
                inner.in_flight.remove(&key);
            }
        }
    }

    /// Moves a plan to `state`, notifying waiters. Terminal states free the
    /// bucket.
    pub fn set_state(&self, plan_id: PlanId, state: PlanState, failure: Option<String>) {
        let mut inner = self.inner.write();
        let Some(record) = inner.plans.get_mut(&plan_id) else {
            return;
        };
        record.status.state = state;
        if failure.is_some() {
            record.status.failure = failure;
        }
        record.tx.send_replace(state);
        if state.is_terminal() {
            record.finished_at = Some(Instant::now());
            let key = (record.status.plan.collection_id, record.status.plan.bucket);
            if inner.in_flight.get(&key) == Some(&plan_id) {
                inner.in_flight.remove(&key);
            }
        }
    }

    pub fn status(&self, plan_id: PlanId) -> Option<PlanStatus> {
        self.inner.read().plans.get(&plan_id).map(|r| r.status.clone())
    }

    pub fn subscribe(&self, plan_id: PlanId) -> Option<watch::Receiver<PlanState>> {
        self.inner.read().plans.get(&plan_id).map(|r| r.tx.subscribe())
    }

    /// Buckets of `collection` with a plan in flight.
    pub fn in_flight_buckets(&self, collection: CollectionId) -> HashSet<SegmentBucket> {
        self.inner
            .read()
            .in_flight
            .keys()
            .filter(|(c, _)| *c == collection)
            .map(|(_, bucket)| *bucket)
            .collect()
    }

    /// The plan holding `bucket` of `collection`, if any.
    pub fn in_flight_plan(&self, collection: CollectionId, bucket: SegmentBucket) -> Option<PlanId> {
        self.inner.read().in_flight.get(&(collection, bucket)).copied()
    }

    /// Plans of `collection` currently in flight.
    pub fn in_flight_plans(&self, collection: CollectionId) -> Vec<PlanId> {
        let mut plans: Vec<PlanId> = self
            .inner
            .read()
            .in_flight
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|(_, plan)| *plan)
            .collect();
        plans.sort();
        plans
    }

    /// Records the plans produced by one trigger call.
    pub fn record_group(&self, group_id: PlanGroupId, plans: Vec<PlanId>) {
        self.inner.write().groups.insert(
            group_id,
            GroupRecord {
                plans,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Forgets plans that reached a terminal state at least `horizon` ago,
    /// and groups recorded that long ago with none of their plans left.
    /// Returns the number of plan records removed.
    pub fn prune(&self, horizon: Duration) -> usize {
        let mut inner = self.inner.write();
        let before = inner.plans.len();
        inner.plans.retain(|_, record| {
            record
                .finished_at
                .map_or(true, |finished| finished.elapsed() < horizon)
        });
        let removed = before - inner.plans.len();

        let TrackerInner { plans, groups, .. } = &mut *inner;
        groups.retain(|_, group| {
            group.recorded_at.elapsed() < horizon
                || group.plans.iter().any(|id| plans.contains_key(id))
        });
        removed
    }

    pub fn plan_count(&self) -> usize {
        self.inner.read().plans.len()
    }

    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }

    /// Status of every plan in a group, in plan order.
    pub fn group_plans(&self, group_id: PlanGroupId) -> CoreResult<Vec<PlanStatus>> {
        let inner = self.inner.read();
        let group = inner
            .groups
            .get(&group_id)
            .ok_or_else(|| CoreError::not_found("plan group", group_id.to_string()))?;
        Ok(group
            .plans
            .iter()
            .filter_map(|id| inner.plans.get(id).map(|r| r.status.clone()))
            .collect())
    }

    pub fn group_summary(&self, group_id: PlanGroupId) -> CoreResult<CompactionStateSummary> {
        let plans = self.group_plans(group_id)?;
        Ok(CompactionStateSummary::from_states(
            group_id,
            plans.iter().map(|p| p.state),
        ))
    }

    /// Waits until every plan of the group is terminal.
    ///
    /// # Errors
    ///
    /// `Timeout` once `timeout` elapses; the plans keep running.
    pub async fn wait_group(
        &self,
        group_id: PlanGroupId,
        timeout: Duration,
    ) -> CoreResult<CompactionStateSummary> {
        let receivers: Vec<watch::Receiver<PlanState>> = {
            let inner = self.inner.read();
            let group = inner
                .groups
                .get(&group_id)
                .ok_or_else(|| CoreError::not_found("plan group", group_id.to_string()))?;
            group
                .plans
                .iter()
                .filter_map(|id| inner.plans.get(id).map(|r| r.tx.subscribe()))
                .collect()
        };

        let started = Instant::now();
        let all_terminal = async {
            for mut rx in receivers {
                // The sender lives as long as the record; a closed channel
                // only happens on shutdown, which ends the wait as well.
                let _ = rx.wait_for(PlanState::is_terminal).await;
            }
        };
        tokio::time::timeout(timeout, all_terminal)
            .await
            .map_err(|_| {
                CoreError::timeout(
                    format!("compaction plan group {group_id}"),
                    started.elapsed().as_millis() as u64,
                )
            })?;
        self.group_summary(group_id)
    }
}

/// Caller-side handle on a submitted plan.
#[derive(Debug, Clone)]
pub struct PlanHandle {
    plan_id: PlanId,
    rx: watch::Receiver<PlanState>,
}

impl PlanHandle {
    pub(crate) fn new(plan_id: PlanId, rx: watch::Receiver<PlanState>) -> Self {
        Self { plan_id, rx }
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Latest observed state.
    pub fn state(&self) -> PlanState {
        *self.rx.borrow()
    }

    /// Waits for a terminal state.
    ///
    /// # Errors
    ///
    /// `Timeout` if the plan is still running after `timeout`; the plan is
    /// not cancelled.
    pub async fn wait(&mut self, timeout: Duration) -> CoreResult<PlanState> {
        let started = Instant::now();
        let plan_id = self.plan_id;
        match tokio::time::timeout(timeout, self.rx.wait_for(PlanState::is_terminal)).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(CoreError::internal(format!(
                "plan {plan_id} tracker dropped before completion"
            ))),
            Err(_) => Err(CoreError::timeout(
                format!("compaction plan {plan_id}"),
                started.elapsed().as_millis() as u64,
            )),
        }
    }
}
