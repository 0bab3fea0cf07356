//! Compaction planner.
//!
//! Evaluation is a pure function of a segment snapshot, the set of buckets
//! that already have a plan in flight, and a [`PlanContext`] carrying `now`
//! and the retention cutoff. Turning candidates into plans (allocating plan
//! and target ids) is a separate step so the evaluation can be tested on
//! synthetic segment sets.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use silt_core::config::CompactionConfig;
use silt_core::{
    CollectionId, CompactionKind, CompactionPlan, CompactionTrigger, IdAllocator, SegmentBucket,
    SegmentId, Timestamp,
};
use silt_storage::SegmentView;

/// Thresholds the planner evaluates against.
#[derive(Debug, Clone)]
pub struct PlannerPolicy {
    pub delete_ratio_threshold: f64,
    pub max_delta_records: u64,
    pub segment_count_threshold: usize,
    /// Segments with fewer rows than this are "small".
    pub small_segment_rows: u64,
    pub max_compaction_interval: Duration,
}

impl PlannerPolicy {
    pub fn from_config(config: &CompactionConfig, max_rows: u64) -> Self {
        Self {
            delete_ratio_threshold: config.delete_ratio_threshold,
            max_delta_records: config.max_delta_records,
            segment_count_threshold: config.segment_count_threshold,
            small_segment_rows: (max_rows as f64 * config.small_segment_proportion).ceil() as u64,
            max_compaction_interval: config.max_compaction_interval(),
        }
    }
}

/// Clock inputs of one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext {
    pub now: Timestamp,
    /// Deletes at or before this are physically applicable.
    pub retention_cutoff: Timestamp,
}

impl PlanContext {
    /// Context for `now` with a cutoff `retention` in the past.
    pub fn at(now: Timestamp, retention: Duration) -> Self {
        Self {
            now,
            retention_cutoff: now.saturating_sub(retention),
        }
    }
}

/// A plan before ids are allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCandidate {
    pub bucket: SegmentBucket,
    /// Sources in creation order.
    pub sources: Vec<SegmentId>,
    pub kind: CompactionKind,
    pub trigger: CompactionTrigger,
}

#[derive(Debug, Clone)]
pub struct CompactionPlanner {
    policy: PlannerPolicy,
}

impl CompactionPlanner {
    pub fn new(policy: PlannerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PlannerPolicy {
        &self.policy
    }

    /// Manual trigger: one merge per bucket with two or more eligible
    /// segments, or a delta merge for a lone segment that meets the delete
    /// condition.
    pub fn plan_manual(
        &self,
        segments: &[SegmentView],
        in_flight: &HashSet<SegmentBucket>,
        ctx: PlanContext,
    ) -> Vec<PlanCandidate> {
        let mut candidates = Vec::new();
        for (bucket, eligible) in eligible_by_bucket(segments) {
            if in_flight.contains(&bucket) {
                continue;
            }
            if eligible.len() >= 2 {
                candidates.push(merge(bucket, &eligible, CompactionTrigger::Manual));
            } else if let Some(only) = eligible.first() {
                if self.delete_trigger(only, ctx).is_some() {
                    candidates.push(PlanCandidate {
                        bucket,
                        sources: vec![only.descriptor.segment_id],
                        kind: CompactionKind::DeltaMerge,
                        trigger: CompactionTrigger::Manual,
                    });
                }
            }
        }
        candidates
    }

    /// Automatic triggers, at most one candidate per bucket: segment count
    /// first, then time interval, then the worst delete-ratio or delta-size
    /// segment.
    pub fn plan_auto(
        &self,
        segments: &[SegmentView],
        in_flight: &HashSet<SegmentBucket>,
        ctx: PlanContext,
    ) -> Vec<PlanCandidate> {
        let mut candidates = Vec::new();
        for (bucket, eligible) in eligible_by_bucket(segments) {
            if in_flight.contains(&bucket) {
                continue;
            }
            if let Some(candidate) = self.evaluate_bucket(bucket, &eligible, ctx) {
                debug!(%bucket, trigger = %candidate.trigger, sources = candidate.sources.len(), "Automatic compaction candidate");
                candidates.push(candidate);
            }
        }
        candidates
    }

    fn evaluate_bucket(
        &self,
        bucket: SegmentBucket,
        eligible: &[&SegmentView],
        ctx: PlanContext,
    ) -> Option<PlanCandidate> {
        let small: Vec<&SegmentView> = eligible
            .iter()
            .copied()
            .filter(|s| s.descriptor.row_count < self.policy.small_segment_rows)
            .collect();
        if small.len() >= self.policy.segment_count_threshold {
            return Some(merge(bucket, &small, CompactionTrigger::SegmentCount));
        }

        if eligible.len() >= 2 && eligible.iter().all(|s| self.is_idle(s, ctx.now)) {
            return Some(merge(bucket, eligible, CompactionTrigger::TimeInterval));
        }

        eligible
            .iter()
            .filter_map(|s| self.delete_trigger(s, ctx).map(|t| (s, t)))
            .max_by(|(a, _), (b, _)| {
                delete_ratio(a, ctx.retention_cutoff)
                    .total_cmp(&delete_ratio(b, ctx.retention_cutoff))
                    // Prefer the older segment on ties.
                    .then(b.descriptor.segment_id.cmp(&a.descriptor.segment_id))
            })
            .map(|(s, trigger)| PlanCandidate {
                bucket,
                sources: vec![s.descriptor.segment_id],
                kind: CompactionKind::DeltaMerge,
                trigger,
            })
    }

    fn is_idle(&self, segment: &SegmentView, now: Timestamp) -> bool {
        let Some(last) = segment.descriptor.last_activity_ts() else {
            return false;
        };
        let idle_ms = now.physical().saturating_sub(last.physical());
        u128::from(idle_ms) > self.policy.max_compaction_interval.as_millis()
    }

    /// Which delete condition, if any, the segment meets.
    fn delete_trigger(&self, segment: &SegmentView, ctx: PlanContext) -> Option<CompactionTrigger> {
        let applicable = segment.applicable_deletes(ctx.retention_cutoff);
        if applicable == 0 {
            return None;
        }
        if delete_ratio(segment, ctx.retention_cutoff) >= self.policy.delete_ratio_threshold {
            Some(CompactionTrigger::DeleteRatio)
        } else if applicable >= self.policy.max_delta_records {
            Some(CompactionTrigger::DeltaSize)
        } else {
            None
        }
    }
}

fn delete_ratio(segment: &SegmentView, cutoff: Timestamp) -> f64 {
    let rows = segment.descriptor.row_count;
    if rows == 0 {
        return 0.0;
    }
    segment.applicable_deletes(cutoff) as f64 / rows as f64
}

fn eligible_by_bucket(segments: &[SegmentView]) -> BTreeMap<SegmentBucket, Vec<&SegmentView>> {
    let mut buckets: BTreeMap<SegmentBucket, Vec<&SegmentView>> = BTreeMap::new();
    for segment in segments.iter().filter(|s| s.descriptor.is_claimable()) {
        buckets
            .entry(segment.descriptor.bucket())
            .or_default()
            .push(segment);
    }
    for eligible in buckets.values_mut() {
        eligible.sort_by_key(|s| s.descriptor.segment_id);
    }
    buckets
}

fn merge(bucket: SegmentBucket, sources: &[&SegmentView], trigger: CompactionTrigger) -> PlanCandidate {
    PlanCandidate {
        bucket,
        sources: sources.iter().map(|s| s.descriptor.segment_id).collect(),
        kind: CompactionKind::Merge,
        trigger,
    }
}

/// Allocates plan and target ids for a candidate.
pub fn materialize(
    candidate: PlanCandidate,
    collection_id: CollectionId,
    ids: &IdAllocator,
    ctx: PlanContext,
) -> CompactionPlan {
    CompactionPlan {
        plan_id: ids.plan(),
        collection_id,
        bucket: candidate.bucket,
        sources: candidate.sources,
        target: ids.segment(),
        kind: candidate.kind,
        trigger: candidate.trigger,
        retention_cutoff: ctx.retention_cutoff,
        created_at: Utc::now(),
    }
}
