//! Compaction plan types shared by the planner, executor and service layers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, PlanGroupId, PlanId, SegmentId};
use crate::segment::SegmentBucket;
use crate::timestamp::Timestamp;

/// What a plan does physically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CompactionKind {
    /// Several segments of one bucket merged into one target.
    Merge,
    /// One segment's delta log folded into a fresh insert log.
    DeltaMerge,
}

/// Why a plan was created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CompactionTrigger {
    Manual,
    DeleteRatio,
    DeltaSize,
    SegmentCount,
    TimeInterval,
}

impl CompactionTrigger {
    /// Canonical lowercase label used in metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::DeleteRatio => "delete_ratio",
            Self::DeltaSize => "delta_size",
            Self::SegmentCount => "segment_count",
            Self::TimeInterval => "time_interval",
        }
    }

    /// True for triggers raised by the scheduler rather than a caller.
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

impl fmt::Display for CompactionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PlanState {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl PlanState {
    /// True once the plan can no longer change state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Specification of source segments to merge into one target segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionPlan {
    pub plan_id: PlanId,
    pub collection_id: CollectionId,
    pub bucket: SegmentBucket,
    /// Sources in segment creation order.
    pub sources: Vec<SegmentId>,
    pub target: SegmentId,
    pub kind: CompactionKind,
    pub trigger: CompactionTrigger,
    /// Deletes at or before this timestamp are physically applied.
    pub retention_cutoff: Timestamp,
    pub created_at: DateTime<Utc>,
}

impl CompactionPlan {
    /// True when `segment_id` is one of the plan's sources.
    #[must_use]
    pub fn has_source(&self, segment_id: SegmentId) -> bool {
        self.sources.contains(&segment_id)
    }
}

/// Snapshot of a plan and its current state, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStatus {
    pub plan: CompactionPlan,
    pub state: PlanState,
    /// Reason reported when `state == Failed`.
    pub failure: Option<String>,
}

/// Aggregate state of a plan group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupState {
    /// At least one plan is still pending or executing.
    Executing,
    /// Every plan reached a terminal state (or there were none).
    Completed,
}

/// Result of `get_compaction_state`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionStateSummary {
    pub group_id: PlanGroupId,
    pub state: GroupState,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CompactionStateSummary {
    /// Summarizes a set of plan states.
    #[must_use]
    pub fn from_states(group_id: PlanGroupId, states: impl IntoIterator<Item = PlanState>) -> Self {
        let (mut executing, mut completed, mut failed) = (0, 0, 0);
        for state in states {
            match state {
                PlanState::Pending | PlanState::Executing => executing += 1,
                PlanState::Completed => completed += 1,
                PlanState::Failed => failed += 1,
            }
        }
        let state = if executing > 0 {
            GroupState::Executing
        } else {
            GroupState::Completed
        };
        Self {
            group_id,
            state,
            executing,
            completed,
            failed,
        }
    }
}
