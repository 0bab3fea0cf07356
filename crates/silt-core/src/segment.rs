//! Segment domain types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::ids::{CollectionId, PartitionId, PlanId, SegmentId, ShardId};
use crate::timestamp::Timestamp;

/// Lifecycle state for a segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// Accepting inserts; rows live in memory.
    Growing,
    /// No longer accepting inserts; insert log is being written.
    Sealed,
    /// Insert log persisted; eligible for compaction.
    Flushed,
    /// Consumed by a completed compaction plan; kept until the GC horizon.
    Compacted,
    /// Retired after retention; logs removed.
    Dropped,
}

impl SegmentState {
    /// Returns true for states a compaction plan may take as a source.
    #[must_use]
    pub const fn is_compactable(&self) -> bool {
        matches!(self, Self::Sealed | Self::Flushed)
    }

    /// Returns true for states readers may load.
    #[must_use]
    pub const fn is_visible(&self) -> bool {
        matches!(self, Self::Growing | Self::Sealed | Self::Flushed)
    }

    /// Canonical lowercase label used in metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Growing => "growing",
            Self::Sealed => "sealed",
            Self::Flushed => "flushed",
            Self::Compacted => "compacted",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (shard, partition) pair a segment belongs to.
///
/// Compaction never mixes segments from different buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentBucket {
    pub shard_id: ShardId,
    pub partition_id: PartitionId,
}

impl SegmentBucket {
    #[must_use]
    pub const fn new(shard_id: ShardId, partition_id: PartitionId) -> Self {
        Self {
            shard_id,
            partition_id,
        }
    }
}

impl fmt::Display for SegmentBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard={}/partition={}", self.shard_id, self.partition_id)
    }
}

/// Catalog entry describing one segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentDescriptor {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub shard_id: ShardId,
    pub partition_id: PartitionId,
    pub state: SegmentState,
    pub row_count: u64,
    /// Object key of the insert binlog; `None` while growing.
    pub insert_log: Option<String>,
    /// Object key of the last persisted delta binlog.
    pub delta_log: Option<String>,
    /// Smallest commit timestamp of any row in the segment.
    pub min_ts: Timestamp,
    /// Largest commit timestamp of any row in the segment.
    pub max_ts: Timestamp,
    pub created_at: DateTime<Utc>,
    /// Hybrid timestamp of the flush (or of the compaction that built it).
    pub flushed_ts: Option<Timestamp>,
    /// Hybrid timestamp of the compaction that produced this segment.
    pub last_compacted_ts: Option<Timestamp>,
    /// Deletes at or before this timestamp were physically applied.
    pub compacted_cutoff: Option<Timestamp>,
    /// Hybrid timestamp at which the segment was retired as a source.
    pub retired_ts: Option<Timestamp>,
    /// Sources this segment was compacted from.
    pub compaction_from: Vec<SegmentId>,
    /// In-flight plan holding this segment as a source.
    pub claimed_by: Option<PlanId>,
}

impl SegmentDescriptor {
    /// Creates a growing segment descriptor.
    #[must_use]
    pub fn growing(
        segment_id: SegmentId,
        collection_id: CollectionId,
        bucket: SegmentBucket,
    ) -> Self {
        Self {
            segment_id,
            collection_id,
            shard_id: bucket.shard_id,
            partition_id: bucket.partition_id,
            state: SegmentState::Growing,
            row_count: 0,
            insert_log: None,
            delta_log: None,
            min_ts: Timestamp::MAX,
            max_ts: Timestamp::ZERO,
            created_at: Utc::now(),
            flushed_ts: None,
            last_compacted_ts: None,
            compacted_cutoff: None,
            retired_ts: None,
            compaction_from: Vec::new(),
            claimed_by: None,
        }
    }

    /// Returns the (shard, partition) bucket.
    #[must_use]
    pub const fn bucket(&self) -> SegmentBucket {
        SegmentBucket::new(self.shard_id, self.partition_id)
    }

    /// True when the segment may be claimed by a new plan.
    ///
    /// A sealed segment whose insert log has not landed yet is skipped.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        self.state.is_compactable() && self.insert_log.is_some() && self.claimed_by.is_none()
    }

    /// Timestamp the time-interval trigger measures from.
    #[must_use]
    pub fn last_activity_ts(&self) -> Option<Timestamp> {
        self.last_compacted_ts.or(self.flushed_ts)
    }
}

/// A single row as stored in insert logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Row {
    /// Primary key.
    pub pk: i64,
    /// Commit timestamp assigned on insert.
    pub ts: Timestamp,
    /// Float vector field.
    pub vector: Vec<f32>,
    /// Scalar fields keyed by field name.
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl Row {
    /// Creates a row without scalar fields.
    #[must_use]
    pub fn new(pk: i64, ts: Timestamp, vector: Vec<f32>) -> Self {
        Self {
            pk,
            ts,
            vector,
            fields: Map::new(),
        }
    }

    /// Adds a scalar field (builder pattern).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Delete record appended to a segment's delta log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeltaRecord {
    pub pk: i64,
    pub ts: Timestamp,
}

impl DeltaRecord {
    #[must_use]
    pub const fn new(pk: i64, ts: Timestamp) -> Self {
        Self { pk, ts }
    }
}
