use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use silt_core::{PartitionId, SegmentId, SegmentState, ShardId, Timestamp};

/// A row as supplied by a client; the commit timestamp is assigned on
/// insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub pk: i64,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(pk: i64, vector: Vec<f32>) -> Self {
        Self {
            pk,
            vector,
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertResult {
    pub primary_keys: Vec<i64>,
    /// Commit timestamp shared by every row of the batch.
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub timestamp: Timestamp,
    /// Distinct primary keys that matched in visible segments.
    pub delete_count: usize,
}

/// One loadable segment as reported by `get_query_segment_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySegmentInfo {
    pub segment_id: SegmentId,
    pub state: SegmentState,
    pub partition_id: PartitionId,
    pub shard_id: ShardId,
    pub num_rows: u64,
}
