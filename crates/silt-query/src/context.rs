use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use silt_core::{CollectionSchema, DistanceMetric, IndexDescriptor, Timestamp};
use silt_storage::SegmentView;

use crate::expr::PkExpr;

/// What a request runs against: the collection layout and the segment set
/// the registry handed out at one catalog version.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub schema: CollectionSchema,
    pub index: Option<IndexDescriptor>,
    pub segments: Vec<SegmentView>,
    pub catalog_version: u64,
}

/// Primary-key query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub expr: PkExpr,
    /// Fields to return besides the primary key.
    pub output_fields: Vec<String>,
    pub travel_ts: Timestamp,
}

/// One matching row, keyed by field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub pk: i64,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Matching rows in primary-key order.
    pub records: Vec<QueryRecord>,
    /// False when the travel timestamp predates a compaction's retention
    /// cutoff on some segment.
    pub exact: bool,
}

/// Brute-force vector search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub vectors: Vec<Vec<f32>>,
    pub metric: DistanceMetric,
    pub limit: usize,
    pub travel_ts: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub pk: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits per query vector, best first.
    pub hits: Vec<Vec<SearchHit>>,
    pub exact: bool,
}
