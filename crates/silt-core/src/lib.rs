//! Core domain types for the Silt segment compaction engine.

pub mod collection;
pub mod compaction;
pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod segment;
pub mod timestamp;
pub mod vector;

pub use collection::{
    CollectionDescriptor, CollectionSchema, DistanceMetric, IndexDescriptor, PartitionDescriptor,
};
pub use compaction::{
    CompactionKind, CompactionPlan, CompactionStateSummary, CompactionTrigger, GroupState,
    PlanState, PlanStatus,
};
pub use config::SiltConfig;
pub use error::{CoreError, CoreResult};
pub use ids::{CollectionId, IdAllocator, PartitionId, PlanGroupId, PlanId, SegmentId, ShardId};
pub use segment::{DeltaRecord, Row, SegmentBucket, SegmentDescriptor, SegmentState};
pub use timestamp::{Timestamp, TimestampOracle};
