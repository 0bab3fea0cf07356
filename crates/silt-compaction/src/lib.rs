//! Compaction for Silt: visibility rules, planning, execution, plan
//! tracking, scheduling and garbage collection of retired segments.

pub mod executor;
pub mod gc;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod tracker;
pub mod visibility;

pub use executor::CompactionExecutor;
pub use gc::GarbageCollector;
pub use planner::{materialize, CompactionPlanner, PlanCandidate, PlanContext, PlannerPolicy};
pub use registry::{QuerySegmentRegistry, RegistrySnapshot};
pub use scheduler::CompactionScheduler;
pub use tracker::{PlanHandle, PlanTracker};
pub use visibility::{apply_retention, visible_at, visible_rows, DeleteIndex, RetainedRows, VisibleRows};
