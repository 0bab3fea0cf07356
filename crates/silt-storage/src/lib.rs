//! Segment storage for Silt: object stores, binlogs, the segment catalog and
//! the segment store.

pub mod binlog;
pub mod catalog;
pub mod object_store;
pub mod segment_store;

pub use catalog::{CatalogSnapshot, PendingDeltas, SegmentCatalog, SegmentView, SwapTarget};
pub use object_store::{LocalObjectStore, MemoryObjectStore, MockObjectStore, ObjectStore};
pub use segment_store::{SegmentStore, SharedRows};
