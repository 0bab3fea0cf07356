//! Query-segment registry: which segments readers should load.

use std::sync::Arc;

use silt_core::{CollectionId, SegmentDescriptor};
use silt_storage::{SegmentCatalog, SegmentView};

/// Loadable segments of a collection at one catalog version.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub segments: Vec<SegmentView>,
}

impl RegistrySnapshot {
    pub fn descriptors(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.iter().map(|s| &s.descriptor)
    }
}

/// Read-only view over the catalog for the query side.
///
/// Only Growing, Sealed and Flushed segments are listed, so a compaction
/// target shows up exactly when its swap lands and its sources disappear in
/// the same version.
#[derive(Debug, Clone)]
pub struct QuerySegmentRegistry {
    catalog: Arc<SegmentCatalog>,
}

impl QuerySegmentRegistry {
    pub fn new(catalog: Arc<SegmentCatalog>) -> Self {
        Self { catalog }
    }

    pub fn segments_for(&self, collection: CollectionId) -> RegistrySnapshot {
        let snapshot = self.catalog.snapshot_collection(collection);
        let version = snapshot.version;
        let segments = snapshot
            .segments
            .into_iter()
            .filter(|s| s.descriptor.state.is_visible())
            .collect();
        RegistrySnapshot { version, segments }
    }
}
