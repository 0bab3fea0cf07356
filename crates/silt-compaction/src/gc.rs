//! Garbage collection of retired compaction sources.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use silt_core::{CoreResult, SegmentId, SegmentState, Timestamp};
use silt_storage::SegmentStore;

/// Moves Compacted segments to Dropped once they have been retired for
/// longer than the retention duration, deletes their logs and removes them
/// from the catalog. Segments already Dropped, such as empty merge targets,
/// are removed on the same pass.
pub struct GarbageCollector {
    store: Arc<SegmentStore>,
    retention: Duration,
}

impl GarbageCollector {
    pub fn new(store: Arc<SegmentStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// One pass at `now`. Returns the ids of the segments removed.
    pub async fn collect(&self, now: Timestamp) -> CoreResult<Vec<SegmentId>> {
        let horizon = now.saturating_sub(self.retention);
        let catalog = self.store.catalog();
        let (expired, already_dropped): (Vec<_>, Vec<_>) = catalog
            .snapshot()
            .segments
            .iter()
            .filter(|s| match s.descriptor.state {
                SegmentState::Compacted => s.descriptor.retired_ts.is_some_and(|ts| ts <= horizon),
                SegmentState::Dropped => true,
                _ => false,
            })
            .map(|s| s.descriptor.clone())
            .partition(|d| d.state == SegmentState::Compacted);

        let mut purged = already_dropped;
        for descriptor in expired {
            let id = descriptor.segment_id;
            match catalog.transition(id, SegmentState::Compacted, SegmentState::Dropped, |_| {}) {
                Ok(descriptor) => purged.push(descriptor),
                Err(e) => warn!(segment_id = %id, error = %e, "Skipping segment in GC pass"),
            }
        }

        let mut removed = Vec::with_capacity(purged.len());
        for descriptor in purged {
            self.store.purge_segment(&descriptor).await?;
            let id = descriptor.segment_id;
            match catalog.forget(id) {
                Ok(_) => removed.push(id),
                Err(e) => warn!(segment_id = %id, error = %e, "Dropped segment not forgotten"),
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Garbage collected retired segments");
        }
        Ok(removed)
    }
}
