//! Versioned segment catalog.
//!
//! The catalog is the single source of truth for segment metadata, the
//! in-memory delta logs and the per-segment primary-key sets. Every mutation
//! takes the write guard once, checks the expected state and bumps the
//! version, so readers always observe either the whole of a transition or
//! none of it. No `.await` happens while a guard is held.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;
use roaring::RoaringTreemap;
use tracing::{debug, info};

use silt_core::metrics::CATALOG_SEGMENTS;
use silt_core::{
    CollectionId, CompactionPlan, CoreError, CoreResult, DeltaRecord, PlanId, Row,
    SegmentDescriptor, SegmentId, SegmentState, Timestamp,
};

fn pk_key(pk: i64) -> u64 {
    pk as u64
}

/// A segment together with its delete records, as handed to readers.
#[derive(Debug, Clone)]
pub struct SegmentView {
    pub descriptor: SegmentDescriptor,
    /// Delete records in append order.
    pub deltas: Vec<DeltaRecord>,
}

impl SegmentView {
    /// Delete records at or before `cutoff`.
    #[must_use]
    pub fn applicable_deletes(&self, cutoff: Timestamp) -> u64 {
        self.deltas.iter().filter(|d| d.ts <= cutoff).count() as u64
    }
}

/// Point-in-time copy of the catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub segments: Vec<SegmentView>,
}

impl CatalogSnapshot {
    /// Segments of one collection, in creation order.
    pub fn collection(&self, collection: CollectionId) -> impl Iterator<Item = &SegmentView> {
        self.segments
            .iter()
            .filter(move |s| s.descriptor.collection_id == collection)
    }

    /// Readable segments of one collection (Growing, Sealed, Flushed).
    pub fn visible(&self, collection: CollectionId) -> impl Iterator<Item = &SegmentView> {
        self.collection(collection)
            .filter(|s| s.descriptor.state.is_visible())
    }

    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<&SegmentView> {
        self.segments.iter().find(|s| s.descriptor.segment_id == id)
    }
}

#[derive(Debug)]
struct SegmentEntry {
    descriptor: SegmentDescriptor,
    deltas: Vec<DeltaRecord>,
    /// Prefix of `deltas` already written to the delta log.
    persisted_deltas: usize,
    pks: RoaringTreemap,
}

impl SegmentEntry {
    fn new(descriptor: SegmentDescriptor) -> Self {
        Self {
            descriptor,
            deltas: Vec::new(),
            persisted_deltas: 0,
            pks: RoaringTreemap::new(),
        }
    }

    fn view(&self) -> SegmentView {
        SegmentView {
            descriptor: self.descriptor.clone(),
            deltas: self.deltas.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct CatalogInner {
    version: u64,
    segments: BTreeMap<SegmentId, SegmentEntry>,
}

impl CatalogInner {
    fn entry_mut(&mut self, id: SegmentId) -> CoreResult<&mut SegmentEntry> {
        self.segments
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("segment", id.to_string()))
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn refresh_metrics(&self) {
        let mut counts: HashMap<SegmentState, i64> = HashMap::new();
        for entry in self.segments.values() {
            *counts.entry(entry.descriptor.state).or_default() += 1;
        }
        for state in [
            SegmentState::Growing,
            SegmentState::Sealed,
            SegmentState::Flushed,
            SegmentState::Compacted,
            SegmentState::Dropped,
        ] {
            CATALOG_SEGMENTS
                .with_label_values(&[state.as_str()])
                .set(counts.get(&state).copied().unwrap_or(0));
        }
    }
}

/// The target of a completed plan, ready to be swapped in.
#[derive(Debug, Clone)]
pub struct SwapTarget {
    pub descriptor: SegmentDescriptor,
    /// Delete records newer than the retention cutoff carried from sources.
    pub deltas: Vec<DeltaRecord>,
    /// Primary keys of the surviving rows.
    pub pks: Vec<i64>,
}

/// Pending delta records of one segment that still need persisting.
#[derive(Debug, Clone)]
pub struct PendingDeltas {
    pub descriptor: SegmentDescriptor,
    pub deltas: Vec<DeltaRecord>,
}

/// Explicit, versioned metadata registry for segments.
#[derive(Debug, Default)]
pub struct SegmentCatalog {
    inner: RwLock<CatalogInner>,
}

impl SegmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current catalog version; increases on every mutation.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Registers a new segment.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken.
    pub fn register(&self, descriptor: SegmentDescriptor) -> CoreResult<u64> {
        let mut inner = self.inner.write();
        let id = descriptor.segment_id;
        if inner.segments.contains_key(&id) {
            return Err(CoreError::already_exists("segment", id.to_string()));
        }
        debug!(segment_id = %id, state = %descriptor.state, "Registering segment");
        inner.segments.insert(id, SegmentEntry::new(descriptor));
        inner.refresh_metrics();
        Ok(inner.bump())
    }

    /// Appends rows to a growing segment, updating row count, timestamp
    /// range and primary-key set. Returns the new row count.
    pub fn append_rows(&self, id: SegmentId, rows: &[Row]) -> CoreResult<u64> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(id)?;
        if entry.descriptor.state != SegmentState::Growing {
            return Err(CoreError::invalid_state(format!(
                "segment {id} is {}, cannot append rows",
                entry.descriptor.state
            )));
        }
        for row in rows {
            entry.pks.insert(pk_key(row.pk));
            entry.descriptor.min_ts = entry.descriptor.min_ts.min(row.ts);
            entry.descriptor.max_ts = entry.descriptor.max_ts.max(row.ts);
        }
        entry.descriptor.row_count += rows.len() as u64;
        let rows_now = entry.descriptor.row_count;
        inner.bump();
        Ok(rows_now)
    }

    /// Compare-and-swap state transition.
    ///
    /// Fails with `InvalidState` when the segment is not in `expected`.
    /// `patch` runs on the descriptor after the state change, inside the
    /// same critical section.
    pub fn transition(
        &self,
        id: SegmentId,
        expected: SegmentState,
        next: SegmentState,
        patch: impl FnOnce(&mut SegmentDescriptor),
    ) -> CoreResult<SegmentDescriptor> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(id)?;
        if entry.descriptor.state != expected {
            return Err(CoreError::invalid_state(format!(
                "segment {id} is {}, expected {expected}",
                entry.descriptor.state
            )));
        }
        entry.descriptor.state = next;
        patch(&mut entry.descriptor);
        let descriptor = entry.descriptor.clone();
        inner.refresh_metrics();
        inner.bump();
        debug!(segment_id = %id, from = %expected, to = %next, "Segment transitioned");
        Ok(descriptor)
    }

    /// Claims every segment for `plan_id`, or none of them.
    ///
    /// # Errors
    ///
    /// `InvalidState` naming the first segment that is missing, not
    /// compactable, lacks an insert log, or is already claimed.
    pub fn claim(&self, ids: &[SegmentId], plan_id: PlanId) -> CoreResult<()> {
        let mut inner = self.inner.write();
        for id in ids {
            let entry = inner
                .segments
                .get(id)
                .ok_or_else(|| CoreError::not_found("segment", id.to_string()))?;
            if !entry.descriptor.is_claimable() {
                return Err(CoreError::invalid_state(format!(
                    "segment {id} cannot be claimed (state {}, claimed by {:?})",
                    entry.descriptor.state, entry.descriptor.claimed_by
                )));
            }
        }
        for id in ids {
            inner.entry_mut(*id)?.descriptor.claimed_by = Some(plan_id);
        }
        inner.bump();
        Ok(())
    }

    /// Releases the claims `plan_id` holds. Segments claimed by other plans
    /// are left alone.
    pub fn release(&self, ids: &[SegmentId], plan_id: PlanId) {
        let mut inner = self.inner.write();
        for id in ids {
            if let Some(entry) = inner.segments.get_mut(id) {
                if entry.descriptor.claimed_by == Some(plan_id) {
                    entry.descriptor.claimed_by = None;
                }
            }
        }
        inner.bump();
    }

    /// Appends a delete record at `ts` for every key matching `predicate` in
    /// every visible segment of `collection`. Returns the number of distinct
    /// keys hit.
    pub fn apply_delete(
        &self,
        collection: CollectionId,
        predicate: impl Fn(i64) -> bool,
        ts: Timestamp,
    ) -> usize {
        let mut inner = self.inner.write();
        let mut hit: HashSet<i64> = HashSet::new();
        for entry in inner.segments.values_mut() {
            if entry.descriptor.collection_id != collection || !entry.descriptor.state.is_visible()
            {
                continue;
            }
            let keys: Vec<i64> = entry
                .pks
                .iter()
                .map(|k| k as i64)
                .filter(|pk| predicate(*pk))
                .collect();
            for pk in keys {
                entry.deltas.push(DeltaRecord::new(pk, ts));
                hit.insert(pk);
            }
        }
        if !hit.is_empty() {
            inner.bump();
        }
        hit.len()
    }

    /// Atomically retires the plan's sources and publishes its target.
    ///
    /// A target without rows is recorded as Dropped so it never becomes
    /// visible.
    ///
    /// `consumed` maps each source to the number of its delete records the
    /// executor read; anything appended after that is moved onto the target
    /// so deletes issued during execution are not lost.
    pub fn swap(
        &self,
        plan: &CompactionPlan,
        consumed: &HashMap<SegmentId, usize>,
        target: SwapTarget,
        retired_ts: Timestamp,
    ) -> CoreResult<u64> {
        let mut inner = self.inner.write();

        for id in &plan.sources {
            let entry = inner
                .segments
                .get(id)
                .ok_or_else(|| CoreError::not_found("segment", id.to_string()))?;
            if entry.descriptor.claimed_by != Some(plan.plan_id)
                || !entry.descriptor.state.is_compactable()
            {
                return Err(CoreError::invalid_state(format!(
                    "plan {} no longer owns source {id}",
                    plan.plan_id
                )));
            }
        }
        if inner.segments.contains_key(&plan.target) {
            return Err(CoreError::already_exists("segment", plan.target.to_string()));
        }

        let mut pks = RoaringTreemap::new();
        for pk in &target.pks {
            pks.insert(pk_key(*pk));
        }

        let mut late = Vec::new();
        for id in &plan.sources {
            let entry = inner.entry_mut(*id)?;
            let seen = consumed.get(id).copied().unwrap_or(0);
            late.extend(
                entry
                    .deltas
                    .iter()
                    .skip(seen)
                    .filter(|d| pks.contains(pk_key(d.pk)))
                    .copied(),
            );
            entry.descriptor.state = SegmentState::Compacted;
            entry.descriptor.claimed_by = None;
            entry.descriptor.retired_ts = Some(retired_ts);
        }

        let mut target_entry = SegmentEntry::new(target.descriptor);
        // Nothing survived: the sources retire and nothing replaces them.
        target_entry.descriptor.state = if target_entry.descriptor.row_count == 0 {
            SegmentState::Dropped
        } else {
            SegmentState::Flushed
        };
        target_entry.persisted_deltas = if target_entry.descriptor.delta_log.is_some() {
            target.deltas.len()
        } else {
            0
        };
        target_entry.deltas = target.deltas;
        target_entry.deltas.extend(late.iter().copied());
        target_entry.pks = pks;
        inner.segments.insert(plan.target, target_entry);

        inner.refresh_metrics();
        let version = inner.bump();
        info!(
            plan_id = %plan.plan_id,
            target = %plan.target,
            sources = plan.sources.len(),
            late_deletes = late.len(),
            version,
            "Swapped compaction target into catalog"
        );
        Ok(version)
    }

    /// Removes a Dropped segment together with its delete records and key
    /// set. Returns its last descriptor.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the segment is Dropped.
    pub fn forget(&self, id: SegmentId) -> CoreResult<SegmentDescriptor> {
        let mut inner = self.inner.write();
        let state = inner.entry_mut(id)?.descriptor.state;
        if state != SegmentState::Dropped {
            return Err(CoreError::invalid_state(format!(
                "segment {id} is {state}, only dropped segments can be forgotten"
            )));
        }
        let entry = inner
            .segments
            .remove(&id)
            .ok_or_else(|| CoreError::not_found("segment", id.to_string()))?;
        inner.refresh_metrics();
        inner.bump();
        debug!(segment_id = %id, "Forgot dropped segment");
        Ok(entry.descriptor)
    }

    /// Delete records not yet written to a delta log, per sealed segment of
    /// `collection`.
    pub fn pending_deltas(&self, collection: CollectionId) -> Vec<PendingDeltas> {
        let inner = self.inner.read();
        inner
            .segments
            .values()
            .filter(|e| {
                e.descriptor.collection_id == collection
                    && matches!(
                        e.descriptor.state,
                        SegmentState::Sealed | SegmentState::Flushed
                    )
                    && e.deltas.len() > e.persisted_deltas
            })
            .map(|e| PendingDeltas {
                descriptor: e.descriptor.clone(),
                deltas: e.deltas.clone(),
            })
            .collect()
    }

    /// Records that the first `count` delete records of `id` are in `key`.
    pub fn mark_deltas_persisted(&self, id: SegmentId, count: usize, key: String) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(id)?;
        entry.persisted_deltas = entry.persisted_deltas.max(count.min(entry.deltas.len()));
        entry.descriptor.delta_log = Some(key);
        inner.bump();
        Ok(())
    }

    /// One segment with its delete records.
    pub fn get(&self, id: SegmentId) -> Option<SegmentView> {
        self.inner.read().segments.get(&id).map(SegmentEntry::view)
    }

    /// Snapshot of every segment.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let inner = self.inner.read();
        CatalogSnapshot {
            version: inner.version,
            segments: inner.segments.values().map(SegmentEntry::view).collect(),
        }
    }

    /// Snapshot restricted to one collection.
    pub fn snapshot_collection(&self, collection: CollectionId) -> CatalogSnapshot {
        let inner = self.inner.read();
        CatalogSnapshot {
            version: inner.version,
            segments: inner
                .segments
                .values()
                .filter(|e| e.descriptor.collection_id == collection)
                .map(SegmentEntry::view)
                .collect(),
        }
    }

    /// Distinct collections with at least one segment.
    pub fn collections(&self) -> Vec<CollectionId> {
        let inner = self.inner.read();
        let mut ids: Vec<CollectionId> = inner
            .segments
            .values()
            .map(|e| e.descriptor.collection_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
