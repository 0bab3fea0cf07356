//! Time-travel visibility.
//!
//! A row (K, ts_i) is visible at T iff ts_i <= T and no delete for K has
//! ts_i <= ts_d <= T. Compaction physically drops a row iff such a delete
//! exists with ts_d <= cutoff, and carries every newer delete forward, so
//! the answer for any T >= cutoff is unchanged.

use std::collections::{HashMap, HashSet};

use silt_core::{CoreResult, DeltaRecord, Row, Timestamp};
use silt_storage::{SegmentStore, SegmentView};

/// Delete timestamps grouped by primary key.
#[derive(Debug, Default)]
pub struct DeleteIndex {
    by_pk: HashMap<i64, Vec<Timestamp>>,
}

impl DeleteIndex {
    pub fn new<'a>(deltas: impl IntoIterator<Item = &'a DeltaRecord>) -> Self {
        let mut by_pk: HashMap<i64, Vec<Timestamp>> = HashMap::new();
        for delta in deltas {
            by_pk.entry(delta.pk).or_default().push(delta.ts);
        }
        Self { by_pk }
    }

    /// True when a delete for `pk` falls in `[inserted_at, upto]`.
    #[must_use]
    pub fn hides(&self, pk: i64, inserted_at: Timestamp, upto: Timestamp) -> bool {
        self.by_pk
            .get(&pk)
            .is_some_and(|stamps| stamps.iter().any(|ts| inserted_at <= *ts && *ts <= upto))
    }
}

/// Rows of `rows` visible at `read_ts` given `deltas`, in input order.
#[must_use]
pub fn visible_at(rows: &[Row], deltas: &[DeltaRecord], read_ts: Timestamp) -> Vec<Row> {
    let index = DeleteIndex::new(deltas);
    rows.iter()
        .filter(|row| row.ts <= read_ts && !index.hides(row.pk, row.ts, read_ts))
        .cloned()
        .collect()
}

/// Outcome of folding delete records into rows at a retention cutoff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetainedRows {
    /// Rows that survive, in input order.
    pub rows: Vec<Row>,
    /// Deletes newer than the cutoff that still target a surviving row.
    pub carried: Vec<DeltaRecord>,
    pub removed_rows: usize,
    /// Deletes at or before the cutoff, consumed by this fold.
    pub applied_deletes: usize,
}

/// Applies every delete at or before `cutoff` and keeps the rest.
#[must_use]
pub fn apply_retention(rows: &[Row], deltas: &[DeltaRecord], cutoff: Timestamp) -> RetainedRows {
    let applicable = DeleteIndex::new(deltas.iter().filter(|d| d.ts <= cutoff));
    let survivors: Vec<Row> = rows
        .iter()
        .filter(|row| !applicable.hides(row.pk, row.ts, cutoff))
        .cloned()
        .collect();

    let live_pks: HashSet<i64> = survivors.iter().map(|r| r.pk).collect();
    let mut seen = HashSet::new();
    let carried: Vec<DeltaRecord> = deltas
        .iter()
        .filter(|d| d.ts > cutoff && live_pks.contains(&d.pk) && seen.insert(**d))
        .copied()
        .collect();

    RetainedRows {
        removed_rows: rows.len() - survivors.len(),
        applied_deletes: deltas.iter().filter(|d| d.ts <= cutoff).count(),
        rows: survivors,
        carried,
    }
}

/// Rows visible at a read timestamp across a segment set.
#[derive(Debug, Clone, Default)]
pub struct VisibleRows {
    pub rows: Vec<Row>,
    /// False when `read_ts` is older than the retention cutoff some segment
    /// was compacted at; rows removed by that compaction stay absent.
    pub exact: bool,
}

/// Evaluates visibility over `segments` at `read_ts`, reading rows through
/// the segment store.
///
/// Deletes are matched across the whole set, so a delete recorded against
/// one segment also hides the same key in another.
pub async fn visible_rows(
    store: &SegmentStore,
    segments: &[SegmentView],
    read_ts: Timestamp,
) -> CoreResult<VisibleRows> {
    let index = DeleteIndex::new(segments.iter().flat_map(|s| s.deltas.iter()));
    let mut rows = Vec::new();
    for segment in segments {
        let segment_rows = store.read_rows(segment).await?;
        rows.extend(
            segment_rows
                .iter()
                .filter(|row| row.ts <= read_ts && !index.hides(row.pk, row.ts, read_ts))
                .cloned(),
        );
    }

    let exact = segments.iter().all(|s| {
        s.descriptor
            .compacted_cutoff
            .map_or(true, |cutoff| read_ts >= cutoff)
    });
    Ok(VisibleRows { rows, exact })
}
