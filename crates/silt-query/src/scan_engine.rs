//! Scan execution engine
//!
//! Evaluates every request by reading the visible rows of the context's
//! segment set at the travel timestamp and scanning them. Search validation
//! (metric, dimension, limit) happens before any segment is read.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use silt_compaction::visible_rows;
use silt_core::{CoreError, CoreResult, DistanceMetric, Row};
use silt_storage::SegmentStore;

use crate::context::{
    QueryContext, QueryRecord, QueryRequest, QueryResponse, SearchHit, SearchRequest,
    SearchResponse,
};
use crate::engine::ExecutionEngine;

/// Largest accepted search limit.
pub const MAX_SEARCH_LIMIT: usize = 16_384;

pub struct ScanEngine {
    store: Arc<SegmentStore>,
}

impl ScanEngine {
    pub fn new(store: Arc<SegmentStore>) -> Self {
        Self { store }
    }

    fn validate_search(ctx: &QueryContext, request: &SearchRequest) -> CoreResult<()> {
        if let Some(index) = &ctx.index {
            if index.metric != request.metric {
                return Err(CoreError::ValidationError(format!(
                    "metric type not match: index built with {}, search requested {}",
                    index.metric, request.metric
                )));
            }
        }
        if request.limit == 0 || request.limit > MAX_SEARCH_LIMIT {
            return Err(CoreError::ValidationError(format!(
                "limit {} is outside valid range [1, {MAX_SEARCH_LIMIT}]",
                request.limit
            )));
        }
        let dim = ctx.schema.dimension as usize;
        if let Some(bad) = request.vectors.iter().find(|v| v.len() != dim) {
            return Err(CoreError::ValidationError(format!(
                "search vector has dimension {}, collection expects {dim}",
                bad.len()
            )));
        }
        Ok(())
    }

    fn record(ctx: &QueryContext, row: &Row, output_fields: &[String]) -> QueryRecord {
        let mut fields = Map::new();
        fields.insert(ctx.schema.primary_field.clone(), Value::from(row.pk));
        for name in output_fields {
            if *name == ctx.schema.primary_field {
                continue;
            }
            if *name == ctx.schema.vector_field {
                fields.insert(name.clone(), Value::from(row.vector.clone()));
            } else if let Some(value) = row.fields.get(name) {
                fields.insert(name.clone(), value.clone());
            }
        }
        QueryRecord { pk: row.pk, fields }
    }
}

fn rank(metric: DistanceMetric, a: &SearchHit, b: &SearchHit) -> Ordering {
    let by_score = if metric.higher_is_better() {
        b.score.total_cmp(&a.score)
    } else {
        a.score.total_cmp(&b.score)
    };
    by_score.then(a.pk.cmp(&b.pk))
}

#[async_trait]
impl ExecutionEngine for ScanEngine {
    async fn query(&self, ctx: &QueryContext, request: &QueryRequest) -> CoreResult<QueryResponse> {
        let visible = visible_rows(&self.store, &ctx.segments, request.travel_ts).await?;
        let mut records: Vec<QueryRecord> = visible
            .rows
            .iter()
            .filter(|row| request.expr.matches(row.pk))
            .map(|row| Self::record(ctx, row, &request.output_fields))
            .collect();
        records.sort_by_key(|r| r.pk);

        debug!(
            expr = %request.expr,
            segments = ctx.segments.len(),
            matched = records.len(),
            exact = visible.exact,
            "Query evaluated"
        );
        Ok(QueryResponse {
            records,
            exact: visible.exact,
        })
    }

    async fn search(
        &self,
        ctx: &QueryContext,
        request: &SearchRequest,
    ) -> CoreResult<SearchResponse> {
        Self::validate_search(ctx, request)?;

        let visible = visible_rows(&self.store, &ctx.segments, request.travel_ts).await?;
        let hits = request
            .vectors
            .iter()
            .map(|query| {
                let mut scored: Vec<SearchHit> = visible
                    .rows
                    .iter()
                    .map(|row| SearchHit {
                        pk: row.pk,
                        score: request.metric.score(query, &row.vector),
                    })
                    .collect();
                scored.sort_by(|a, b| rank(request.metric, a, b));
                scored.truncate(request.limit);
                scored
            })
            .collect();

        debug!(
            segments = ctx.segments.len(),
            candidates = visible.rows.len(),
            queries = request.vectors.len(),
            metric = %request.metric,
            "Search evaluated"
        );
        Ok(SearchResponse {
            hits,
            exact: visible.exact,
        })
    }
}
