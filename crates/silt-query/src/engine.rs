use async_trait::async_trait;

use silt_core::CoreResult;

use crate::context::{QueryContext, QueryRequest, QueryResponse, SearchRequest, SearchResponse};

/// Executes queries and searches over a resolved segment set.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn query(&self, ctx: &QueryContext, request: &QueryRequest) -> CoreResult<QueryResponse>;

    async fn search(
        &self,
        ctx: &QueryContext,
        request: &SearchRequest,
    ) -> CoreResult<SearchResponse>;
}
