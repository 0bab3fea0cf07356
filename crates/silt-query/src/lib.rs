pub mod context;
pub mod engine;
pub mod expr;
pub mod scan_engine;

pub use context::{
    QueryContext, QueryRecord, QueryRequest, QueryResponse, SearchHit, SearchRequest,
    SearchResponse,
};
pub use engine::ExecutionEngine;
pub use expr::{CompareOp, PkExpr};
pub use scan_engine::ScanEngine;
