//! Query and search over flushed and growing segments

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use silt_compaction::QuerySegmentRegistry;
use silt_core::{
    CollectionId, CollectionSchema, CoreError, DistanceMetric, IdAllocator, IndexDescriptor,
    PartitionId, Row, SegmentBucket, ShardId, Timestamp, TimestampOracle,
};
use silt_query::{
    ExecutionEngine, PkExpr, QueryContext, QueryRequest, ScanEngine, SearchRequest,
};
use silt_storage::object_store::{MockObjectStore, MockOperation};
use silt_storage::{SegmentCatalog, SegmentStore};

struct Fixture {
    store: Arc<SegmentStore>,
    oracle: Arc<TimestampOracle>,
    objects: Arc<MockObjectStore>,
    collection: CollectionId,
    schema: CollectionSchema,
}

impl Fixture {
    fn new() -> Self {
        let objects = Arc::new(MockObjectStore::new());
        let oracle = Arc::new(TimestampOracle::new());
        let store = Arc::new(SegmentStore::new(
            Arc::new(SegmentCatalog::new()),
            objects.clone(),
            Arc::new(IdAllocator::default()),
            oracle.clone(),
            1_000,
        ));
        Self {
            store,
            oracle,
            objects,
            collection: CollectionId::new(),
            schema: CollectionSchema::new("query_flow", 2),
        }
    }

    fn insert(&self, pks: std::ops::Range<i64>) {
        let rows = pks
            .map(|pk| {
                Row::new(pk, self.oracle.allocate(), vec![pk as f32, 0.0])
                    .with_field("double", json!(pk as f64 * 0.5))
            })
            .collect();
        self.store
            .append(
                self.collection,
                SegmentBucket::new(ShardId::new(0), PartitionId::new(1)),
                rows,
            )
            .unwrap();
    }

    fn context(&self, index: Option<DistanceMetric>) -> QueryContext {
        let snapshot = QuerySegmentRegistry::new(self.store.catalog().clone())
            .segments_for(self.collection);
        QueryContext {
            schema: self.schema.clone(),
            index: index.map(|metric| IndexDescriptor {
                field: self.schema.vector_field.clone(),
                metric,
            }),
            segments: snapshot.segments,
            catalog_version: snapshot.version,
        }
    }

    fn engine(&self) -> ScanEngine {
        ScanEngine::new(self.store.clone())
    }
}

#[tokio::test]
async fn test_query_returns_output_fields() {
    let f = Fixture::new();
    f.insert(0..10);
    f.store.flush_collection(f.collection).await.unwrap();
    f.insert(10..20);

    let request = QueryRequest {
        expr: PkExpr::parse("int64 in [3, 15, 42]", "int64").unwrap(),
        output_fields: vec!["double".to_string()],
        travel_ts: Timestamp::MAX,
    };
    let response = f.engine().query(&f.context(None), &request).await.unwrap();

    assert!(response.exact);
    let pks: Vec<i64> = response.records.iter().map(|r| r.pk).collect();
    assert_eq!(pks, vec![3, 15]);
    assert_eq!(response.records[0].fields["int64"], json!(3));
    assert_eq!(response.records[0].fields["double"], json!(1.5));
    assert!(!response.records[0].fields.contains_key("float_vector"));
}

#[tokio::test]
async fn test_query_respects_travel_timestamp_and_deletes() {
    let f = Fixture::new();
    f.insert(0..10);
    f.store.flush_collection(f.collection).await.unwrap();
    let before_delete = f.oracle.allocate();
    let ts = f.oracle.allocate();
    f.store
        .catalog()
        .apply_delete(f.collection, |pk| pk < 5, ts);

    let expr = PkExpr::parse("int64 >= 0", "int64").unwrap();
    let now = QueryRequest {
        expr: expr.clone(),
        output_fields: vec![],
        travel_ts: Timestamp::MAX,
    };
    let then = QueryRequest {
        expr,
        output_fields: vec![],
        travel_ts: before_delete,
    };
    let ctx = f.context(None);
    assert_eq!(f.engine().query(&ctx, &now).await.unwrap().records.len(), 5);
    assert_eq!(f.engine().query(&ctx, &then).await.unwrap().records.len(), 10);
}

#[tokio::test]
async fn test_search_ranks_by_metric() {
    let f = Fixture::new();
    f.insert(0..10);
    f.store.flush_collection(f.collection).await.unwrap();

    let l2 = SearchRequest {
        vectors: vec![vec![4.2, 0.0]],
        metric: DistanceMetric::L2,
        limit: 3,
        travel_ts: Timestamp::MAX,
    };
    let response = f.engine().search(&f.context(None), &l2).await.unwrap();
    let pks: Vec<i64> = response.hits[0].iter().map(|h| h.pk).collect();
    assert_eq!(pks, vec![4, 5, 3]);

    let ip = SearchRequest {
        metric: DistanceMetric::Ip,
        vectors: vec![vec![1.0, 0.0]],
        ..l2
    };
    let response = f
        .engine()
        .search(&f.context(Some(DistanceMetric::Ip)), &ip)
        .await
        .unwrap();
    let pks: Vec<i64> = response.hits[0].iter().map(|h| h.pk).collect();
    assert_eq!(pks, vec![9, 8, 7]);
}

#[tokio::test]
async fn test_metric_mismatch_rejected_before_reads() {
    let f = Fixture::new();
    f.insert(0..10);
    f.store.flush_collection(f.collection).await.unwrap();
    let ctx = f.context(Some(DistanceMetric::L2));
    f.objects.clear_history();

    let request = SearchRequest {
        vectors: vec![vec![0.0, 0.0]],
        metric: DistanceMetric::Ip,
        limit: 1,
        travel_ts: Timestamp::MAX,
    };
    let err = f.engine().search(&ctx, &request).await.unwrap_err();
    match err {
        CoreError::ValidationError(message) => {
            assert!(message.contains("L2"));
            assert!(message.contains("IP"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(f.objects.successful_calls(MockOperation::Get), 0);
}

#[tokio::test]
async fn test_search_rejects_bad_limit_and_dimension() {
    let f = Fixture::new();
    let ctx = f.context(None);
    let mut request = SearchRequest {
        vectors: vec![vec![0.0, 0.0]],
        metric: DistanceMetric::L2,
        limit: 0,
        travel_ts: Timestamp::MAX,
    };
    assert!(f.engine().search(&ctx, &request).await.is_err());

    request.limit = 1;
    request.vectors = vec![vec![0.0; 3]];
    assert!(f.engine().search(&ctx, &request).await.is_err());
}

proptest! {
    #[test]
    fn prop_in_list_matches_membership(
        keys in prop::collection::vec(-1_000i64..1_000, 0..20),
        probe in -1_000i64..1_000,
    ) {
        let list: Vec<String> = keys.iter().map(i64::to_string).collect();
        let expr = PkExpr::parse(&format!("int64 in [{}]", list.join(", ")), "int64").unwrap();
        prop_assert_eq!(expr.matches(probe), keys.contains(&probe));
    }
}
