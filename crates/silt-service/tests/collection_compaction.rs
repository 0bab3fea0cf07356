//! End-to-end compaction through the client-facing collection API
//!
//! Each test drives a `SiltServer` the way a client would: connect, create a
//! collection, insert and flush, then compact and check what readers see.

use std::time::Duration;

use serde_json::json;

use silt_core::{
    CollectionSchema, CompactionKind, CompactionTrigger, CoreError, DistanceMetric, GroupState,
    PlanState, SegmentState, SiltConfig,
};
use silt_service::{Collection, Entity, SiltServer, DEFAULT_ALIAS};

const WAIT: Duration = Duration::from_secs(10);
const DIM: u32 = 8;

fn config(retention_secs: u64) -> SiltConfig {
    let mut config = SiltConfig::default();
    config.compaction.enable_auto = false;
    config.retention.retention_duration_secs = retention_secs;
    config
}

fn entities(pks: std::ops::Range<i64>) -> Vec<Entity> {
    pks.map(|pk| {
        let mut vector = vec![0.0; DIM as usize];
        vector[0] = pk as f32;
        Entity::new(pk, vector)
            .with_field("double", json!(pk as f64))
            .with_field("varchar", json!(pk.to_string()))
    })
    .collect()
}

fn setup(config: SiltConfig, shards: u32) -> (SiltServer, Collection) {
    let server = SiltServer::new(config).unwrap();
    server.connect(DEFAULT_ALIAS).unwrap();
    let collection = server
        .create_collection(
            DEFAULT_ALIAS,
            CollectionSchema::new("compaction", DIM).with_shards(shards),
        )
        .unwrap();
    (server, collection)
}

async fn insert_segment(collection: &Collection, pks: std::ops::Range<i64>) {
    collection.insert(entities(pks), None).await.unwrap();
    collection.flush().await.unwrap();
}

async fn compact_and_wait(collection: &Collection) {
    collection.compact().unwrap();
    let summary = collection
        .wait_for_compaction_completed(Some(WAIT))
        .await
        .unwrap();
    assert_eq!(summary.state, GroupState::Completed);
}

async fn query_pks(collection: &Collection, expr: &str) -> Vec<i64> {
    collection
        .query(expr, &[], None)
        .await
        .unwrap()
        .records
        .iter()
        .map(|r| r.pk)
        .collect()
}

#[tokio::test]
async fn test_compact_merge_two_segments() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..100).await;
    insert_segment(&collection, 100..200).await;

    compact_and_wait(&collection).await;
    let plans = collection.get_compaction_plans().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan.kind, CompactionKind::Merge);
    assert_eq!(plans[0].plan.sources.len(), 2);
    assert_eq!(plans[0].state, PlanState::Completed);

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].segment_id, plans[0].plan.target);
    assert_eq!(infos[0].num_rows, 200);
    assert_eq!(collection.num_entities().await.unwrap(), 200);
}

#[tokio::test]
async fn test_compact_twice_reuses_previous_target() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..10).await;
    insert_segment(&collection, 10..20).await;
    compact_and_wait(&collection).await;
    let first_target = collection.get_compaction_plans().unwrap()[0].plan.target;

    insert_segment(&collection, 20..30).await;
    compact_and_wait(&collection).await;
    let plans = collection.get_compaction_plans().unwrap();
    assert_eq!(plans.len(), 1);
    assert!(plans[0].plan.sources.contains(&first_target));

    collection.load().unwrap();
    assert_eq!(collection.get_query_segment_info().unwrap().len(), 1);
    assert_eq!(query_pks(&collection, "int64 in [0, 15, 29]").await, vec![0, 15, 29]);
}

#[tokio::test]
async fn test_compact_no_merge_single_segment() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..100).await;

    compact_and_wait(&collection).await;
    assert!(collection.get_compaction_plans().unwrap().is_empty());

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].state, SegmentState::Flushed);
}

#[tokio::test]
async fn test_compact_empty_collection() {
    let (_server, collection) = setup(config(3600), 2);

    compact_and_wait(&collection).await;
    assert!(collection.get_compaction_plans().unwrap().is_empty());
    assert_eq!(collection.num_entities().await.unwrap(), 0);
}

#[tokio::test]
async fn test_compact_only_growing_segment() {
    let (_server, collection) = setup(config(3600), 1);
    collection.insert(entities(0..50), None).await.unwrap();

    compact_and_wait(&collection).await;
    assert!(collection.get_compaction_plans().unwrap().is_empty());

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].state, SegmentState::Growing);
    assert_eq!(query_pks(&collection, "int64 < 3").await, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_compact_does_not_cross_partitions() {
    let (_server, collection) = setup(config(3600), 1);
    collection.create_partition("p1").unwrap();
    collection.insert(entities(0..10), None).await.unwrap();
    collection.insert(entities(10..20), Some("p1")).await.unwrap();
    collection.flush().await.unwrap();

    compact_and_wait(&collection).await;
    assert!(collection.get_compaction_plans().unwrap().is_empty());

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 2);
    assert_ne!(infos[0].partition_id, infos[1].partition_id);
    assert_eq!(collection.partition_num_entities("p1").await.unwrap(), 10);
}

#[tokio::test]
async fn test_compact_partition_merges_within_partition() {
    let (_server, collection) = setup(config(3600), 1);
    let p1 = collection.create_partition("p1").unwrap();
    collection.insert(entities(0..10), Some("p1")).await.unwrap();
    collection.flush().await.unwrap();
    collection.insert(entities(10..20), Some("p1")).await.unwrap();
    collection.flush().await.unwrap();

    compact_and_wait(&collection).await;
    let plans = collection.get_compaction_plans().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan.bucket.partition_id, p1);
    assert_eq!(collection.partition_num_entities("p1").await.unwrap(), 20);
}

#[tokio::test]
async fn test_compact_does_not_cross_shards() {
    let (_server, collection) = setup(config(3600), 2);
    insert_segment(&collection, 0..100).await;

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 2);
    assert_ne!(infos[0].shard_id, infos[1].shard_id);

    compact_and_wait(&collection).await;
    assert!(collection.get_compaction_plans().unwrap().is_empty());
}

#[tokio::test]
async fn test_compact_multi_segments() {
    let (_server, collection) = setup(config(3600), 1);
    for i in 0..9 {
        insert_segment(&collection, i * 10..i * 10 + 10).await;
    }

    compact_and_wait(&collection).await;
    let plans = collection.get_compaction_plans().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan.sources.len(), 9);

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].segment_id, plans[0].plan.target);
    assert_eq!(collection.num_entities().await.unwrap(), 90);
}

#[tokio::test]
async fn test_compact_after_delete_applies_outside_retention() {
    let (_server, collection) = setup(config(0), 1);
    insert_segment(&collection, 0..100).await;
    let deleted = collection.delete("int64 in [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19]").await.unwrap();
    assert_eq!(deleted.delete_count, 20);

    compact_and_wait(&collection).await;
    let plans = collection.get_compaction_plans().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan.kind, CompactionKind::DeltaMerge);

    collection.load().unwrap();
    assert!(query_pks(&collection, "int64 < 20").await.is_empty());
    let last = collection.query("int64 in [99]", &["double", "varchar"], None).await.unwrap();
    assert_eq!(last.records.len(), 1);
    assert_eq!(last.records[0].fields["double"], json!(99.0));
    assert_eq!(last.records[0].fields["varchar"], json!("99"));
    assert_eq!(collection.get_query_segment_info().unwrap()[0].num_rows, 80);
}

#[tokio::test]
async fn test_compact_delete_ratio_below_threshold() {
    let (_server, collection) = setup(config(0), 1);
    insert_segment(&collection, 0..100).await;
    collection.delete("int64 < 10").await.unwrap();

    compact_and_wait(&collection).await;
    assert!(collection.get_compaction_plans().unwrap().is_empty());

    collection.load().unwrap();
    assert_eq!(collection.get_query_segment_info().unwrap()[0].num_rows, 100);
    assert_eq!(query_pks(&collection, "int64 < 20").await, (10..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_compact_after_delete_all() {
    let (_server, collection) = setup(config(0), 1);
    insert_segment(&collection, 0..100).await;
    let deleted = collection.delete("int64 >= 0").await.unwrap();
    assert_eq!(deleted.delete_count, 100);

    compact_and_wait(&collection).await;
    assert_eq!(collection.get_compaction_plans().unwrap().len(), 1);

    collection.load().unwrap();
    assert!(collection.get_query_segment_info().unwrap().is_empty());
    assert!(query_pks(&collection, "int64 >= 0").await.is_empty());
    assert_eq!(collection.num_entities().await.unwrap(), 0);
}

#[tokio::test]
async fn test_compact_delete_inside_time_travel() {
    let (_server, collection) = setup(config(3600), 1);
    let inserted = collection.insert(entities(0..100), None).await.unwrap();
    collection.flush().await.unwrap();
    insert_segment(&collection, 100..200).await;
    collection.delete("int64 in [0]").await.unwrap();

    compact_and_wait(&collection).await;
    collection.create_index("float_vector", DistanceMetric::L2).unwrap();
    collection.load().unwrap();

    let probe = entities(0..1).remove(0).vector;
    let now = collection
        .search(vec![probe.clone()], DistanceMetric::L2, 1, None)
        .await
        .unwrap();
    assert_ne!(now.hits[0][0].pk, 0);

    let then = collection
        .search(vec![probe], DistanceMetric::L2, 1, Some(inserted.timestamp))
        .await
        .unwrap();
    assert_eq!(then.hits[0][0].pk, 0);
    assert!(then.exact);
}

#[tokio::test]
async fn test_compact_merge_inside_time_travel() {
    let (_server, collection) = setup(config(3600), 1);
    let first = collection.insert(entities(0..100), None).await.unwrap();
    collection.flush().await.unwrap();
    let second = collection.insert(entities(100..200), None).await.unwrap();
    collection.flush().await.unwrap();

    compact_and_wait(&collection).await;
    collection.load().unwrap();

    let at_first = collection
        .query("int64 >= 0", &[], Some(first.timestamp))
        .await
        .unwrap();
    assert_eq!(at_first.records.len(), 100);
    let at_second = collection
        .query("int64 >= 0", &[], Some(second.timestamp.shifted_ms(1)))
        .await
        .unwrap();
    assert_eq!(at_second.records.len(), 200);
}

#[tokio::test]
async fn test_compact_both_delete_and_merge() {
    let (_server, collection) = setup(config(0), 1);
    insert_segment(&collection, 0..100).await;
    insert_segment(&collection, 100..200).await;
    collection.delete("int64 in [0, 100]").await.unwrap();

    compact_and_wait(&collection).await;
    let plans = collection.get_compaction_plans().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan.kind, CompactionKind::Merge);
    assert_eq!(plans[0].plan.sources.len(), 2);

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].num_rows, 198);
    assert!(query_pks(&collection, "int64 in [0, 100]").await.is_empty());
}

#[tokio::test]
async fn test_compact_and_insert() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..100).await;
    insert_segment(&collection, 100..200).await;
    compact_and_wait(&collection).await;

    insert_segment(&collection, 200..300).await;
    assert_eq!(collection.num_entities().await.unwrap(), 300);
}

#[tokio::test]
async fn test_compact_and_delete() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..100).await;
    insert_segment(&collection, 100..200).await;

    collection.compact().unwrap();
    collection.delete("int64 in [5]").await.unwrap();
    collection
        .wait_for_compaction_completed(Some(WAIT))
        .await
        .unwrap();

    collection.load().unwrap();
    assert!(query_pks(&collection, "int64 in [5]").await.is_empty());
    assert_eq!(query_pks(&collection, "int64 in [4, 6]").await, vec![4, 6]);
}

#[tokio::test]
async fn test_auto_merge_at_segment_threshold() {
    let mut config = config(3600);
    config.compaction.enable_auto = true;
    let (server, collection) = setup(config, 1);
    for i in 0..10 {
        insert_segment(&collection, i * 10..i * 10 + 10).await;
    }

    let mut handles = server
        .scheduler()
        .run_trigger_cycle(server.oracle().allocate())
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].wait(WAIT).await.unwrap(), PlanState::Completed);

    collection.load().unwrap();
    assert_eq!(collection.get_query_segment_info().unwrap().len(), 1);
}

#[tokio::test]
async fn test_auto_delete_ratio_merges_without_manual_compact() {
    let mut config = config(0);
    config.compaction.enable_auto = true;
    let (server, collection) = setup(config, 1);
    insert_segment(&collection, 0..100).await;
    collection.delete("int64 < 20").await.unwrap();
    collection.flush().await.unwrap();

    let mut handles = server
        .scheduler()
        .run_trigger_cycle(server.oracle().allocate())
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].wait(WAIT).await.unwrap(), PlanState::Completed);
    let status = server
        .scheduler()
        .tracker()
        .status(handles[0].plan_id())
        .unwrap();
    assert_eq!(status.plan.trigger, CompactionTrigger::DeleteRatio);
    assert_eq!(status.plan.kind, CompactionKind::DeltaMerge);

    collection.load().unwrap();
    let infos = collection.get_query_segment_info().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].segment_id, status.plan.target);
    assert_eq!(infos[0].num_rows, 80);
    assert!(query_pks(&collection, "int64 < 20").await.is_empty());
}

#[tokio::test]
async fn test_auto_below_threshold_does_not_merge() {
    let mut config = config(3600);
    config.compaction.enable_auto = true;
    let (server, collection) = setup(config, 1);
    for i in 0..9 {
        insert_segment(&collection, i * 10..i * 10 + 10).await;
    }

    let handles = server
        .scheduler()
        .run_trigger_cycle(server.oracle().allocate())
        .await
        .unwrap();
    assert!(handles.is_empty());

    collection.load().unwrap();
    assert_eq!(collection.get_query_segment_info().unwrap().len(), 9);
}

#[tokio::test]
async fn test_manual_and_background_compaction() {
    let mut config = config(3600);
    config.compaction.enable_auto = true;
    config.compaction.trigger_interval_ms = 50;
    let (server, collection) = setup(config, 1);
    server.start();

    for i in 0..11 {
        insert_segment(&collection, i * 10..i * 10 + 10).await;
    }
    collection.load().unwrap();

    // The worker may already be merging; a manual pass picks up the rest.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        compact_and_wait(&collection).await;
        if collection.get_query_segment_info().unwrap().len() == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "segments never merged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(collection.num_entities().await.unwrap(), 110);
    server.shutdown();
}

#[tokio::test]
async fn test_operations_without_connection_fail() {
    let (server, collection) = setup(config(3600), 1);
    server.remove_connection(DEFAULT_ALIAS);

    let err = collection.compact().unwrap_err();
    assert!(matches!(err, CoreError::NotConnected { .. }));
    assert!(err.to_string().contains("should create connect first"));
    assert!(collection.insert(entities(0..1), None).await.is_err());
    assert!(server.list_collections(DEFAULT_ALIAS).is_err());
}

#[tokio::test]
async fn test_search_metric_mismatch_after_index() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..10).await;
    collection.create_index("float_vector", DistanceMetric::L2).unwrap();
    collection.load().unwrap();

    let err = collection
        .search(vec![vec![0.0; DIM as usize]], DistanceMetric::Ip, 1, None)
        .await
        .unwrap_err();
    match err {
        CoreError::ValidationError(message) => assert!(message.contains("metric type not match")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_query_requires_load_and_recent_travel() {
    let (server, collection) = setup(config(60), 1);
    insert_segment(&collection, 0..10).await;

    assert!(matches!(
        collection.query("int64 >= 0", &[], None).await,
        Err(CoreError::InvalidState { .. })
    ));

    collection.load().unwrap();
    let stale = server.oracle().allocate().shifted_ms(-120_000);
    assert!(matches!(
        collection.query("int64 >= 0", &[], Some(stale)).await,
        Err(CoreError::ValidationError(_))
    ));
    assert!(matches!(
        collection.query("double >= 0", &[], None).await,
        Err(CoreError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_wait_without_compaction_is_an_error() {
    let (_server, collection) = setup(config(3600), 1);
    assert!(collection.get_compaction_state().is_err());
    assert!(collection.wait_for_compaction_completed(None).await.is_err());
}

#[tokio::test]
async fn test_compaction_trigger_recorded_as_manual() {
    let (_server, collection) = setup(config(3600), 1);
    insert_segment(&collection, 0..10).await;
    insert_segment(&collection, 10..20).await;
    compact_and_wait(&collection).await;

    let state = collection.get_compaction_state().unwrap();
    assert_eq!(state.completed, 1);
    assert_eq!(state.failed, 0);
    assert_eq!(
        collection.get_compaction_plans().unwrap()[0].plan.trigger,
        CompactionTrigger::Manual
    );
}
