//! End-to-end engine behavior: DDL, ingest, search, deletion, compaction,
//! cache limits and the stop/start lifecycle.

use sango_engine::{Engine, EngineConfig, Error, IndexKind, Metric, SENTINEL_ID};
use std::path::Path;
use std::time::Duration;

/// Config with background ticks parked out of the way so tests drive every
/// transition explicitly.
fn quiet_config(root: &Path) -> EngineConfig {
    EngineConfig {
        flush_interval: Duration::from_secs(3600),
        merge_interval: Duration::from_secs(3600),
        index_interval: Duration::from_secs(3600),
        cache_metrics_interval: Duration::from_secs(3600),
        gc_interval: Duration::from_secs(3600),
        gc_quiescence: Duration::ZERO,
        ..EngineConfig::new(root)
    }
}

async fn open_engine(root: &Path) -> Engine {
    Engine::open(quiet_config(root)).await.unwrap()
}

fn no_params() -> serde_json::Value {
    serde_json::Value::Null
}

#[tokio::test]
async fn test_create_insert_search_flat() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t1", 4, Metric::L2, 64 << 20).await.unwrap();
    engine
        .insert_vectors(
            "t1",
            "",
            Some(vec![10, 11, 12]),
            vec![
                0.0, 0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0,
            ],
        )
        .await
        .unwrap();
    engine.flush(None).await.unwrap();
    engine
        .create_index("t1", IndexKind::Flat, no_params())
        .await
        .unwrap();

    let result = engine
        .query("t1", &[], 2, &no_params(), vec![0.0, 0.0, 0.0, 0.0])
        .await
        .unwrap();
    assert_eq!(result.ids[0], 10);
    assert_eq!(result.distances[0], 0.0);
    // 11 and 12 tie at distance 1; the lower id wins deterministically.
    assert_eq!(result.ids[1], 11);
    assert_eq!(result.distances[1], 1.0);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_partition_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t2", 4, Metric::L2, 64 << 20).await.unwrap();
    engine.create_partition("t2", "t2.a", "a").await.unwrap();
    engine.create_partition("t2", "t2.b", "b").await.unwrap();

    let ids_a: Vec<i64> = (0..100).collect();
    let vectors_a: Vec<f32> = (0..100).flat_map(|i| [i as f32, 0.0, 0.0, 0.0]).collect();
    engine
        .insert_vectors("t2", "a", Some(ids_a.clone()), vectors_a)
        .await
        .unwrap();

    let ids_b: Vec<i64> = (1000..1100).collect();
    let vectors_b: Vec<f32> = (0..100).flat_map(|i| [i as f32, 100.0, 0.0, 0.0]).collect();
    engine
        .insert_vectors("t2", "b", Some(ids_b.clone()), vectors_b)
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    // Restricted to "a", every hit comes from a's ids.
    let result = engine
        .query(
            "t2",
            &["a".to_string()],
            5,
            &no_params(),
            vec![0.0, 0.0, 0.0, 0.0],
        )
        .await
        .unwrap();
    for id in &result.ids {
        assert!(ids_a.contains(id), "hit {id} not from partition a");
    }

    // A regex spanning both tags sees both id ranges.
    let result = engine
        .query(
            "t2",
            &["\\w".to_string()],
            200,
            &no_params(),
            vec![0.0, 0.0, 0.0, 0.0],
        )
        .await
        .unwrap();
    let hits: Vec<i64> = result.ids.iter().copied().filter(|&id| id >= 0).collect();
    assert!(hits.iter().any(|id| ids_a.contains(id)));
    assert!(hits.iter().any(|id| ids_b.contains(id)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_ids() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t3", 4, Metric::L2, 64 << 20).await.unwrap();
    let vectors: Vec<f32> = (0..20).flat_map(|i| [i as f32, 0.0, 0.0, 0.0]).collect();
    engine
        .insert_vectors("t3", "", Some(vec![0; 20]), vectors)
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    assert_eq!(engine.get_table_row_count("t3").unwrap(), 20);

    // One of the 20 rows, which one is unspecified.
    let vector = engine.get_vector_by_id("t3", 0).await.unwrap().unwrap();
    assert_eq!(vector.len(), 4);
    assert!(vector[0] >= 0.0 && vector[0] < 20.0);

    let result = engine
        .query("t3", &[], 20, &no_params(), vec![0.0, 0.0, 0.0, 0.0])
        .await
        .unwrap();
    assert_eq!(result.ids, vec![0; 20]);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_delete_then_compact_reclaims_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t4", 8, Metric::L2, 64 << 20).await.unwrap();
    let ids: Vec<i64> = (0..1000).collect();
    let vectors: Vec<f32> = (0..1000)
        .flat_map(|i| (0..8).map(move |d| (i * 8 + d) as f32))
        .collect();
    engine
        .insert_vectors("t4", "", Some(ids), vectors)
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    let doomed: Vec<i64> = (0..500).collect();
    engine.delete_vectors("t4", &doomed).await.unwrap();
    assert_eq!(engine.get_table_row_count("t4").unwrap(), 500);

    engine.compact("t4").await.unwrap();
    assert_eq!(engine.get_table_row_count("t4").unwrap(), 500);

    let info = engine.get_table_info("t4").unwrap();
    assert_eq!(info.segments.len(), 1);
    let merged = &info.segments[0];
    assert_eq!(merged.row_count, 500);
    assert_eq!(merged.deleted_count, 0);
    // Within 10% of what a fresh 500-row segment occupies.
    let fresh = 500 * (8 * 4 + 8) as u64;
    assert!(
        (merged.size_bytes as f64) <= fresh as f64 * 1.1 + 1024.0,
        "merged segment is {} bytes, fresh would be {fresh}",
        merged.size_bytes
    );

    // Deleted ids stay gone.
    let result = engine
        .query("t4", &[], 10, &no_params(), (0..8).map(|d| d as f32).collect())
        .await
        .unwrap();
    for id in result.ids.iter().filter(|&&id| id != SENTINEL_ID) {
        assert!(*id >= 500);
    }

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_cache_exhaustion_preload_vs_query() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        cache_capacity: 1 << 20, // 1 MiB
        ..quiet_config(dir.path())
    };
    let engine = Engine::open(config).await.unwrap();

    engine.create_table("big", 128, Metric::L2, 256 << 20).await.unwrap();
    // Four ~2.6 MiB segments: every one alone exceeds the cache.
    for batch in 0..4 {
        let ids: Vec<i64> = (batch * 5000..(batch + 1) * 5000).collect();
        let vectors = vec![batch as f32; 5000 * 128];
        engine
            .insert_vectors("big", "", Some(ids), vectors)
            .await
            .unwrap();
        engine.flush(None).await.unwrap();
    }

    let err = engine.preload_table("big").await.unwrap_err();
    assert!(matches!(err, Error::Capacity(_)));
    assert_eq!(err.exit_code(), 4);

    // Queries still work: oversized segments stream through the cache.
    let result = engine
        .query("big", &[], 5, &no_params(), vec![2.0; 128])
        .await
        .unwrap();
    assert_eq!(result.ids.len(), 5);
    assert!(result.ids.iter().all(|&id| (10000..15000).contains(&id)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_buffer_cap_triggers_flush_without_explicit_call() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    // index_file_size of 1 KiB: a 100-row batch blows straight through it.
    engine.create_table("t5", 4, Metric::L2, 1024).await.unwrap();
    let ids: Vec<i64> = (0..100).collect();
    let vectors: Vec<f32> = vec![0.5; 400];
    engine
        .insert_vectors("t5", "", Some(ids), vectors)
        .await
        .unwrap();

    // Visible without an explicit Flush because the cap fired.
    assert_eq!(engine.get_table_row_count("t5").unwrap(), 100);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_unflushed_rows_not_visible() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t6", 4, Metric::L2, 64 << 20).await.unwrap();
    engine
        .insert_vectors("t6", "", Some(vec![1]), vec![0.0; 4])
        .await
        .unwrap();

    // Buffered rows are not queryable; the engine does not search buffers.
    assert_eq!(engine.get_table_row_count("t6").unwrap(), 0);
    assert!(matches!(
        engine.query("t6", &[], 1, &no_params(), vec![0.0; 4]).await,
        Err(Error::NoData)
    ));

    engine.flush(Some(&["t6".to_string()])).await.unwrap();
    assert_eq!(engine.get_table_row_count("t6").unwrap(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_ivf_index_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t7", 4, Metric::L2, 64 << 20).await.unwrap();
    let ids: Vec<i64> = (0..200).collect();
    let vectors: Vec<f32> = (0..200).flat_map(|i| [i as f32, 0.0, 0.0, 0.0]).collect();
    engine
        .insert_vectors("t7", "", Some(ids), vectors)
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    engine
        .create_index("t7", IndexKind::IvfFlat, serde_json::json!({"nlist": 4}))
        .await
        .unwrap();
    let spec = engine.describe_index("t7").unwrap().unwrap();
    assert_eq!(spec.kind, IndexKind::IvfFlat);

    let info = engine.get_table_info("t7").unwrap();
    assert!(info.segments.iter().all(|s| s.index_kind == Some(IndexKind::IvfFlat)));

    let result = engine
        .query(
            "t7",
            &[],
            1,
            &serde_json::json!({"nprobe": 4}),
            vec![42.0, 0.0, 0.0, 0.0],
        )
        .await
        .unwrap();
    assert_eq!(result.ids[0], 42);
    assert_eq!(result.distances[0], 0.0);

    // Dropping the index falls back to raw scans with identical answers.
    engine.drop_index("t7").await.unwrap();
    assert!(engine.describe_index("t7").unwrap().is_none());
    let result = engine
        .query("t7", &[], 1, &no_params(), vec![42.0, 0.0, 0.0, 0.0])
        .await
        .unwrap();
    assert_eq!(result.ids[0], 42);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_ivf_sq8_queries_after_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t8", 8, Metric::L2, 64 << 20).await.unwrap();
    let ids: Vec<i64> = (0..100).collect();
    let vectors: Vec<f32> = (0..100)
        .flat_map(|i| (0..8).map(move |d| i as f32 + d as f32 * 0.1))
        .collect();
    engine
        .insert_vectors("t8", "", Some(ids), vectors)
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    engine
        .create_index("t8", IndexKind::IvfFlat, serde_json::json!({"nlist": 4}))
        .await
        .unwrap();
    // Changing the spec rebuilds everything under the new family.
    engine
        .create_index("t8", IndexKind::IvfSq8, serde_json::json!({"nlist": 4}))
        .await
        .unwrap();

    let info = engine.get_table_info("t8").unwrap();
    assert!(info.segments.iter().all(|s| s.index_kind == Some(IndexKind::IvfSq8)));

    let query: Vec<f32> = (0..8).map(|d| 50.0 + d as f32 * 0.1).collect();
    let result = engine
        .query("t8", &[], 1, &serde_json::json!({"nprobe": 4}), query)
        .await
        .unwrap();
    assert_eq!(result.ids[0], 50);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_query_by_segment_id() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t9", 4, Metric::L2, 64 << 20).await.unwrap();
    engine
        .insert_vectors("t9", "", Some(vec![1]), vec![1.0, 0.0, 0.0, 0.0])
        .await
        .unwrap();
    engine.flush(None).await.unwrap();
    engine
        .insert_vectors("t9", "", Some(vec![2]), vec![0.0, 1.0, 0.0, 0.0])
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    let info = engine.get_table_info("t9").unwrap();
    assert_eq!(info.segments.len(), 2);
    let first = info.segments[0].id;

    // Restricting to one segment hides the other's rows; stale extra ids
    // are silently ignored.
    let result = engine
        .query_by_segment_id("t9", &[first, 9999], 2, &no_params(), vec![0.0; 4])
        .await
        .unwrap();
    let real: Vec<i64> = result.ids.iter().copied().filter(|&id| id >= 0).collect();
    assert_eq!(real, vec![1]);

    assert!(matches!(
        engine
            .query_by_segment_id("t9", &[9999], 1, &no_params(), vec![0.0; 4])
            .await,
        Err(Error::NoSegmentsToSearch)
    ));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_get_vector_ids_lists_live_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t10", 4, Metric::L2, 64 << 20).await.unwrap();
    engine
        .insert_vectors("t10", "", Some(vec![7, 8, 9]), vec![0.25; 12])
        .await
        .unwrap();
    engine.flush(None).await.unwrap();
    engine.delete_vectors("t10", &[8]).await.unwrap();

    let info = engine.get_table_info("t10").unwrap();
    let ids = engine.get_vector_ids(info.segments[0].id).await.unwrap();
    assert_eq!(ids, vec![7, 9]);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_rejects_operations_start_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t11", 4, Metric::L2, 64 << 20).await.unwrap();
    engine
        .insert_vectors("t11", "", Some(vec![1]), vec![0.0; 4])
        .await
        .unwrap();

    engine.stop().await.unwrap();
    assert!(!engine.is_running());

    assert!(matches!(
        engine.create_table("other", 4, Metric::L2, 1024).await,
        Err(Error::EngineStopped)
    ));
    assert!(matches!(
        engine.query("t11", &[], 1, &no_params(), vec![0.0; 4]).await,
        Err(Error::EngineStopped)
    ));
    assert!(matches!(engine.describe_table("t11"), Err(Error::EngineStopped)));
    assert_eq!(Error::EngineStopped.exit_code(), 5);

    // Stop flushed the buffered row best-effort; start recovers and serves.
    engine.start().await.unwrap();
    assert_eq!(engine.get_table_row_count("t11").unwrap(), 1);
    let result = engine
        .query("t11", &[], 1, &no_params(), vec![0.0; 4])
        .await
        .unwrap();
    assert_eq!(result.ids[0], 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_partition_ddl_errors() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t12", 4, Metric::L2, 64 << 20).await.unwrap();
    engine.create_partition("t12", "t12.p0", "x").await.unwrap();

    assert!(matches!(
        engine.create_partition("t12", "t12.p1", "x").await,
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.create_partition("missing", "p", "y").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.drop_partition_by_tag("t12", "").await,
        Err(Error::InvalidArgument(_))
    ));

    engine.drop_partition_by_tag("t12", "x").await.unwrap();
    assert_eq!(engine.show_partitions("t12").unwrap().len(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_insert_validation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t13", 4, Metric::L2, 64 << 20).await.unwrap();

    assert!(matches!(
        engine.insert_vectors("t13", "", None, vec![]).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.insert_vectors("t13", "", None, vec![0.0; 7]).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine
            .insert_vectors("t13", "", Some(vec![1, 2]), vec![0.0; 4])
            .await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.insert_vectors("t13", "nope", None, vec![0.0; 4]).await,
        Err(Error::NotFound(_))
    ));

    // Auto-assigned ids come back distinct.
    let ids = engine
        .insert_vectors("t13", "", None, vec![0.0; 12])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] != w[1]));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_inner_product_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t14", 4, Metric::Ip, 64 << 20).await.unwrap();
    engine
        .insert_vectors(
            "t14",
            "",
            Some(vec![1, 2, 3]),
            vec![
                1.0, 0.0, 0.0, 0.0, //
                3.0, 0.0, 0.0, 0.0, //
                -1.0, 0.0, 0.0, 0.0,
            ],
        )
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    let result = engine
        .query("t14", &[], 3, &no_params(), vec![1.0, 0.0, 0.0, 0.0])
        .await
        .unwrap();
    // Descending inner product.
    assert_eq!(result.ids, vec![2, 1, 3]);
    assert_eq!(result.distances, vec![3.0, 1.0, -1.0]);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_row_count_matches_live_segments() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t15", 4, Metric::L2, 64 << 20).await.unwrap();
    for batch in 0..3 {
        let ids: Vec<i64> = (batch * 10..(batch + 1) * 10).collect();
        engine
            .insert_vectors("t15", "", Some(ids), vec![batch as f32; 40])
            .await
            .unwrap();
        engine.flush(None).await.unwrap();
    }

    let info = engine.get_table_info("t15").unwrap();
    let by_segments: usize = info.segments.iter().map(|s| s.row_count - s.deleted_count).sum();
    assert_eq!(by_segments, engine.get_table_row_count("t15").unwrap());
    assert_eq!(by_segments, 30);
    assert!(engine.size().unwrap() > 0);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_drop_table_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine.create_table("t16", 4, Metric::L2, 64 << 20).await.unwrap();
    engine
        .insert_vectors("t16", "", Some(vec![1]), vec![0.0; 4])
        .await
        .unwrap();
    engine.flush(None).await.unwrap();

    let table_dir = dir.path().join("tables").join("t16");
    assert!(table_dir.exists());

    engine.drop_table("t16").await.unwrap();
    assert!(!engine.has_table("t16").unwrap());
    assert!(!table_dir.exists());
    assert!(matches!(
        engine.describe_table("t16"),
        Err(Error::NotFound(_))
    ));

    engine.stop().await.unwrap();
}
