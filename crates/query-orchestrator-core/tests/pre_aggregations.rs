// crates/query-orchestrator-core/tests/pre_aggregations.rs
// ============================================================================
// Module: Pre-Aggregation Engine Tests
// Description: Exercises table builds, reuse, partitions, and cleanup.
// ============================================================================
//! ## Overview
//! Loads pre-aggregations through [`PreAggregations`] against scripted
//! source and external drivers.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    clippy::missing_docs_in_private_items,
    reason = "Test-only output and panic-based assertions are permitted."
)]

mod support;

use std::time::Duration;

use query_orchestrator_core::DriverCapabilities;
use query_orchestrator_core::OrchestratorOptions;
use query_orchestrator_core::PreAggregationDescription;
use query_orchestrator_core::PreAggregationError;
use query_orchestrator_core::PreAggregationsOptions;
use query_orchestrator_core::QueryCacheOptions;
use query_orchestrator_core::QueryDescriptor;
use query_orchestrator_core::QueryKey;
use query_orchestrator_core::QueueError;
use query_orchestrator_core::StreamOffset;
use query_orchestrator_core::tables_to_version_entries;
use serde_json::json;
use support::MockDriver;
use support::description;
use support::harness;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

const TABLE: &str = "stb.orders_main";
const LOAD_SQL: &str = "CREATE TABLE stb.orders_main AS SELECT status, count(*) FROM orders GROUP BY 1";
const KEY_SQL: &str = "SELECT max(updated_at) FROM orders";

fn descriptor(pre_aggregations: Vec<PreAggregationDescription>) -> QueryDescriptor {
    QueryDescriptor::pre_aggregations_only(pre_aggregations)
}

fn external_refresh() -> OrchestratorOptions {
    OrchestratorOptions {
        pre_aggregations: PreAggregationsOptions { external_refresh: true, ..PreAggregationsOptions::default() },
        ..OrchestratorOptions::default()
    }
}

fn daily(extra: serde_json::Value) -> PreAggregationDescription {
    let mut fields = json!({
        "partition_granularity": "day",
        "build_range_start": "2024-01-01T00:00:00.000",
        "build_range_end": "2024-01-03T23:59:59.999",
    });
    if let (Some(fields), Some(extra)) = (fields.as_object_mut(), extra.as_object()) {
        fields.extend(extra.clone());
    }
    description(
        "stb.orders_daily",
        "CREATE TABLE stb.orders_daily AS SELECT * FROM orders WHERE ts >= ? AND ts <= ?",
        fields,
    )
}

// ============================================================================
// SECTION: Single Tables
// ============================================================================

#[tokio::test]
async fn missing_table_is_built_from_scratch_then_reused() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let engine = h.orchestrator.pre_aggregations();
    let request = descriptor(vec![description(TABLE, LOAD_SQL, json!({}))]);

    let first = engine.load_all_pre_aggregations_if_needed(&request).await.unwrap();
    let second = engine.load_all_pre_aggregations_if_needed(&request).await.unwrap();

    assert_eq!(first.tables.len(), 1);
    assert_eq!(first.tables[0].table_name, TABLE);
    assert_eq!(second.tables[0].target_table_name, first.tables[0].target_table_name);
    let loads = source.loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].0, first.tables[0].target_table_name);
    assert!(loads[0].1.starts_with(&format!("CREATE TABLE {} AS", first.tables[0].target_table_name)));
    assert!(h.events.contains("Creating pre-aggregation from scratch"));
    assert!(h.events.contains("Executing Load Pre Aggregation SQL"));
    assert!(engine.tables_used().await.unwrap().contains(&first.tables[0].target_table_name));
    assert!(engine.tables_touched().await.unwrap().contains(&first.tables[0].target_table_name));
}

#[tokio::test]
async fn built_table_name_encodes_versions() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({}));

    let loaded =
        h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation.clone()])).await.unwrap();

    let entries = tables_to_version_entries("stb", &source.tables("stb"));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].table_name, TABLE);
    assert_eq!(entries[0].structure_version, pre_aggregation.structure_version().unwrap());
    assert_eq!(entries[0].content_version, pre_aggregation.content_version(&[]).unwrap());
    assert_eq!(entries[0].target_table_name(), loaded.tables[0].target_table_name);
}

#[tokio::test]
async fn refresh_key_change_rebuilds_when_renewal_is_requested() {
    let source = MockDriver::new();
    source.respond(KEY_SQL, json!([{ "max": 1 }]));
    let options = OrchestratorOptions {
        query_cache: QueryCacheOptions { refresh_key_renewal_threshold: Some(0), ..QueryCacheOptions::default() },
        ..OrchestratorOptions::default()
    };
    let h = harness(&source, None, options);
    let engine = h.orchestrator.pre_aggregations();
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({ "invalidate_key_queries": [{ "sql": KEY_SQL }] }));

    let first = engine.load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation.clone()])).await.unwrap();
    source.respond(KEY_SQL, json!([{ "max": 2 }]));
    let mut renew = descriptor(vec![pre_aggregation]);
    renew.renew_query = true;
    let second = engine.load_all_pre_aggregations_if_needed(&renew).await.unwrap();

    assert_ne!(first.tables[0].target_table_name, second.tables[0].target_table_name);
    assert_eq!(second.tables[0].refresh_key_values, vec![json!([{ "max": 2 }])]);
    assert_eq!(source.loads().len(), 2);
    assert!(h.events.contains("Waiting for pre-aggregation renew"));
}

#[tokio::test]
async fn structure_change_rebuilds_and_drops_stale_tables() {
    let source = MockDriver::new();
    source.add_table("stb", "orders_main_oldcontent_oldstructure_1600000000000");
    let h = harness(&source, None, OrchestratorOptions::default());

    let loaded = h
        .orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![description(TABLE, LOAD_SQL, json!({}))]))
        .await
        .unwrap();

    assert!(h.events.contains("Invalidating pre-aggregation structure"));
    assert!(h.events.contains("Dropping orphaned tables completed"));
    assert_eq!(source.dropped(), vec!["stb.orders_main_oldcontent_oldstructure_1600000000000".to_string()]);
    let remaining: Vec<String> = source.tables("stb").iter().map(|table| format!("stb.{table}")).collect();
    assert_eq!(remaining, vec![loaded.tables[0].target_table_name.clone()]);
}

#[tokio::test]
async fn force_build_rebuilds_the_last_pre_aggregation() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let engine = h.orchestrator.pre_aggregations();
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({}));
    engine.load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation.clone()])).await.unwrap();

    let mut forced = descriptor(vec![pre_aggregation]);
    forced.force_build_pre_aggregations = true;
    let result = engine.load_all_pre_aggregations_if_needed(&forced).await;

    assert!(result.is_ok());
    assert!(h.events.contains("Force build pre-aggregation"));
}

#[tokio::test]
async fn read_only_source_without_external_store_is_rejected() {
    let source = MockDriver::with_capabilities(DriverCapabilities::default(), true);
    let h = harness(&source, None, OrchestratorOptions::default());

    let result = h
        .orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![description(TABLE, LOAD_SQL, json!({}))]))
        .await;

    assert!(matches!(result, Err(PreAggregationError::Queue(QueueError::Handler(message))) if message.contains("read-only")));
    assert!(source.loads().is_empty());
}

// ============================================================================
// SECTION: External Store
// ============================================================================

#[tokio::test]
async fn external_table_is_copied_and_source_temp_table_dropped() {
    let source = MockDriver::new();
    let external = MockDriver::new();
    let h = harness(&source, Some(&external), OrchestratorOptions::default());
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({ "external": true }));

    let loaded = h
        .orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation]))
        .await
        .unwrap();

    let target = loaded.tables[0].target_table_name.clone();
    let uploads = external.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, target);
    assert_eq!(uploads[0].1, vec![support::column("id", "int")]);
    assert_eq!(source.loads()[0].0, target);
    assert!(source.dropped().contains(&target));
    assert!(source.tables("stb").is_empty());
    assert_eq!(external.tables("stb").len(), 1);
    assert!(h.events.contains("Downloading external pre-aggregation"));
    assert!(h.events.contains("Uploading external pre-aggregation completed"));
    assert!(h.events.contains("Dropping source temp table"));
}

#[tokio::test]
async fn stream_offset_is_passed_to_the_source_download() {
    let source = MockDriver::new();
    let external = MockDriver::new();
    let h = harness(&source, Some(&external), OrchestratorOptions::default());
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({ "external": true, "stream_offset": "earliest" }));

    h.orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation]))
        .await
        .unwrap();

    assert_eq!(source.download_offsets(), vec![Some(StreamOffset::Earliest)]);
}

#[tokio::test]
async fn read_only_source_downloads_query_results_into_external_store() {
    let source = MockDriver::with_capabilities(DriverCapabilities::default(), true);
    source.respond(LOAD_SQL, json!([{ "status": "new", "count": 3 }]));
    let external = MockDriver::new();
    let h = harness(&source, Some(&external), OrchestratorOptions::default());
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({ "external": true }));

    h.orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation]))
        .await
        .unwrap();

    assert!(source.loads().is_empty());
    assert_eq!(source.executed_count(LOAD_SQL), 1);
    let uploads = external.uploads();
    assert_eq!(uploads.len(), 1);
    let mut names: Vec<&str> = uploads[0].1.iter().map(|column| column.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["count", "status"]);
    assert!(h.events.contains("Downloading external pre-aggregation via query"));
}

#[tokio::test]
async fn external_pre_aggregation_requires_external_driver() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({ "external": true }));

    let result =
        h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation])).await;

    assert!(matches!(result, Err(PreAggregationError::InvalidConfiguration(_))));
}

// ============================================================================
// SECTION: External Refresh
// ============================================================================

#[tokio::test]
async fn external_refresh_never_builds_missing_tables() {
    let source = MockDriver::new();
    let h = harness(&source, None, external_refresh());

    let result = h
        .orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![description(TABLE, LOAD_SQL, json!({}))]))
        .await;

    assert!(matches!(&result, Err(PreAggregationError::NotBuilt(message)) if message.contains("stb.orders_main_*_")));
    assert!(source.loads().is_empty());
}

#[tokio::test]
async fn external_refresh_serves_tables_built_elsewhere() {
    let source = MockDriver::new();
    let pre_aggregation = description(TABLE, LOAD_SQL, json!({}));
    let structure = pre_aggregation.structure_version().unwrap();
    source.add_table("stb", &format!("orders_main_abcdefgh_{structure}_1700000000000"));
    let h = harness(&source, None, external_refresh());

    let loaded = h
        .orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation]))
        .await
        .unwrap();

    assert_eq!(loaded.tables[0].target_table_name, format!("stb.orders_main_abcdefgh_{structure}_1700000000000"));
    assert_eq!(loaded.tables[0].last_updated_at, 1_700_000_000_000);
    assert!(source.loads().is_empty());
}

#[tokio::test]
async fn renewal_is_rejected_in_external_refresh_mode() {
    let source = MockDriver::new();
    let h = harness(&source, None, external_refresh());
    let mut request = descriptor(vec![description(TABLE, LOAD_SQL, json!({}))]);
    request.renew_query = true;

    let result = h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&request).await;

    assert!(matches!(result, Err(PreAggregationError::InvalidConfiguration(message)) if message.contains("externalRefresh")));
    assert!(source.executed().is_empty());
}

// ============================================================================
// SECTION: Partitions
// ============================================================================

#[tokio::test]
async fn partitions_load_into_a_union_in_range_order() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let engine = h.orchestrator.pre_aggregations();

    let loaded = engine.load_all_pre_aggregations_if_needed(&descriptor(vec![daily(json!({}))])).await.unwrap();

    let target = &loaded.tables[0].target_table_name;
    assert_eq!(loaded.tables[0].table_name, "stb.orders_daily");
    assert!(target.starts_with("(SELECT * FROM stb.orders_daily20240101_"));
    assert_eq!(target.matches(" UNION ALL ").count(), 2);
    let day2 = target.find("orders_daily20240102_").unwrap();
    let day3 = target.find("orders_daily20240103_").unwrap();
    assert!(day2 < day3);
    assert_eq!(source.loads().len(), 3);
    assert_eq!(loaded.tables[0].build_range_end.as_deref(), Some("2024-01-03T23:59:59.999"));
    let used = engine.tables_used().await.unwrap();
    assert_eq!(used.iter().filter(|table| table.starts_with("stb.orders_daily2024")).count(), 3);
    assert!(!used.iter().any(|table| table.starts_with('(')));
}

#[tokio::test]
async fn matched_range_narrows_partitions_to_one_table() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let pre_aggregation = daily(json!({
        "matched_time_dimension_date_range": ["2024-01-02T00:00:00.000", "2024-01-02T23:59:59.999"],
    }));

    let loaded = h
        .orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation]))
        .await
        .unwrap();

    assert!(loaded.tables[0].target_table_name.starts_with("stb.orders_daily20240102_"));
    assert_eq!(source.loads().len(), 1);
}

#[tokio::test]
async fn partition_limit_is_enforced() {
    let source = MockDriver::new();
    let options = OrchestratorOptions {
        pre_aggregations: PreAggregationsOptions { max_partitions: 2, ..PreAggregationsOptions::default() },
        ..OrchestratorOptions::default()
    };
    let h = harness(&source, None, options);

    let result =
        h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&descriptor(vec![daily(json!({}))])).await;

    assert!(matches!(
        result,
        Err(PreAggregationError::PartitionCountExceeded { requested: 3, limit: 2, .. })
    ));
    assert!(source.loads().is_empty());
}

#[tokio::test]
async fn partition_limit_fails_fast_for_second_buckets() {
    let source = MockDriver::new();
    let options = OrchestratorOptions {
        pre_aggregations: PreAggregationsOptions { max_partitions: 100, ..PreAggregationsOptions::default() },
        ..OrchestratorOptions::default()
    };
    let h = harness(&source, None, options);
    let per_second = daily(json!({
        "partition_granularity": "second",
        "build_range_start": "2024-01-01T00:00:00.000",
        "build_range_end": "2024-01-31T23:59:59.999",
    }));

    let started = std::time::Instant::now();
    let result = h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&descriptor(vec![per_second])).await;

    assert!(matches!(
        result,
        Err(PreAggregationError::PartitionCountExceeded { requested: 2_678_400, limit: 100, .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(source.loads().is_empty());
}

#[tokio::test]
async fn hourly_partitions_use_hour_suffixes() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let hourly = daily(json!({
        "partition_granularity": "hour",
        "build_range_start": "2024-01-01T22:00:00.000",
        "build_range_end": "2024-01-02T00:59:59.999",
    }));

    let loaded =
        h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&descriptor(vec![hourly])).await.unwrap();

    let loads = source.loads();
    assert_eq!(loads.len(), 3);
    let mut targets: Vec<&str> = loads.iter().map(|(target, _)| target.as_str()).collect();
    targets.sort_unstable();
    assert!(targets[0].starts_with("stb.orders_daily2024010122_"));
    assert!(targets[1].starts_with("stb.orders_daily2024010123_"));
    assert!(targets[2].starts_with("stb.orders_daily2024010200_"));
    assert_eq!(loaded.tables[0].build_range_end.as_deref(), Some("2024-01-02T00:59:59.999"));
}

#[tokio::test]
async fn external_partitions_upload_with_their_seal_instant() {
    let source = MockDriver::new();
    let external = MockDriver::new();
    let h = harness(&source, Some(&external), OrchestratorOptions::default());
    let pre_aggregation = daily(json!({ "external": true, "update_window_seconds": 3_600 }));

    h.orchestrator
        .pre_aggregations()
        .load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation]))
        .await
        .unwrap();

    let mut seals = external.upload_seals();
    seals.sort_unstable();
    assert_eq!(
        seals,
        vec![
            Some("2024-01-02T00:59:59.999Z".to_string()),
            Some("2024-01-03T00:59:59.999Z".to_string()),
            Some("2024-01-04T00:59:59.999Z".to_string()),
        ]
    );
}

#[tokio::test]
async fn sealed_partitions_skip_refresh_keys_on_renewal() {
    let source = MockDriver::new();
    source.respond(KEY_SQL, json!([{ "max": 1 }]));
    let options = OrchestratorOptions {
        query_cache: QueryCacheOptions { refresh_key_renewal_threshold: Some(0), ..QueryCacheOptions::default() },
        ..OrchestratorOptions::default()
    };
    let h = harness(&source, None, options);
    let engine = h.orchestrator.pre_aggregations();
    let pre_aggregation = daily(json!({
        "update_window_seconds": 0,
        "invalidate_key_queries": [{ "sql": KEY_SQL }],
    }));

    let first = engine.load_all_pre_aggregations_if_needed(&descriptor(vec![pre_aggregation.clone()])).await.unwrap();
    let key_runs = source.executed_count(KEY_SQL);
    source.respond(KEY_SQL, json!([{ "max": 2 }]));
    let mut renew = descriptor(vec![pre_aggregation]);
    renew.renew_query = true;
    let second = engine.load_all_pre_aggregations_if_needed(&renew).await.unwrap();

    assert_eq!(second.tables[0].target_table_name, first.tables[0].target_table_name);
    assert_eq!(source.loads().len(), 3);
    assert_eq!(source.executed_count(KEY_SQL), key_runs);
    assert!(h.events.contains("Using sealed pre-aggregation partition"));
}

#[tokio::test]
async fn expansion_lists_partitions_without_building() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());

    let expanded = h
        .orchestrator
        .pre_aggregations()
        .expand_partitions_in_pre_aggregations(&descriptor(vec![daily(json!({}))]))
        .await
        .unwrap();

    let names: Vec<&str> = expanded.descriptor.pre_aggregations.iter().map(|p| p.table_name.as_str()).collect();
    assert_eq!(names, vec!["stb.orders_daily20240101", "stb.orders_daily20240102", "stb.orders_daily20240103"]);
    assert!(expanded.descriptor.pre_aggregations.iter().all(|p| p.expanded_partition));
    assert_eq!(expanded.grouped.len(), 1);
    assert_eq!(expanded.descriptor.pre_aggregations[1].build_range_start.as_deref(), Some("2024-01-02T00:00:00.000"));
    assert!(source.loads().is_empty());
}

#[tokio::test]
async fn build_range_queries_are_cached_after_first_load() {
    let source = MockDriver::new();
    source.respond("SELECT min(ts) FROM orders", json!([{ "min": "2024-01-01T05:00:00.000Z" }]));
    source.respond("SELECT max(ts) FROM orders", json!([{ "max": "2024-01-02T10:00:00.000Z" }]));
    let h = harness(&source, None, OrchestratorOptions::default());
    let pre_aggregation = daily(json!({
        "build_range_start": null,
        "build_range_end": null,
        "pre_aggregation_start_end_queries": [{ "sql": "SELECT min(ts) FROM orders" }, { "sql": "SELECT max(ts) FROM orders" }],
    }));
    let request = descriptor(vec![pre_aggregation]);
    let engine = h.orchestrator.pre_aggregations();

    let before = engine.check_partitions_build_range_cache(&request).await.unwrap();
    assert!(!before[0].is_cached);

    let loaded = engine.load_all_pre_aggregations_if_needed(&request).await.unwrap();
    let after = engine.check_partitions_build_range_cache(&request).await.unwrap();

    assert!(after[0].is_cached);
    assert_eq!(loaded.tables[0].target_table_name.matches(" UNION ALL ").count(), 1);
    assert!(loaded.tables[0].build_range_end.as_deref().is_some_and(|end| end.starts_with("2024-01-02")));
}

#[tokio::test]
async fn external_refresh_reports_expected_partition_names() {
    let source = MockDriver::new();
    let h = harness(&source, None, external_refresh());

    let result =
        h.orchestrator.pre_aggregations().load_all_pre_aggregations_if_needed(&descriptor(vec![daily(json!({}))])).await;

    let Err(PreAggregationError::NotBuilt(message)) = result else {
        panic!("expected a not-built error");
    };
    assert!(message.contains("stb.orders_daily20240103_*_"));
}

// ============================================================================
// SECTION: Queue Introspection
// ============================================================================

#[tokio::test]
async fn build_queue_state_is_empty_once_builds_finish() {
    let source = MockDriver::new();
    let h = harness(&source, None, OrchestratorOptions::default());
    let engine = h.orchestrator.pre_aggregations();

    engine.load_all_pre_aggregations_if_needed(&descriptor(vec![description(TABLE, LOAD_SQL, json!({}))])).await.unwrap();

    assert!(engine.get_queue_state("default").await.unwrap().is_empty());
    let key = QueryKey::new(json!(["missing"]));
    assert_eq!(engine.cancel_queries_from_queue(&[key], "default").await.unwrap(), vec![None]);
}
