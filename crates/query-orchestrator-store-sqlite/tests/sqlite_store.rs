// crates/query-orchestrator-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Store Tests
// Description: Validate SQLite queue and cache store behavior.
// Purpose: Ensure queue transitions, retention, and locks survive reopening.
// Dependencies: query-orchestrator-store-sqlite, query-orchestrator-core, rusqlite, serde_json, tempfile
// ============================================================================

//! ## Overview
//! Conformance tests for the SQLite-backed queue and cache stores. Exercises
//! activation limits, processing locks, result retention, reconcile sweeps,
//! and schema version checks against real database files.

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
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use query_orchestrator_core::BackingStore;
use query_orchestrator_core::ExecuteOptions;
use query_orchestrator_core::ExecutionResult;
use query_orchestrator_core::HandlerContext;
use query_orchestrator_core::HandlerError;
use query_orchestrator_core::HandlerType;
use query_orchestrator_core::MemoryEventSink;
use query_orchestrator_core::QueryDef;
use query_orchestrator_core::QueryHandler;
use query_orchestrator_core::QueryKey;
use query_orchestrator_core::QueryKeyHash;
use query_orchestrator_core::QueryQueue;
use query_orchestrator_core::QueueHandlers;
use query_orchestrator_core::QueueOptions;
use query_orchestrator_core::QueueSetup;
use query_orchestrator_core::QueueStore;
use query_orchestrator_core::StoreError;
use query_orchestrator_core::StoreRetention;
use query_orchestrator_core::core::queue::AddToQueueRequest;
use query_orchestrator_core::core::queue::QueryDefUpdate;
use query_orchestrator_core::core::queue::ReconcileRequest;
use query_orchestrator_core::core::time::unix_millis;
use query_orchestrator_store_sqlite::SqliteBackingStore;
use query_orchestrator_store_sqlite::SqliteStoreConfig;
use query_orchestrator_store_sqlite::SqliteStoreError;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn open(dir: &TempDir) -> SqliteBackingStore {
    open_with(dir, StoreRetention::default())
}

fn open_with(dir: &TempDir, retention: StoreRetention) -> SqliteBackingStore {
    let config = SqliteStoreConfig::new(dir.path().join("orchestrator.db"));
    SqliteBackingStore::open(&config, retention).expect("open store")
}

fn def(key: &str) -> QueryDef {
    QueryDef {
        key_hash: QueryKeyHash::new(key),
        query_key: json!(key),
        handler: HandlerType::Query,
        payload: json!({ "sql": key }),
        priority: 0,
        stage_key: None,
        request_id: None,
        added_to_queue_time: 1_000,
        start_query_time: None,
        cancel_handler: None,
        owner: None,
    }
}

fn owned_def(key: &str, owner: &str) -> QueryDef {
    QueryDef { owner: Some(owner.to_string()), ..def(key) }
}

async fn enqueue(store: &Arc<dyn QueueStore>, key: &str, score: i64) {
    let orphaned_time = unix_millis() + 60_000;
    let response = store.add_to_queue(AddToQueueRequest { score, orphaned_time, def: def(key) }).await.unwrap();
    assert!(response.added);
}

fn success(value: Value) -> ExecutionResult {
    ExecutionResult::Success { value }
}

struct EchoHandler;

#[async_trait]
impl QueryHandler for EchoHandler {
    async fn execute(&self, payload: Value, _context: HandlerContext) -> Result<Value, HandlerError> {
        Ok(json!({ "echo": payload }))
    }

    async fn cancel(&self, _def: &QueryDef) -> Result<(), HandlerError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Queue Store
// ============================================================================

#[tokio::test]
async fn duplicate_adds_keep_the_first_definition() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;

    let mut second = def("k1");
    second.added_to_queue_time = 5_000;
    let response = store
        .add_to_queue(AddToQueueRequest { score: 1, orphaned_time: unix_millis() + 60_000, def: second })
        .await
        .unwrap();

    assert!(!response.added);
    assert_eq!(response.queue_size, 1);
    assert_eq!(response.added_to_queue_time, 1_000);
}

#[tokio::test]
async fn activation_respects_concurrency_and_lock_ownership() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    enqueue(&store, "k2", 20).await;

    let first_id = store.next_processing_id().await.unwrap();
    let second_id = store.next_processing_id().await.unwrap();
    assert!(second_id > first_id);

    let first = store.retrieve_for_processing(&QueryKeyHash::new("k1"), first_id, 1).await.unwrap().unwrap();
    assert!(first.activated);
    assert_eq!(first.active_keys, vec![QueryKeyHash::new("k1")]);
    assert_eq!(first.queue_size, 1);

    let relock = store.retrieve_for_processing(&QueryKeyHash::new("k1"), second_id, 1).await.unwrap();
    assert!(relock.is_none());

    let second = store.retrieve_for_processing(&QueryKeyHash::new("k2"), second_id, 1).await.unwrap().unwrap();
    assert!(!second.activated);
    assert!(second.lock_acquired);
}

#[tokio::test]
async fn only_the_lock_holder_may_publish_results() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let key = QueryKeyHash::new("k1");
    let holder = store.next_processing_id().await.unwrap();
    let intruder = store.next_processing_id().await.unwrap();
    store.retrieve_for_processing(&key, holder, 2).await.unwrap().unwrap();

    let update = QueryDefUpdate { start_query_time: Some(2_000), cancel_handler: Some(json!({ "pid": 1 })) };
    assert!(!store.optimistic_query_update(&key, update.clone(), intruder).await.unwrap());
    assert!(store.optimistic_query_update(&key, update, holder).await.unwrap());
    let stored = store.get_query_def(&key).await.unwrap().unwrap();
    assert_eq!(stored.start_query_time, Some(2_000));
    assert_eq!(stored.cancel_handler, Some(json!({ "pid": 1 })));

    assert!(!store.set_result_and_remove_query(&key, success(json!(1)), intruder).await.unwrap());
    assert!(store.set_result_and_remove_query(&key, success(json!(2)), holder).await.unwrap());
    assert_eq!(store.get_result(&key).await.unwrap(), Some(success(json!(2))));
    assert!(store.get_query_def(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn freeing_an_activated_lock_releases_the_slot() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let key = QueryKeyHash::new("k1");
    let id = store.next_processing_id().await.unwrap();
    store.retrieve_for_processing(&key, id, 1).await.unwrap().unwrap();

    store.free_processing_lock(&key, id, true).await.unwrap();

    let state = store.get_query_stage_state().await.unwrap();
    assert!(state.active.is_empty());
    assert_eq!(state.defs.len(), 1);
    let next = store.next_processing_id().await.unwrap();
    assert!(store.retrieve_for_processing(&key, next, 1).await.unwrap().unwrap().activated);
}

#[tokio::test]
async fn stage_state_orders_pending_keys_by_score() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "late", 30).await;
    enqueue(&store, "early", 10).await;
    enqueue(&store, "tie", 10).await;

    let state = store.get_query_stage_state().await.unwrap();

    let keys: Vec<&str> = state.to_process.iter().map(QueryKeyHash::as_str).collect();
    assert_eq!(keys, vec!["early", "tie", "late"]);
    assert_eq!(state.defs.len(), 3);
}

#[tokio::test]
async fn results_expire_after_retention() {
    let dir = TempDir::new().unwrap();
    let retention =
        StoreRetention { result_ttl: Duration::from_millis(30), processing_lock_ttl: Duration::from_secs(120) };
    let backing = open_with(&dir, retention);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let key = QueryKeyHash::new("k1");
    let id = store.next_processing_id().await.unwrap();
    store.retrieve_for_processing(&key, id, 1).await.unwrap().unwrap();
    store.set_result_and_remove_query(&key, success(json!("done")), id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store.get_result(&key).await.unwrap().is_none());
    assert!(store.get_result_blocking(&key, Duration::from_millis(10)).await.unwrap().is_none());
}

#[tokio::test]
async fn result_lookup_hands_out_a_result_once() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let key = QueryKeyHash::new("k1");
    let id = store.next_processing_id().await.unwrap();
    store.retrieve_for_processing(&key, id, 1).await.unwrap().unwrap();
    store.set_result_and_remove_query(&key, success(json!("done")), id).await.unwrap();

    assert_eq!(store.get_result(&key).await.unwrap(), Some(success(json!("done"))));
    assert!(store.get_result(&key).await.unwrap().is_none());
    let blocked = store.get_result_blocking(&key, Duration::from_millis(10)).await.unwrap();
    assert_eq!(blocked, Some(success(json!("done"))));

    enqueue(&store, "k1", 20).await;
    assert!(store.get_result_blocking(&key, Duration::from_millis(10)).await.unwrap().is_none());
}

#[tokio::test]
async fn blocking_wait_wakes_on_result() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let key = QueryKeyHash::new("k1");
    let id = store.next_processing_id().await.unwrap();
    store.retrieve_for_processing(&key, id, 1).await.unwrap().unwrap();

    let waiter = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move { store.get_result_blocking(&key, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.set_result_and_remove_query(&key, success(json!(9)), id).await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), Some(success(json!(9))));
    let missing = store.get_result_blocking(&QueryKeyHash::new("absent"), Duration::from_millis(30)).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn reconcile_removes_orphans_and_dispatches_owned_keys() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    let now = unix_millis();
    store.add_to_queue(AddToQueueRequest { score: 1, orphaned_time: now - 1, def: def("gone") }).await.unwrap();
    let orphaned_time = now + 60_000;
    store
        .add_to_queue(AddToQueueRequest { score: 2, orphaned_time, def: owned_def("owned@proc-a", "proc-a") })
        .await
        .unwrap();
    store
        .add_to_queue(AddToQueueRequest { score: 3, orphaned_time, def: owned_def("foreign@proc-b", "proc-b") })
        .await
        .unwrap();
    enqueue(&store, "shared", 4).await;
    enqueue(&store, "WHERE email = 'a@b'", 5).await;

    let plan = store
        .reconcile_queue(ReconcileRequest {
            now,
            heartbeat_timeout_ms: 30_000,
            concurrency: 5,
            process_uid: "proc-a".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(plan.removed.len(), 1);
    assert_eq!(plan.removed[0].key_hash, QueryKeyHash::new("gone"));
    let dispatched: Vec<&str> = plan.to_dispatch.iter().map(QueryKeyHash::as_str).collect();
    assert_eq!(dispatched, vec!["owned@proc-a", "shared", "WHERE email = 'a@b'"]);
}

#[tokio::test]
async fn stalled_heartbeats_are_reported() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let key = QueryKeyHash::new("k1");
    let id = store.next_processing_id().await.unwrap();
    store.retrieve_for_processing(&key, id, 1).await.unwrap().unwrap();

    assert!(store.get_stalled_queries(unix_millis() - 10_000).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.get_stalled_queries(unix_millis()).await.unwrap(), vec![key.clone()]);
    store.update_heartbeat(&key).await.unwrap();
    assert!(store.get_stalled_queries(unix_millis() - 10_000).await.unwrap().is_empty());
}

#[tokio::test]
async fn queue_names_are_isolated() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let first = backing.queue_store("SQL_QUERY_A").unwrap();
    let second = backing.queue_store("SQL_QUERY_B").unwrap();
    enqueue(&first, "k1", 10).await;

    assert!(second.get_query_def(&QueryKeyHash::new("k1")).await.unwrap().is_none());
    assert_eq!(second.get_query_stage_state().await.unwrap().defs.len(), 0);
}

// ============================================================================
// SECTION: Durability
// ============================================================================

#[tokio::test]
async fn queue_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let backing = open(&dir);
        let store = backing.queue_store("SQL_QUERY_A").unwrap();
        enqueue(&store, "k1", 10).await;
        backing.cache_store().set("SQL_SCHEMA_x", json!(["public"]), Duration::from_secs(60)).await.unwrap();
    }

    let backing = open(&dir);
    backing.readiness().await.unwrap();
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    assert_eq!(store.get_query_def(&QueryKeyHash::new("k1")).await.unwrap(), Some(def("k1")));
    assert_eq!(backing.cache_store().get("SQL_SCHEMA_x").await.unwrap(), Some(json!(["public"])));
}

#[tokio::test]
async fn unknown_schema_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orchestrator.db");
    drop(open(&dir));
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", []).unwrap();
    drop(connection);

    let result = SqliteBackingStore::open(&SqliteStoreConfig::new(path), StoreRetention::default());

    assert!(matches!(result, Err(SqliteStoreError::VersionMismatch(_))));
}

#[tokio::test]
async fn corrupt_definitions_fail_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orchestrator.db");
    let backing = open(&dir);
    let store = backing.queue_store("SQL_QUERY_A").unwrap();
    enqueue(&store, "k1", 10).await;
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection.execute("UPDATE queue_entries SET def_json = x'7b7b'", []).unwrap();
    drop(connection);

    let result = store.get_query_def(&QueryKeyHash::new("k1")).await;

    assert!(matches!(result, Err(StoreError::Corrupt(_))));
}

#[test]
fn directory_paths_are_rejected() {
    let dir = TempDir::new().unwrap();
    let result = SqliteBackingStore::open(&SqliteStoreConfig::new(dir.path()), StoreRetention::default());
    assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
}

// ============================================================================
// SECTION: Cache Store
// ============================================================================

#[tokio::test]
async fn cache_values_expire_and_list_by_prefix() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir).cache_store();
    cache.set("SQL_SCHEMA_b", json!(2), Duration::from_secs(60)).await.unwrap();
    cache.set("SQL_SCHEMA_a", json!(1), Duration::from_secs(60)).await.unwrap();
    cache.set("SQL_SCHEMA_short", json!(3), Duration::from_millis(20)).await.unwrap();
    cache.set("OTHER_a", json!(4), Duration::from_secs(60)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(cache.keys_by_prefix("SQL_SCHEMA_").await.unwrap(), vec!["SQL_SCHEMA_a", "SQL_SCHEMA_b"]);
    assert!(cache.get("SQL_SCHEMA_short").await.unwrap().is_none());
    cache.remove("SQL_SCHEMA_a").await.unwrap();
    assert!(cache.get("SQL_SCHEMA_a").await.unwrap().is_none());
}

#[tokio::test]
async fn cache_locks_are_exclusive_until_released_or_expired() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir).cache_store();

    assert!(cache.try_lock("LOCK_x", "one", Duration::from_secs(60)).await.unwrap());
    assert!(!cache.try_lock("LOCK_x", "two", Duration::from_secs(60)).await.unwrap());
    cache.unlock("LOCK_x", "two").await.unwrap();
    assert!(!cache.try_lock("LOCK_x", "two", Duration::from_secs(60)).await.unwrap());
    cache.unlock("LOCK_x", "one").await.unwrap();
    assert!(cache.try_lock("LOCK_x", "two", Duration::from_millis(20)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(cache.try_lock("LOCK_x", "three", Duration::from_secs(60)).await.unwrap());
}

// ============================================================================
// SECTION: Queue Integration
// ============================================================================

#[tokio::test]
async fn query_queue_runs_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let backing = open(&dir);
    let events = Arc::new(MemoryEventSink::default());
    let queue = QueryQueue::new(QueueSetup {
        name: "SQL_QUERY_TEST_default".to_string(),
        store: backing.queue_store("SQL_QUERY_TEST_default").unwrap(),
        handlers: QueueHandlers { query: Arc::new(EchoHandler), stream: None },
        options: QueueOptions { concurrency: 2, ..QueueOptions::default() },
        messenger: None,
        events: events.clone(),
    });

    let output = queue
        .execute_in_queue(
            HandlerType::Query,
            &QueryKey::new(json!("SELECT 1")),
            json!("SELECT 1"),
            0,
            ExecuteOptions::default(),
        )
        .await
        .unwrap()
        .into_value()
        .unwrap();

    assert_eq!(output, json!({ "echo": "SELECT 1" }));
    assert!(events.contains("Performing query completed"));
}
