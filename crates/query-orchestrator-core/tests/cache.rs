// crates/query-orchestrator-core/tests/cache.rs
// ============================================================================
// Module: Query Cache Tests
// Description: Exercises result caching, renewal, and advisory locks.
// ============================================================================
//! ## Overview
//! Runs [`QueryCache`] against a scripted driver and the in-memory store.

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

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use query_orchestrator_core::BackingStore;
use query_orchestrator_core::CacheError;
use query_orchestrator_core::CacheQueryOptions;
use query_orchestrator_core::InMemoryBackingStore;
use query_orchestrator_core::MemoryEventSink;
use query_orchestrator_core::QueryCache;
use query_orchestrator_core::QueryCacheOptions;
use query_orchestrator_core::QueryCacheSetup;
use query_orchestrator_core::QueryDescriptor;
use query_orchestrator_core::QueryWithParams;
use query_orchestrator_core::QueueError;
use query_orchestrator_core::StoreRetention;
use query_orchestrator_core::runtime::KeyPart;
use serde_json::json;
use support::MockDriver;
use support::MockFactory;
use tokio_util::sync::CancellationToken;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

const MAIN_SQL: &str = "SELECT * FROM orders";
const REFRESH_SQL: &str = "SELECT MAX(updated_at) FROM orders";

fn cache_with(driver: &Arc<MockDriver>, options: QueryCacheOptions, result_ttl: Duration) -> (QueryCache, Arc<MemoryEventSink>) {
    let events = Arc::new(MemoryEventSink::default());
    let retention = StoreRetention { result_ttl, ..StoreRetention::default() };
    let cache = QueryCache::new(QueryCacheSetup {
        prefix: "TEST".to_string(),
        driver_factory: MockFactory::single(driver),
        external_driver_factory: None,
        backing_store: Arc::new(InMemoryBackingStore::new(retention)) as Arc<dyn BackingStore>,
        messenger: None,
        events: events.clone(),
        options,
    });
    (cache, events)
}

fn cache(driver: &Arc<MockDriver>) -> (QueryCache, Arc<MemoryEventSink>) {
    cache_with(driver, QueryCacheOptions::default(), Duration::from_secs(60))
}

fn descriptor() -> QueryDescriptor {
    let mut descriptor = QueryDescriptor::new(MAIN_SQL, Vec::new());
    descriptor.cache_key_queries = vec![QueryWithParams::new(REFRESH_SQL)];
    descriptor
}

// ============================================================================
// SECTION: Cached Results
// ============================================================================

#[tokio::test]
async fn repeated_calls_reuse_the_cached_result() {
    let driver = MockDriver::new();
    driver.respond(REFRESH_SQL, json!([{ "max": 1 }]));
    driver.respond(MAIN_SQL, json!([{ "id": 1 }]));
    let (cache, events) = cache(&driver);

    let first = cache.cached_query_result(&descriptor(), &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = cache.cached_query_result(&descriptor(), &[]).await.unwrap();

    assert_eq!(first.data, json!([{ "id": 1 }]));
    assert_eq!(second.data, first.data);
    assert_eq!(second.refresh_key_values, vec![json!([{ "max": 1 }])]);
    assert!(second.last_refresh_time.is_some());
    assert_eq!(driver.executed_count(MAIN_SQL), 1);
    assert!(events.contains("Missing cache for"));
    assert!(events.contains("Using cache for"));
}

#[tokio::test]
async fn refresh_key_change_renews_the_main_query() {
    let driver = MockDriver::new();
    driver.respond(REFRESH_SQL, json!([{ "max": 1 }]));
    driver.respond(MAIN_SQL, json!([{ "id": 1 }]));
    let options = QueryCacheOptions { refresh_key_renewal_threshold: Some(0), ..QueryCacheOptions::default() };
    let (cache, events) = cache_with(&driver, options, StoreRetention::DEFAULT_RESULT_TTL);

    let first = cache.cached_query_result(&descriptor(), &[]).await.unwrap();
    assert_eq!(first.data, json!([{ "id": 1 }]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    driver.respond(REFRESH_SQL, json!([{ "max": 2 }]));
    driver.respond(MAIN_SQL, json!([{ "id": 2 }]));
    let _ = cache.cached_query_result(&descriptor(), &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let renewed = cache.cached_query_result(&descriptor(), &[]).await.unwrap();

    assert_eq!(renewed.data, json!([{ "id": 2 }]));
    assert_eq!(renewed.refresh_key_values, vec![json!([{ "max": 2 }])]);
    assert_eq!(driver.executed_count(MAIN_SQL), 2);
    assert!(events.contains("Waiting for renew"));
}

#[tokio::test]
async fn requested_renew_executes_again_within_result_retention() {
    let driver = MockDriver::new();
    driver.respond(REFRESH_SQL, json!([{ "max": 1 }]));
    driver.respond(MAIN_SQL, json!([{ "id": 1 }]));
    let options = QueryCacheOptions { refresh_key_renewal_threshold: Some(0), ..QueryCacheOptions::default() };
    let (cache, _events) = cache_with(&driver, options, StoreRetention::DEFAULT_RESULT_TTL);

    let first = cache.cached_query_result(&descriptor(), &[]).await.unwrap();
    assert_eq!(first.data, json!([{ "id": 1 }]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    driver.respond(REFRESH_SQL, json!([{ "max": 2 }]));
    driver.respond(MAIN_SQL, json!([{ "id": 2 }]));
    let mut renew = descriptor();
    renew.renew_query = true;
    let renewed = cache.cached_query_result(&renew, &[]).await.unwrap();

    assert_eq!(renewed.data, json!([{ "id": 2 }]));
    assert_eq!(renewed.refresh_key_values, vec![json!([{ "max": 2 }])]);
    assert_eq!(driver.executed_count(MAIN_SQL), 2);
}

#[tokio::test]
async fn force_no_cache_executes_every_time() {
    let driver = MockDriver::new();
    driver.respond(MAIN_SQL, json!([{ "id": 1 }]));
    let (cache, events) = cache(&driver);
    let query = QueryWithParams::new(MAIN_SQL);
    let options = CacheQueryOptions { force_no_cache: true, ..CacheQueryOptions::default() };

    cache.cache_query_result(&query, &query.cache_key(), Duration::from_secs(60), options.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    cache.cache_query_result(&query, &query.cache_key(), Duration::from_secs(60), options).await.unwrap();

    assert_eq!(driver.executed_count(MAIN_SQL), 2);
    assert!(events.contains("Force no cache for"));
}

#[tokio::test]
async fn failed_execution_drops_the_cache_entry() {
    let driver = MockDriver::new();
    driver.fail(MAIN_SQL, "relation does not exist");
    let (cache, events) = cache(&driver);
    let query = QueryWithParams::new(MAIN_SQL);

    let result =
        cache.cache_query_result(&query, &query.cache_key(), Duration::from_secs(60), CacheQueryOptions::default()).await;

    assert!(matches!(result, Err(CacheError::Queue(QueueError::Handler(message))) if message.contains("relation does not exist")));
    assert!(events.contains("Dropping Cache"));
    assert!(cache.last_refresh_time(&query.cache_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn cached_result_lookup_never_executes() {
    let driver = MockDriver::new();
    driver.respond(MAIN_SQL, json!([{ "id": 1 }]));
    let (cache, _events) = cache(&driver);
    let descriptor = QueryDescriptor::new(MAIN_SQL, Vec::new());

    assert!(cache.result_from_cache_if_exists(&descriptor).await.unwrap().is_none());
    cache.cached_query_result(&descriptor, &[]).await.unwrap();
    let cached = cache.result_from_cache_if_exists(&descriptor).await.unwrap().unwrap();

    assert_eq!(cached.data, json!([{ "id": 1 }]));
    assert!(cached.last_refresh_time.is_some());
}

#[tokio::test]
async fn result_keys_carry_the_prefix() {
    let driver = MockDriver::new();
    let (cache, _events) = cache(&driver);

    let key = cache.query_result_key(&json!([MAIN_SQL, []])).unwrap();

    assert!(key.starts_with("SQL_QUERY_RESULT_TEST_"));
    assert_eq!(key, cache.query_result_key(&json!([MAIN_SQL, []])).unwrap());
}

#[tokio::test]
async fn stream_rows_bypass_the_result_cache() {
    let driver = MockDriver::new();
    driver.respond(MAIN_SQL, json!([{ "id": 1 }, { "id": 2 }]));
    let (cache, _events) = cache(&driver);

    let mut stream =
        cache.stream_query_result(&QueryWithParams::new(MAIN_SQL), &CacheQueryOptions::default()).await.unwrap();
    let mut rows = Vec::new();
    while let Some(row) = stream.next_row().await {
        rows.push(row.unwrap());
    }

    assert_eq!(rows, vec![json!({ "id": 1 }), json!({ "id": 2 })]);
    assert!(cache.last_refresh_time(&QueryWithParams::new(MAIN_SQL).cache_key()).await.unwrap().is_none());
}

// ============================================================================
// SECTION: Locks and Memoization
// ============================================================================

#[tokio::test]
async fn lock_is_exclusive_and_released_afterwards() {
    let driver = MockDriver::new();
    let (cache, _events) = cache(&driver);
    let cancel = CancellationToken::new();

    let outer = cache
        .with_lock("lock:build", Duration::from_secs(60), &cancel, |_token| {
            let cache = cache.clone();
            let cancel = cancel.clone();
            async move {
                let inner = cache
                    .with_lock("lock:build", Duration::from_secs(60), &cancel, |_token| async { Ok::<(), CacheError>(()) })
                    .await?;
                assert!(!inner);
                Ok::<(), CacheError>(())
            }
        })
        .await
        .unwrap();
    assert!(outer);

    let again = cache
        .with_lock("lock:build", Duration::from_secs(60), &cancel, |_token| async { Ok::<(), CacheError>(()) })
        .await
        .unwrap();
    assert!(again);
}

#[tokio::test]
async fn memoized_values_are_computed_once() {
    let driver = MockDriver::new();
    let (cache, _events) = cache(&driver);
    let computed = Arc::new(AtomicUsize::new(0));
    let parts = [KeyPart::from("tables"), KeyPart::from(json!(["public"])), KeyPart::Undefined];

    for _ in 0 .. 3 {
        let computed = computed.clone();
        let value: Vec<String> = cache
            .cache(&parts, Duration::from_secs(60), || async move {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(vec!["orders".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["orders".to_string()]);
    }

    assert_eq!(computed.load(Ordering::SeqCst), 1);
}
