//! Config loading, validation, and conversion tests for query-orchestrator-config.
// crates/query-orchestrator-config/tests/config_loading.rs
// =============================================================================
// Module: Config Loading Tests
// Description: Validate file loading, section validation, and option conversion.
// Purpose: Ensure a minimal config is valid and invalid configs fail closed.
// =============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::missing_docs_in_private_items,
    reason = "Test fixtures use explicit asserts and unwraps for clarity."
)]

use std::path::PathBuf;
use std::time::Duration;

use query_orchestrator_config::ConfigError;
use query_orchestrator_config::OrchestratorConfig;
use query_orchestrator_config::StoreType;
use query_orchestrator_core::OrchestratorOptions;
use query_orchestrator_store_sqlite::SqliteStoreMode;
use query_orchestrator_store_sqlite::SqliteSyncMode;
use tempfile::TempDir;

type TestResult = Result<(), String>;

fn assert_invalid(result: Result<OrchestratorConfig, ConfigError>, needle: &str) -> TestResult {
    match result {
        Err(error) => {
            let message = error.to_string();
            if message.contains(needle) {
                Ok(())
            } else {
                Err(format!("error {message} did not contain {needle}"))
            }
        }
        Ok(_) => Err("expected invalid config".to_string()),
    }
}

// =============================================================================
// SECTION: Defaults
// =============================================================================

#[test]
fn empty_config_uses_runtime_defaults() {
    let config = OrchestratorConfig::parse("").unwrap();

    assert_eq!(config.prefix(), "STANDALONE");
    assert_eq!(config.store.store_type, StoreType::Memory);
    assert_eq!(config.orchestrator_options(), OrchestratorOptions::default());
}

#[test]
fn sections_override_runtime_options() {
    let config = OrchestratorConfig::parse(
        r#"
        [orchestrator]
        prefix = "PROD"
        rollup_only = true
        metadata_cache_expire_secs = 600

        [queue]
        concurrency = 8
        continue_wait_timeout_ms = 2000

        [external_queue]
        concurrency = 3

        [query_cache]
        refresh_key_renewal_threshold_secs = 30
        background_renew = true
        memory_cache_capacity = 50

        [pre_aggregations]
        max_partitions = 100
        external_refresh = true
        drop_without_touch = true

        [pre_aggregations.queue]
        concurrency = 2
        "#,
    )
    .unwrap();

    let options = config.orchestrator_options();
    assert_eq!(config.prefix(), "PROD");
    assert!(options.rollup_only);
    assert_eq!(options.metadata_cache_expire, Duration::from_secs(600));
    assert_eq!(options.query_cache.queue_options.concurrency, 8);
    assert_eq!(options.query_cache.queue_options.continue_wait_timeout, Duration::from_secs(2));
    assert_eq!(options.query_cache.external_queue_options.concurrency, 3);
    assert_eq!(options.query_cache.refresh_key_renewal_threshold, Some(30));
    assert!(options.query_cache.background_renew);
    assert_eq!(options.query_cache.memory_cache_capacity, 50);
    assert_eq!(options.pre_aggregations.max_partitions, 100);
    assert!(options.pre_aggregations.external_refresh);
    assert!(options.pre_aggregations.drop_without_touch);
    assert_eq!(options.pre_aggregations.queue_options.concurrency, 2);
}

#[test]
fn store_retention_follows_store_section() {
    let config = OrchestratorConfig::parse(
        r"
        [store]
        result_ttl_secs = 5
        processing_lock_ttl_secs = 10
        ",
    )
    .unwrap();

    let retention = config.store_retention();
    assert_eq!(retention.result_ttl, Duration::from_secs(5));
    assert_eq!(retention.processing_lock_ttl, Duration::from_secs(10));
}

// =============================================================================
// SECTION: Validation
// =============================================================================

#[test]
fn invalid_prefix_is_rejected() -> TestResult {
    assert_invalid(OrchestratorConfig::parse("[orchestrator]\nprefix = \"\"\n"), "orchestrator.prefix")?;
    assert_invalid(OrchestratorConfig::parse("[orchestrator]\nprefix = \"a b\"\n"), "orchestrator.prefix")
}

#[test]
fn zero_concurrency_is_rejected() -> TestResult {
    assert_invalid(OrchestratorConfig::parse("[queue]\nconcurrency = 0\n"), "queue.concurrency")?;
    assert_invalid(
        OrchestratorConfig::parse("[pre_aggregations.queue]\nconcurrency = 0\n"),
        "pre_aggregations.queue.concurrency",
    )
}

#[test]
fn heartbeat_must_be_shorter_than_execution_timeout() -> TestResult {
    assert_invalid(
        OrchestratorConfig::parse("[external_queue]\nexecution_timeout_ms = 100\nheartbeat_interval_ms = 100\n"),
        "external_queue.heartbeat_interval_ms",
    )
}

#[test]
fn zero_partitions_are_rejected() -> TestResult {
    assert_invalid(
        OrchestratorConfig::parse("[pre_aggregations]\nmax_partitions = 0\n"),
        "pre_aggregations.max_partitions",
    )
}

#[test]
fn memory_store_rejects_path() -> TestResult {
    assert_invalid(
        OrchestratorConfig::parse("[store]\ntype = \"memory\"\npath = \"state.db\"\n"),
        "memory store must not set path",
    )
}

#[test]
fn sqlite_store_requires_path() -> TestResult {
    assert_invalid(OrchestratorConfig::parse("[store]\ntype = \"sqlite\"\n"), "sqlite store requires path")
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let result = OrchestratorConfig::parse("[queue\nconcurrency = 1");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

// =============================================================================
// SECTION: Loading
// =============================================================================

#[test]
fn load_reads_explicit_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("query-orchestrator.toml");
    std::fs::write(&path, "[orchestrator]\nprefix = \"FILE\"\n").unwrap();

    let config = OrchestratorConfig::load(Some(&path)).unwrap();

    assert_eq!(config.prefix(), "FILE");
}

#[test]
fn load_rejects_oversized_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("big.toml");
    let mut content = String::from("# padding\n");
    content.push_str(&"#".repeat(1024 * 1024));
    std::fs::write(&path, content).unwrap();

    let result = OrchestratorConfig::load(Some(&path));

    assert!(matches!(result, Err(ConfigError::Invalid(message)) if message.contains("size limit")));
}

#[test]
fn load_reports_missing_files() {
    let dir = TempDir::new().unwrap();
    let result = OrchestratorConfig::load(Some(&dir.path().join("absent.toml")));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

// =============================================================================
// SECTION: Backing Store
// =============================================================================

#[test]
fn memory_backing_store_opens() {
    let config = OrchestratorConfig::parse("").unwrap();
    let store = config.open_backing_store().unwrap();
    assert!(store.queue_store("SQL_QUERY_STANDALONE_default").is_ok());
}

#[test]
fn sqlite_backing_store_opens_at_configured_path() {
    let dir = TempDir::new().unwrap();
    let path: PathBuf = dir.path().join("nested").join("orchestrator.db");
    let text = format!(
        "[store]\ntype = \"sqlite\"\npath = {:?}\njournal_mode = \"delete\"\nsync_mode = \"full\"\n",
        path.to_string_lossy()
    );
    let config = OrchestratorConfig::parse(&text).unwrap();
    assert_eq!(config.store.journal_mode, SqliteStoreMode::Delete);
    assert_eq!(config.store.sync_mode, SqliteSyncMode::Full);

    let store = config.open_backing_store().unwrap();

    assert!(store.queue_store("SQL_QUERY_STANDALONE_default").is_ok());
    assert!(path.exists());
}
