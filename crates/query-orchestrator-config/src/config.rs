// crates/query-orchestrator-config/src/config.rs
// ============================================================================
// Module: Query Orchestrator Configuration
// Description: Configuration loading and validation for the query orchestrator.
// Purpose: Build immutable runtime options and the backing store once at startup.
// Dependencies: query-orchestrator-core, query-orchestrator-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits,
//! validated section by section, and converted once into
//! [`OrchestratorOptions`]. Nothing reads the environment after loading.
//! Missing sections fall back to the runtime defaults.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use query_orchestrator_core::BackingStore;
use query_orchestrator_core::InMemoryBackingStore;
use query_orchestrator_core::OrchestratorOptions;
use query_orchestrator_core::PreAggregationsOptions;
use query_orchestrator_core::QueryCacheOptions;
use query_orchestrator_core::QueueOptions;
use query_orchestrator_core::StoreRetention;
use query_orchestrator_store_sqlite::SqliteBackingStore;
use query_orchestrator_store_sqlite::SqliteStoreConfig;
use query_orchestrator_store_sqlite::SqliteStoreMode;
use query_orchestrator_store_sqlite::SqliteSyncMode;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "query-orchestrator.toml";
/// Environment variable naming the configuration file.
pub(crate) const CONFIG_ENV_VAR: &str = "QUERY_ORCHESTRATOR_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum key prefix length.
pub(crate) const MAX_PREFIX_LENGTH: usize = 64;
/// Maximum queue concurrency.
pub(crate) const MAX_QUEUE_CONCURRENCY: usize = 1024;
/// Maximum partitions a pre-aggregation may be configured to enumerate.
pub(crate) const MAX_PARTITIONS_LIMIT: usize = 1_000_000;
/// Maximum in-process cache capacity.
pub(crate) const MAX_CACHE_CAPACITY: usize = 1_000_000;
/// Default key prefix.
const DEFAULT_PREFIX: &str = "STANDALONE";
/// Default `SQLite` busy timeout (ms).
const DEFAULT_STORE_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Root Config
// ============================================================================

/// Query orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    /// Orchestrator-wide settings.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Per-data-source query queues.
    #[serde(default)]
    pub queue: QueueConfig,
    /// External store query queue.
    #[serde(default)]
    pub external_queue: QueueConfig,
    /// Query cache tuning.
    #[serde(default)]
    pub query_cache: QueryCacheConfig,
    /// Pre-aggregation engine tuning.
    #[serde(default)]
    pub pre_aggregations: PreAggregationsConfig,
    /// Backing store selection.
    #[serde(default)]
    pub store: StoreConfig,
}

impl OrchestratorConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// Resolution order: `path`, then `QUERY_ORCHESTRATOR_CONFIG`, then
    /// `query-orchestrator.toml` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::parse(content)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let config: Self = toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.queue.validate("queue")?;
        self.external_queue.validate("external_queue")?;
        self.query_cache.validate()?;
        self.pre_aggregations.validate()?;
        self.store.validate()?;
        Ok(())
    }

    /// Returns the key prefix shared by queues and cache entries.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.orchestrator.prefix
    }

    /// Converts the configuration into runtime options.
    #[must_use]
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            rollup_only: self.orchestrator.rollup_only,
            metadata_cache_expire: Duration::from_secs(self.orchestrator.metadata_cache_expire_secs),
            query_cache: QueryCacheOptions {
                refresh_key_renewal_threshold: self.query_cache.refresh_key_renewal_threshold_secs,
                background_renew: self.query_cache.background_renew,
                memory_cache_capacity: self.query_cache.memory_cache_capacity,
                queue_options: self.queue.queue_options(),
                external_queue_options: self.external_queue.queue_options(),
            },
            pre_aggregations: self.pre_aggregations.options(),
        }
    }

    /// Returns queue retention for the backing store.
    #[must_use]
    pub const fn store_retention(&self) -> StoreRetention {
        self.store.retention()
    }

    /// Opens the configured backing store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the store cannot be opened.
    pub fn open_backing_store(&self) -> Result<Arc<dyn BackingStore>, ConfigError> {
        let retention = self.store_retention();
        match self.store.store_type {
            StoreType::Memory => Ok(Arc::new(InMemoryBackingStore::new(retention))),
            StoreType::Sqlite => {
                let config = self.store.sqlite_config()?;
                let store = SqliteBackingStore::open(&config, retention)
                    .map_err(|err| ConfigError::Store(err.to_string()))?;
                Ok(Arc::new(store))
            }
        }
    }
}

// ============================================================================
// SECTION: Orchestrator Section
// ============================================================================

/// Orchestrator-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// Key prefix shared by queues and cache entries.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Reject queries that resolve no pre-aggregation table.
    #[serde(default)]
    pub rollup_only: bool,
    /// Expiry of cached schema, table, and column listings (seconds).
    #[serde(default = "default_metadata_cache_expire_secs")]
    pub metadata_cache_expire_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            rollup_only: false,
            metadata_cache_expire_secs: default_metadata_cache_expire_secs(),
        }
    }
}

impl OrchestratorSection {
    /// Validates orchestrator-wide settings.
    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.prefix.as_str();
        if prefix.is_empty() {
            return Err(ConfigError::Invalid("orchestrator.prefix must be non-empty".to_string()));
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(ConfigError::Invalid("orchestrator.prefix exceeds max length".to_string()));
        }
        if !prefix.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-') {
            return Err(ConfigError::Invalid(
                "orchestrator.prefix must contain only ascii letters, digits, '_' or '-'".to_string(),
            ));
        }
        require_positive("orchestrator.metadata_cache_expire_secs", self.metadata_cache_expire_secs)
    }
}

// ============================================================================
// SECTION: Queue Config
// ============================================================================

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum simultaneous handler invocations.
    pub concurrency: usize,
    /// Client-facing wait before a continue-wait signal (ms).
    pub continue_wait_timeout_ms: u64,
    /// Handler runtime limit (ms).
    pub execution_timeout_ms: u64,
    /// Time an entry survives without a waiter (ms).
    pub orphaned_timeout_ms: u64,
    /// Heartbeat cadence of running entries (ms).
    pub heartbeat_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_options(&QueueOptions::default())
    }
}

impl QueueConfig {
    /// Mirrors runtime queue options.
    fn from_options(options: &QueueOptions) -> Self {
        Self {
            concurrency: options.concurrency,
            continue_wait_timeout_ms: duration_ms(options.continue_wait_timeout),
            execution_timeout_ms: duration_ms(options.execution_timeout),
            orphaned_timeout_ms: duration_ms(options.orphaned_timeout),
            heartbeat_interval_ms: duration_ms(options.heartbeat_interval),
        }
    }

    /// Converts into runtime queue options.
    #[must_use]
    pub const fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            concurrency: self.concurrency,
            continue_wait_timeout: Duration::from_millis(self.continue_wait_timeout_ms),
            execution_timeout: Duration::from_millis(self.execution_timeout_ms),
            orphaned_timeout: Duration::from_millis(self.orphaned_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }

    /// Validates queue tuning under the given section name.
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > MAX_QUEUE_CONCURRENCY {
            return Err(ConfigError::Invalid(format!(
                "{section}.concurrency must be between 1 and {MAX_QUEUE_CONCURRENCY}"
            )));
        }
        require_positive(&format!("{section}.continue_wait_timeout_ms"), self.continue_wait_timeout_ms)?;
        require_positive(&format!("{section}.execution_timeout_ms"), self.execution_timeout_ms)?;
        require_positive(&format!("{section}.orphaned_timeout_ms"), self.orphaned_timeout_ms)?;
        require_positive(&format!("{section}.heartbeat_interval_ms"), self.heartbeat_interval_ms)?;
        if self.heartbeat_interval_ms >= self.execution_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "{section}.heartbeat_interval_ms must be less than {section}.execution_timeout_ms"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Query Cache Config
// ============================================================================

/// Query cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// Overrides every refresh-key renewal threshold (seconds).
    pub refresh_key_renewal_threshold_secs: Option<u64>,
    /// Serve cached results immediately and renew in the background.
    pub background_renew: bool,
    /// In-process cache capacity.
    pub memory_cache_capacity: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        let defaults = QueryCacheOptions::default();
        Self {
            refresh_key_renewal_threshold_secs: defaults.refresh_key_renewal_threshold,
            background_renew: defaults.background_renew,
            memory_cache_capacity: defaults.memory_cache_capacity,
        }
    }
}

impl QueryCacheConfig {
    /// Validates query cache tuning.
    fn validate(&self) -> Result<(), ConfigError> {
        require_capacity("query_cache.memory_cache_capacity", self.memory_cache_capacity)
    }
}

// ============================================================================
// SECTION: Pre-Aggregation Config
// ============================================================================

/// Pre-aggregation engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PreAggregationsConfig {
    /// Maximum partitions one pre-aggregation may enumerate.
    pub max_partitions: usize,
    /// Maximum rows downloaded from a source in one go.
    pub max_source_row_limit: u64,
    /// Serve only tables built by an external refresh worker.
    pub external_refresh: bool,
    /// How long superseded structure versions are kept (seconds).
    pub structure_version_persist_secs: u64,
    /// TTL of touch markers (seconds).
    pub touch_table_persist_secs: u64,
    /// TTL of used-table markers (seconds).
    pub used_table_persist_secs: u64,
    /// Keep only used and touched tables once the refresh end is reached.
    pub drop_without_touch: bool,
    /// Capacity of the in-process touch throttle.
    pub touch_cache_capacity: usize,
    /// How long a touch suppresses repeated store writes (seconds).
    pub touch_cache_max_age_secs: u64,
    /// Build queue tuning.
    pub queue: QueueConfig,
}

impl Default for PreAggregationsConfig {
    fn default() -> Self {
        let defaults = PreAggregationsOptions::default();
        Self {
            max_partitions: defaults.max_partitions,
            max_source_row_limit: defaults.max_source_row_limit,
            external_refresh: defaults.external_refresh,
            structure_version_persist_secs: defaults.structure_version_persist_time.as_secs(),
            touch_table_persist_secs: defaults.touch_table_persist_time.as_secs(),
            used_table_persist_secs: defaults.used_table_persist_time.as_secs(),
            drop_without_touch: defaults.drop_without_touch,
            touch_cache_capacity: defaults.touch_cache_capacity,
            touch_cache_max_age_secs: defaults.touch_cache_max_age.as_secs(),
            queue: QueueConfig::from_options(&defaults.queue_options),
        }
    }
}

impl PreAggregationsConfig {
    /// Converts into runtime pre-aggregation options.
    #[must_use]
    pub const fn options(&self) -> PreAggregationsOptions {
        PreAggregationsOptions {
            max_partitions: self.max_partitions,
            max_source_row_limit: self.max_source_row_limit,
            external_refresh: self.external_refresh,
            structure_version_persist_time: Duration::from_secs(self.structure_version_persist_secs),
            touch_table_persist_time: Duration::from_secs(self.touch_table_persist_secs),
            used_table_persist_time: Duration::from_secs(self.used_table_persist_secs),
            drop_without_touch: self.drop_without_touch,
            touch_cache_capacity: self.touch_cache_capacity,
            touch_cache_max_age: Duration::from_secs(self.touch_cache_max_age_secs),
            queue_options: self.queue.queue_options(),
        }
    }

    /// Validates pre-aggregation tuning.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_partitions == 0 || self.max_partitions > MAX_PARTITIONS_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "pre_aggregations.max_partitions must be between 1 and {MAX_PARTITIONS_LIMIT}"
            )));
        }
        require_positive("pre_aggregations.max_source_row_limit", self.max_source_row_limit)?;
        require_positive("pre_aggregations.structure_version_persist_secs", self.structure_version_persist_secs)?;
        require_positive("pre_aggregations.touch_table_persist_secs", self.touch_table_persist_secs)?;
        require_positive("pre_aggregations.used_table_persist_secs", self.used_table_persist_secs)?;
        require_capacity("pre_aggregations.touch_cache_capacity", self.touch_cache_capacity)?;
        self.queue.validate("pre_aggregations.queue")
    }
}

// ============================================================================
// SECTION: Store Config
// ============================================================================

/// Backing store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// In-process store; state is lost on exit and not shared.
    #[default]
    Memory,
    /// `SQLite` store shared by every process opening the same file.
    Sqlite,
}

/// Backing store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Store backend type.
    #[serde(rename = "type", default)]
    pub store_type: StoreType,
    /// `SQLite` database path when using the sqlite backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_store_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` synchronous mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// How long finished queue results stay readable (seconds).
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// How long a processing claim survives without a heartbeat (seconds).
    #[serde(default = "default_processing_lock_ttl_secs")]
    pub processing_lock_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            path: None,
            busy_timeout_ms: default_store_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
            result_ttl_secs: default_result_ttl_secs(),
            processing_lock_ttl_secs: default_processing_lock_ttl_secs(),
        }
    }
}

impl StoreConfig {
    /// Validates backing store configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("store.result_ttl_secs", self.result_ttl_secs)?;
        require_positive("store.processing_lock_ttl_secs", self.processing_lock_ttl_secs)?;
        match self.store_type {
            StoreType::Memory => {
                if self.path.is_some() {
                    return Err(ConfigError::Invalid("memory store must not set path".to_string()));
                }
                Ok(())
            }
            StoreType::Sqlite => {
                let path = self
                    .path
                    .as_ref()
                    .ok_or_else(|| ConfigError::Invalid("sqlite store requires path".to_string()))?;
                validate_store_path(path)
            }
        }
    }

    /// Returns queue retention.
    const fn retention(&self) -> StoreRetention {
        StoreRetention {
            result_ttl: Duration::from_secs(self.result_ttl_secs),
            processing_lock_ttl: Duration::from_secs(self.processing_lock_ttl_secs),
        }
    }

    /// Returns the `SQLite` store configuration.
    fn sqlite_config(&self) -> Result<SqliteStoreConfig, ConfigError> {
        let path = self.path.clone().ok_or_else(|| ConfigError::Invalid("sqlite store requires path".to_string()))?;
        Ok(SqliteStoreConfig {
            path,
            busy_timeout_ms: self.busy_timeout_ms,
            journal_mode: self.journal_mode,
            sync_mode: self.sync_mode,
        })
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Backing store failed to open.
    #[error("config store error: {0}")]
    Store(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from the caller or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates the `SQLite` store path.
fn validate_store_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("store.path must be non-empty".to_string()));
    }
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("store.path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("store.path component too long".to_string()));
        }
    }
    Ok(())
}

/// Rejects zero-valued durations and limits.
fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
    }
    Ok(())
}

/// Validates a cache capacity.
fn require_capacity(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_CACHE_CAPACITY {
        return Err(ConfigError::Invalid(format!("{field} must be between 1 and {MAX_CACHE_CAPACITY}")));
    }
    Ok(())
}

/// Converts a duration into whole milliseconds.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Returns the default key prefix.
fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

/// Returns the default metadata cache expiry.
const fn default_metadata_cache_expire_secs() -> u64 {
    24 * 60 * 60
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_store_busy_timeout_ms() -> u64 {
    DEFAULT_STORE_BUSY_TIMEOUT_MS
}

/// Returns the default result retention.
const fn default_result_ttl_secs() -> u64 {
    StoreRetention::DEFAULT_RESULT_TTL.as_secs()
}

/// Returns the default processing lock TTL.
const fn default_processing_lock_ttl_secs() -> u64 {
    StoreRetention::DEFAULT_PROCESSING_LOCK_TTL.as_secs()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test fixtures use explicit asserts and unwraps for clarity."
    )]

    use super::*;

    #[test]
    fn queue_config_defaults_mirror_runtime_defaults() {
        assert_eq!(QueueConfig::default().queue_options(), QueueOptions::default());
    }

    #[test]
    fn build_queue_defaults_to_single_worker() {
        assert_eq!(PreAggregationsConfig::default().queue.concurrency, 1);
        assert_eq!(PreAggregationsConfig::default().options(), PreAggregationsOptions::default());
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = require_positive("queue.execution_timeout_ms", 0).unwrap_err();
        assert!(err.to_string().contains("queue.execution_timeout_ms must be greater than zero"));
        assert!(require_capacity("cap", 0).is_err());
        assert!(require_capacity("cap", MAX_CACHE_CAPACITY + 1).is_err());
    }

    #[test]
    fn overlong_path_components_are_rejected() {
        let path = PathBuf::from("a".repeat(MAX_PATH_COMPONENT_LENGTH + 1));
        assert!(validate_path(&path).is_err());
        assert!(validate_store_path(&path).is_err());
        assert!(validate_path(Path::new("query-orchestrator.toml")).is_ok());
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        let resolved = resolve_path(Some(Path::new("custom.toml"))).unwrap();
        assert_eq!(resolved, PathBuf::from("custom.toml"));
    }
}
