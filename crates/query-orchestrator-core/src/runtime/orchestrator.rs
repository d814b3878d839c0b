// crates/query-orchestrator-core/src/runtime/orchestrator.rs
// ============================================================================
// Module: Query Orchestrator
// Description: Façade composing the query cache and pre-aggregation engine.
// Purpose: Answer query descriptors and expose queue and metadata introspection.
// Dependencies: serde, serde_json, thiserror, crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! [`QueryOrchestrator`] is the single entry point callers use. A fetch first
//! resolves every pre-aggregation the descriptor references, rewrites the
//! main query onto the resolved tables, and then serves it through the
//! [`QueryCache`]. Every other surface (stage reporting, refresh keys,
//! version entries, metadata listings) reads the same queues and stores so
//! that every process in a fleet observes a consistent view.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashError;
use crate::core::hashing::hash_canonical_json;
use crate::core::pre_aggregation::LoadPreAggregationResult;
use crate::core::pre_aggregation::PreAggregationDescription;
use crate::core::pre_aggregation::UsedPreAggregation;
use crate::core::pre_aggregation::VersionEntry;
use crate::core::query::DEFAULT_DATA_SOURCE;
use crate::core::query::DEFAULT_QUERY_PRIORITY;
use crate::core::query::QueryCacheKey;
use crate::core::query::QueryDescriptor;
use crate::core::queue::QueryDef;
use crate::core::queue::QueryKey;
use crate::core::queue::QueryStage;
use crate::core::queue::QueuedQuery;
use crate::interfaces::BackingStore;
use crate::interfaces::ColumnRef;
use crate::interfaces::DriverError;
use crate::interfaces::DriverFactory;
use crate::interfaces::OrchestratorEvent;
use crate::interfaces::OrchestratorEventSink;
use crate::interfaces::QueueMessenger;
use crate::interfaces::StoreError;
use crate::interfaces::TableRef;
use crate::runtime::cache::CacheError;
use crate::runtime::cache::CacheQueryOptions;
use crate::runtime::cache::CachedQueryResult;
use crate::runtime::cache::QueryCache;
use crate::runtime::cache::QueryCacheOptions;
use crate::runtime::cache::QueryCacheSetup;
use crate::runtime::cache::replace_pre_aggregation_table_names;
use crate::runtime::pre_aggregations::BuildRangeCacheStatus;
use crate::runtime::pre_aggregations::ExpandedPreAggregations;
use crate::runtime::pre_aggregations::PreAggregationError;
use crate::runtime::pre_aggregations::PreAggregations;
use crate::runtime::pre_aggregations::PreAggregationsOptions;
use crate::runtime::queue::QueryStream;
use crate::runtime::queue::QueueError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default expiry of cached metadata listings (24 hours).
pub const DEFAULT_METADATA_CACHE_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum priority of pre-aggregation builds considered blocking by
/// [`QueryOrchestrator::query_stage`].
const BLOCKING_BUILD_PRIORITY: i32 = 10;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Reject queries that resolve no pre-aggregation table.
    pub rollup_only: bool,
    /// Expiry of cached schema, table, and column listings.
    pub metadata_cache_expire: Duration,
    /// Query cache tuning.
    pub query_cache: QueryCacheOptions,
    /// Pre-aggregation engine tuning.
    pub pre_aggregations: PreAggregationsOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            rollup_only: false,
            metadata_cache_expire: DEFAULT_METADATA_CACHE_EXPIRE,
            query_cache: QueryCacheOptions::default(),
            pre_aggregations: PreAggregationsOptions::default(),
        }
    }
}

/// Everything needed to build a [`QueryOrchestrator`].
pub struct OrchestratorSetup {
    /// Key prefix shared by queues and cache entries.
    pub prefix: String,
    /// Source drivers.
    pub driver_factory: Arc<dyn DriverFactory>,
    /// External store drivers.
    pub external_driver_factory: Option<Arc<dyn DriverFactory>>,
    /// Shared backing store.
    pub backing_store: Arc<dyn BackingStore>,
    /// Cross-node queue notifications.
    pub messenger: Option<Arc<dyn QueueMessenger>>,
    /// Log sink.
    pub events: Arc<dyn OrchestratorEventSink>,
    /// Tuning.
    pub options: OrchestratorOptions,
}

/// Options of one metadata listing call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataOptions {
    /// Bypass the cached listing and overwrite it with a fresh one.
    pub force_refresh: bool,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Orchestrator errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Query cache failed or asked the caller to continue waiting.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Pre-aggregation engine failed.
    #[error(transparent)]
    PreAggregation(#[from] PreAggregationError),
    /// Queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Cache store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Key hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Rollup-only mode rejected a query without pre-aggregations.
    #[error(
        "No pre-aggregation table has been built for this query yet. Please check your refresh worker \
         configuration if it persists."
    )]
    RollupOnly,
    /// Request cannot be served as submitted.
    #[error("invalid orchestrator request: {0}")]
    Invalid(String),
}

impl OrchestratorError {
    /// Returns true for the non-terminal polling signal.
    #[must_use]
    pub const fn is_continue_wait(&self) -> bool {
        match self {
            Self::Cache(err) => err.is_continue_wait(),
            Self::PreAggregation(err) => err.is_continue_wait(),
            Self::Queue(QueueError::ContinueWait) => true,
            _ => false,
        }
    }
}

// ============================================================================
// SECTION: Results
// ============================================================================

/// Result of [`QueryOrchestrator::fetch_query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchQueryResult {
    /// Query result; `None` when the descriptor only loads pre-aggregations.
    pub data: Option<Value>,
    /// Oldest refresh time among the result and the tables it reads, unix millis.
    pub last_refresh_time: Option<i64>,
    /// Pre-aggregation tables used, keyed by base table name.
    pub used_pre_aggregations: BTreeMap<String, UsedPreAggregation>,
    /// Refresh-key values the result was validated against.
    pub refresh_key_values: Vec<Value>,
    /// Data source the query ran against.
    pub data_source: String,
    /// Whether the query ran on the external store.
    pub external: bool,
}

/// A pre-aggregation with the partitions it expands into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAggregationPartitions {
    /// Pre-aggregation as declared.
    pub pre_aggregation: PreAggregationDescription,
    /// Its partitions; empty for unpartitioned pre-aggregations.
    #[serde(default)]
    pub partitions: Vec<PreAggregationDescription>,
}

/// Built tables matching the current structure of each partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAggregationVersionEntries {
    /// Current structure version by partition table name.
    pub structure_versions_by_table_name: BTreeMap<String, String>,
    /// Built entries with the current structure, newest first, by table name.
    pub version_entries_by_table_name: BTreeMap<String, Vec<VersionEntry>>,
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Query orchestration façade.
#[derive(Clone)]
pub struct QueryOrchestrator {
    /// Result cache and SQL queues.
    cache: QueryCache,
    /// Pre-aggregation engine.
    pre_aggregations: PreAggregations,
    /// Tuning.
    options: OrchestratorOptions,
}

impl QueryOrchestrator {
    /// Builds the orchestrator and its engines.
    #[must_use]
    pub fn new(setup: OrchestratorSetup) -> Self {
        let cache = QueryCache::new(QueryCacheSetup {
            prefix: setup.prefix,
            driver_factory: setup.driver_factory,
            external_driver_factory: setup.external_driver_factory,
            backing_store: setup.backing_store,
            messenger: setup.messenger,
            events: setup.events,
            options: setup.options.query_cache.clone(),
        });
        let pre_aggregations = PreAggregations::new(cache.clone(), setup.options.pre_aggregations.clone());
        Self { cache, pre_aggregations, options: setup.options }
    }

    /// Returns the query cache.
    #[must_use]
    pub const fn query_cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Returns the pre-aggregation engine.
    #[must_use]
    pub const fn pre_aggregations(&self) -> &PreAggregations {
        &self.pre_aggregations
    }

    /// Returns the tuning.
    #[must_use]
    pub const fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Resolves pre-aggregations and returns the descriptor's result.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RollupOnly`] in rollup-only mode when no
    /// table was resolved, a continue-wait error when the result is not
    /// ready within the queue's wait window, and any load or execution
    /// failure otherwise.
    pub async fn fetch_query(&self, descriptor: &QueryDescriptor) -> Result<FetchQueryResult, OrchestratorError> {
        let loaded = self.pre_aggregations.load_all_pre_aggregations_if_needed(descriptor).await?;
        let descriptor = with_values(descriptor, loaded.values);
        let used_pre_aggregations = used_pre_aggregations(&loaded.tables);
        if self.options.rollup_only && used_pre_aggregations.is_empty() {
            return Err(OrchestratorError::RollupOnly);
        }
        let pre_aggregations_refreshed_at = oldest(loaded.tables.iter().map(|table| Some(table.last_updated_at)));

        if descriptor.sql.is_none() {
            return Ok(FetchQueryResult {
                data: None,
                last_refresh_time: pre_aggregations_refreshed_at,
                used_pre_aggregations,
                refresh_key_values: Vec::new(),
                data_source: descriptor.data_source.clone(),
                external: descriptor.external,
            });
        }

        let CachedQueryResult { data, refresh_key_values, last_refresh_time } =
            self.cache.cached_query_result(&descriptor, &loaded.tables).await?;
        Ok(FetchQueryResult {
            data: Some(data),
            last_refresh_time: oldest([pre_aggregations_refreshed_at, last_refresh_time]),
            used_pre_aggregations,
            refresh_key_values,
            data_source: descriptor.data_source.clone(),
            external: descriptor.external,
        })
    }

    /// Resolves pre-aggregations and streams the descriptor's rows.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Invalid`] when the descriptor has no SQL,
    /// and any load or queue failure otherwise.
    pub async fn stream_query(&self, descriptor: &QueryDescriptor) -> Result<QueryStream, OrchestratorError> {
        let loaded = self.pre_aggregations.load_all_pre_aggregations_if_needed(descriptor).await?;
        let descriptor = with_values(descriptor, loaded.values);
        let query = descriptor
            .main_query()
            .map(|query| replace_pre_aggregation_table_names(&query, &loaded.tables))
            .ok_or_else(|| OrchestratorError::Invalid("stream query requires SQL".to_string()))?;
        let options = CacheQueryOptions {
            priority: Some(descriptor.query_priority.unwrap_or(DEFAULT_QUERY_PRIORITY)),
            external: descriptor.external,
            request_id: descriptor.request_id.clone(),
            data_source: descriptor.data_source.clone(),
            ..CacheQueryOptions::default()
        };
        Ok(self.cache.stream_query_result(&query, &options).await?)
    }

    /// Reports where a descriptor currently waits.
    ///
    /// A pending build of one of its pre-aggregations is reported as
    /// `Building pre-aggregation i/n`, suffixed with the queue position when
    /// the build is still queued; otherwise the stage of the main query.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a queue cannot be read.
    pub async fn query_stage(&self, descriptor: &QueryDescriptor) -> Result<Option<QueryStage>, OrchestratorError> {
        let count = descriptor.pre_aggregations.len();
        for (index, description) in descriptor.pre_aggregations.iter().enumerate() {
            let queue = self.pre_aggregations.get_queue(&description.data_source)?;
            if queue.get_query_stage(&description.table_name, Some(BLOCKING_BUILD_PRIORITY)).await?.is_none() {
                continue;
            }
            let Some(stage) = queue.get_query_stage(&description.table_name, None).await? else {
                return Ok(None);
            };
            let message = format!("Building pre-aggregation {}/{count}", index + 1);
            let text = if stage.stage.contains("queue") { format!("{message}: {}", stage.stage) } else { message };
            return Ok(Some(QueryStage { stage: text, ..stage }));
        }

        let queue = if descriptor.external {
            self.cache.get_external_queue()?
        } else {
            self.cache.get_queue(&descriptor.data_source)?
        };
        let key_hash = queue.key_hash(&QueryCacheKey::for_descriptor(descriptor).to_query_key())?;
        Ok(queue.get_query_stage(key_hash.as_str(), None).await?)
    }

    /// Resolves a descriptor's refresh keys.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a refresh-key query fails.
    pub async fn load_refresh_keys(&self, descriptor: &QueryDescriptor) -> Result<Vec<Value>, OrchestratorError> {
        Ok(self.cache.load_refresh_keys(descriptor).await?)
    }

    /// Returns the cached result of a descriptor without executing anything.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the cache store cannot be read.
    pub async fn result_from_cache_if_exists(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<Option<CachedQueryResult>, OrchestratorError> {
        Ok(self.cache.result_from_cache_if_exists(descriptor).await?)
    }

    // ------------------------------------------------------------------------
    // Pre-aggregations
    // ------------------------------------------------------------------------

    /// Returns the built tables whose structure matches each partition.
    ///
    /// Every pre-aggregation is looked up in `schema` on the data source of
    /// its first partition.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a listing fails.
    pub async fn get_pre_aggregation_version_entries(
        &self,
        partition_sets: &[PreAggregationPartitions],
        schema: &str,
        request_id: Option<&String>,
    ) -> Result<PreAggregationVersionEntries, OrchestratorError> {
        let descriptions: Vec<PreAggregationDescription> = partition_sets
            .iter()
            .map(|set| {
                let mut description = set.pre_aggregation.clone();
                description.data_source = set
                    .partitions
                    .first()
                    .map_or_else(|| DEFAULT_DATA_SOURCE.to_string(), |partition| partition.data_source.clone());
                description.pre_aggregations_schema = schema.to_string();
                description
            })
            .collect();
        let entries = self.pre_aggregations.get_version_entries(&descriptions, request_id).await?;

        let mut structure_versions_by_table_name = BTreeMap::new();
        for partition in partition_sets.iter().flat_map(|set| set.partitions.iter()) {
            structure_versions_by_table_name.insert(partition.table_name.clone(), partition.structure_version()?);
        }
        let mut version_entries_by_table_name: BTreeMap<String, Vec<VersionEntry>> = BTreeMap::new();
        for entry in entries.into_iter().flatten() {
            if structure_versions_by_table_name.get(&entry.table_name) == Some(&entry.structure_version) {
                version_entries_by_table_name.entry(entry.table_name.clone()).or_default().push(entry);
            }
        }
        Ok(PreAggregationVersionEntries { structure_versions_by_table_name, version_entries_by_table_name })
    }

    /// Replaces partitioned pre-aggregations with their partitions.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when build ranges cannot be resolved.
    pub async fn expand_partitions_in_pre_aggregations(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<ExpandedPreAggregations, OrchestratorError> {
        Ok(self.pre_aggregations.expand_partitions_in_pre_aggregations(descriptor).await?)
    }

    /// Reports whether build-range queries are already cached.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the cache store cannot be read.
    pub async fn check_partitions_build_range_cache(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<Vec<BuildRangeCacheStatus>, OrchestratorError> {
        Ok(self.pre_aggregations.check_partitions_build_range_cache(descriptor).await?)
    }

    /// Lists the build queue of a data source.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the queue cannot be read.
    pub async fn get_pre_aggregation_queue_states(
        &self,
        data_source: &str,
    ) -> Result<Vec<QueuedQuery>, OrchestratorError> {
        Ok(self.pre_aggregations.get_queue_state(data_source).await?)
    }

    /// Cancels queued or running builds.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the queue cannot be updated.
    pub async fn cancel_pre_aggregation_queries_from_queue(
        &self,
        keys: &[QueryKey],
        data_source: &str,
    ) -> Result<Vec<Option<QueryDef>>, OrchestratorError> {
        Ok(self.pre_aggregations.cancel_queries_from_queue(keys, data_source).await?)
    }

    /// Records that a full refresh pass completed.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the cache store cannot be written.
    pub async fn update_refresh_end_reached(&self) -> Result<(), OrchestratorError> {
        Ok(self.pre_aggregations.update_refresh_end_reached().await?)
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    /// Lists the schemas of a data source.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the driver or cache store fails.
    pub async fn query_data_source_schemas(
        &self,
        data_source: &str,
        options: MetadataOptions,
    ) -> Result<Vec<String>, OrchestratorError> {
        let key = self.metadata_key(data_source, "schemas", &Value::Null)?;
        self.cached_metadata(&key, options, || async {
            let driver = self.cache.driver_factory().driver(data_source).await?;
            driver.get_schemas().await
        })
        .await
    }

    /// Lists the tables of the given schemas.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the driver or cache store fails.
    pub async fn query_tables_for_schemas(
        &self,
        data_source: &str,
        schemas: &[String],
        options: MetadataOptions,
    ) -> Result<Vec<TableRef>, OrchestratorError> {
        let key = self.metadata_key(data_source, "tables", &json!(schemas))?;
        self.cached_metadata(&key, options, || async {
            let driver = self.cache.driver_factory().driver(data_source).await?;
            driver.get_tables_for_schemas(schemas).await
        })
        .await
    }

    /// Lists the columns of the given tables.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the driver or cache store fails.
    pub async fn query_columns_for_tables(
        &self,
        data_source: &str,
        tables: &[TableRef],
        options: MetadataOptions,
    ) -> Result<Vec<ColumnRef>, OrchestratorError> {
        let identity = serde_json::to_value(tables).map_err(|err| OrchestratorError::Invalid(err.to_string()))?;
        let key = self.metadata_key(data_source, "columns", &identity)?;
        self.cached_metadata(&key, options, || async {
            let driver = self.cache.driver_factory().driver(data_source).await?;
            driver.get_columns_for_tables(tables).await
        })
        .await
    }

    /// Returns the cache store key of a metadata listing.
    fn metadata_key(&self, data_source: &str, kind: &str, identity: &Value) -> Result<String, OrchestratorError> {
        let digest = hash_canonical_json(DEFAULT_HASH_ALGORITHM, identity)?;
        Ok(format!("SQL_SCHEMA_{}_{data_source}_{kind}_{}", self.cache.prefix(), digest.value))
    }

    /// Serves a listing from the cache store, fetching and storing it when
    /// missing, undecodable, or force-refreshed.
    async fn cached_metadata<T, F, Fut>(
        &self,
        key: &str,
        options: MetadataOptions,
        fetch: F,
    ) -> Result<T, OrchestratorError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let store = self.cache.cache_store();
        if !options.force_refresh
            && let Some(cached) = store.get(key).await?
            && let Ok(decoded) = serde_json::from_value(cached)
        {
            return Ok(decoded);
        }
        self.cache.events().record(
            &OrchestratorEvent::info("Fetching data source metadata")
                .with("key", key)
                .with("force_refresh", options.force_refresh),
        );
        let fetched = fetch().await?;
        let encoded = serde_json::to_value(&fetched).map_err(|err| OrchestratorError::Invalid(err.to_string()))?;
        store.set(key, encoded, self.options.metadata_cache_expire).await?;
        Ok(fetched)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Runs a reconcile sweep on a data source queue.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when the sweep fails.
    pub async fn force_reconcile(&self, data_source: &str) -> Result<(), OrchestratorError> {
        Ok(self.cache.force_reconcile(data_source).await?)
    }

    /// Cancels in-flight work and drops in-process state.
    pub fn cleanup(&self) {
        self.cache.cleanup();
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the descriptor with build-range parameters substituted.
fn with_values(descriptor: &QueryDescriptor, values: Option<Vec<Value>>) -> QueryDescriptor {
    let mut descriptor = descriptor.clone();
    if let Some(values) = values {
        descriptor.params = values;
    }
    descriptor
}

/// Indexes resolved tables by base table name.
fn used_pre_aggregations(tables: &[LoadPreAggregationResult]) -> BTreeMap<String, UsedPreAggregation> {
    tables
        .iter()
        .map(|table| {
            (
                table.table_name.clone(),
                UsedPreAggregation {
                    target_table_name: table.target_table_name.clone(),
                    refresh_key_values: table.refresh_key_values.clone(),
                    last_updated_at: table.last_updated_at,
                },
            )
        })
        .collect()
}

/// Returns the oldest known timestamp.
fn oldest(timestamps: impl IntoIterator<Item = Option<i64>>) -> Option<i64> {
    timestamps.into_iter().flatten().min()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, last_updated_at: i64) -> LoadPreAggregationResult {
        LoadPreAggregationResult {
            table_name: name.to_string(),
            target_table_name: format!("{name}_a_b_c"),
            refresh_key_values: vec![json!(1)],
            last_updated_at,
            rollup_lambda_id: None,
            build_range_end: None,
        }
    }

    #[test]
    fn oldest_ignores_missing_timestamps() {
        assert_eq!(oldest([None, Some(5), Some(3)]), Some(3));
        assert_eq!(oldest([None, None]), None);
    }

    #[test]
    fn used_pre_aggregations_are_keyed_by_table_name() {
        let used = used_pre_aggregations(&[table("s.orders", 10), table("s.users", 20)]);
        assert_eq!(used.len(), 2);
        assert_eq!(used["s.users"].target_table_name, "s.users_a_b_c");
        assert_eq!(used["s.orders"].last_updated_at, 10);
    }

    #[test]
    fn values_replace_params_only_when_present() {
        let descriptor = QueryDescriptor::new("SELECT ?", vec![json!("__FROM_PARTITION_RANGE")]);
        assert_eq!(with_values(&descriptor, None).params, descriptor.params);
        assert_eq!(with_values(&descriptor, Some(vec![json!("2024-01-01")])).params, vec![json!("2024-01-01")]);
    }

    #[test]
    fn rollup_only_message_matches_clients() {
        assert!(OrchestratorError::RollupOnly.to_string().starts_with("No pre-aggregation table has been built"));
    }
}
