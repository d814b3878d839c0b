// crates/query-orchestrator-core/src/runtime/loader.rs
// ============================================================================
// Module: Pre-Aggregation Loader
// Description: Version resolution and build strategies for one pre-aggregation.
// Purpose: Decide whether a table is current and materialize it when not.
// Dependencies: tokio, tokio-util, crate::{core, interfaces, runtime::{cache, pre_aggregations, queue}}
// ============================================================================

//! ## Overview
//! A [`PreAggregationLoader`] resolves one pre-aggregation (or one
//! partition) to a physical table. Invalidation-key values select a content
//! version; a matching table is served as-is, a table of the same structure
//! is served while a refresh runs in the background, and anything else is
//! built through the data source's build queue before the call returns.
//!
//! Builds run inside the queue handler via [`PreAggregationLoader::refresh`]
//! using one of the [`BuildStrategy`] variants.
//!
//! A [`LoadCache`] memoizes table listings and refresh-key results for the
//! duration of one request so pre-aggregations sharing a schema list it
//! once.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::pre_aggregation::DEFAULT_PRE_AGGREGATION_PRIORITY;
use crate::core::pre_aggregation::IndexDescription;
use crate::core::pre_aggregation::LoadPreAggregationResult;
use crate::core::pre_aggregation::NamingVersion;
use crate::core::pre_aggregation::PreAggregationDescription;
use crate::core::pre_aggregation::TableColumn;
use crate::core::pre_aggregation::VersionEntries;
use crate::core::pre_aggregation::VersionEntry;
use crate::core::pre_aggregation::expected_table_name_pattern;
use crate::core::pre_aggregation::no_partitions_built_message;
use crate::core::pre_aggregation::tables_to_version_entries;
use crate::core::query::QueryWithParams;
use crate::core::queue::HandlerType;
use crate::core::queue::QueryKey;
use crate::core::time::now_utc;
use crate::interfaces::DownloadOptions;
use crate::interfaces::DownloadedTable;
use crate::interfaces::Driver;
use crate::interfaces::DriverCapabilities;
use crate::interfaces::DriverError;
use crate::interfaces::OrchestratorEvent;
use crate::interfaces::QueryMeta;
use crate::interfaces::StoreError;
use crate::interfaces::UploadOptions;
use crate::runtime::cache::CacheError;
use crate::runtime::cache::CacheQueryOptions;
use crate::runtime::cache::replace_pre_aggregation_table_names;
use crate::runtime::pre_aggregations::BuildJob;
use crate::runtime::pre_aggregations::DROP_LOCK_TTL;
use crate::runtime::pre_aggregations::PreAggregationError;
use crate::runtime::pre_aggregations::PreAggregations;
use crate::runtime::pre_aggregations::renew_with_external_refresh;
use crate::runtime::queue::ExecuteOptions;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Expiry of cached refresh-key results.
const KEY_QUERY_EXPIRE: Duration = Duration::from_secs(60 * 60);

/// Default refresh-key renewal threshold in seconds.
const DEFAULT_KEY_RENEWAL_THRESHOLD: u64 = 2 * 60;

/// Priority of background content refreshes.
const REFRESH_PRIORITY: i32 = 0;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Per-load behavior of a loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadOptions {
    /// Block on stale content instead of serving the previous version.
    pub wait_for_renew: bool,
    /// Rebuild even when the content version is current.
    pub force_build: bool,
    /// Caller correlation identifier.
    pub request_id: Option<String>,
    /// Serve only tables built elsewhere.
    pub external_refresh: bool,
    /// Maximum partitions per pre-aggregation.
    pub max_partitions: usize,
    /// Maximum rows downloaded from a source in one go.
    pub max_source_row_limit: u64,
}

// ============================================================================
// SECTION: Load Cache
// ============================================================================

/// Request-scoped memo of table listings and refresh-key results.
pub(crate) struct LoadCache {
    /// Engine providing drivers and the query cache.
    engine: PreAggregations,
    /// Data source the memo belongs to.
    data_source: String,
    /// Caller correlation identifier.
    request_id: Option<String>,
    /// Table listings by [`LoadCache::tables_cache_key`].
    tables: Mutex<HashMap<String, Vec<String>>>,
    /// Refresh-key results by query cache key.
    key_query_results: Mutex<HashMap<String, Value>>,
}

impl LoadCache {
    /// Creates an empty memo.
    pub(crate) fn new(engine: PreAggregations, data_source: &str, request_id: Option<String>) -> Self {
        Self {
            engine,
            data_source: data_source.to_string(),
            request_id,
            tables: Mutex::new(HashMap::new()),
            key_query_results: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the key of the listing a description's tables live in.
    pub(crate) fn tables_cache_key(&self, description: &PreAggregationDescription) -> String {
        let store = if description.external { "external".to_string() } else { description.data_source.clone() };
        format!("{store}:{}", description.pre_aggregations_schema)
    }

    /// Lists the tables of a description's schema, once per request.
    async fn get_tables(&self, description: &PreAggregationDescription) -> Result<Vec<String>, PreAggregationError> {
        let key = self.tables_cache_key(description);
        let cached = self.tables.lock().map_err(|_| poisoned("load cache"))?.get(&key).cloned();
        if let Some(tables) = cached {
            return Ok(tables);
        }
        let driver = self.engine.table_driver(description).await?;
        let tables = driver.get_tables_query(&description.pre_aggregations_schema).await?;
        self.tables.lock().map_err(|_| poisoned("load cache"))?.insert(key, tables.clone());
        Ok(tables)
    }

    /// Returns the version entries of a description's schema.
    pub(crate) async fn get_version_entries(
        &self,
        description: &PreAggregationDescription,
    ) -> Result<VersionEntries, PreAggregationError> {
        let tables = self.get_tables(description).await?;
        let entries = tables_to_version_entries(&description.pre_aggregations_schema, &tables);
        Ok(VersionEntries::from_sorted(entries))
    }

    /// Forgets the listing of a description's schema.
    fn reset(&self, description: &PreAggregationDescription) -> Result<(), PreAggregationError> {
        let key = self.tables_cache_key(description);
        self.tables.lock().map_err(|_| poisoned("load cache"))?.remove(&key);
        Ok(())
    }

    /// Returns true when a refresh-key query already ran in this request.
    fn has_key_query_result(&self, query: &QueryWithParams) -> bool {
        self.key_query_results.lock().is_ok_and(|results| results.contains_key(&query.cache_key().to_string()))
    }

    /// Runs a refresh-key query through the query cache.
    pub(crate) async fn key_query_result(
        &self,
        query: &QueryWithParams,
        wait_for_renew: bool,
        priority: i32,
    ) -> Result<Value, PreAggregationError> {
        let cache_key = query.cache_key();
        let memo_key = cache_key.to_string();
        let cached = self.key_query_results.lock().map_err(|_| poisoned("load cache"))?.get(&memo_key).cloned();
        if let Some(value) = cached {
            return Ok(value);
        }
        let cache = self.engine.cache();
        let renewal_threshold = cache
            .options()
            .refresh_key_renewal_threshold
            .or(query.options.renewal_threshold)
            .unwrap_or(DEFAULT_KEY_RENEWAL_THRESHOLD);
        let options = CacheQueryOptions {
            renewal_threshold: Some(renewal_threshold),
            renewal_key: Some(cache_key.clone()),
            priority: Some(priority),
            external: query.options.external,
            request_id: self.request_id.clone(),
            data_source: self.data_source.clone(),
            wait_for_renew,
            use_in_memory: true,
            ..CacheQueryOptions::default()
        };
        let value = cache.cache_query_result(query, &cache_key, KEY_QUERY_EXPIRE, options).await?;
        self.key_query_results.lock().map_err(|_| poisoned("load cache"))?.insert(memo_key, value.clone());
        Ok(value)
    }
}

/// Builds the error of a poisoned mutex.
fn poisoned(name: &str) -> StoreError {
    StoreError::Store(format!("{name} mutex poisoned"))
}

// ============================================================================
// SECTION: Build Strategies
// ============================================================================

/// How a table gets materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildStrategy {
    /// `CREATE TABLE AS` inside the source database.
    StoreInSource,
    /// Build in the source, copy to the external store.
    ExternalWrite {
        /// Materialize into a source temp table before downloading.
        with_temp_table: bool,
        /// Drop the source temp table afterwards.
        drop_source_temp_table: bool,
    },
    /// Download query results from a read-only source into the external store.
    ExternalReadOnly,
}

impl BuildStrategy {
    /// Selects the strategy for a description and its source.
    pub(crate) fn select(
        description: &PreAggregationDescription,
        source_read_only: bool,
        source: DriverCapabilities,
    ) -> Result<Self, PreAggregationError> {
        let read_only = description.read_only || source_read_only;
        match (description.external, read_only) {
            (false, true) => Err(PreAggregationError::InvalidConfiguration(format!(
                "pre-aggregation {} can't be built in a read-only source without an external store",
                description.table_name
            ))),
            (false, false) => Ok(Self::StoreInSource),
            (true, true) => Ok(Self::ExternalReadOnly),
            (true, false) => Ok(Self::ExternalWrite {
                with_temp_table: !source.unload_without_temp_table,
                drop_source_temp_table: !source.streaming_source,
            }),
        }
    }
}

// ============================================================================
// SECTION: Loader
// ============================================================================

/// Resolves and builds one pre-aggregation.
#[derive(Clone)]
pub(crate) struct PreAggregationLoader {
    /// Engine providing drivers, queues, and table bookkeeping.
    engine: PreAggregations,
    /// Pre-aggregation (or partition) being loaded.
    description: PreAggregationDescription,
    /// Tables resolved earlier in the same request.
    tables: Vec<LoadPreAggregationResult>,
    /// Request-scoped memo.
    load_cache: Arc<LoadCache>,
    /// Load behavior.
    options: LoadOptions,
}

impl PreAggregationLoader {
    /// Creates a loader.
    pub(crate) fn new(
        engine: PreAggregations,
        description: PreAggregationDescription,
        tables: Vec<LoadPreAggregationResult>,
        load_cache: Arc<LoadCache>,
        options: LoadOptions,
    ) -> Result<Self, PreAggregationError> {
        if options.external_refresh && options.wait_for_renew {
            return Err(renew_with_external_refresh());
        }
        Ok(Self { engine, description, tables, load_cache, options })
    }

    /// Returns the build priority with a fallback.
    fn priority(&self, default: i32) -> i32 {
        self.description.priority_or(default)
    }

    /// Resolves the table to read from.
    ///
    /// In external-refresh mode returns `Ok(None)` for a missing table
    /// unless `throw_on_missing` is set. A sealed partition with a built
    /// table is served without evaluating its refresh keys.
    pub(crate) async fn load_pre_aggregation(
        &self,
        throw_on_missing: bool,
    ) -> Result<Option<LoadPreAggregationResult>, PreAggregationError> {
        if !self.options.force_build && self.description.is_sealed(now_utc()) {
            let structure_version = self.description.structure_version()?;
            let entries = self.load_cache.get_version_entries(&self.description).await?;
            if let Some(entry) = entries.by_structure.get(&format!("{}_{structure_version}", self.description.table_name)) {
                self.engine.emit(
                    &OrchestratorEvent::info("Using sealed pre-aggregation partition")
                        .with("target_table_name", entry.target_table_name())
                        .with("seal_at", self.description.seal_at.clone())
                        .with("request_id", self.options.request_id.clone()),
                );
                self.touch(&entry.target_table_name()).await;
                return Ok(Some(self.result_for(entry, Vec::new())));
            }
        }
        let has_unloaded_key = self
            .description
            .invalidate_key_queries
            .iter()
            .any(|query| !self.load_cache.has_key_query_result(query));
        if !self.options.external_refresh && (self.options.force_build || !has_unloaded_key || self.options.wait_for_renew)
        {
            return self.load_with_keys().await.map(Some);
        }
        let structure_version = self.description.structure_version()?;
        let entries = self.load_cache.get_version_entries(&self.description).await?;
        let by_structure = entries.by_structure.get(&format!("{}_{structure_version}", self.description.table_name));
        if self.options.external_refresh {
            let Some(entry) = by_structure else {
                if throw_on_missing {
                    return Err(PreAggregationError::NotBuilt(no_partitions_built_message(&[
                        expected_table_name_pattern(&self.description),
                    ])));
                }
                return Ok(None);
            };
            return Ok(Some(self.result_for(entry, Vec::new())));
        }
        if let Some(entry) = by_structure {
            let loader = self.clone();
            tokio::spawn(async move {
                if let Err(err) = loader.load_with_keys().await
                    && !err.is_continue_wait()
                {
                    loader.engine.emit(
                        &OrchestratorEvent::error("Error loading pre-aggregation")
                            .with("table", loader.description.table_name.clone())
                            .with("error", err.to_string())
                            .with("request_id", loader.options.request_id.clone()),
                    );
                }
            });
            self.touch(&entry.target_table_name()).await;
            return Ok(Some(self.result_for(entry, Vec::new())));
        }
        self.load_with_keys().await.map(Some)
    }

    /// Builds a load result for a version entry.
    fn result_for(&self, entry: &VersionEntry, refresh_key_values: Vec<Value>) -> LoadPreAggregationResult {
        LoadPreAggregationResult {
            table_name: self.description.table_name.clone(),
            target_table_name: entry.target_table_name(),
            refresh_key_values,
            last_updated_at: entry.last_updated_at,
            rollup_lambda_id: self.description.rollup_lambda_id.clone(),
            build_range_end: self.description.build_range_end.clone(),
        }
    }

    /// Resolves the refresh-key values of the whole pre-aggregation.
    async fn invalidation_key_values(&self) -> Result<Vec<Value>, PreAggregationError> {
        self.key_values(&self.description.invalidate_key_queries).await
    }

    /// Resolves the refresh-key values selecting this partition's content.
    pub(crate) async fn partition_invalidation_key_values(&self) -> Result<Vec<Value>, PreAggregationError> {
        match &self.description.partition_invalidate_key_queries {
            Some(queries) => self.key_values(queries).await,
            None => self.invalidation_key_values().await,
        }
    }

    /// Runs refresh-key queries in order.
    async fn key_values(&self, queries: &[QueryWithParams]) -> Result<Vec<Value>, PreAggregationError> {
        let priority = self.priority(DEFAULT_PRE_AGGREGATION_PRIORITY);
        let mut values = Vec::with_capacity(queries.len());
        for query in queries {
            values.push(self.load_cache.key_query_result(query, self.options.wait_for_renew, priority).await?);
        }
        Ok(values)
    }

    /// Records a read of a table, logging store failures.
    async fn touch(&self, target_table_name: &str) {
        if let Err(err) = self.engine.update_last_touch(target_table_name).await {
            self.engine.emit(
                &OrchestratorEvent::error("Error on pre-aggregation touch")
                    .with("table", target_table_name.to_string())
                    .with("error", err.to_string()),
            );
        }
    }

    /// Resolves the table with fresh refresh-key values, building when the
    /// current version is unusable.
    async fn load_with_keys(&self) -> Result<LoadPreAggregationResult, PreAggregationError> {
        let invalidation_keys = self.partition_invalidation_key_values().await?;
        let content_version = self.description.content_version(&invalidation_keys)?;
        let structure_version = self.description.structure_version()?;
        let table_name = &self.description.table_name;
        let entries = self.load_cache.get_version_entries(&self.description).await?;
        let refresh_key_values = self.invalidation_key_values().await?;

        if !self.options.force_build
            && let Some(entry) = entries.by_content.get(&format!("{table_name}_{content_version}"))
        {
            self.touch(&entry.target_table_name()).await;
            return Ok(self.result_for(entry, refresh_key_values));
        }
        let by_structure = entries.by_structure.get(&format!("{table_name}_{structure_version}"));
        if !self.options.wait_for_renew
            && !self.options.force_build
            && let Some(entry) = by_structure
        {
            self.touch(&entry.target_table_name()).await;
            return Ok(self.result_for(entry, refresh_key_values));
        }

        let client = self.engine.table_driver(&self.description).await?;
        if entries.versions.is_empty() {
            client.create_schema_if_not_exists(&self.description.pre_aggregations_schema).await?;
        }
        let version_entry = by_structure.or_else(|| entries.by_table_name.get(table_name)).cloned();
        let new_entry = VersionEntry {
            table_name: table_name.clone(),
            content_version,
            structure_version,
            last_updated_at: client.now_timestamp().await?,
            naming_version: NamingVersion::V2,
        };

        let (message, priority) = if self.options.force_build {
            ("Force build pre-aggregation", self.priority(DEFAULT_PRE_AGGREGATION_PRIORITY))
        } else {
            match &version_entry {
                None => ("Creating pre-aggregation from scratch", self.priority(DEFAULT_PRE_AGGREGATION_PRIORITY)),
                Some(entry) if entry.structure_version != new_entry.structure_version => {
                    ("Invalidating pre-aggregation structure", self.priority(DEFAULT_PRE_AGGREGATION_PRIORITY))
                }
                Some(entry) if entry.content_version != new_entry.content_version && self.options.wait_for_renew => {
                    ("Waiting for pre-aggregation renew", self.priority(REFRESH_PRIORITY))
                }
                Some(entry) => {
                    if entry.content_version != new_entry.content_version {
                        self.schedule_refresh(invalidation_keys, new_entry);
                    }
                    self.touch(&entry.target_table_name()).await;
                    return Ok(self.result_for(entry, refresh_key_values));
                }
            }
        };
        self.emit_build(message, &new_entry);
        self.execute_in_queue(&invalidation_keys, priority, &new_entry).await?;
        let mut result = self.most_recent(&new_entry.content_version).await?;
        result.refresh_key_values = refresh_key_values;
        Ok(result)
    }

    /// Logs a build decision.
    fn emit_build(&self, message: &'static str, new_entry: &VersionEntry) {
        self.engine.emit(
            &OrchestratorEvent::info(message)
                .with("table", self.description.table_name.clone())
                .with("target_table_name", new_entry.target_table_name())
                .with("request_id", self.options.request_id.clone()),
        );
    }

    /// Queues a content refresh without waiting for it.
    fn schedule_refresh(&self, invalidation_keys: Vec<Value>, new_entry: VersionEntry) {
        self.emit_build("Refreshing pre-aggregation content", &new_entry);
        let loader = self.clone();
        tokio::spawn(async move {
            let priority = loader.priority(REFRESH_PRIORITY);
            if let Err(err) = loader.execute_in_queue(&invalidation_keys, priority, &new_entry).await
                && !err.is_continue_wait()
            {
                loader.engine.emit(
                    &OrchestratorEvent::error("Error refreshing pre-aggregation")
                        .with("table", loader.description.table_name.clone())
                        .with("error", err.to_string()),
                );
            }
        });
    }

    /// Re-lists the schema and returns the freshly built table.
    async fn most_recent(&self, content_version: &str) -> Result<LoadPreAggregationResult, PreAggregationError> {
        self.load_cache.reset(&self.description)?;
        let entries = self.load_cache.get_version_entries(&self.description).await?;
        let table_name = &self.description.table_name;
        let entry = entries
            .by_content
            .get(&format!("{table_name}_{content_version}"))
            .ok_or_else(|| PreAggregationError::TableNotFound(table_name.clone()))?;
        self.touch(&entry.target_table_name()).await;
        Ok(self.result_for(entry, Vec::new()))
    }

    /// Returns the build queue key for a set of invalidation keys.
    fn query_key(&self, invalidation_keys: &[Value]) -> QueryKey {
        let load_sql = self.description.load_sql.cache_key();
        if self.description.indexes_sql.is_empty() {
            QueryKey::new(json!([load_sql, invalidation_keys]))
        } else {
            let indexes: Vec<Value> = self
                .description
                .indexes_sql
                .iter()
                .map(|index| json!([index.index_name, index.sql.cache_key()]))
                .collect();
            QueryKey::new(json!([load_sql, indexes, invalidation_keys]))
        }
    }

    /// Builds `new_entry` through the data source's build queue.
    async fn execute_in_queue(
        &self,
        invalidation_keys: &[Value],
        priority: i32,
        new_entry: &VersionEntry,
    ) -> Result<(), PreAggregationError> {
        let queue = self.engine.get_queue(&self.description.data_source)?;
        let job = BuildJob {
            description: self.description.clone(),
            tables: self.tables.clone(),
            new_version_entry: new_entry.clone(),
            request_id: self.options.request_id.clone(),
        };
        let payload = serde_json::to_value(&job).map_err(|err| CacheError::Invalid(err.to_string()))?;
        let options = ExecuteOptions {
            stage_key: Some(self.description.table_name.clone()),
            request_id: self.options.request_id.clone(),
        };
        queue.execute_in_queue(HandlerType::Query, &self.query_key(invalidation_keys), payload, priority, options).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------------

    /// Returns the load SQL rewritten to create `target`.
    fn target_load_sql(&self, target: &str) -> QueryWithParams {
        let mut query = replace_pre_aggregation_table_names(&self.description.load_sql, &self.tables);
        query.sql = query.sql.replace(&self.description.table_name, target);
        query
    }

    /// Returns the plain select query of the pre-aggregation.
    fn select_sql(&self) -> QueryWithParams {
        let base = self.description.sql.as_ref().unwrap_or(&self.description.load_sql);
        replace_pre_aggregation_table_names(base, &self.tables)
    }

    /// Returns index statements rewritten for the new table.
    fn prepare_indexes(&self, new_entry: &VersionEntry) -> Vec<IndexDescription> {
        let target = new_entry.target_table_name();
        self.description
            .indexes_sql
            .iter()
            .map(|index| {
                let index_entry = VersionEntry { table_name: index.index_name.clone(), ..new_entry.clone() };
                let mut sql = replace_pre_aggregation_table_names(&index.sql, &self.tables);
                sql.sql = sql
                    .sql
                    .replace(&self.description.table_name, &target)
                    .replace(&index.index_name, &index_entry.target_table_name());
                IndexDescription { index_name: index_entry.target_table_name(), sql }
            })
            .collect()
    }

    /// Returns the download options of this pre-aggregation.
    fn download_options(&self, csv: bool) -> DownloadOptions {
        DownloadOptions {
            stream_offset: self.description.stream_offset,
            max_source_row_limit: self.options.max_source_row_limit,
            csv,
        }
    }

    /// Materializes `new_entry` with the strategy matching the drivers.
    ///
    /// Orphaned tables are swept whether or not the build succeeds.
    pub(crate) async fn refresh(
        &self,
        new_entry: &VersionEntry,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        let target = new_entry.target_table_name();
        self.touch(&target).await;
        let source = self.engine.source_driver(&self.description.data_source).await?;
        let strategy = BuildStrategy::select(&self.description, source.read_only(), source.capabilities())?;
        match strategy {
            BuildStrategy::StoreInSource => {
                let built = self.store_in_source(&source, new_entry, cancel).await;
                let swept = self.engine.drop_orphaned_tables(&source, &self.description, &target, false, cancel).await;
                built.and(swept)
            }
            BuildStrategy::ExternalWrite { with_temp_table, drop_source_temp_table } => {
                let built = self.external_write(&source, new_entry, with_temp_table, cancel).await;
                let cleaned = self.cleanup_source(&source, &target, with_temp_table && drop_source_temp_table, cancel).await;
                built.and(cleaned)
            }
            BuildStrategy::ExternalReadOnly => self.external_read_only(&source, new_entry, cancel).await,
        }
    }

    /// Builds the table inside the source and creates its indexes.
    async fn store_in_source(
        &self,
        source: &Arc<dyn Driver>,
        new_entry: &VersionEntry,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        let target = new_entry.target_table_name();
        let load_sql = self.target_load_sql(&target);
        self.emit_sql(&load_sql, &target);
        source.load_pre_aggregation_into_table(&target, &load_sql, cancel).await?;
        let meta = QueryMeta { request_id: self.options.request_id.clone() };
        for index in self.prepare_indexes(new_entry) {
            self.engine.emit(
                &OrchestratorEvent::info("Creating pre-aggregation index")
                    .with("table", target.clone())
                    .with("index", index.index_name.clone()),
            );
            source.query(&index.sql, &meta, cancel).await?;
        }
        Ok(())
    }

    /// Logs the statement that materializes a table.
    fn emit_sql(&self, query: &QueryWithParams, target: &str) {
        self.engine.emit(
            &OrchestratorEvent::info("Executing Load Pre Aggregation SQL")
                .with("target_table_name", target.to_string())
                .with("sql", query.sql.clone())
                .with("request_id", self.options.request_id.clone()),
        );
    }

    /// Builds in the source (or streams a query) and copies into the external store.
    async fn external_write(
        &self,
        source: &Arc<dyn Driver>,
        new_entry: &VersionEntry,
        with_temp_table: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        let target = new_entry.target_table_name();
        let external = self.engine.external_driver().await?;
        let csv = external.capabilities().csv_import && source.capabilities().unload;
        let options = self.download_options(csv);
        self.engine.emit(&OrchestratorEvent::info("Downloading external pre-aggregation").with("table", target.clone()));
        let data = if with_temp_table {
            source.create_schema_if_not_exists(&self.description.pre_aggregations_schema).await?;
            let load_sql = self.target_load_sql(&target);
            self.emit_sql(&load_sql, &target);
            source.load_pre_aggregation_into_table(&target, &load_sql, cancel).await?;
            if csv {
                source.unload(&target, None, &options, cancel).await?
            } else {
                source.download_table(&target, &options, cancel).await?
            }
        } else {
            let query = self.select_sql();
            self.emit_sql(&query, &target);
            if csv {
                source.unload(&target, Some(&query), &options, cancel).await?
            } else {
                source.download_query_results(&query, &options, cancel).await?
            }
        };
        let columns = match data.types() {
            Some(types) => types.to_vec(),
            None if with_temp_table => source.table_column_types(&target).await?,
            None => self.declared_columns()?,
        };
        self.upload(&external, new_entry, columns, data, cancel).await
    }

    /// Copies query results of a read-only source into the external store.
    async fn external_read_only(
        &self,
        source: &Arc<dyn Driver>,
        new_entry: &VersionEntry,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        let target = new_entry.target_table_name();
        let external = self.engine.external_driver().await?;
        let csv = external.capabilities().csv_import && source.capabilities().unload;
        let options = self.download_options(csv);
        let query = self.select_sql();
        self.emit_sql(&query, &target);
        self.engine.emit(
            &OrchestratorEvent::info("Downloading external pre-aggregation via query").with("table", target.clone()),
        );
        let downloaded = if csv {
            source.unload(&target, Some(&query), &options, cancel).await
        } else {
            source.download_query_results(&query, &options, cancel).await
        };
        let data = downloaded.inspect_err(|err| {
            self.engine.emit(
                &OrchestratorEvent::error("Downloading external pre-aggregation via query error")
                    .with("table", target.clone())
                    .with("error", err.to_string()),
            );
        })?;
        let columns = match data.types() {
            Some(types) => types.to_vec(),
            None => self.declared_columns()?,
        };
        self.upload(&external, new_entry, columns, data, cancel).await
    }

    /// Returns the declared output columns.
    fn declared_columns(&self) -> Result<Vec<TableColumn>, PreAggregationError> {
        self.description.output_column_types.clone().ok_or_else(|| {
            DriverError::Query(format!("unable to detect column types for {}", self.description.table_name)).into()
        })
    }

    /// Uploads downloaded data to the external store and sweeps it.
    async fn upload(
        &self,
        external: &Arc<dyn Driver>,
        new_entry: &VersionEntry,
        columns: Vec<TableColumn>,
        data: DownloadedTable,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        let target = new_entry.target_table_name();
        self.engine.emit(&OrchestratorEvent::info("Uploading external pre-aggregation").with("table", target.clone()));
        external.create_schema_if_not_exists(&self.description.pre_aggregations_schema).await?;
        let indexes = self.prepare_indexes(new_entry);
        let options = UploadOptions { seal_at: self.description.seal_at.clone() };
        let uploaded = external.upload_table_with_indexes(&target, &columns, data, &indexes, &options, cancel).await;
        if let Err(err) = &uploaded {
            self.engine.emit(
                &OrchestratorEvent::error("Uploading external pre-aggregation error")
                    .with("table", target.clone())
                    .with("error", err.to_string()),
            );
        }
        uploaded?;
        self.engine.emit(
            &OrchestratorEvent::info("Uploading external pre-aggregation completed").with("table", target.clone()),
        );
        self.engine.drop_orphaned_tables(external, &self.description, &target, true, cancel).await
    }

    /// Drops the source temp table and sweeps the source schema.
    async fn cleanup_source(
        &self,
        source: &Arc<dyn Driver>,
        target: &str,
        drop_temp_table: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        if drop_temp_table {
            let lock_key = format!("drop-temp-table:{}:{target}", self.description.data_source);
            let schema = &self.description.pre_aggregations_schema;
            self.engine
                .cache()
                .with_lock(&lock_key, DROP_LOCK_TTL, cancel, |_| async move {
                    self.engine
                        .emit(&OrchestratorEvent::info("Dropping source temp table").with("table", target.to_string()));
                    let tables = source.get_tables_query(schema).await?;
                    if tables.iter().any(|table| format!("{schema}.{table}") == target) {
                        source.drop_table(target).await?;
                    }
                    Ok::<(), PreAggregationError>(())
                })
                .await?;
        }
        self.engine.drop_orphaned_tables(source, &self.description, target, false, cancel).await
    }
}
