// crates/query-orchestrator-core/src/runtime/pre_aggregations.rs
// ============================================================================
// Module: Pre-Aggregations
// Description: Pre-aggregation loading, build queueing, and table lifecycle.
// Purpose: Resolve materialized tables for queries and keep the schema tidy.
// Dependencies: lru, tokio-util, crate::{core, interfaces, runtime::{cache, loader, partitions, queue}}
// ============================================================================

//! ## Overview
//! [`PreAggregations`] is the entry point of the pre-aggregation engine. For
//! each query it resolves every referenced pre-aggregation to a physical
//! table, building missing or stale tables through the per-data-source
//! queue `SQL_PRE_AGGREGATIONS_<prefix>_<dataSource>`.
//!
//! Built tables are never rewritten in place. A build creates a new table
//! and the orphaned-table sweep later drops superseded versions, keeping
//! tables recently marked as used by queries and, in drop-without-touch
//! mode, only tables touched by reads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::hashing::HashError;
use crate::core::pre_aggregation::LoadPreAggregationResult;
use crate::core::pre_aggregation::PreAggregationDescription;
use crate::core::pre_aggregation::VersionEntry;
use crate::core::pre_aggregation::tables_to_version_entries;
use crate::core::query::DEFAULT_DATA_SOURCE;
use crate::core::query::QueryDescriptor;
use crate::core::queue::QueryDef;
use crate::core::queue::QueryKey;
use crate::core::queue::QueuedQuery;
use crate::core::ranges::RangeError;
use crate::core::time::TimeError;
use crate::core::time::unix_millis;
use crate::interfaces::Driver;
use crate::interfaces::DriverError;
use crate::interfaces::HandlerContext;
use crate::interfaces::HandlerError;
use crate::interfaces::OrchestratorEvent;
use crate::interfaces::QueryHandler;
use crate::interfaces::QueueHandlers;
use crate::interfaces::StoreError;
use crate::runtime::cache::CacheError;
use crate::runtime::cache::QueryCache;
use crate::runtime::loader::LoadCache;
use crate::runtime::loader::LoadOptions;
use crate::runtime::loader::PreAggregationLoader;
use crate::runtime::memory::duration_millis;
use crate::runtime::partitions::PartitionRangeLoader;
use crate::runtime::partitions::range_query_cache_key;
use crate::runtime::queue::QueryQueue;
use crate::runtime::queue::QueueError;
use crate::runtime::queue::QueueOptions;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default maximum partitions per pre-aggregation.
pub const DEFAULT_MAX_PARTITIONS: usize = 10_000;

/// Default maximum rows downloaded from a source in one go.
pub const DEFAULT_MAX_SOURCE_ROW_LIMIT: u64 = 10_000;

/// TTL of the drop locks.
pub const DROP_LOCK_TTL: Duration = Duration::from_secs(300);

/// Cache store catalog of used-table markers.
const TABLES_USED_KEY: &str = "SQL_PRE_AGGREGATIONS_TABLES_USED";

/// Cache store catalog of touched-table markers.
const TABLES_TOUCH_KEY: &str = "SQL_PRE_AGGREGATIONS_TABLES_TOUCH";

/// Cache store catalog of the refresh-end flag.
const REFRESH_END_REACHED_KEY: &str = "SQL_PRE_AGGREGATIONS_REFRESH_END_REACHED";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Pre-aggregation engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreAggregationError {
    /// Options contradict each other.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A required table has not been built by the refresh worker.
    #[error("{0}")]
    NotBuilt(String),
    /// Partition enumeration exceeded the configured limit.
    #[error(
        "Pre-aggregation '{table}' requested to build {requested} partitions which exceeds the maximum number of \
         partitions per pre-aggregation of {limit}"
    )]
    PartitionCountExceeded {
        /// Pre-aggregation table name.
        table: String,
        /// Number of partitions the range implies.
        requested: u64,
        /// Configured limit.
        limit: usize,
    },
    /// A date range was malformed.
    #[error(transparent)]
    MalformedRange(#[from] RangeError),
    /// A build finished but its table is missing from the listing.
    #[error("Pre-aggregation table is not found for {0} after it was successfully created")]
    TableNotFound(String),
    /// Driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Build queue failed or asked the caller to continue waiting.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Query cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Local time arithmetic failed.
    #[error(transparent)]
    Time(#[from] TimeError),
    /// Version hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Cache store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A concurrent load task panicked or was aborted.
    #[error("pre-aggregation load task failed: {0}")]
    Task(String),
}

impl PreAggregationError {
    /// Returns true for the non-terminal polling signal.
    #[must_use]
    pub const fn is_continue_wait(&self) -> bool {
        match self {
            Self::Queue(err) => err.is_continue_wait(),
            Self::Cache(err) => err.is_continue_wait(),
            _ => false,
        }
    }
}

impl From<PreAggregationError> for HandlerError {
    fn from(err: PreAggregationError) -> Self {
        match err {
            PreAggregationError::Driver(DriverError::Cancelled) => Self::Cancelled(err.to_string()),
            PreAggregationError::Driver(driver) => Self::Driver(driver),
            PreAggregationError::Store(store) => Self::Store(store),
            other => Self::Failed(other.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Pre-aggregation engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreAggregationsOptions {
    /// Maximum partitions one pre-aggregation may enumerate.
    pub max_partitions: usize,
    /// Maximum rows downloaded from a source in one go.
    pub max_source_row_limit: u64,
    /// Never build from the query path; serve only what a refresh worker built.
    pub external_refresh: bool,
    /// How long superseded structure versions are kept.
    pub structure_version_persist_time: Duration,
    /// TTL of touch markers.
    pub touch_table_persist_time: Duration,
    /// TTL of used-table markers.
    pub used_table_persist_time: Duration,
    /// Keep only used and touched tables once the refresh end is reached.
    pub drop_without_touch: bool,
    /// Capacity of the in-process touch throttle.
    pub touch_cache_capacity: usize,
    /// How long a touch suppresses repeated store writes.
    pub touch_cache_max_age: Duration,
    /// Tuning of the build queues.
    pub queue_options: QueueOptions,
}

impl Default for PreAggregationsOptions {
    fn default() -> Self {
        Self {
            max_partitions: DEFAULT_MAX_PARTITIONS,
            max_source_row_limit: DEFAULT_MAX_SOURCE_ROW_LIMIT,
            external_refresh: false,
            structure_version_persist_time: Duration::from_secs(60 * 60 * 24 * 30),
            touch_table_persist_time: Duration::from_secs(60 * 60 * 24),
            used_table_persist_time: Duration::from_secs(600),
            drop_without_touch: false,
            touch_cache_capacity: 8192,
            touch_cache_max_age: Duration::from_secs(60),
            queue_options: QueueOptions { concurrency: 1, ..QueueOptions::default() },
        }
    }
}

// ============================================================================
// SECTION: Results
// ============================================================================

/// Tables resolved for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedPreAggregations {
    /// Resolved tables in descriptor order.
    pub tables: Vec<LoadPreAggregationResult>,
    /// Main query parameters with build-range placeholders substituted.
    pub values: Option<Vec<Value>>,
}

/// Partition expansion of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedPreAggregations {
    /// Descriptor whose pre-aggregations are the flattened partitions.
    pub descriptor: QueryDescriptor,
    /// Partitions grouped by their originating pre-aggregation.
    pub grouped: Vec<Vec<PreAggregationDescription>>,
}

/// Whether the build-range queries of a pre-aggregation are cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRangeCacheStatus {
    /// Checked pre-aggregation.
    pub pre_aggregation: PreAggregationDescription,
    /// True when no range query needs to run.
    pub is_cached: bool,
}

// ============================================================================
// SECTION: Build Jobs
// ============================================================================

/// Payload of a build queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BuildJob {
    /// Pre-aggregation (or partition) to build.
    pub description: PreAggregationDescription,
    /// Tables resolved before this one, for SQL rewriting.
    #[serde(default)]
    pub tables: Vec<LoadPreAggregationResult>,
    /// Version entry of the table to create.
    pub new_version_entry: VersionEntry,
    /// Caller correlation identifier.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Builds pre-aggregation tables dequeued from a build queue.
struct PreAggregationBuildHandler {
    /// Engine the handler builds for.
    engine: Weak<PreAggregationsInner>,
    /// Data source of the queue.
    data_source: String,
}

#[async_trait]
impl QueryHandler for PreAggregationBuildHandler {
    async fn execute(&self, payload: Value, context: HandlerContext) -> Result<Value, HandlerError> {
        let job: BuildJob = serde_json::from_value(payload).map_err(|err| HandlerError::Failed(err.to_string()))?;
        let inner =
            self.engine.upgrade().ok_or_else(|| HandlerError::Failed("pre-aggregation engine was dropped".to_string()))?;
        let engine = PreAggregations { inner };
        let load_cache = Arc::new(LoadCache::new(engine.clone(), &self.data_source, job.request_id.clone()));
        let options = LoadOptions { request_id: job.request_id.clone(), ..engine.load_options() };
        let target = job.new_version_entry.target_table_name();
        let loader = PreAggregationLoader::new(engine, job.description, job.tables, load_cache, options)?;
        loader.refresh(&job.new_version_entry, context.cancel_token()).await?;
        Ok(json!({ "target_table_name": target }))
    }
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Shared state of the engine.
struct PreAggregationsInner {
    /// Query cache providing drivers, queues, locks, and the cache store.
    cache: QueryCache,
    /// Engine tuning.
    options: PreAggregationsOptions,
    /// Recent touches by table name, in unix millis.
    touch_cache: Mutex<LruCache<String, i64>>,
}

/// Pre-aggregation engine.
#[derive(Clone)]
pub struct PreAggregations {
    /// Shared state.
    inner: Arc<PreAggregationsInner>,
}

impl PreAggregations {
    /// Creates the engine on top of a query cache.
    #[must_use]
    pub fn new(cache: QueryCache, options: PreAggregationsOptions) -> Self {
        let capacity = NonZeroUsize::new(options.touch_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(PreAggregationsInner { cache, options, touch_cache: Mutex::new(LruCache::new(capacity)) }),
        }
    }

    /// Returns the query cache.
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Returns the engine tuning.
    #[must_use]
    pub fn options(&self) -> &PreAggregationsOptions {
        &self.inner.options
    }

    /// Returns loader options derived from the engine tuning.
    pub(crate) fn load_options(&self) -> LoadOptions {
        LoadOptions {
            wait_for_renew: false,
            force_build: false,
            request_id: None,
            external_refresh: self.inner.options.external_refresh,
            max_partitions: self.inner.options.max_partitions,
            max_source_row_limit: self.inner.options.max_source_row_limit,
        }
    }

    /// Records an event.
    pub(crate) fn emit(&self, event: &OrchestratorEvent) {
        self.inner.cache.events().record(event);
    }

    // ------------------------------------------------------------------------
    // Drivers and queues
    // ------------------------------------------------------------------------

    /// Returns the source driver of a data source.
    pub(crate) async fn source_driver(&self, data_source: &str) -> Result<Arc<dyn Driver>, PreAggregationError> {
        Ok(self.inner.cache.driver_factory().driver(data_source).await?)
    }

    /// Returns the external store driver.
    pub(crate) async fn external_driver(&self) -> Result<Arc<dyn Driver>, PreAggregationError> {
        let factory = self.inner.cache.external_driver_factory().ok_or_else(|| {
            PreAggregationError::InvalidConfiguration("external pre-aggregations require an external driver".to_string())
        })?;
        Ok(factory.driver(DEFAULT_DATA_SOURCE).await?)
    }

    /// Returns the driver holding a pre-aggregation's tables.
    pub(crate) async fn table_driver(
        &self,
        description: &PreAggregationDescription,
    ) -> Result<Arc<dyn Driver>, PreAggregationError> {
        if description.external { self.external_driver().await } else { self.source_driver(&description.data_source).await }
    }

    /// Returns the build queue of a data source.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Cache`] when the queue cannot be opened.
    pub fn get_queue(&self, data_source: &str) -> Result<QueryQueue, PreAggregationError> {
        let name = format!("SQL_PRE_AGGREGATIONS_{}_{}", self.inner.cache.prefix(), data_source);
        let engine = Arc::downgrade(&self.inner);
        let handlers = || QueueHandlers {
            query: Arc::new(PreAggregationBuildHandler { engine, data_source: data_source.to_string() }),
            stream: None,
        };
        Ok(self.inner.cache.queue_with_handlers(&name, self.inner.options.queue_options, handlers)?)
    }

    /// Lists the build queue of a data source.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError`] when the queue cannot be read.
    pub async fn get_queue_state(&self, data_source: &str) -> Result<Vec<QueuedQuery>, PreAggregationError> {
        Ok(self.get_queue(data_source)?.get_queries().await?)
    }

    /// Cancels build queue entries by key.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError`] when the queue cannot be updated.
    pub async fn cancel_queries_from_queue(
        &self,
        query_keys: &[QueryKey],
        data_source: &str,
    ) -> Result<Vec<Option<QueryDef>>, PreAggregationError> {
        let queue = self.get_queue(data_source)?;
        let mut cancelled = Vec::with_capacity(query_keys.len());
        for key in query_keys {
            cancelled.push(queue.cancel_query(key).await?);
        }
        Ok(cancelled)
    }

    // ------------------------------------------------------------------------
    // Used and touched tables
    // ------------------------------------------------------------------------

    /// Returns the cache store key of a marker.
    fn marker_key(&self, catalog: &str, name: &str) -> String {
        format!("{catalog}_{}_{name}", self.inner.cache.prefix())
    }

    /// Lists marker names of a catalog.
    async fn marker_names(&self, catalog: &str) -> Result<Vec<String>, PreAggregationError> {
        let prefix = self.marker_key(catalog, "");
        let keys = self.inner.cache.cache_store().keys_by_prefix(&prefix).await?;
        Ok(keys.into_iter().filter_map(|key| key.strip_prefix(&prefix).map(str::to_string)).collect())
    }

    /// Marks a table as used by a query.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Store`] when the marker cannot be written.
    pub async fn add_table_used(&self, table_name: &str) -> Result<(), PreAggregationError> {
        let key = self.marker_key(TABLES_USED_KEY, table_name);
        self.inner.cache.cache_store().set(&key, Value::Bool(true), self.inner.options.used_table_persist_time).await?;
        Ok(())
    }

    /// Lists tables marked as used.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Store`] when the store cannot be read.
    pub async fn tables_used(&self) -> Result<Vec<String>, PreAggregationError> {
        self.marker_names(TABLES_USED_KEY).await
    }

    /// Records a read of a table, at most once per throttle window.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Store`] when the marker cannot be written.
    pub async fn update_last_touch(&self, table_name: &str) -> Result<(), PreAggregationError> {
        let now = unix_millis();
        let max_age = duration_millis(self.inner.options.touch_cache_max_age);
        {
            let mut touches = self
                .inner
                .touch_cache
                .lock()
                .map_err(|_| StoreError::Store("touch cache mutex poisoned".to_string()))?;
            if touches.get(table_name).is_some_and(|touched_at| now - *touched_at < max_age) {
                return Ok(());
            }
            touches.put(table_name.to_string(), now);
        }
        let key = self.marker_key(TABLES_TOUCH_KEY, table_name);
        let written =
            self.inner.cache.cache_store().set(&key, json!(now), self.inner.options.touch_table_persist_time).await;
        if let Err(err) = written {
            if let Ok(mut touches) = self.inner.touch_cache.lock() {
                touches.pop(table_name);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Lists tables touched within the touch TTL.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Store`] when the store cannot be read.
    pub async fn tables_touched(&self) -> Result<Vec<String>, PreAggregationError> {
        self.marker_names(TABLES_TOUCH_KEY).await
    }

    /// Records that a refresh worker reached the end of its refresh cycle.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Store`] when the flag cannot be written.
    pub async fn update_refresh_end_reached(&self) -> Result<(), PreAggregationError> {
        let key = self.marker_key(REFRESH_END_REACHED_KEY, "");
        self.inner
            .cache
            .cache_store()
            .set(&key, json!(unix_millis()), self.inner.options.touch_table_persist_time)
            .await?;
        Ok(())
    }

    /// Returns when the refresh end was last reached, in unix millis.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::Store`] when the store cannot be read.
    pub async fn get_refresh_end_reached(&self) -> Result<Option<i64>, PreAggregationError> {
        let key = self.marker_key(REFRESH_END_REACHED_KEY, "");
        Ok(self.inner.cache.cache_store().get(&key).await?.and_then(|value| value.as_i64()))
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Returns the load cache shared by pre-aggregations of one data source
    /// and schema.
    fn load_cache_for(
        &self,
        caches: &mut HashMap<String, Arc<LoadCache>>,
        description: &PreAggregationDescription,
        request_id: Option<&String>,
    ) -> Arc<LoadCache> {
        let key = format!("{}_{}", description.data_source, description.pre_aggregations_schema);
        Arc::clone(caches.entry(key).or_insert_with(|| {
            Arc::new(LoadCache::new(self.clone(), &description.data_source, request_id.cloned()))
        }))
    }

    /// Resolves every pre-aggregation of a descriptor to a table, building
    /// what is missing.
    ///
    /// Pre-aggregations load in order so later ones can reference the
    /// tables of earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError::InvalidConfiguration`] before any I/O
    /// when a renewal is requested in external-refresh mode, and any load
    /// failure otherwise.
    pub async fn load_all_pre_aggregations_if_needed(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<LoadedPreAggregations, PreAggregationError> {
        if self.inner.options.external_refresh && descriptor.renew_query {
            return Err(renew_with_external_refresh());
        }
        let mut caches = HashMap::new();
        let mut loaded = LoadedPreAggregations::default();
        let count = descriptor.pre_aggregations.len();
        for (index, description) in descriptor.pre_aggregations.iter().enumerate() {
            let is_last = index + 1 == count;
            let load_cache = self.load_cache_for(&mut caches, description, descriptor.request_id.as_ref());
            let options = LoadOptions {
                wait_for_renew: descriptor.renew_query,
                force_build: is_last && descriptor.force_build_pre_aggregations,
                request_id: descriptor.request_id.clone(),
                ..self.load_options()
            };
            let loader =
                PartitionRangeLoader::new(self.clone(), description.clone(), loaded.tables.clone(), load_cache, options);
            let result = loader.load_pre_aggregations().await?;
            if !result.target_table_name.starts_with('(') {
                self.add_table_used(&result.target_table_name).await?;
            }
            if is_last {
                loaded.values = loader.replace_query_build_range_params(&descriptor.params).await?;
            }
            loaded.tables.push(result);
        }
        Ok(loaded)
    }

    /// Reports whether each pre-aggregation's build-range queries already
    /// have cached results.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError`] when the cache store cannot be read.
    pub async fn check_partitions_build_range_cache(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<Vec<BuildRangeCacheStatus>, PreAggregationError> {
        let mut statuses = Vec::with_capacity(descriptor.pre_aggregations.len());
        for description in &descriptor.pre_aggregations {
            let is_cached = if description.partition_granularity.is_none() {
                true
            } else if let Some(queries) = &description.pre_aggregation_start_end_queries {
                let mut cached = true;
                for query in queries {
                    let key = range_query_cache_key(query);
                    cached &= self.inner.cache.last_refresh_time(&key).await?.is_some();
                }
                cached
            } else {
                false
            };
            statuses.push(BuildRangeCacheStatus { pre_aggregation: description.clone(), is_cached });
        }
        Ok(statuses)
    }

    /// Replaces every partitioned pre-aggregation of a descriptor with its
    /// partitions.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError`] when build ranges cannot be resolved
    /// or exceed the partition limit.
    pub async fn expand_partitions_in_pre_aggregations(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<ExpandedPreAggregations, PreAggregationError> {
        let mut caches = HashMap::new();
        let mut grouped = Vec::with_capacity(descriptor.pre_aggregations.len());
        for description in &descriptor.pre_aggregations {
            let load_cache = self.load_cache_for(&mut caches, description, descriptor.request_id.as_ref());
            let options = LoadOptions {
                wait_for_renew: descriptor.renew_query,
                request_id: descriptor.request_id.clone(),
                ..self.load_options()
            };
            let loader = PartitionRangeLoader::new(self.clone(), description.clone(), Vec::new(), load_cache, options);
            let mut partitions = loader.partition_pre_aggregations().await?;
            for partition in &mut partitions {
                partition.expanded_partition = true;
            }
            grouped.push(partitions);
        }
        let mut expanded = descriptor.clone();
        expanded.pre_aggregations = grouped.iter().flatten().cloned().collect();
        Ok(ExpandedPreAggregations { descriptor: expanded, grouped })
    }

    /// Returns the version entries of each distinct table listing the
    /// pre-aggregations live in.
    ///
    /// # Errors
    ///
    /// Returns [`PreAggregationError`] when a listing fails.
    pub async fn get_version_entries(
        &self,
        pre_aggregations: &[PreAggregationDescription],
        request_id: Option<&String>,
    ) -> Result<Vec<Vec<VersionEntry>>, PreAggregationError> {
        let mut caches = HashMap::new();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for description in pre_aggregations {
            let load_cache = self.load_cache_for(&mut caches, description, request_id);
            if !seen.insert(load_cache.tables_cache_key(description)) {
                continue;
            }
            entries.push(load_cache.get_version_entries(description).await?.versions);
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------------
    // Table lifecycle
    // ------------------------------------------------------------------------

    /// Drops tables superseded by newer builds under the schema's drop lock.
    ///
    /// Skips silently when another process holds the lock.
    pub(crate) async fn drop_orphaned_tables(
        &self,
        driver: &Arc<dyn Driver>,
        description: &PreAggregationDescription,
        just_created: &str,
        external: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PreAggregationError> {
        let lock_key = if external {
            "drop-orphaned-tables-external".to_string()
        } else {
            format!("drop-orphaned-tables:{}", description.data_source)
        };
        self.inner
            .cache
            .with_lock(&lock_key, DROP_LOCK_TTL, cancel, |token| {
                self.drop_orphaned_tables_locked(driver, description, just_created, token)
            })
            .await?;
        Ok(())
    }

    /// Body of [`Self::drop_orphaned_tables`] once the lock is held.
    async fn drop_orphaned_tables_locked(
        &self,
        driver: &Arc<dyn Driver>,
        description: &PreAggregationDescription,
        just_created: &str,
        cancel: CancellationToken,
    ) -> Result<(), PreAggregationError> {
        self.add_table_used(just_created).await?;
        let schema = &description.pre_aggregations_schema;
        let tables = driver.get_tables_query(schema).await?;
        let mut keep: HashSet<String> = self.tables_used().await?.into_iter().collect();
        keep.insert(just_created.to_string());
        let refresh_end_reached = self.get_refresh_end_reached().await?.is_some();
        if self.inner.options.drop_without_touch && refresh_end_reached {
            keep.extend(self.tables_touched().await?);
        } else {
            let now = unix_millis();
            let persist_ms = duration_millis(self.inner.options.structure_version_persist_time);
            let mut newest_tables = HashSet::new();
            let mut newest_structures = HashSet::new();
            for entry in tables_to_version_entries(schema, &tables) {
                let newest_of_table = newest_tables.insert(entry.table_name.clone());
                let newest_of_structure =
                    now - entry.last_updated_at < persist_ms && newest_structures.insert(entry.structure_key());
                if newest_of_table || newest_of_structure {
                    keep.insert(entry.target_table_name());
                }
            }
        }
        let to_drop: Vec<String> =
            tables.iter().map(|table| format!("{schema}.{table}")).filter(|table| !keep.contains(table)).collect();
        self.emit(
            &OrchestratorEvent::info("Dropping orphaned tables")
                .with("tables_to_drop", to_drop.clone())
                .with("data_source", description.data_source.clone()),
        );
        for table in &to_drop {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled.into());
            }
            self.emit(&OrchestratorEvent::info("Dropping table").with("table", table.clone()));
            driver.drop_table(table).await?;
        }
        self.emit(
            &OrchestratorEvent::info("Dropping orphaned tables completed")
                .with("dropped", to_drop.len())
                .with("data_source", description.data_source.clone()),
        );
        Ok(())
    }
}

/// Returns the error raised when a renewal is requested in external-refresh mode.
pub(crate) fn renew_with_external_refresh() -> PreAggregationError {
    PreAggregationError::InvalidConfiguration("renewQuery is not supported with externalRefresh".to_string())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
