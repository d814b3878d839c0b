// crates/query-orchestrator-core/src/runtime/cache.rs
// ============================================================================
// Module: Query Cache
// Description: Result caching, refresh-key renewal, and advisory locks.
// Purpose: Serve cached results and renew them once refresh keys change.
// Dependencies: lru, tokio, tokio-util, crate::{core, interfaces, runtime::queue}
// ============================================================================

//! ## Overview
//! [`QueryCache`] stores query results in the shared [`CacheStore`] under
//! `SQL_QUERY_RESULT_<prefix>_<hash>`, tagged with a renewal key built from
//! the current refresh-key values. A cached result is renewed when its
//! renewal key changes or it is older than the renewal threshold. Execution
//! always goes through a [`QueryQueue`] so concurrent callers share one
//! database round trip.
//!
//! The in-process LRU layer is read-through and disposable: it only avoids
//! repeating refresh-key lookups within their renewal threshold.
//!
//! [`QueryCache::with_lock`] provides skip-if-held advisory exclusivity on
//! top of [`CacheStore::try_lock`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashError;
use crate::core::hashing::hash_canonical_json;
use crate::core::pre_aggregation::LoadPreAggregationResult;
use crate::core::query::DEFAULT_DATA_SOURCE;
use crate::core::query::DEFAULT_EXPIRE_SECS;
use crate::core::query::DEFAULT_QUERY_PRIORITY;
use crate::core::query::QueryCacheKey;
use crate::core::query::QueryDescriptor;
use crate::core::query::QueryWithParams;
use crate::core::queue::HandlerType;
use crate::core::queue::QueryDef;
use crate::core::queue::QueryKey;
use crate::core::time::unix_millis;
use crate::interfaces::BackingStore;
use crate::interfaces::CacheStore;
use crate::interfaces::DriverError;
use crate::interfaces::DriverFactory;
use crate::interfaces::HandlerContext;
use crate::interfaces::HandlerError;
use crate::interfaces::OrchestratorEvent;
use crate::interfaces::OrchestratorEventSink;
use crate::interfaces::QueryHandler;
use crate::interfaces::QueryMeta;
use crate::interfaces::QueueHandlers;
use crate::interfaces::QueueMessenger;
use crate::interfaces::StoreError;
use crate::interfaces::StreamHandler;
use crate::interfaces::StreamSink;
use crate::runtime::queue::ExecuteOptions;
use crate::runtime::queue::QueryQueue;
use crate::runtime::queue::QueryStream;
use crate::runtime::queue::QueueError;
use crate::runtime::queue::QueueOptions;
use crate::runtime::queue::QueueOutput;
use crate::runtime::queue::QueueSetup;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default renewal threshold for refresh-key queries, in seconds.
pub const DEFAULT_REFRESH_KEY_RENEWAL_THRESHOLD: u64 = 2 * 60;

/// Default renewal threshold for main queries, in seconds.
pub const DEFAULT_MAIN_QUERY_RENEWAL_THRESHOLD: u64 = 6 * 60 * 60;

/// Default in-process cache capacity.
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 10_000;

/// Sentinel for a missing key part.
const UNDEFINED_PART: &str = "__undefined__";

/// Sentinel for a null key part.
const NULL_PART: &str = "__null__";

// ============================================================================
// SECTION: Options
// ============================================================================

/// Query cache tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheOptions {
    /// Overrides every refresh-key renewal threshold, in seconds.
    pub refresh_key_renewal_threshold: Option<u64>,
    /// Serve cached results immediately and renew in the background.
    pub background_renew: bool,
    /// In-process cache capacity.
    pub memory_cache_capacity: usize,
    /// Tuning of per-data-source queues.
    pub queue_options: QueueOptions,
    /// Tuning of the external queue.
    pub external_queue_options: QueueOptions,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            refresh_key_renewal_threshold: None,
            background_renew: false,
            memory_cache_capacity: DEFAULT_MEMORY_CACHE_CAPACITY,
            queue_options: QueueOptions::default(),
            external_queue_options: QueueOptions::default(),
        }
    }
}

/// Options of one [`QueryCache::cache_query_result`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheQueryOptions {
    /// Seconds a cached result stays fresh.
    pub renewal_threshold: Option<u64>,
    /// Value whose change forces a renewal.
    pub renewal_key: Option<Value>,
    /// Queue priority.
    pub priority: Option<i32>,
    /// Run on the external store.
    pub external: bool,
    /// Hash the queue key with a process-unique suffix.
    pub persistent: bool,
    /// Caller correlation identifier.
    pub request_id: Option<String>,
    /// Data source name.
    pub data_source: String,
    /// Block on renewal instead of serving the stale value.
    pub wait_for_renew: bool,
    /// Skip the cache entirely.
    pub force_no_cache: bool,
    /// Consult the in-process cache first.
    pub use_in_memory: bool,
}

impl Default for CacheQueryOptions {
    fn default() -> Self {
        Self {
            renewal_threshold: None,
            renewal_key: None,
            priority: None,
            external: false,
            persistent: false,
            request_id: None,
            data_source: DEFAULT_DATA_SOURCE.to_string(),
            wait_for_renew: false,
            force_no_cache: false,
            use_in_memory: false,
        }
    }
}

/// Options of one [`QueryCache::renew_query`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewOptions {
    /// Run the main query on the external store.
    pub external: bool,
    /// Hash the main queue key with a process-unique suffix.
    pub persistent: bool,
    /// Caller correlation identifier.
    pub request_id: Option<String>,
    /// Data source name.
    pub data_source: String,
    /// Serve cached refresh keys without waiting for their renewal.
    pub skip_refresh_key_wait_for_renew: bool,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Query cache errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Queue failed or asked the caller to continue waiting.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Cache store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Key hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Driver lookup failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Required collaborator is missing.
    #[error("query cache configuration error: {0}")]
    Configuration(String),
    /// Cached value cannot be decoded.
    #[error("query cache invalid entry: {0}")]
    Invalid(String),
}

impl CacheError {
    /// Returns true for the non-terminal polling signal.
    #[must_use]
    pub const fn is_continue_wait(&self) -> bool {
        matches!(self, Self::Queue(QueueError::ContinueWait))
    }
}

// ============================================================================
// SECTION: Results
// ============================================================================

/// Result of a cached query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedQueryResult {
    /// Query result.
    pub data: Value,
    /// Refresh-key values the result was validated against.
    #[serde(default)]
    pub refresh_key_values: Vec<Value>,
    /// Time the cached result was produced, unix milliseconds.
    #[serde(default)]
    pub last_refresh_time: Option<i64>,
}

/// Cache store representation of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedEntry {
    /// Unix milliseconds the result was stored.
    time: i64,
    /// Query result.
    result: Value,
    /// Renewal key the result was produced under.
    #[serde(default)]
    renewal_key: Option<String>,
}

/// In-process cache slot.
#[derive(Debug, Clone)]
struct MemoryEntry {
    /// Cached value.
    value: Value,
    /// Unix milliseconds after which the slot is stale.
    expires_at: i64,
}

// ============================================================================
// SECTION: Key Parts
// ============================================================================

/// One component of a [`fast_compute_cache_key`] key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    /// Missing component.
    Undefined,
    /// JSON component.
    Json(Value),
}

impl From<Value> for KeyPart {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Json(Value::String(value.to_string()))
    }
}

impl<T: Into<Value>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Undefined, |value| Self::Json(value.into()))
    }
}

/// Builds a colon-joined key from primitives.
///
/// Strings, numbers, and booleans are written as-is, arrays and objects as
/// JSON, and missing or null parts as sentinels. Not collision-free across
/// types; use only where a collision costs a cache miss.
#[must_use]
pub fn fast_compute_cache_key(parts: &[KeyPart]) -> String {
    parts
        .iter()
        .map(|part| match part {
            KeyPart::Undefined => UNDEFINED_PART.to_string(),
            KeyPart::Json(Value::Null) => NULL_PART.to_string(),
            KeyPart::Json(Value::String(text)) => text.clone(),
            KeyPart::Json(value @ (Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_))) => {
                value.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Returns `query` with every pre-aggregation table name replaced by its
/// resolved target table.
#[must_use]
pub fn replace_pre_aggregation_table_names(
    query: &QueryWithParams,
    tables: &[LoadPreAggregationResult],
) -> QueryWithParams {
    let sql = tables.iter().fold(query.sql.clone(), |sql, table| sql.replace(&table.table_name, &table.target_table_name));
    QueryWithParams { sql, params: query.params.clone(), options: query.options.clone() }
}

// ============================================================================
// SECTION: Locks
// ============================================================================

/// Releases an advisory lock, in the background if dropped unreleased.
struct LockRelease {
    /// Store holding the lock.
    store: Arc<dyn CacheStore>,
    /// Lock key.
    key: String,
    /// Lock owner.
    owner: String,
    /// True once released explicitly.
    released: bool,
}

impl LockRelease {
    /// Releases the lock now.
    async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.unlock(&self.key, &self.owner).await
    }
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            handle.spawn(async move {
                let _ = store.unlock(&key, &owner).await;
            });
        }
    }
}

// ============================================================================
// SECTION: Driver Query Handler
// ============================================================================

/// Queue payload of a SQL query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SqlQueryPayload {
    /// Query to run.
    query: QueryWithParams,
    /// Caller correlation identifier.
    #[serde(default)]
    request_id: Option<String>,
}

/// Runs SQL payloads against a data source driver.
struct DriverQueryHandler {
    /// Driver lookup.
    drivers: Arc<dyn DriverFactory>,
    /// Data source name.
    data_source: String,
    /// Log sink.
    events: Arc<dyn OrchestratorEventSink>,
    /// Cancellation tokens of running executions by handle id.
    handles: Mutex<HashMap<u64, CancellationToken>>,
    /// Handle id source.
    next_handle: AtomicU64,
}

impl DriverQueryHandler {
    /// Removes a handle, returning its token.
    fn take_handle(&self, id: u64) -> Option<CancellationToken> {
        self.handles.lock().ok().and_then(|mut handles| handles.remove(&id))
    }
}

#[async_trait]
impl QueryHandler for DriverQueryHandler {
    async fn execute(&self, payload: Value, context: HandlerContext) -> Result<Value, HandlerError> {
        let payload: SqlQueryPayload =
            serde_json::from_value(payload).map_err(|err| HandlerError::Failed(err.to_string()))?;
        let driver = self.drivers.driver(&self.data_source).await?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.handles
            .lock()
            .map_err(|_| HandlerError::Failed("query handle mutex poisoned".to_string()))?
            .insert(id, context.cancel_token().clone());
        context.set_cancel_handler(json!(id)).await?;
        self.events.record(
            &OrchestratorEvent::info("Executing SQL")
                .with("data_source", self.data_source.clone())
                .with("sql", payload.query.sql.clone())
                .with("request_id", payload.request_id.clone()),
        );
        let meta = QueryMeta { request_id: payload.request_id };
        let rows = driver.query(&payload.query, &meta, context.cancel_token()).await;
        self.take_handle(id);
        Ok(Value::Array(rows?.into_iter().map(Value::Object).collect()))
    }

    async fn cancel(&self, def: &QueryDef) -> Result<(), HandlerError> {
        if let Some(id) = def.cancel_handler.as_ref().and_then(Value::as_u64)
            && let Some(token) = self.take_handle(id)
        {
            token.cancel();
        }
        Ok(())
    }
}

/// Streams SQL payload rows from a data source driver.
struct DriverStreamHandler {
    /// Driver lookup.
    drivers: Arc<dyn DriverFactory>,
    /// Data source name.
    data_source: String,
    /// Log sink.
    events: Arc<dyn OrchestratorEventSink>,
}

#[async_trait]
impl StreamHandler for DriverStreamHandler {
    async fn stream(&self, payload: Value, sink: StreamSink, context: HandlerContext) -> Result<(), HandlerError> {
        let payload: SqlQueryPayload =
            serde_json::from_value(payload).map_err(|err| HandlerError::Failed(err.to_string()))?;
        let driver = self.drivers.driver(&self.data_source).await?;
        self.events.record(
            &OrchestratorEvent::info("Streaming SQL")
                .with("data_source", self.data_source.clone())
                .with("sql", payload.query.sql.clone())
                .with("request_id", payload.request_id.clone()),
        );
        driver.stream_query(&payload.query, &sink, context.cancel_token()).await?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Query Cache
// ============================================================================

/// Request to execute a query and store its result.
#[derive(Debug, Clone)]
struct FetchRequest {
    /// Query to run.
    query: QueryWithParams,
    /// Cache key identifying the query.
    cache_key: Value,
    /// Cache store key of the result.
    result_key: String,
    /// Renewal key stored with the result.
    renewal_key: Option<String>,
    /// Result expiry.
    expire: Duration,
    /// Call options.
    options: CacheQueryOptions,
}

/// Everything needed to build a [`QueryCache`].
pub struct QueryCacheSetup {
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
    pub options: QueryCacheOptions,
}

/// Shared cache state.
struct CacheInner {
    /// Key prefix.
    prefix: String,
    /// Source drivers.
    driver_factory: Arc<dyn DriverFactory>,
    /// External store drivers.
    external_driver_factory: Option<Arc<dyn DriverFactory>>,
    /// Shared backing store.
    backing_store: Arc<dyn BackingStore>,
    /// Shared cache store.
    cache_store: Arc<dyn CacheStore>,
    /// Cross-node queue notifications.
    messenger: Option<Arc<dyn QueueMessenger>>,
    /// Log sink.
    events: Arc<dyn OrchestratorEventSink>,
    /// Tuning.
    options: QueryCacheOptions,
    /// Queues by name.
    queues: Mutex<HashMap<String, QueryQueue>>,
    /// In-process cache.
    memory: Mutex<LruCache<String, MemoryEntry>>,
    /// Owner prefix of advisory locks taken by this process.
    lock_owner: String,
    /// Lock owner sequence.
    lock_sequence: AtomicU64,
}

/// Result cache and queue registry.
#[derive(Clone)]
pub struct QueryCache {
    /// Shared state.
    inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Builds a query cache.
    #[must_use]
    pub fn new(setup: QueryCacheSetup) -> Self {
        let capacity = NonZeroUsize::new(setup.options.memory_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let cache_store = setup.backing_store.cache_store();
        Self {
            inner: Arc::new(CacheInner {
                prefix: setup.prefix,
                driver_factory: setup.driver_factory,
                external_driver_factory: setup.external_driver_factory,
                backing_store: setup.backing_store,
                cache_store,
                messenger: setup.messenger,
                events: setup.events,
                options: setup.options,
                queues: Mutex::new(HashMap::new()),
                memory: Mutex::new(LruCache::new(capacity)),
                lock_owner: format!("{:016x}", rand::random::<u64>()),
                lock_sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Returns the shared cache store.
    #[must_use]
    pub fn cache_store(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.inner.cache_store)
    }

    /// Returns the log sink.
    #[must_use]
    pub fn events(&self) -> Arc<dyn OrchestratorEventSink> {
        Arc::clone(&self.inner.events)
    }

    /// Returns the tuning.
    #[must_use]
    pub fn options(&self) -> &QueryCacheOptions {
        &self.inner.options
    }

    /// Returns the source driver factory.
    #[must_use]
    pub fn driver_factory(&self) -> Arc<dyn DriverFactory> {
        Arc::clone(&self.inner.driver_factory)
    }

    /// Returns the external driver factory when configured.
    #[must_use]
    pub fn external_driver_factory(&self) -> Option<Arc<dyn DriverFactory>> {
        self.inner.external_driver_factory.clone()
    }

    /// Records an event.
    fn emit(&self, event: &OrchestratorEvent) {
        self.inner.events.record(event);
    }

    // ------------------------------------------------------------------------
    // Locks and memoization
    // ------------------------------------------------------------------------

    /// Runs `f` while holding the advisory lock `key`.
    ///
    /// Returns `Ok(false)` without running `f` when another owner holds the
    /// lock. `f` receives a child of `cancel`; the lock is released however
    /// `f` ends, including when this future is dropped.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the lock store.
    pub async fn with_lock<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<bool, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<StoreError>,
    {
        let owner = format!(
            "{}:{}",
            self.inner.lock_owner,
            self.inner.lock_sequence.fetch_add(1, Ordering::Relaxed)
        );
        let store = self.cache_store();
        if !store.try_lock(key, &owner, ttl).await? {
            return Ok(false);
        }
        let release = LockRelease { store, key: key.to_string(), owner, released: false };
        let outcome = f(cancel.child_token()).await;
        release.release().await?;
        outcome.map(|()| true)
    }

    /// Returns a live in-process value.
    fn memory_get(&self, key: &str) -> Option<Value> {
        let mut memory = self.inner.memory.lock().ok()?;
        let entry = memory.get(key)?;
        if entry.expires_at > unix_millis() {
            return Some(entry.value.clone());
        }
        memory.pop(key);
        None
    }

    /// Stores an in-process value.
    fn memory_set(&self, key: &str, value: Value, ttl: Duration) {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        if let Ok(mut memory) = self.inner.memory.lock() {
            memory.put(key.to_string(), MemoryEntry { value, expires_at: unix_millis().saturating_add(ttl_ms) });
        }
    }

    /// Memoizes `compute` in the in-process cache for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns the error of `compute`, or [`CacheError::Invalid`] when the
    /// value does not round-trip through JSON.
    pub async fn cache<T, F, Fut, E>(&self, key_parts: &[KeyPart], ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let key = fast_compute_cache_key(key_parts);
        if let Some(value) = self.memory_get(&key)
            && let Ok(decoded) = serde_json::from_value(value)
        {
            return Ok(decoded);
        }
        let computed = compute().await?;
        let encoded = serde_json::to_value(&computed).map_err(|err| CacheError::Invalid(err.to_string()))?;
        self.memory_set(&key, encoded, ttl);
        Ok(computed)
    }

    // ------------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------------

    /// Returns the queue named `name`, creating it with `handlers` on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] when the queue store cannot be opened.
    pub fn queue_with_handlers<H>(&self, name: &str, options: QueueOptions, handlers: H) -> Result<QueryQueue, CacheError>
    where
        H: FnOnce() -> QueueHandlers,
    {
        let mut queues =
            self.inner.queues.lock().map_err(|_| StoreError::Store("query cache queue mutex poisoned".to_string()))?;
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }
        let queue = QueryQueue::new(QueueSetup {
            name: name.to_string(),
            store: self.inner.backing_store.queue_store(name)?,
            handlers: handlers(),
            options,
            messenger: self.inner.messenger.clone(),
            events: self.events(),
        });
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Returns the SQL queue of a data source.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] when the queue store cannot be opened.
    pub fn get_queue(&self, data_source: &str) -> Result<QueryQueue, CacheError> {
        let name = format!("SQL_QUERY_{}_{}", self.inner.prefix, data_source);
        let drivers = self.driver_factory();
        self.queue_with_handlers(&name, self.inner.options.queue_options, || self.driver_handlers(drivers, data_source))
    }

    /// Returns the SQL queue of the external store.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Configuration`] without an external driver factory.
    pub fn get_external_queue(&self) -> Result<QueryQueue, CacheError> {
        let drivers = self
            .external_driver_factory()
            .ok_or_else(|| CacheError::Configuration("external driver factory is not configured".to_string()))?;
        let name = format!("SQL_QUERY_EXT_{}", self.inner.prefix);
        self.queue_with_handlers(&name, self.inner.options.external_queue_options, || {
            self.driver_handlers(drivers, DEFAULT_DATA_SOURCE)
        })
    }

    /// Builds the SQL handler table for a data source.
    fn driver_handlers(&self, drivers: Arc<dyn DriverFactory>, data_source: &str) -> QueueHandlers {
        QueueHandlers {
            query: Arc::new(DriverQueryHandler {
                drivers: Arc::clone(&drivers),
                data_source: data_source.to_string(),
                events: self.events(),
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(0),
            }),
            stream: Some(Arc::new(DriverStreamHandler {
                drivers,
                data_source: data_source.to_string(),
                events: self.events(),
            })),
        }
    }

    /// Runs a reconcile sweep on a data source queue.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the sweep fails.
    pub async fn force_reconcile(&self, data_source: &str) -> Result<(), CacheError> {
        self.get_queue(data_source)?.reconcile_queue().await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------------

    /// Returns the cache store key of a cache key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Hash`] when the key cannot be canonicalized.
    pub fn query_result_key(&self, cache_key: &Value) -> Result<String, CacheError> {
        let digest = hash_canonical_json(DEFAULT_HASH_ALGORITHM, cache_key)?;
        Ok(format!("SQL_QUERY_RESULT_{}_{}", self.inner.prefix, digest.value))
    }

    // ------------------------------------------------------------------------
    // Cached queries
    // ------------------------------------------------------------------------

    /// Returns the result of a descriptor's main query, renewing as needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when execution fails or must continue waiting.
    pub async fn cached_query_result(
        &self,
        descriptor: &QueryDescriptor,
        pre_aggregation_tables: &[LoadPreAggregationResult],
    ) -> Result<CachedQueryResult, CacheError> {
        let query = descriptor
            .main_query()
            .map(|query| replace_pre_aggregation_table_names(&query, pre_aggregation_tables))
            .ok_or_else(|| CacheError::Configuration("descriptor has no main query".to_string()))?;
        let cache_key_queries: Vec<QueryWithParams> = descriptor
            .cache_key_queries
            .iter()
            .map(|query| replace_pre_aggregation_table_names(query, pre_aggregation_tables))
            .collect();
        let expire = Duration::from_secs(descriptor.expire_secs.unwrap_or(DEFAULT_EXPIRE_SECS));
        let cache_key = QueryCacheKey::for_descriptor(descriptor);
        let renew_options = RenewOptions {
            external: descriptor.external,
            persistent: cache_key.persistent,
            request_id: descriptor.request_id.clone(),
            data_source: descriptor.data_source.clone(),
            skip_refresh_key_wait_for_renew: false,
        };

        if descriptor.renew_query {
            self.emit(
                &OrchestratorEvent::info("Requested renew")
                    .with("cache_key", cache_key.content.clone())
                    .with("request_id", descriptor.request_id.clone()),
            );
            return self
                .renew_query(&query, &cache_key_queries, expire, &cache_key.content, descriptor.renewal_threshold, renew_options)
                .await;
        }

        if !self.inner.options.background_renew {
            let skip_wait = RenewOptions { skip_refresh_key_wait_for_renew: true, ..renew_options.clone() };
            self.start_renew_cycle(
                query.clone(),
                cache_key_queries.clone(),
                expire,
                cache_key.content.clone(),
                descriptor.renewal_threshold,
                renew_options,
            );
            return self
                .renew_query(&query, &cache_key_queries, expire, &cache_key.content, descriptor.renewal_threshold, skip_wait)
                .await;
        }

        self.emit(
            &OrchestratorEvent::info("Background fetch")
                .with("cache_key", cache_key.content.clone())
                .with("request_id", descriptor.request_id.clone()),
        );
        let options = CacheQueryOptions {
            priority: Some(descriptor.query_priority.unwrap_or(DEFAULT_QUERY_PRIORITY)),
            force_no_cache: descriptor.force_no_cache,
            external: descriptor.external,
            persistent: cache_key.persistent,
            request_id: descriptor.request_id.clone(),
            data_source: descriptor.data_source.clone(),
            ..CacheQueryOptions::default()
        };
        let data = self.cache_query_result(&query, &cache_key.content, expire, options).await;
        if !descriptor.force_no_cache {
            self.start_renew_cycle(
                query,
                cache_key_queries,
                expire,
                cache_key.content.clone(),
                descriptor.renewal_threshold,
                renew_options,
            );
        }
        Ok(CachedQueryResult {
            data: data?,
            refresh_key_values: Vec::new(),
            last_refresh_time: self.last_refresh_time(&cache_key.content).await?,
        })
    }

    /// Renews refresh keys in the background, logging failures.
    pub fn start_renew_cycle(
        &self,
        query: QueryWithParams,
        cache_key_queries: Vec<QueryWithParams>,
        expire: Duration,
        cache_key: Value,
        renewal_threshold: Option<u64>,
        options: RenewOptions,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let request_id = options.request_id.clone();
            let outcome =
                cache.renew_query(&query, &cache_key_queries, expire, &cache_key, renewal_threshold, options).await;
            if let Err(err) = outcome
                && !err.is_continue_wait()
            {
                cache.emit(
                    &OrchestratorEvent::error("Error while renew cycle")
                        .with("sql", query.sql.clone())
                        .with("error", err.to_string())
                        .with("request_id", request_id),
                );
            }
        });
    }

    /// Resolves refresh keys, then the main query under a renewal key built
    /// from their values.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the main query fails or must continue
    /// waiting. Refresh-key failures other than continue-wait are logged and
    /// treated as an empty key set.
    pub async fn renew_query(
        &self,
        query: &QueryWithParams,
        cache_key_queries: &[QueryWithParams],
        expire: Duration,
        cache_key: &Value,
        renewal_threshold: Option<u64>,
        options: RenewOptions,
    ) -> Result<CachedQueryResult, CacheError> {
        let refresh_key_values = match self
            .refresh_key_values(
                cache_key_queries,
                expire,
                !options.skip_refresh_key_wait_for_renew,
                options.request_id.as_deref(),
                &options.data_source,
            )
            .await
        {
            Ok(values) => values,
            Err(err) if err.is_continue_wait() => return Err(err),
            Err(err) => {
                self.emit(
                    &OrchestratorEvent::error("Error fetching cache key queries")
                        .with("error", err.to_string())
                        .with("request_id", options.request_id.clone()),
                );
                Vec::new()
            }
        };
        let key_queries: Vec<Value> = cache_key_queries.iter().map(QueryWithParams::cache_key).collect();
        let renewal_key =
            json!([key_queries, refresh_key_values, self.query_result_key(&query.cache_key())?]);
        let data = self
            .cache_query_result(
                query,
                cache_key,
                expire,
                CacheQueryOptions {
                    renewal_threshold: Some(renewal_threshold.unwrap_or(DEFAULT_MAIN_QUERY_RENEWAL_THRESHOLD)),
                    renewal_key: Some(renewal_key),
                    wait_for_renew: true,
                    external: options.external,
                    persistent: options.persistent,
                    request_id: options.request_id.clone(),
                    data_source: options.data_source.clone(),
                    ..CacheQueryOptions::default()
                },
            )
            .await?;
        Ok(CachedQueryResult {
            data,
            refresh_key_values,
            last_refresh_time: self.last_refresh_time(cache_key).await?,
        })
    }

    /// Resolves refresh-key queries concurrently, preserving their order.
    async fn refresh_key_values(
        &self,
        cache_key_queries: &[QueryWithParams],
        expire: Duration,
        wait_for_renew: bool,
        request_id: Option<&str>,
        data_source: &str,
    ) -> Result<Vec<Value>, CacheError> {
        let mut tasks = JoinSet::new();
        for (index, key_query) in cache_key_queries.iter().enumerate() {
            let cache = self.clone();
            let key_query = key_query.clone();
            let options = CacheQueryOptions {
                renewal_threshold: Some(self.refresh_key_renewal_threshold(key_query.options.renewal_threshold)),
                renewal_key: Some(key_query.cache_key()),
                wait_for_renew,
                external: key_query.options.external,
                request_id: request_id.map(str::to_string),
                data_source: data_source.to_string(),
                use_in_memory: true,
                ..CacheQueryOptions::default()
            };
            tasks.spawn(async move {
                let cache_key = key_query.cache_key();
                (index, cache.cache_query_result(&key_query, &cache_key, expire, options).await)
            });
        }
        let mut values = vec![Value::Null; cache_key_queries.len()];
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(value))) => {
                    if let Some(slot) = values.get_mut(index) {
                        *slot = value;
                    }
                }
                Ok((_, Err(err))) => {
                    if failure.as_ref().is_none_or(|current: &CacheError| !current.is_continue_wait()) {
                        failure = Some(err);
                    }
                }
                Err(err) => failure = failure.or(Some(CacheError::Invalid(err.to_string()))),
            }
        }
        failure.map_or(Ok(values), Err)
    }

    /// Returns the effective renewal threshold of a refresh-key query.
    fn refresh_key_renewal_threshold(&self, query_threshold: Option<u64>) -> u64 {
        self.inner
            .options
            .refresh_key_renewal_threshold
            .or(query_threshold)
            .unwrap_or(DEFAULT_REFRESH_KEY_RENEWAL_THRESHOLD)
    }

    /// Returns a cached result, executing the query when the cache is
    /// missing or stale.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when execution fails or must continue waiting.
    pub async fn cache_query_result(
        &self,
        query: &QueryWithParams,
        cache_key: &Value,
        expire: Duration,
        options: CacheQueryOptions,
    ) -> Result<Value, CacheError> {
        let renewal_key = options.renewal_key.as_ref().map(|key| self.query_result_key(key)).transpose()?;
        let result_key = self.query_result_key(cache_key)?;
        let request = FetchRequest {
            query: query.clone(),
            cache_key: cache_key.clone(),
            result_key: result_key.clone(),
            renewal_key: renewal_key.clone(),
            expire,
            options: options.clone(),
        };

        if options.force_no_cache {
            self.emit(
                &OrchestratorEvent::info("Force no cache for")
                    .with("cache_key", cache_key.clone())
                    .with("request_id", options.request_id.clone()),
            );
            return self.fetch_new(request).await;
        }

        let threshold = options.renewal_threshold.unwrap_or(0);
        let in_memory = options.use_in_memory && threshold > 0;
        let cached = match in_memory.then(|| self.memory_get(&result_key)).flatten() {
            Some(value) => Some(value),
            None => self.inner.cache_store.get(&result_key).await?,
        };
        let Some(cached) = cached else {
            self.emit(
                &OrchestratorEvent::info("Missing cache for")
                    .with("cache_key", cache_key.clone())
                    .with("request_id", options.request_id.clone()),
            );
            return self.fetch_new(request).await;
        };
        let entry: CachedEntry = serde_json::from_value(cached).map_err(|err| CacheError::Invalid(err.to_string()))?;
        let renewed_ago = unix_millis() - entry.time;
        self.emit(
            &OrchestratorEvent::info("Found cache entry")
                .with("cache_key", cache_key.clone())
                .with("time", entry.time)
                .with("renewed_ago", renewed_ago)
                .with("renewal_key", entry.renewal_key.clone())
                .with("new_renewal_key", renewal_key.clone())
                .with("renewal_threshold", options.renewal_threshold)
                .with("request_id", options.request_id.clone()),
        );
        let threshold_ms = i64::try_from(threshold.saturating_mul(1000)).unwrap_or(i64::MAX);
        let stale = threshold == 0 || entry.time == 0 || renewed_ago > threshold_ms;
        if let Some(renewal_key) = &renewal_key
            && (stale || entry.renewal_key.as_ref() != Some(renewal_key))
        {
            if options.wait_for_renew {
                self.emit(
                    &OrchestratorEvent::info("Waiting for renew")
                        .with("cache_key", cache_key.clone())
                        .with("renewal_threshold", options.renewal_threshold)
                        .with("request_id", options.request_id.clone()),
                );
                return self.fetch_new(request).await;
            }
            self.emit(
                &OrchestratorEvent::info("Renewing existing key")
                    .with("cache_key", cache_key.clone())
                    .with("renewal_threshold", options.renewal_threshold)
                    .with("request_id", options.request_id.clone()),
            );
            let cache = self.clone();
            tokio::spawn(async move {
                let cache_key = request.cache_key.clone();
                let request_id = request.options.request_id.clone();
                if let Err(err) = cache.fetch_new(request).await
                    && !err.is_continue_wait()
                {
                    cache.emit(
                        &OrchestratorEvent::error("Error renewing")
                            .with("cache_key", cache_key)
                            .with("error", err.to_string())
                            .with("request_id", request_id),
                    );
                }
            });
        }
        if in_memory {
            let ttl = Duration::from_secs(threshold);
            if let Ok(value) = serde_json::to_value(&entry) {
                self.memory_set(&result_key, value, ttl);
            }
        }
        self.emit(
            &OrchestratorEvent::info("Using cache for")
                .with("cache_key", cache_key.clone())
                .with("request_id", options.request_id.clone()),
        );
        Ok(entry.result)
    }

    /// Executes a query through its queue and stores the result.
    async fn fetch_new(&self, request: FetchRequest) -> Result<Value, CacheError> {
        let options = &request.options;
        let outcome = self.query_with_retry_and_release(&request.query, &request.cache_key, options).await;
        match outcome {
            Ok(result) => {
                let entry = CachedEntry { time: unix_millis(), result: result.clone(), renewal_key: request.renewal_key.clone() };
                let value = serde_json::to_value(&entry).map_err(|err| CacheError::Invalid(err.to_string()))?;
                self.inner.cache_store.set(&request.result_key, value.clone(), request.expire).await?;
                if options.use_in_memory && let Some(threshold) = options.renewal_threshold.filter(|secs| *secs > 0) {
                    self.memory_set(&request.result_key, value, Duration::from_secs(threshold));
                }
                self.emit(
                    &OrchestratorEvent::info("Renewed")
                        .with("cache_key", request.cache_key.clone())
                        .with("request_id", options.request_id.clone()),
                );
                Ok(result)
            }
            Err(err) => {
                if !err.is_continue_wait() {
                    self.emit(
                        &OrchestratorEvent::warn("Dropping Cache")
                            .with("cache_key", request.cache_key.clone())
                            .with("error", err.to_string())
                            .with("request_id", options.request_id.clone()),
                    );
                    if let Err(remove_err) = self.inner.cache_store.remove(&request.result_key).await {
                        self.emit(
                            &OrchestratorEvent::error("Error removing key")
                                .with("cache_key", request.cache_key.clone())
                                .with("error", remove_err.to_string()),
                        );
                    }
                    if let Ok(mut memory) = self.inner.memory.lock() {
                        memory.pop(&request.result_key);
                    }
                }
                Err(err)
            }
        }
    }

    /// Executes a query through the data source or external queue.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when execution fails or must continue waiting.
    pub async fn query_with_retry_and_release(
        &self,
        query: &QueryWithParams,
        cache_key: &Value,
        options: &CacheQueryOptions,
    ) -> Result<Value, CacheError> {
        let queue = if options.external { self.get_external_queue()? } else { self.get_queue(&options.data_source)? };
        let key = QueryKey { value: cache_key.clone(), persistent: options.persistent };
        let stage_key = queue.key_hash(&key)?;
        let payload = serde_json::to_value(SqlQueryPayload { query: query.clone(), request_id: options.request_id.clone() })
            .map_err(|err| CacheError::Invalid(err.to_string()))?;
        let output = queue
            .execute_in_queue(
                HandlerType::Query,
                &key,
                payload,
                options.priority.unwrap_or(0),
                ExecuteOptions { stage_key: Some(stage_key.to_string()), request_id: options.request_id.clone() },
            )
            .await?;
        Ok(output.into_value()?)
    }

    /// Streams a query's rows through the data source or external queue.
    ///
    /// Streams bypass the result cache and are keyed per process, so each
    /// process runs its own stream.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the queue rejects the request or the
    /// stream cannot start.
    pub async fn stream_query_result(
        &self,
        query: &QueryWithParams,
        options: &CacheQueryOptions,
    ) -> Result<QueryStream, CacheError> {
        let queue = if options.external { self.get_external_queue()? } else { self.get_queue(&options.data_source)? };
        let key = QueryKey::persistent(query.cache_key());
        let stage_key = queue.key_hash(&key)?;
        let payload = serde_json::to_value(SqlQueryPayload { query: query.clone(), request_id: options.request_id.clone() })
            .map_err(|err| CacheError::Invalid(err.to_string()))?;
        let output = queue
            .execute_in_queue(
                HandlerType::Stream,
                &key,
                payload,
                options.priority.unwrap_or(0),
                ExecuteOptions { stage_key: Some(stage_key.to_string()), request_id: options.request_id.clone() },
            )
            .await?;
        match output {
            QueueOutput::Stream(stream) => Ok(stream),
            QueueOutput::Value(_) => Err(CacheError::Invalid("stream request produced a value".to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Returns when the cached result of `cache_key` was produced.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the store cannot be read.
    pub async fn last_refresh_time(&self, cache_key: &Value) -> Result<Option<i64>, CacheError> {
        let cached = self.inner.cache_store.get(&self.query_result_key(cache_key)?).await?;
        Ok(cached.and_then(|value| serde_json::from_value::<CachedEntry>(value).ok()).map(|entry| entry.time))
    }

    /// Returns the cached result of a descriptor without executing anything.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the store cannot be read.
    pub async fn result_from_cache_if_exists(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<Option<CachedQueryResult>, CacheError> {
        let cache_key = QueryCacheKey::for_descriptor(descriptor);
        let Some(cached) = self.inner.cache_store.get(&self.query_result_key(&cache_key.content)?).await? else {
            return Ok(None);
        };
        let entry: CachedEntry = serde_json::from_value(cached).map_err(|err| CacheError::Invalid(err.to_string()))?;
        Ok(Some(CachedQueryResult {
            data: entry.result,
            refresh_key_values: Vec::new(),
            last_refresh_time: Some(entry.time),
        }))
    }

    /// Resolves a descriptor's refresh keys, waiting for stale ones.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when a refresh-key query fails.
    pub async fn load_refresh_keys(&self, descriptor: &QueryDescriptor) -> Result<Vec<Value>, CacheError> {
        let expire = Duration::from_secs(descriptor.expire_secs.unwrap_or(DEFAULT_EXPIRE_SECS));
        self.refresh_key_values(
            &descriptor.cache_key_queries,
            expire,
            true,
            descriptor.request_id.as_deref(),
            &descriptor.data_source,
        )
        .await
    }

    /// Cancels every queue and drops in-process state.
    pub fn cleanup(&self) {
        if let Ok(queues) = self.inner.queues.lock() {
            for queue in queues.values() {
                queue.shutdown();
            }
        }
        if let Ok(mut memory) = self.inner.memory.lock() {
            memory.clear();
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_key_uses_sentinels() {
        let key = fast_compute_cache_key(&[
            KeyPart::from("sql"),
            KeyPart::from(json!(3)),
            KeyPart::Json(Value::Null),
            KeyPart::Undefined,
            KeyPart::from(json!({"a": [1, 2]})),
        ]);
        assert_eq!(key, "sql:3:__null__:__undefined__:{\"a\":[1,2]}");
    }

    #[test]
    fn replaces_every_table_occurrence() {
        let query = QueryWithParams::new("SELECT * FROM s.t JOIN s.t2 ON s.t.id = s.t2.id");
        let tables = vec![LoadPreAggregationResult {
            table_name: "s.t2".to_string(),
            target_table_name: "s.t2_abc_def_1".to_string(),
            refresh_key_values: Vec::new(),
            last_updated_at: 1,
            rollup_lambda_id: None,
            build_range_end: None,
        }];
        let replaced = replace_pre_aggregation_table_names(&query, &tables);
        assert_eq!(replaced.sql, "SELECT * FROM s.t JOIN s.t2_abc_def_1 ON s.t.id = s.t2_abc_def_1.id");
    }
}
