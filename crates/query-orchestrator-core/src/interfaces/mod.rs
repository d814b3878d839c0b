// crates/query-orchestrator-core/src/interfaces/mod.rs
// ============================================================================
// Module: Query Orchestrator Interfaces
// Description: Backend-agnostic contracts for stores, drivers, and handlers.
// Purpose: Define the seams the queue, cache, and pre-aggregation engines use.
// Dependencies: async-trait, tokio, tokio-util, tracing, crate::core
// ============================================================================

//! ## Overview
//! The orchestrator never talks to a database or a shared store directly.
//! It goes through the traits in this module:
//! - [`QueueStore`] and [`CacheStore`]: atomic primitives over a shared
//!   backing store, obtained from a [`BackingStore`].
//! - [`Driver`] and [`DriverFactory`]: the source and external databases.
//! - [`QueryHandler`] and [`StreamHandler`]: what a queue entry executes.
//! - [`QueueMessenger`]: optional cross-node process/cancel notifications.
//! - [`OrchestratorEventSink`]: structured log events.
//!
//! Every async operation that may block on I/O receives a
//! [`CancellationToken`] or a [`HandlerContext`] carrying one.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::columns::infer_column_types;
use crate::core::pre_aggregation::IndexDescription;
use crate::core::pre_aggregation::StreamOffset;
use crate::core::pre_aggregation::TableColumn;
use crate::core::query::QueryWithParams;
use crate::core::queue::AddToQueueRequest;
use crate::core::queue::AddToQueueResponse;
use crate::core::queue::ExecutionResult;
use crate::core::queue::ProcessingId;
use crate::core::queue::QueryDef;
use crate::core::queue::QueryDefUpdate;
use crate::core::queue::QueryKeyHash;
use crate::core::queue::QueryStageState;
use crate::core::queue::ReconcilePlan;
use crate::core::queue::ReconcileRequest;
use crate::core::queue::RetrieveForProcessing;
use crate::core::time::unix_millis;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Poll interval used by the default blocking result wait.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// SECTION: Store Errors
// ============================================================================

/// Backing store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("queue store io error: {0}")]
    Io(String),
    /// Store data is corrupted or fails integrity checks.
    #[error("queue store corruption: {0}")]
    Corrupt(String),
    /// Store data version is incompatible.
    #[error("queue store version mismatch: {0}")]
    VersionMismatch(String),
    /// Store data is invalid.
    #[error("queue store invalid data: {0}")]
    Invalid(String),
    /// Store reported an error.
    #[error("queue store error: {0}")]
    Store(String),
}

// ============================================================================
// SECTION: Queue Store
// ============================================================================

/// Atomic queue primitives over one shared-store namespace.
///
/// # Invariants
/// - At most one entry exists per [`QueryKeyHash`] store-wide.
/// - Every method is atomic with respect to concurrent callers on the same
///   namespace, including callers in other processes.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts an entry unless the key is already queued. Resubmission of a
    /// queued key refreshes its orphaned deadline.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn add_to_queue(&self, request: AddToQueueRequest) -> Result<AddToQueueResponse, StoreError>;

    /// Claims a key for processing.
    ///
    /// Returns `None` when another claim holds the processing lock. On
    /// success the key is moved to the active set only if fewer than
    /// `concurrency` keys are active; the heartbeat is refreshed either way.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn retrieve_for_processing(
        &self,
        key: &QueryKeyHash,
        processing_id: ProcessingId,
        concurrency: usize,
    ) -> Result<Option<RetrieveForProcessing>, StoreError>;

    /// Releases a claim. When `activated` is true the key also leaves the
    /// active set; the entry itself stays queued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn free_processing_lock(
        &self,
        key: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
    ) -> Result<(), StoreError>;

    /// Merges handler-provided fields into a running entry. Returns false
    /// when the caller no longer holds the processing lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn optimistic_query_update(
        &self,
        key: &QueryKeyHash,
        update: QueryDefUpdate,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError>;

    /// Refreshes the heartbeat of a running entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn update_heartbeat(&self, key: &QueryKeyHash) -> Result<(), StoreError>;

    /// Stores a result for all waiters and removes the entry. Returns false,
    /// storing nothing, when the caller no longer holds the processing lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn set_result_and_remove_query(
        &self,
        key: &QueryKeyHash,
        result: ExecutionResult,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError>;

    /// Returns a stored result that no waiter has received yet and marks it
    /// received. A result already handed out is never returned here, so a
    /// resubmitted key runs again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_result(&self, key: &QueryKeyHash) -> Result<Option<ExecutionResult>, StoreError>;

    /// Waits up to `timeout` for a result and marks it received. Every waiter
    /// blocked on the key receives the same result; stores override the
    /// polling default to honor that.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_result_blocking(
        &self,
        key: &QueryKeyHash,
        timeout: Duration,
    ) -> Result<Option<ExecutionResult>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.get_result(key).await? {
                return Ok(Some(result));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Removes an entry from every queue set and returns its definition.
    /// Only the first of several concurrent callers receives `Some`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn get_query_and_remove(&self, key: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError>;

    /// Returns an entry definition without modifying it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_query_def(&self, key: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError>;

    /// Lists keys whose orphaned deadline is before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_orphaned_queries(&self, now: i64) -> Result<Vec<QueryKeyHash>, StoreError>;

    /// Lists keys whose heartbeat is older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_stalled_queries(&self, cutoff: i64) -> Result<Vec<QueryKeyHash>, StoreError>;

    /// Returns active keys, pending keys in order, and all definitions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_query_stage_state(&self) -> Result<QueryStageState, StoreError>;

    /// Lists stalled and orphaned keys, each once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_queries_to_cancel(&self, now: i64, stalled_cutoff: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        let mut keys = self.get_stalled_queries(stalled_cutoff).await?;
        for key in self.get_orphaned_queries(now).await? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Returns active keys and pending keys in scheduling order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get_active_and_to_process(&self) -> Result<(Vec<QueryKeyHash>, Vec<QueryKeyHash>), StoreError> {
        let state = self.get_query_stage_state().await?;
        Ok((state.active, state.to_process))
    }

    /// Atomically removes stalled and orphaned entries and selects pending
    /// keys owned by the requesting process for dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn reconcile_queue(&self, request: ReconcileRequest) -> Result<ReconcilePlan, StoreError>;

    /// Returns a store-unique processing identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn next_processing_id(&self) -> Result<ProcessingId, StoreError>;
}

// ============================================================================
// SECTION: Cache Store
// ============================================================================

/// Shared key/value cache with advisory locks.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns an unexpired value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores a value for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Removes a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Lists unexpired keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Acquires `key` for `owner` unless another unexpired owner holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Releases `key` if `owner` still holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store rejects the write.
    async fn unlock(&self, key: &str, owner: &str) -> Result<(), StoreError>;
}

/// Factory for namespaced queue stores and the shared cache store.
pub trait BackingStore: Send + Sync {
    /// Returns the queue store for a queue namespace.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the namespace cannot be opened.
    fn queue_store(&self, queue_name: &str) -> Result<Arc<dyn QueueStore>, StoreError>;

    /// Returns the shared cache store.
    fn cache_store(&self) -> Arc<dyn CacheStore>;
}

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Rows returned by a driver.
pub type Rows = Vec<Map<String, Value>>;

/// Driver errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Query failed.
    #[error("{0}")]
    Query(String),
    /// Connection failed.
    #[error("driver connection error: {0}")]
    Connection(String),
    /// Operation was cancelled.
    #[error("query cancelled")]
    Cancelled,
    /// Operation is not supported by this driver.
    #[error("driver does not support {0}")]
    Unsupported(String),
}

/// Per-call metadata passed to drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Caller correlation identifier.
    pub request_id: Option<String>,
}

/// Optional driver features.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// Accepts CSV files in uploads.
    pub csv_import: bool,
    /// Source is a stream; tables are never dropped.
    pub streaming_source: bool,
    /// Can unload a query without a temp table.
    pub unload_without_temp_table: bool,
    /// Can unload tables or queries to staged CSV files.
    pub unload: bool,
}

/// Download request options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Streaming source offset.
    pub stream_offset: Option<StreamOffset>,
    /// Row cap for ad-hoc downloads.
    pub max_source_row_limit: u64,
    /// Prefer CSV output.
    pub csv: bool,
}

/// Upload request options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// UTC instant after which a partition receives no more data; streaming
    /// stores use it to close the table.
    pub seal_at: Option<String>,
}

/// Table data moved between source and external store.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadedTable {
    /// In-memory rows.
    Rows {
        /// Row data.
        rows: Rows,
        /// Column types when known.
        types: Option<Vec<TableColumn>>,
    },
    /// CSV files staged by the source.
    Csv {
        /// CSV file locations.
        files: Vec<String>,
        /// Column types when known.
        types: Option<Vec<TableColumn>>,
    },
}

impl DownloadedTable {
    /// Returns the column types carried with the data.
    #[must_use]
    pub fn types(&self) -> Option<&[TableColumn]> {
        match self {
            Self::Rows { types, .. } | Self::Csv { types, .. } => types.as_deref(),
        }
    }
}

/// Schema-qualified table reference for metadata introspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
}

/// Column metadata for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// Source data type.
    pub data_type: String,
}

/// Database driver collaborator.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Runs a query.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the query fails or is cancelled.
    async fn query(
        &self,
        query: &QueryWithParams,
        meta: &QueryMeta,
        cancel: &CancellationToken,
    ) -> Result<Rows, DriverError>;

    /// Streams query rows into a sink.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] unless overridden.
    async fn stream_query(
        &self,
        _query: &QueryWithParams,
        _sink: &StreamSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("streaming queries".to_string()))
    }

    /// Creates a schema when missing.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the statement fails.
    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<(), DriverError>;

    /// Lists table names in a schema.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the listing fails.
    async fn get_tables_query(&self, schema: &str) -> Result<Vec<String>, DriverError>;

    /// Drops a schema-qualified table.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the statement fails.
    async fn drop_table(&self, table: &str) -> Result<(), DriverError>;

    /// Materializes `load_sql` into `target_table` inside the source.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the statement fails.
    async fn load_pre_aggregation_into_table(
        &self,
        target_table: &str,
        load_sql: &QueryWithParams,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError>;

    /// Downloads a table.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the download fails.
    async fn download_table(
        &self,
        table: &str,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadedTable, DriverError>;

    /// Runs a query and returns its rows with inferred column types.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the query fails or returns no rows.
    async fn download_query_results(
        &self,
        query: &QueryWithParams,
        _options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadedTable, DriverError> {
        let rows = self.query(query, &QueryMeta::default(), cancel).await?;
        let types = infer_column_types(&rows).ok_or_else(|| {
            DriverError::Query(
                "Unable to detect column types for pre-aggregation on empty values in readOnly mode."
                    .to_string(),
            )
        })?;
        Ok(DownloadedTable::Rows { rows, types: Some(types) })
    }

    /// Unloads a table, or `query` when given, to staged files.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] unless overridden.
    async fn unload(
        &self,
        _table: &str,
        _query: Option<&QueryWithParams>,
        _options: &DownloadOptions,
        _cancel: &CancellationToken,
    ) -> Result<DownloadedTable, DriverError> {
        Err(DriverError::Unsupported("unload".to_string()))
    }

    /// Returns the column types of a table.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when introspection fails.
    async fn table_column_types(&self, table: &str) -> Result<Vec<TableColumn>, DriverError>;

    /// Creates `table` from `data` and builds the given indexes.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the upload fails.
    async fn upload_table_with_indexes(
        &self,
        table: &str,
        columns: &[TableColumn],
        data: DownloadedTable,
        indexes: &[IndexDescription],
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError>;

    /// Returns optional features.
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Returns true when the source cannot create tables.
    fn read_only(&self) -> bool {
        false
    }

    /// Returns the database clock in unix milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the clock cannot be read.
    async fn now_timestamp(&self) -> Result<i64, DriverError> {
        Ok(unix_millis())
    }

    /// Lists schemas.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when introspection fails.
    async fn get_schemas(&self) -> Result<Vec<String>, DriverError>;

    /// Lists tables in the given schemas.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when introspection fails.
    async fn get_tables_for_schemas(&self, schemas: &[String]) -> Result<Vec<TableRef>, DriverError>;

    /// Lists columns of the given tables.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when introspection fails.
    async fn get_columns_for_tables(&self, tables: &[TableRef]) -> Result<Vec<ColumnRef>, DriverError>;
}

/// Resolves drivers by data source name.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Returns the driver for a data source.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the data source is unknown or unreachable.
    async fn driver(&self, data_source: &str) -> Result<Arc<dyn Driver>, DriverError>;
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// Handler errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Handler failed.
    #[error("{0}")]
    Failed(String),
    /// Handler observed cancellation.
    #[error("query cancelled: {0}")]
    Cancelled(String),
    /// Driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Queue store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sink a stream handler writes rows into.
#[derive(Debug, Clone)]
pub struct StreamSink {
    /// Channel to the consuming stream.
    sender: mpsc::Sender<Result<Value, String>>,
}

impl StreamSink {
    /// Wraps a channel sender.
    #[must_use]
    pub const fn new(sender: mpsc::Sender<Result<Value, String>>) -> Self {
        Self { sender }
    }

    /// Sends one row, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Cancelled`] when the consumer went away.
    pub async fn send(&self, row: Value) -> Result<(), HandlerError> {
        self.sender
            .send(Ok(row))
            .await
            .map_err(|_| HandlerError::Cancelled("stream consumer closed".to_string()))
    }

    /// Delivers a terminal error to the consumer.
    pub async fn fail(&self, message: String) {
        let _ = self.sender.send(Err(message)).await;
    }
}

/// Execution context handed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    /// Cooperative cancellation signal.
    cancel: CancellationToken,
    /// Key being executed.
    key_hash: QueryKeyHash,
    /// Claim the execution runs under.
    processing_id: ProcessingId,
    /// Store that persists cancel state.
    store: Arc<dyn QueueStore>,
}

impl HandlerContext {
    /// Creates a context for one execution.
    #[must_use]
    pub fn new(
        cancel: CancellationToken,
        key_hash: QueryKeyHash,
        processing_id: ProcessingId,
        store: Arc<dyn QueueStore>,
    ) -> Self {
        Self { cancel, key_hash, processing_id, store }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the key being executed.
    #[must_use]
    pub const fn key_hash(&self) -> &QueryKeyHash {
        &self.key_hash
    }

    /// Records state a later cancellation will receive through
    /// [`QueryHandler::cancel`] as [`QueryDef::cancel_handler`].
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Store`] when the update cannot be written.
    pub async fn set_cancel_handler(&self, state: Value) -> Result<(), HandlerError> {
        let update = QueryDefUpdate { start_query_time: None, cancel_handler: Some(state) };
        self.store.optimistic_query_update(&self.key_hash, update, self.processing_id).await?;
        Ok(())
    }
}

/// Handler returning a single value.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Executes a payload.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when execution fails.
    async fn execute(&self, payload: Value, context: HandlerContext) -> Result<Value, HandlerError>;

    /// Performs handler-specific cleanup for a cancelled entry.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when cleanup fails.
    async fn cancel(&self, _def: &QueryDef) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handler writing rows to a sink.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Streams a payload into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when production fails.
    async fn stream(&self, payload: Value, sink: StreamSink, context: HandlerContext) -> Result<(), HandlerError>;

    /// Performs handler-specific cleanup for a cancelled entry.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when cleanup fails.
    async fn cancel(&self, _def: &QueryDef) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handler table resolved when a queue is built.
#[derive(Clone)]
pub struct QueueHandlers {
    /// Handler for [`crate::core::HandlerType::Query`] entries.
    pub query: Arc<dyn QueryHandler>,
    /// Handler for [`crate::core::HandlerType::Stream`] entries.
    pub stream: Option<Arc<dyn StreamHandler>>,
}

// ============================================================================
// SECTION: Messenger
// ============================================================================

/// Cross-node notifications for queue work.
///
/// Delivery is best effort; the queue's reconcile sweep recovers lost
/// messages.
#[async_trait]
pub trait QueueMessenger: Send + Sync {
    /// Asks a worker to process `key` on `queue_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the message cannot be sent.
    async fn send_process_message(&self, queue_name: &str, key: &QueryKeyHash) -> Result<(), StoreError>;

    /// Asks a worker to cancel `def` on `queue_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the message cannot be sent.
    async fn send_cancel_message(&self, queue_name: &str, def: &QueryDef) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: Events
// ============================================================================

/// Severity of an orchestrator event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// Routine progress.
    Info,
    /// Recoverable anomaly.
    Warn,
    /// Failure.
    Error,
}

/// Structured log event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorEvent {
    /// Event message, e.g. `Performing query`.
    pub message: &'static str,
    /// Severity.
    pub level: EventLevel,
    /// Structured fields.
    pub fields: Map<String, Value>,
}

impl OrchestratorEvent {
    /// Creates an info event.
    #[must_use]
    pub fn info(message: &'static str) -> Self {
        Self { message, level: EventLevel::Info, fields: Map::new() }
    }

    /// Creates a warning event.
    #[must_use]
    pub fn warn(message: &'static str) -> Self {
        Self { message, level: EventLevel::Warn, fields: Map::new() }
    }

    /// Creates an error event.
    #[must_use]
    pub fn error(message: &'static str) -> Self {
        Self { message, level: EventLevel::Error, fields: Map::new() }
    }

    /// Adds a structured field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Event sink for orchestrator logs.
pub trait OrchestratorEventSink: Send + Sync {
    /// Records an event.
    fn record(&self, event: &OrchestratorEvent);
}

/// Event sink forwarding to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl OrchestratorEventSink for TracingEventSink {
    fn record(&self, event: &OrchestratorEvent) {
        let fields = Value::Object(event.fields.clone());
        match event.level {
            EventLevel::Info => tracing::info!(target: "query_orchestrator", %fields, "{}", event.message),
            EventLevel::Warn => tracing::warn!(target: "query_orchestrator", %fields, "{}", event.message),
            EventLevel::Error => tracing::error!(target: "query_orchestrator", %fields, "{}", event.message),
        }
    }
}

/// Event sink that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl OrchestratorEventSink for NoopEventSink {
    fn record(&self, _event: &OrchestratorEvent) {}
}

/// Event sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    /// Recorded events in arrival order.
    events: Mutex<Vec<OrchestratorEvent>>,
}

impl MemoryEventSink {
    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Returns the recorded messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<&'static str> {
        self.events().iter().map(|event| event.message).collect()
    }

    /// Returns true when an event with `message` was recorded.
    #[must_use]
    pub fn contains(&self, message: &str) -> bool {
        self.events().iter().any(|event| event.message == message)
    }
}

impl OrchestratorEventSink for MemoryEventSink {
    fn record(&self, event: &OrchestratorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
