// crates/query-orchestrator-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Backing Store
// Description: Durable QueueStore, CacheStore, and BackingStore on SQLite WAL.
// Purpose: Share queue state, results, cache entries, and locks across processes.
// Dependencies: async-trait, query-orchestrator-core, rusqlite, serde, serde_json, thiserror, tokio
// ============================================================================

//! ## Overview
//! Every queue namespace lives in the same database file, keyed by queue
//! name. Each [`QueueStore`] or [`CacheStore`] method runs in one immediate
//! transaction on a blocking worker, so processes sharing the file observe
//! the same atomic transitions the in-memory store provides. Result waiters
//! in this process are woken directly; waiters in other processes poll.
//! Security posture: database contents are untrusted and decoded fail-closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use query_orchestrator_core::BackingStore;
use query_orchestrator_core::CacheStore;
use query_orchestrator_core::ExecutionResult;
use query_orchestrator_core::ProcessingId;
use query_orchestrator_core::QueryDef;
use query_orchestrator_core::QueryKeyHash;
use query_orchestrator_core::QueueStore;
use query_orchestrator_core::StoreError;
use query_orchestrator_core::StoreRetention;
use query_orchestrator_core::core::queue::AddToQueueRequest;
use query_orchestrator_core::core::queue::AddToQueueResponse;
use query_orchestrator_core::core::queue::QueryDefUpdate;
use query_orchestrator_core::core::queue::QueryStageState;
use query_orchestrator_core::core::queue::ReconcilePlan;
use query_orchestrator_core::core::queue::ReconcileRequest;
use query_orchestrator_core::core::queue::RetrieveForProcessing;
use query_orchestrator_core::core::time::unix_millis;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 2;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum encoded size of a stored definition, result, or cache value.
pub const MAX_VALUE_BYTES: usize = 64 * 1024 * 1024;
/// Interval at which result waiters re-read rows written by other processes.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    Full,
    /// Normal synchronous mode (balanced).
    #[default]
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` backing store.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Returns a config with default tuning for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
///
/// # Invariants
/// - Error messages avoid embedding stored payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Stored payload failed to decode.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// Payload exceeded [`MAX_VALUE_BYTES`].
    #[error("sqlite store payload too large: {actual_bytes} bytes (max {max_bytes})")]
    TooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual payload size in bytes.
        actual_bytes: usize,
    },
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Store(message),
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
            SqliteStoreError::TooLarge { max_bytes, actual_bytes } => {
                Self::Invalid(format!("payload exceeds size limit: {actual_bytes} bytes (max {max_bytes})"))
            }
        }
    }
}

/// Maps an engine error.
#[allow(clippy::needless_pass_by_value, reason = "Used as a map_err adapter.")]
fn db(err: rusqlite::Error) -> SqliteStoreError {
    SqliteStoreError::Db(err.to_string())
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Connection shared by every store view of one database file.
type SharedConnection = Arc<Mutex<Connection>>;

/// Runs `op` on the shared connection from a blocking worker.
async fn with_connection<T, F>(connection: &SharedConnection, op: F) -> Result<T, SqliteStoreError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, SqliteStoreError> + Send + 'static,
{
    let connection = Arc::clone(connection);
    tokio::task::spawn_blocking(move || {
        let mut guard =
            connection.lock().map_err(|_| SqliteStoreError::Io("sqlite connection mutex poisoned".to_string()))?;
        op(&mut guard)
    })
    .await
    .map_err(|err| SqliteStoreError::Io(err.to_string()))?
}

/// Runs `op` in an immediate transaction, committing on success.
async fn in_transaction<T, F>(connection: &SharedConnection, op: F) -> Result<T, SqliteStoreError>
where
    T: Send + 'static,
    F: FnOnce(&Transaction<'_>) -> Result<T, SqliteStoreError> + Send + 'static,
{
    with_connection(connection, move |connection| {
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db)?;
        let value = op(&tx)?;
        tx.commit().map_err(db)?;
        Ok(value)
    })
    .await
}

// ============================================================================
// SECTION: Encoding
// ============================================================================

/// Serializes a payload, enforcing [`MAX_VALUE_BYTES`].
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SqliteStoreError> {
    let bytes = serde_json::to_vec(value).map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
    if bytes.len() > MAX_VALUE_BYTES {
        return Err(SqliteStoreError::TooLarge { max_bytes: MAX_VALUE_BYTES, actual_bytes: bytes.len() });
    }
    Ok(bytes)
}

/// Deserializes a stored payload.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SqliteStoreError> {
    serde_json::from_slice(bytes).map_err(|err| SqliteStoreError::Corrupt(err.to_string()))
}

/// Converts a duration into whole milliseconds.
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Converts a processing id into its stored form.
fn processing_id_column(processing_id: ProcessingId) -> Result<i64, SqliteStoreError> {
    i64::try_from(processing_id.get()).map_err(|_| SqliteStoreError::Invalid("processing id too large".to_string()))
}

/// Converts a stored count.
fn count_column(count: i64) -> usize {
    usize::try_from(count).unwrap_or_default()
}

// ============================================================================
// SECTION: Queue Queries
// ============================================================================

/// Returns the definition of a queued key.
fn load_def(tx: &Transaction<'_>, queue: &str, key: &str) -> Result<Option<QueryDef>, SqliteStoreError> {
    let bytes: Option<Vec<u8>> = tx
        .query_row(
            "SELECT def_json FROM queue_entries WHERE queue = ?1 AND key_hash = ?2",
            params![queue, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    bytes.map(|bytes| decode(&bytes)).transpose()
}

/// Lists keys of a queue selected by `sql`, which binds the queue as `?1`
/// and one integer as `?2`.
fn list_keys(tx: &Transaction<'_>, sql: &str, queue: &str, bound: i64) -> Result<Vec<QueryKeyHash>, SqliteStoreError> {
    let mut statement = tx.prepare(sql).map_err(db)?;
    let rows = statement.query_map(params![queue, bound], |row| row.get::<_, String>(0)).map_err(db)?;
    rows.map(|row| row.map(QueryKeyHash::new).map_err(db)).collect()
}

/// Pending keys in scheduling order.
fn pending_keys(tx: &Transaction<'_>, queue: &str) -> Result<Vec<QueryKeyHash>, SqliteStoreError> {
    list_keys(
        tx,
        "SELECT key_hash FROM queue_entries WHERE queue = ?1 AND pending = ?2 ORDER BY score, sequence",
        queue,
        1,
    )
}

/// Active keys in activation order.
fn active_keys(tx: &Transaction<'_>, queue: &str) -> Result<Vec<QueryKeyHash>, SqliteStoreError> {
    list_keys(
        tx,
        "SELECT key_hash FROM queue_entries WHERE queue = ?1 AND active_id >= ?2 ORDER BY active_id",
        queue,
        0,
    )
}

/// Keys whose orphaned deadline is before `now`, oldest first.
fn orphaned_keys(tx: &Transaction<'_>, queue: &str, now: i64) -> Result<Vec<QueryKeyHash>, SqliteStoreError> {
    list_keys(
        tx,
        "SELECT key_hash FROM queue_entries WHERE queue = ?1 AND orphaned_at < ?2 ORDER BY orphaned_at",
        queue,
        now,
    )
}

/// Keys whose heartbeat is older than `cutoff`, oldest first.
fn stalled_keys(tx: &Transaction<'_>, queue: &str, cutoff: i64) -> Result<Vec<QueryKeyHash>, SqliteStoreError> {
    list_keys(
        tx,
        "SELECT key_hash FROM queue_entries WHERE queue = ?1 AND heartbeat_at IS NOT NULL AND heartbeat_at < ?2 \
         ORDER BY heartbeat_at",
        queue,
        cutoff,
    )
}

/// Counts pending keys.
fn pending_count(tx: &Transaction<'_>, queue: &str) -> Result<usize, SqliteStoreError> {
    let count: i64 = tx
        .query_row("SELECT COUNT(1) FROM queue_entries WHERE queue = ?1 AND pending = 1", params![queue], |row| {
            row.get(0)
        })
        .map_err(db)?;
    Ok(count_column(count))
}

/// Returns true when `processing_id` holds the lock for `key`.
fn holds_lock(tx: &Transaction<'_>, queue: &str, key: &str, processing_id: i64) -> Result<bool, SqliteStoreError> {
    let holder: Option<i64> = tx
        .query_row(
            "SELECT processing_id FROM queue_locks WHERE queue = ?1 AND key_hash = ?2",
            params![queue, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    Ok(holder == Some(processing_id))
}

/// Removes a key from every queue set except results.
fn remove_entry(tx: &Transaction<'_>, queue: &str, key: &str) -> Result<Option<QueryDef>, SqliteStoreError> {
    let def = load_def(tx, queue, key)?;
    tx.execute("DELETE FROM queue_entries WHERE queue = ?1 AND key_hash = ?2", params![queue, key]).map_err(db)?;
    tx.execute("DELETE FROM queue_locks WHERE queue = ?1 AND key_hash = ?2", params![queue, key]).map_err(db)?;
    Ok(def)
}

/// Increments and returns a named counter of a queue.
fn next_counter(tx: &Transaction<'_>, queue: &str, name: &str) -> Result<i64, SqliteStoreError> {
    tx.execute(
        "INSERT INTO queue_counters (queue, name, value) VALUES (?1, ?2, 1)
         ON CONFLICT (queue, name) DO UPDATE SET value = value + 1",
        params![queue, name],
    )
    .map_err(db)?;
    tx.query_row("SELECT value FROM queue_counters WHERE queue = ?1 AND name = ?2", params![queue, name], |row| {
        row.get(0)
    })
    .map_err(db)
}

/// Returns an unexpired result and marks it delivered, deleting an expired
/// one. With `undelivered_only` a result some waiter already received is
/// skipped.
fn read_result(
    tx: &Transaction<'_>,
    queue: &str,
    key: &str,
    now: i64,
    undelivered_only: bool,
) -> Result<Option<ExecutionResult>, SqliteStoreError> {
    tx.execute(
        "DELETE FROM queue_results WHERE queue = ?1 AND key_hash = ?2 AND expires_at <= ?3",
        params![queue, key, now],
    )
    .map_err(db)?;
    let row: Option<(Vec<u8>, bool)> = tx
        .query_row(
            "SELECT result_json, delivered FROM queue_results WHERE queue = ?1 AND key_hash = ?2",
            params![queue, key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db)?;
    let Some((bytes, delivered)) = row else {
        return Ok(None);
    };
    if delivered && undelivered_only {
        return Ok(None);
    }
    if !delivered {
        tx.execute("UPDATE queue_results SET delivered = 1 WHERE queue = ?1 AND key_hash = ?2", params![queue, key])
            .map_err(db)?;
    }
    decode(&bytes).map(Some)
}

// ============================================================================
// SECTION: Queue Store
// ============================================================================

/// One queue namespace inside a shared database.
pub struct SqliteQueueStore {
    /// Shared connection.
    connection: SharedConnection,
    /// Queue namespace name.
    queue: String,
    /// Wakes result waiters in this process.
    results_ready: Notify,
    /// Retention settings.
    retention: StoreRetention,
}

impl SqliteQueueStore {
    /// Reads an unexpired result.
    async fn result(
        &self,
        key: &QueryKeyHash,
        undelivered_only: bool,
    ) -> Result<Option<ExecutionResult>, SqliteStoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        in_transaction(&self.connection, move |tx| read_result(tx, &queue, &key, unix_millis(), undelivered_only))
            .await
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn add_to_queue(&self, request: AddToQueueRequest) -> Result<AddToQueueResponse, StoreError> {
        let queue = self.queue.clone();
        let def_json = encode(&request.def)?;
        Ok(in_transaction(&self.connection, move |tx| {
            let key = request.def.key_hash.as_str();
            if let Some(existing) = load_def(tx, &queue, key)? {
                tx.execute(
                    "UPDATE queue_entries SET orphaned_at = ?3 WHERE queue = ?1 AND key_hash = ?2",
                    params![queue, key, request.orphaned_time],
                )
                .map_err(db)?;
                return Ok(AddToQueueResponse {
                    added: false,
                    queue_size: pending_count(tx, &queue)?,
                    added_to_queue_time: existing.added_to_queue_time,
                });
            }
            let sequence = next_counter(tx, &queue, "sequence")?;
            tx.execute("DELETE FROM queue_results WHERE queue = ?1 AND key_hash = ?2", params![queue, key])
                .map_err(db)?;
            tx.execute(
                "INSERT INTO queue_entries (queue, key_hash, def_json, score, sequence, pending, orphaned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![queue, key, def_json, request.score, sequence, request.orphaned_time],
            )
            .map_err(db)?;
            Ok(AddToQueueResponse {
                added: true,
                queue_size: pending_count(tx, &queue)?,
                added_to_queue_time: request.def.added_to_queue_time,
            })
        })
        .await?)
    }

    async fn retrieve_for_processing(
        &self,
        key: &QueryKeyHash,
        processing_id: ProcessingId,
        concurrency: usize,
    ) -> Result<Option<RetrieveForProcessing>, StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        let processing_id = processing_id_column(processing_id)?;
        let lock_ttl = duration_millis(self.retention.processing_lock_ttl);
        Ok(in_transaction(&self.connection, move |tx| {
            let now = unix_millis();
            let lock_expires: Option<i64> = tx
                .query_row(
                    "SELECT expires_at FROM queue_locks WHERE queue = ?1 AND key_hash = ?2",
                    params![queue, key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            if lock_expires.is_some_and(|expires_at| expires_at > now) {
                return Ok(None);
            }
            tx.execute(
                "INSERT OR REPLACE INTO queue_locks (queue, key_hash, processing_id, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![queue, key, processing_id, now.saturating_add(lock_ttl)],
            )
            .map_err(db)?;
            let active = active_keys(tx, &queue)?;
            let def = load_def(tx, &queue, &key)?;
            let activated =
                active.len() < concurrency && !active.iter().any(|entry| entry.as_str() == key) && def.is_some();
            if activated {
                tx.execute(
                    "UPDATE queue_entries SET active_id = ?3, pending = 0, heartbeat_at = ?4
                     WHERE queue = ?1 AND key_hash = ?2",
                    params![queue, key, processing_id, now],
                )
                .map_err(db)?;
            }
            Ok(Some(RetrieveForProcessing {
                activated,
                active_keys: active_keys(tx, &queue)?,
                queue_size: pending_count(tx, &queue)?,
                query: def,
                lock_acquired: true,
            }))
        })
        .await?)
    }

    async fn free_processing_lock(
        &self,
        key: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
    ) -> Result<(), StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        let processing_id = processing_id_column(processing_id)?;
        Ok(in_transaction(&self.connection, move |tx| {
            if !holds_lock(tx, &queue, &key, processing_id)? {
                return Ok(());
            }
            tx.execute("DELETE FROM queue_locks WHERE queue = ?1 AND key_hash = ?2", params![queue, key])
                .map_err(db)?;
            if activated {
                tx.execute(
                    "UPDATE queue_entries SET active_id = NULL, heartbeat_at = NULL WHERE queue = ?1 AND key_hash = ?2",
                    params![queue, key],
                )
                .map_err(db)?;
            }
            Ok(())
        })
        .await?)
    }

    async fn optimistic_query_update(
        &self,
        key: &QueryKeyHash,
        update: QueryDefUpdate,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        let processing_id = processing_id_column(processing_id)?;
        Ok(in_transaction(&self.connection, move |tx| {
            if !holds_lock(tx, &queue, &key, processing_id)? {
                return Ok(false);
            }
            let Some(mut def) = load_def(tx, &queue, &key)? else {
                return Ok(false);
            };
            if let Some(start) = update.start_query_time {
                def.start_query_time = Some(start);
            }
            if let Some(cancel_handler) = update.cancel_handler {
                def.cancel_handler = Some(cancel_handler);
            }
            tx.execute(
                "UPDATE queue_entries SET def_json = ?3 WHERE queue = ?1 AND key_hash = ?2",
                params![queue, key, encode(&def)?],
            )
            .map_err(db)?;
            Ok(true)
        })
        .await?)
    }

    async fn update_heartbeat(&self, key: &QueryKeyHash) -> Result<(), StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        let lock_ttl = duration_millis(self.retention.processing_lock_ttl);
        Ok(in_transaction(&self.connection, move |tx| {
            let now = unix_millis();
            let updated = tx
                .execute(
                    "UPDATE queue_entries SET heartbeat_at = ?3
                     WHERE queue = ?1 AND key_hash = ?2 AND active_id IS NOT NULL",
                    params![queue, key, now],
                )
                .map_err(db)?;
            if updated > 0 {
                tx.execute(
                    "UPDATE queue_locks SET expires_at = ?3 WHERE queue = ?1 AND key_hash = ?2",
                    params![queue, key, now.saturating_add(lock_ttl)],
                )
                .map_err(db)?;
            }
            Ok(())
        })
        .await?)
    }

    async fn set_result_and_remove_query(
        &self,
        key: &QueryKeyHash,
        result: ExecutionResult,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        let processing_id = processing_id_column(processing_id)?;
        let result_json = encode(&result)?;
        let result_ttl = duration_millis(self.retention.result_ttl);
        let stored = in_transaction(&self.connection, move |tx| {
            if !holds_lock(tx, &queue, &key, processing_id)? {
                return Ok(false);
            }
            remove_entry(tx, &queue, &key)?;
            tx.execute(
                "INSERT OR REPLACE INTO queue_results (queue, key_hash, result_json, expires_at, delivered)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![queue, key, result_json, unix_millis().saturating_add(result_ttl)],
            )
            .map_err(db)?;
            Ok(true)
        })
        .await?;
        if stored {
            self.results_ready.notify_waiters();
        }
        Ok(stored)
    }

    async fn get_result(&self, key: &QueryKeyHash) -> Result<Option<ExecutionResult>, StoreError> {
        Ok(self.result(key, true).await?)
    }

    async fn get_result_blocking(
        &self,
        key: &QueryKeyHash,
        timeout: Duration,
    ) -> Result<Option<ExecutionResult>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.results_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result(key, false).await? {
                return Ok(Some(result));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = deadline.min(now + RESULT_POLL_INTERVAL);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn get_query_and_remove(&self, key: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        Ok(in_transaction(&self.connection, move |tx| remove_entry(tx, &queue, &key)).await?)
    }

    async fn get_query_def(&self, key: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError> {
        let queue = self.queue.clone();
        let key = key.as_str().to_string();
        Ok(in_transaction(&self.connection, move |tx| load_def(tx, &queue, &key)).await?)
    }

    async fn get_orphaned_queries(&self, now: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        let queue = self.queue.clone();
        Ok(in_transaction(&self.connection, move |tx| orphaned_keys(tx, &queue, now)).await?)
    }

    async fn get_stalled_queries(&self, cutoff: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        let queue = self.queue.clone();
        Ok(in_transaction(&self.connection, move |tx| stalled_keys(tx, &queue, cutoff)).await?)
    }

    async fn get_query_stage_state(&self) -> Result<QueryStageState, StoreError> {
        let queue = self.queue.clone();
        Ok(in_transaction(&self.connection, move |tx| {
            let mut statement = tx.prepare("SELECT def_json FROM queue_entries WHERE queue = ?1").map_err(db)?;
            let rows = statement.query_map(params![queue], |row| row.get::<_, Vec<u8>>(0)).map_err(db)?;
            let mut defs: Vec<QueryDef> = Vec::new();
            for row in rows {
                defs.push(decode(&row.map_err(db)?)?);
            }
            Ok(QueryStageState { active: active_keys(tx, &queue)?, to_process: pending_keys(tx, &queue)?, defs })
        })
        .await?)
    }

    async fn reconcile_queue(&self, request: ReconcileRequest) -> Result<ReconcilePlan, StoreError> {
        let queue = self.queue.clone();
        Ok(in_transaction(&self.connection, move |tx| {
            let stalled_cutoff = request.now.saturating_sub(request.heartbeat_timeout_ms);
            let mut seen = HashSet::new();
            let candidates: Vec<QueryKeyHash> = stalled_keys(tx, &queue, stalled_cutoff)?
                .into_iter()
                .chain(orphaned_keys(tx, &queue, request.now)?)
                .filter(|key| seen.insert(key.clone()))
                .collect();
            let mut removed = Vec::with_capacity(candidates.len());
            for key in &candidates {
                if let Some(def) = remove_entry(tx, &queue, key.as_str())? {
                    removed.push(def);
                }
            }
            let mut to_dispatch = Vec::new();
            for key in pending_keys(tx, &queue)? {
                if to_dispatch.len() >= request.concurrency {
                    break;
                }
                let owned = load_def(tx, &queue, key.as_str())?.is_some_and(|def| def.is_owned_by(&request.process_uid));
                if owned {
                    to_dispatch.push(key);
                }
            }
            Ok(ReconcilePlan { removed, to_dispatch })
        })
        .await?)
    }

    async fn next_processing_id(&self) -> Result<ProcessingId, StoreError> {
        let queue = self.queue.clone();
        let raw = in_transaction(&self.connection, move |tx| next_counter(tx, &queue, "processing_id")).await?;
        let raw = u64::try_from(raw).map_err(|_| SqliteStoreError::Corrupt("negative processing id".to_string()))?;
        Ok(ProcessingId::new(raw))
    }
}

// ============================================================================
// SECTION: Cache Store
// ============================================================================

/// Cache values and advisory locks inside a shared database.
pub struct SqliteCacheStore {
    /// Shared connection.
    connection: SharedConnection,
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        Ok(in_transaction(&self.connection, move |tx| {
            tx.execute("DELETE FROM cache_values WHERE key = ?1 AND expires_at <= ?2", params![key, unix_millis()])
                .map_err(db)?;
            let bytes: Option<Vec<u8>> = tx
                .query_row("SELECT value_json FROM cache_values WHERE key = ?1", params![key], |row| row.get(0))
                .optional()
                .map_err(db)?;
            bytes.map(|bytes| decode(&bytes)).transpose()
        })
        .await?)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        let value_json = encode(&value)?;
        let ttl = duration_millis(ttl);
        Ok(in_transaction(&self.connection, move |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO cache_values (key, value_json, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value_json, unix_millis().saturating_add(ttl)],
            )
            .map_err(db)?;
            Ok(())
        })
        .await?)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        Ok(in_transaction(&self.connection, move |tx| {
            tx.execute("DELETE FROM cache_values WHERE key = ?1", params![key]).map_err(db)?;
            Ok(())
        })
        .await?)
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        Ok(in_transaction(&self.connection, move |tx| {
            tx.execute("DELETE FROM cache_values WHERE expires_at <= ?1", params![unix_millis()]).map_err(db)?;
            let mut statement = tx
                .prepare("SELECT key FROM cache_values WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
                .map_err(db)?;
            let rows = statement.query_map(params![prefix], |row| row.get::<_, String>(0)).map_err(db)?;
            rows.map(|row| row.map_err(db)).collect()
        })
        .await?)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let owner = owner.to_string();
        let ttl = duration_millis(ttl);
        Ok(in_transaction(&self.connection, move |tx| {
            let now = unix_millis();
            let expires_at: Option<i64> = tx
                .query_row("SELECT expires_at FROM cache_locks WHERE key = ?1", params![key], |row| row.get(0))
                .optional()
                .map_err(db)?;
            if expires_at.is_some_and(|expires_at| expires_at > now) {
                return Ok(false);
            }
            tx.execute(
                "INSERT OR REPLACE INTO cache_locks (key, owner, expires_at) VALUES (?1, ?2, ?3)",
                params![key, owner, now.saturating_add(ttl)],
            )
            .map_err(db)?;
            Ok(true)
        })
        .await?)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let owner = owner.to_string();
        Ok(in_transaction(&self.connection, move |tx| {
            tx.execute("DELETE FROM cache_locks WHERE key = ?1 AND owner = ?2", params![key, owner]).map_err(db)?;
            Ok(())
        })
        .await?)
    }
}

// ============================================================================
// SECTION: Backing Store
// ============================================================================

/// `SQLite`-backed store shared by every process opening the same file.
///
/// # Invariants
/// - Connection access is serialized through a mutex.
/// - Each queue name maps to one [`SqliteQueueStore`] per backing store so
///   in-process result waiters share a wakeup.
#[derive(Clone)]
pub struct SqliteBackingStore {
    /// Shared connection.
    connection: SharedConnection,
    /// Queue views by name.
    queues: Arc<Mutex<HashMap<String, Arc<SqliteQueueStore>>>>,
    /// Cache view.
    cache: Arc<SqliteCacheStore>,
    /// Retention settings for queue views.
    retention: StoreRetention,
}

impl SqliteBackingStore {
    /// Opens or creates the database at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the path is invalid or the database
    /// cannot be opened or initialized.
    pub fn open(config: &SqliteStoreConfig, retention: StoreRetention) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        let connection = Arc::new(Mutex::new(connection));
        Ok(Self {
            cache: Arc::new(SqliteCacheStore { connection: Arc::clone(&connection) }),
            connection,
            queues: Arc::new(Mutex::new(HashMap::new())),
            retention,
        })
    }

    /// Verifies the store can execute a simple statement.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the connection is unusable.
    pub async fn readiness(&self) -> Result<(), SqliteStoreError> {
        with_connection(&self.connection, |connection| {
            connection.execute_batch("SELECT 1").map_err(db)?;
            Ok(())
        })
        .await
    }
}

impl BackingStore for SqliteBackingStore {
    fn queue_store(&self, queue_name: &str) -> Result<Arc<dyn QueueStore>, StoreError> {
        let mut queues =
            self.queues.lock().map_err(|_| StoreError::Store("sqlite backing mutex poisoned".to_string()))?;
        let store = queues
            .entry(queue_name.to_string())
            .or_insert_with(|| {
                Arc::new(SqliteQueueStore {
                    connection: Arc::clone(&self.connection),
                    queue: queue_name.to_string(),
                    results_ready: Notify::new(),
                    retention: self.retention,
                })
            })
            .clone();
        Ok(store)
    }

    fn cache_store(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStoreError::Invalid("store path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid("store path contains an overlong component".to_string()));
        }
    }
    if path.is_dir() {
        return Err(SqliteStoreError::Invalid("store path must be a file, not a directory".to_string()));
    }
    Ok(())
}

/// Opens an `SQLite` connection with the configured pragmas.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags =
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags).map_err(db)?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(db)?;
    connection.execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value())).map_err(db)?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms)).map_err(db)?;
    Ok(connection)
}

/// Initializes the schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);").map_err(db)?;
    let version: Option<i64> =
        tx.query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0)).optional().map_err(db)?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION]).map_err(db)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS queue_entries (
                    queue TEXT NOT NULL,
                    key_hash TEXT NOT NULL,
                    def_json BLOB NOT NULL,
                    score INTEGER NOT NULL,
                    sequence INTEGER NOT NULL,
                    pending INTEGER NOT NULL,
                    orphaned_at INTEGER NOT NULL,
                    active_id INTEGER,
                    heartbeat_at INTEGER,
                    PRIMARY KEY (queue, key_hash)
                );
                CREATE INDEX IF NOT EXISTS idx_queue_entries_pending
                    ON queue_entries (queue, pending, score, sequence);
                CREATE TABLE IF NOT EXISTS queue_locks (
                    queue TEXT NOT NULL,
                    key_hash TEXT NOT NULL,
                    processing_id INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (queue, key_hash)
                );
                CREATE TABLE IF NOT EXISTS queue_results (
                    queue TEXT NOT NULL,
                    key_hash TEXT NOT NULL,
                    result_json BLOB NOT NULL,
                    expires_at INTEGER NOT NULL,
                    delivered INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (queue, key_hash)
                );
                CREATE TABLE IF NOT EXISTS queue_counters (
                    queue TEXT NOT NULL,
                    name TEXT NOT NULL,
                    value INTEGER NOT NULL,
                    PRIMARY KEY (queue, name)
                );
                CREATE TABLE IF NOT EXISTS cache_values (
                    key TEXT PRIMARY KEY,
                    value_json BLOB NOT NULL,
                    expires_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS cache_locks (
                    key TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );",
            )
            .map_err(db)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!("unsupported schema version: {value}")));
        }
    }
    tx.commit().map_err(db)?;
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn oversized_payloads_are_rejected() {
        let value = Value::String("x".repeat(MAX_VALUE_BYTES));
        assert!(matches!(encode(&value), Err(SqliteStoreError::TooLarge { .. })));
    }

    #[test]
    fn corrupt_payloads_fail_closed() {
        let decoded: Result<QueryDef, SqliteStoreError> = decode(b"{\"key_hash\":");
        assert!(matches!(decoded, Err(SqliteStoreError::Corrupt(_))));
    }

    #[test]
    fn store_errors_map_to_interface_errors() {
        let err: StoreError = SqliteStoreError::Db("locked".to_string()).into();
        assert_eq!(err, StoreError::Store("locked".to_string()));
        let err: StoreError = SqliteStoreError::TooLarge { max_bytes: 1, actual_bytes: 2 }.into();
        assert!(matches!(err, StoreError::Invalid(message) if message.contains("2 bytes")));
    }

    #[test]
    fn empty_paths_are_rejected() {
        assert!(matches!(validate_store_path(Path::new("")), Err(SqliteStoreError::Invalid(_))));
    }
}
