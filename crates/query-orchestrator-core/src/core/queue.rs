// crates/query-orchestrator-core/src/core/queue.rs
// ============================================================================
// Module: Query Orchestrator Queue Model
// Description: Queue keys, entries, claims, results, and reconcile plans.
// Purpose: Define the records exchanged between QueryQueue and QueueStore.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every queued job is addressed by a [`QueryKeyHash`]. String keys shorter
//! than [`MAX_PLAIN_KEY_LENGTH`] are used verbatim; anything else is the
//! SHA-256 of its canonical JSON. Persistent keys carry an `@<processUid>`
//! suffix so that only the owning process ever executes them.
//!
//! Scheduling order is encoded in a single integer score:
//! `enqueueMillis + (10000 - priority) * 1e14`. Lower scores run first, so
//! higher priority wins and equal priorities run in arrival order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashError;
use crate::core::hashing::hash_canonical_json;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Lowest accepted queue priority.
pub const MIN_PRIORITY: i32 = -10_000;

/// Highest accepted queue priority.
pub const MAX_PRIORITY: i32 = 10_000;

/// String keys at or above this length are hashed.
pub const MAX_PLAIN_KEY_LENGTH: usize = 256;

/// Score weight applied per priority step.
const PRIORITY_SCORE_WEIGHT: i64 = 100_000_000_000_000;

/// Separator between a persistent key hash and its owning process.
const PROCESS_SUFFIX_SEPARATOR: char = '@';

/// Returns the ordering score for an entry enqueued at `now_ms`.
///
/// Callers validate `priority` against [`MIN_PRIORITY`] and [`MAX_PRIORITY`].
#[must_use]
pub fn queue_score(now_ms: i64, priority: i32) -> i64 {
    let clamped = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    let weight = i64::from(MAX_PRIORITY - clamped);
    now_ms.saturating_add(weight.saturating_mul(PRIORITY_SCORE_WEIGHT))
}

// ============================================================================
// SECTION: Keys
// ============================================================================

/// Caller-supplied queue key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKey {
    /// JSON-able key content.
    pub value: Value,
    /// Whether the hash is scoped to the executing process.
    #[serde(default)]
    pub persistent: bool,
}

impl QueryKey {
    /// Creates a shared key.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self { value, persistent: false }
    }

    /// Creates a process-scoped key.
    #[must_use]
    pub const fn persistent(value: Value) -> Self {
        Self { value, persistent: true }
    }

    /// Returns the store hash for this key.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when the key cannot be canonicalized.
    pub fn hash(&self, process_uid: &str) -> Result<QueryKeyHash, HashError> {
        let base = match &self.value {
            Value::String(text) if text.len() < MAX_PLAIN_KEY_LENGTH => text.clone(),
            other => hash_canonical_json(DEFAULT_HASH_ALGORITHM, other)?.value,
        };
        if self.persistent {
            Ok(QueryKeyHash(format!("{base}{PROCESS_SUFFIX_SEPARATOR}{process_uid}")))
        } else {
            Ok(QueryKeyHash(base))
        }
    }
}

/// Store-level identity of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKeyHash(String);

impl QueryKeyHash {
    /// Wraps an already-hashed key.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the hash as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic claim identifier handed out by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingId(u64);

impl ProcessingId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Entries
// ============================================================================

/// Handler variant an entry dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    /// Returns a single value.
    Query,
    /// Writes rows into a stream sink.
    Stream,
}

impl HandlerType {
    /// Returns the handler name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Stream => "stream",
        }
    }
}

/// Queued job definition as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDef {
    /// Store hash of the key.
    pub key_hash: QueryKeyHash,
    /// Original key content.
    pub query_key: Value,
    /// Handler the entry dispatches to.
    pub handler: HandlerType,
    /// Handler payload.
    pub payload: Value,
    /// Scheduling priority.
    pub priority: i32,
    /// Key used by stage lookups.
    #[serde(default)]
    pub stage_key: Option<String>,
    /// Caller correlation identifier.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Enqueue time in unix milliseconds.
    pub added_to_queue_time: i64,
    /// Execution start time in unix milliseconds.
    #[serde(default)]
    pub start_query_time: Option<i64>,
    /// State exposed by the handler for later cancellation.
    #[serde(default)]
    pub cancel_handler: Option<Value>,
    /// Process that must execute a persistent key; `None` for shared keys.
    #[serde(default)]
    pub owner: Option<String>,
}

impl QueryDef {
    /// Returns true when `process_uid` may execute this entry.
    #[must_use]
    pub fn is_owned_by(&self, process_uid: &str) -> bool {
        self.owner.as_deref().is_none_or(|owner| owner == process_uid)
    }
}

/// Fields a running handler may merge into its entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefUpdate {
    /// Execution start time in unix milliseconds.
    pub start_query_time: Option<i64>,
    /// State exposed by the handler for later cancellation.
    pub cancel_handler: Option<Value>,
}

/// Insert request for [`crate::interfaces::QueueStore::add_to_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddToQueueRequest {
    /// Ordering score from [`queue_score`].
    pub score: i64,
    /// Deadline after which an unobserved entry is orphaned, in unix millis.
    pub orphaned_time: i64,
    /// Entry definition.
    pub def: QueryDef,
}

/// Outcome of [`crate::interfaces::QueueStore::add_to_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddToQueueResponse {
    /// True when this call created the entry.
    pub added: bool,
    /// Number of pending entries after the call.
    pub queue_size: usize,
    /// Enqueue time of the (possibly pre-existing) entry.
    pub added_to_queue_time: i64,
}

/// Outcome of a processing claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveForProcessing {
    /// True when this call moved the key into the active set.
    pub activated: bool,
    /// Active keys after the call.
    pub active_keys: Vec<QueryKeyHash>,
    /// Number of pending entries after the call.
    pub queue_size: usize,
    /// Entry definition when it still exists.
    pub query: Option<QueryDef>,
    /// True when the processing lock belongs to the caller.
    pub lock_acquired: bool,
}

impl RetrieveForProcessing {
    /// Returns true when the caller should run the entry.
    #[must_use]
    pub fn should_execute(&self, key_hash: &QueryKeyHash) -> bool {
        self.query.is_some() && self.activated && self.lock_acquired && self.active_keys.contains(key_hash)
    }
}

// ============================================================================
// SECTION: Results
// ============================================================================

/// Failure class of a finished entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The handler exceeded the execution timeout.
    Timeout,
    /// The handler returned an error.
    Handler,
    /// The entry was cancelled.
    Cancelled,
}

/// Final outcome stored for every waiter of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Handler returned a value.
    Success {
        /// Returned value.
        value: Value,
    },
    /// Handler or queue failed.
    Error {
        /// Failure class.
        kind: ExecutionErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// Stream handler completed.
    StreamFinished,
}

// ============================================================================
// SECTION: Listings
// ============================================================================

/// Snapshot used by stage reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStageState {
    /// Keys currently executing.
    pub active: Vec<QueryKeyHash>,
    /// Keys waiting, in scheduling order.
    pub to_process: Vec<QueryKeyHash>,
    /// Definitions of all listed keys.
    pub defs: Vec<QueryDef>,
}

/// Human-readable stage of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStage {
    /// Stage text, `#n in queue` or `Executing query`.
    pub stage: String,
    /// Milliseconds since execution started.
    #[serde(default)]
    pub time_elapsed_ms: Option<i64>,
}

/// Status flags reported by queue listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// No waiter observed the entry before its orphaned deadline.
    Orphaned,
    /// The entry's heartbeat stopped.
    Stalled,
    /// The entry is executing.
    Active,
    /// The entry is waiting.
    ToProcess,
}

/// Queue listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedQuery {
    /// Entry definition.
    pub def: QueryDef,
    /// Status flags.
    pub statuses: Vec<QueueStatus>,
}

// ============================================================================
// SECTION: Reconcile
// ============================================================================

/// Parameters for an atomic reconcile sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    /// Current unix millis.
    pub now: i64,
    /// Heartbeats older than this many milliseconds count as stalled.
    pub heartbeat_timeout_ms: i64,
    /// Maximum number of keys to dispatch.
    pub concurrency: usize,
    /// Process allowed to run persistent keys.
    pub process_uid: String,
}

/// Result of an atomic reconcile sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Stalled or orphaned entries that were removed.
    pub removed: Vec<QueryDef>,
    /// Pending keys to notify for processing.
    pub to_dispatch: Vec<QueryKeyHash>,
}

// ============================================================================
// SECTION: Tests
// ============================================================================
