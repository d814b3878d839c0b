// crates/query-orchestrator-core/src/runtime/memory.rs
// ============================================================================
// Module: Query Orchestrator In-Memory Store
// Description: Single-process QueueStore, CacheStore, and BackingStore.
// Purpose: Provide the reference atomic store for local deployments and tests.
// Dependencies: async-trait, tokio, crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Every namespace keeps its queue state behind one mutex, which makes each
//! trait method trivially atomic. Result waiters park on a [`Notify`] and are
//! woken whenever any result in the namespace is stored. A stored result is
//! handed to every waiter blocked on it, while a plain lookup only returns a
//! result nobody has received yet.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

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
use crate::interfaces::BackingStore;
use crate::interfaces::CacheStore;
use crate::interfaces::QueueStore;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Retention settings shared by store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetention {
    /// How long finished results stay readable by late waiters.
    pub result_ttl: Duration,
    /// How long a processing claim survives without a heartbeat.
    pub processing_lock_ttl: Duration,
}

impl StoreRetention {
    /// Default result retention.
    pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);
    /// Default processing lock lifetime.
    pub const DEFAULT_PROCESSING_LOCK_TTL: Duration = Duration::from_secs(120);
}

impl Default for StoreRetention {
    fn default() -> Self {
        Self { result_ttl: Self::DEFAULT_RESULT_TTL, processing_lock_ttl: Self::DEFAULT_PROCESSING_LOCK_TTL }
    }
}

/// Converts a duration into whole milliseconds.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// SECTION: Queue State
// ============================================================================

/// Mutable state of one queue namespace.
#[derive(Debug, Default)]
struct QueueState {
    /// Entry definitions by key.
    defs: HashMap<QueryKeyHash, QueryDef>,
    /// Pending keys with `(score, arrival sequence)`.
    to_process: HashMap<QueryKeyHash, (i64, u64)>,
    /// Orphaned deadlines by key.
    recent: HashMap<QueryKeyHash, i64>,
    /// Active keys with the claim that activated them.
    active: HashMap<QueryKeyHash, ProcessingId>,
    /// Last heartbeat by key.
    heartbeat: HashMap<QueryKeyHash, i64>,
    /// Processing locks with expiry.
    locks: HashMap<QueryKeyHash, (ProcessingId, i64)>,
    /// Finished results.
    results: HashMap<QueryKeyHash, StoredResult>,
    /// Last issued processing id.
    processing_counter: u64,
    /// Arrival sequence for FIFO tie-breaks.
    sequence: u64,
}

/// Finished result awaiting delivery.
#[derive(Debug)]
struct StoredResult {
    /// Execution outcome.
    result: ExecutionResult,
    /// Expiry in unix milliseconds.
    expires_at: i64,
    /// Set once any waiter received the result.
    delivered: bool,
}

impl QueueState {
    /// Removes a key from every set except results.
    fn remove_entry(&mut self, key: &QueryKeyHash) -> Option<QueryDef> {
        self.to_process.remove(key);
        self.recent.remove(key);
        self.active.remove(key);
        self.heartbeat.remove(key);
        self.locks.remove(key);
        self.defs.remove(key)
    }

    /// Returns pending keys in scheduling order.
    fn pending_in_order(&self) -> Vec<QueryKeyHash> {
        let mut pending: Vec<(&QueryKeyHash, &(i64, u64))> = self.to_process.iter().collect();
        pending.sort_by_key(|(_, order)| **order);
        pending.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Returns active keys in activation order.
    fn active_in_order(&self) -> Vec<QueryKeyHash> {
        let mut active: Vec<(&QueryKeyHash, &ProcessingId)> = self.active.iter().collect();
        active.sort_by_key(|(_, id)| **id);
        active.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Returns true when `processing_id` holds the lock for `key`.
    fn holds_lock(&self, key: &QueryKeyHash, processing_id: ProcessingId) -> bool {
        self.locks.get(key).is_some_and(|(owner, _)| *owner == processing_id)
    }

    /// Returns keys whose order value is below `cutoff`, oldest first.
    fn keys_below(map: &HashMap<QueryKeyHash, i64>, cutoff: i64) -> Vec<QueryKeyHash> {
        let mut keys: Vec<(&QueryKeyHash, &i64)> = map.iter().filter(|(_, order)| **order < cutoff).collect();
        keys.sort_by_key(|(_, order)| **order);
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

// ============================================================================
// SECTION: Queue Store
// ============================================================================

/// In-memory queue namespace.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    /// Queue state.
    state: Mutex<QueueState>,
    /// Wakes result waiters.
    results_ready: Notify,
    /// Retention settings.
    retention: StoreRetention,
}

impl InMemoryQueueStore {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new(retention: StoreRetention) -> Self {
        Self { state: Mutex::new(QueueState::default()), results_ready: Notify::new(), retention }
    }

    /// Locks the queue state.
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Store("in-memory queue mutex poisoned".to_string()))
    }

    /// Returns an unexpired result and marks it delivered. With
    /// `undelivered_only` a result some waiter already received is skipped.
    fn read_result(&self, key: &QueryKeyHash, undelivered_only: bool) -> Result<Option<ExecutionResult>, StoreError> {
        let mut state = self.lock()?;
        let now = unix_millis();
        if state.results.get(key).is_some_and(|stored| stored.expires_at <= now) {
            state.results.remove(key);
        }
        let Some(stored) = state.results.get_mut(key) else {
            return Ok(None);
        };
        if stored.delivered && undelivered_only {
            return Ok(None);
        }
        stored.delivered = true;
        Ok(Some(stored.result.clone()))
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn add_to_queue(&self, request: AddToQueueRequest) -> Result<AddToQueueResponse, StoreError> {
        let mut state = self.lock()?;
        let key = request.def.key_hash.clone();
        state.recent.insert(key.clone(), request.orphaned_time);
        if let Some(existing) = state.defs.get(&key) {
            let added_to_queue_time = existing.added_to_queue_time;
            return Ok(AddToQueueResponse {
                added: false,
                queue_size: state.to_process.len(),
                added_to_queue_time,
            });
        }
        state.sequence += 1;
        let sequence = state.sequence;
        let added_to_queue_time = request.def.added_to_queue_time;
        state.results.remove(&key);
        state.to_process.insert(key.clone(), (request.score, sequence));
        state.defs.insert(key, request.def);
        Ok(AddToQueueResponse { added: true, queue_size: state.to_process.len(), added_to_queue_time })
    }

    async fn retrieve_for_processing(
        &self,
        key: &QueryKeyHash,
        processing_id: ProcessingId,
        concurrency: usize,
    ) -> Result<Option<RetrieveForProcessing>, StoreError> {
        let mut state = self.lock()?;
        let now = unix_millis();
        if let Some((_, expires_at)) = state.locks.get(key)
            && *expires_at > now
        {
            return Ok(None);
        }
        let lock_expires = now.saturating_add(duration_millis(self.retention.processing_lock_ttl));
        state.locks.insert(key.clone(), (processing_id, lock_expires));
        let activated =
            state.active.len() < concurrency && !state.active.contains_key(key) && state.defs.contains_key(key);
        if activated {
            state.active.insert(key.clone(), processing_id);
            state.to_process.remove(key);
            state.heartbeat.insert(key.clone(), now);
        }
        Ok(Some(RetrieveForProcessing {
            activated,
            active_keys: state.active_in_order(),
            queue_size: state.to_process.len(),
            query: state.defs.get(key).cloned(),
            lock_acquired: true,
        }))
    }

    async fn free_processing_lock(
        &self,
        key: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.holds_lock(key, processing_id) {
            state.locks.remove(key);
            if activated {
                state.active.remove(key);
                state.heartbeat.remove(key);
            }
        }
        Ok(())
    }

    async fn optimistic_query_update(
        &self,
        key: &QueryKeyHash,
        update: QueryDefUpdate,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if !state.holds_lock(key, processing_id) {
            return Ok(false);
        }
        let Some(def) = state.defs.get_mut(key) else {
            return Ok(false);
        };
        if let Some(start) = update.start_query_time {
            def.start_query_time = Some(start);
        }
        if let Some(cancel_handler) = update.cancel_handler {
            def.cancel_handler = Some(cancel_handler);
        }
        Ok(true)
    }

    async fn update_heartbeat(&self, key: &QueryKeyHash) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let now = unix_millis();
        if state.active.contains_key(key) {
            state.heartbeat.insert(key.clone(), now);
            let lock_expires = now.saturating_add(duration_millis(self.retention.processing_lock_ttl));
            if let Some((_, expires_at)) = state.locks.get_mut(key) {
                *expires_at = lock_expires;
            }
        }
        Ok(())
    }

    async fn set_result_and_remove_query(
        &self,
        key: &QueryKeyHash,
        result: ExecutionResult,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError> {
        {
            let mut state = self.lock()?;
            if !state.holds_lock(key, processing_id) {
                return Ok(false);
            }
            state.remove_entry(key);
            let expires_at = unix_millis().saturating_add(duration_millis(self.retention.result_ttl));
            state.results.insert(key.clone(), StoredResult { result, expires_at, delivered: false });
        }
        self.results_ready.notify_waiters();
        Ok(true)
    }

    async fn get_result(&self, key: &QueryKeyHash) -> Result<Option<ExecutionResult>, StoreError> {
        self.read_result(key, true)
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
            if let Some(result) = self.read_result(key, false)? {
                return Ok(Some(result));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.read_result(key, false);
            }
        }
    }

    async fn get_query_and_remove(&self, key: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError> {
        let mut state = self.lock()?;
        Ok(state.remove_entry(key))
    }

    async fn get_query_def(&self, key: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError> {
        let state = self.lock()?;
        Ok(state.defs.get(key).cloned())
    }

    async fn get_orphaned_queries(&self, now: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        let state = self.lock()?;
        Ok(QueueState::keys_below(&state.recent, now))
    }

    async fn get_stalled_queries(&self, cutoff: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        let state = self.lock()?;
        Ok(QueueState::keys_below(&state.heartbeat, cutoff))
    }

    async fn get_query_stage_state(&self) -> Result<QueryStageState, StoreError> {
        let state = self.lock()?;
        Ok(QueryStageState {
            active: state.active_in_order(),
            to_process: state.pending_in_order(),
            defs: state.defs.values().cloned().collect(),
        })
    }

    async fn reconcile_queue(&self, request: ReconcileRequest) -> Result<ReconcilePlan, StoreError> {
        let mut state = self.lock()?;
        let stalled_cutoff = request.now.saturating_sub(request.heartbeat_timeout_ms);
        let mut seen = HashSet::new();
        let candidates: Vec<QueryKeyHash> = QueueState::keys_below(&state.heartbeat, stalled_cutoff)
            .into_iter()
            .chain(QueueState::keys_below(&state.recent, request.now))
            .filter(|key| seen.insert(key.clone()))
            .collect();
        let removed = candidates.iter().filter_map(|key| state.remove_entry(key)).collect();
        let to_dispatch = state
            .pending_in_order()
            .into_iter()
            .filter(|key| state.defs.get(key).is_some_and(|def| def.is_owned_by(&request.process_uid)))
            .take(request.concurrency)
            .collect();
        Ok(ReconcilePlan { removed, to_dispatch })
    }

    async fn next_processing_id(&self) -> Result<ProcessingId, StoreError> {
        let mut state = self.lock()?;
        state.processing_counter += 1;
        Ok(ProcessingId::new(state.processing_counter))
    }
}

// ============================================================================
// SECTION: Cache Store
// ============================================================================

/// Mutable state of the in-memory cache.
#[derive(Debug, Default)]
struct CacheState {
    /// Values with expiry.
    values: HashMap<String, (Value, i64)>,
    /// Locks with owner and expiry.
    locks: HashMap<String, (String, i64)>,
}

/// In-memory cache store with advisory locks.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    /// Cache state.
    state: Mutex<CacheState>,
}

impl InMemoryCacheStore {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the cache state.
    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Store("in-memory cache mutex poisoned".to_string()))
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut state = self.lock()?;
        let now = unix_millis();
        if state.values.get(key).is_some_and(|(_, expires_at)| *expires_at <= now) {
            state.values.remove(key);
        }
        Ok(state.values.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let expires_at = unix_millis().saturating_add(duration_millis(ttl));
        state.values.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.values.remove(key);
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock()?;
        let now = unix_millis();
        state.values.retain(|_, (_, expires_at)| *expires_at > now);
        let mut keys: Vec<String> = state.values.keys().filter(|key| key.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let now = unix_millis();
        if state.locks.get(key).is_some_and(|(_, expires_at)| *expires_at > now) {
            return Ok(false);
        }
        let expires_at = now.saturating_add(duration_millis(ttl));
        state.locks.insert(key.to_string(), (owner.to_string(), expires_at));
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.locks.get(key).is_some_and(|(holder, _)| holder == owner) {
            state.locks.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Backing Store
// ============================================================================

/// In-memory backing store for a single process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackingStore {
    /// Queue namespaces by name.
    queues: Arc<Mutex<HashMap<String, Arc<InMemoryQueueStore>>>>,
    /// Shared cache.
    cache: Arc<InMemoryCacheStore>,
    /// Retention settings for new namespaces.
    retention: StoreRetention,
}

impl InMemoryBackingStore {
    /// Creates an empty backing store.
    #[must_use]
    pub fn new(retention: StoreRetention) -> Self {
        Self { queues: Arc::new(Mutex::new(HashMap::new())), cache: Arc::new(InMemoryCacheStore::new()), retention }
    }
}

impl BackingStore for InMemoryBackingStore {
    fn queue_store(&self, queue_name: &str) -> Result<Arc<dyn QueueStore>, StoreError> {
        let mut queues =
            self.queues.lock().map_err(|_| StoreError::Store("in-memory backing mutex poisoned".to_string()))?;
        let store = queues
            .entry(queue_name.to_string())
            .or_insert_with(|| Arc::new(InMemoryQueueStore::new(self.retention)))
            .clone();
        Ok(store)
    }

    fn cache_store(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }
}
