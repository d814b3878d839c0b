// crates/query-orchestrator-core/src/runtime/queue.rs
// ============================================================================
// Module: Query Queue
// Description: Priority queue with deduplication, concurrency, and timeouts.
// Purpose: Execute each distinct key at most once across cooperating processes.
// Dependencies: tokio, tokio-stream, tokio-util, rand, crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! [`QueryQueue::execute_in_queue`] enqueues a key (or attaches to the
//! existing entry), triggers a reconcile sweep, and waits up to
//! `continue_wait_timeout` for the shared result. Callers that time out get
//! [`QueueError::ContinueWait`] and are expected to call again; execution is
//! unaffected.
//!
//! Processing is driven by notifications. Without a [`QueueMessenger`] the
//! queue notifies itself by spawning [`QueryQueue::process_query`]; with one,
//! notifications go wherever the messenger routes them. Either way
//! [`QueryQueue::reconcile_queue`] re-notifies pending keys, so a lost
//! message only costs latency.
//!
//! Cancellation is cooperative. Timeouts and cancels signal the handler's
//! [`CancellationToken`] and invoke its cancel hook, then release the slot
//! without waiting for the handler to acknowledge.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::core::hashing::HashError;
use crate::core::queue::AddToQueueRequest;
use crate::core::queue::ExecutionErrorKind;
use crate::core::queue::ExecutionResult;
use crate::core::queue::HandlerType;
use crate::core::queue::MAX_PRIORITY;
use crate::core::queue::MIN_PRIORITY;
use crate::core::queue::ProcessingId;
use crate::core::queue::QueryDef;
use crate::core::queue::QueryDefUpdate;
use crate::core::queue::QueryKey;
use crate::core::queue::QueryKeyHash;
use crate::core::queue::QueryStage;
use crate::core::queue::QueueStatus;
use crate::core::queue::QueuedQuery;
use crate::core::queue::ReconcileRequest;
use crate::core::queue::queue_score;
use crate::core::time::unix_millis;
use crate::interfaces::HandlerContext;
use crate::interfaces::HandlerError;
use crate::interfaces::OrchestratorEvent;
use crate::interfaces::OrchestratorEventSink;
use crate::interfaces::QueueHandlers;
use crate::interfaces::QueueMessenger;
use crate::interfaces::QueueStore;
use crate::interfaces::StoreError;
use crate::interfaces::StreamSink;
use crate::runtime::memory::duration_millis;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Buffered rows between a stream handler and its consumer.
const STREAM_BUFFER: usize = 64;

/// Stage text for running entries.
pub const EXECUTING_STAGE: &str = "Executing query";

// ============================================================================
// SECTION: Options
// ============================================================================

/// Queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum simultaneous handler invocations.
    pub concurrency: usize,
    /// Client-facing wait before [`QueueError::ContinueWait`].
    pub continue_wait_timeout: Duration,
    /// Handler runtime limit.
    pub execution_timeout: Duration,
    /// Time an entry survives without a waiter resubmitting it.
    pub orphaned_timeout: Duration,
    /// Heartbeat cadence of running entries.
    pub heartbeat_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            continue_wait_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(600),
            orphaned_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl QueueOptions {
    /// Returns the silence after which a running entry counts as stalled.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(4)
    }

    /// Returns the timeout error text.
    #[must_use]
    pub fn timeout_message(&self) -> String {
        format!("Query execution timeout after {} min of waiting", self.execution_timeout.as_secs_f64() / 60.0)
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Result not ready yet; call again.
    #[error("Continue wait")]
    ContinueWait,
    /// Execution exceeded the execution timeout.
    #[error("{0}")]
    Timeout(String),
    /// Handler failed.
    #[error("{0}")]
    Handler(String),
    /// Execution was cancelled.
    #[error("{0}")]
    Cancelled(String),
    /// Priority outside the accepted range.
    #[error("Priority should be between -10000 and 10000")]
    InvalidPriority(i32),
    /// Stream output is not available to this caller.
    #[error("stream is not available for {0}")]
    StreamUnavailable(String),
    /// Store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Key hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

impl QueueError {
    /// Returns true for the non-terminal polling signal.
    #[must_use]
    pub const fn is_continue_wait(&self) -> bool {
        matches!(self, Self::ContinueWait)
    }
}

// ============================================================================
// SECTION: Streams
// ============================================================================

/// Rows produced by a stream handler.
#[derive(Debug)]
pub struct QueryStream {
    /// Underlying channel stream.
    inner: ReceiverStream<Result<Value, String>>,
}

impl QueryStream {
    /// Returns the next row, `None` once the producer finished.
    pub async fn next_row(&mut self) -> Option<Result<Value, QueueError>> {
        self.next().await
    }
}

impl Stream for QueryStream {
    type Item = Result<Value, QueueError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(|row| row.map_err(QueueError::Handler)))
    }
}

/// Output of [`QueryQueue::execute_in_queue`].
#[derive(Debug)]
pub enum QueueOutput {
    /// Value returned by a query handler.
    Value(Value),
    /// Rows produced by a stream handler.
    Stream(QueryStream),
}

impl QueueOutput {
    /// Returns the value, rejecting stream output.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StreamUnavailable`] for stream output.
    pub fn into_value(self) -> Result<Value, QueueError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(_) => Err(QueueError::StreamUnavailable("value request".to_string())),
        }
    }
}

// ============================================================================
// SECTION: Queue
// ============================================================================

/// Per-call execution options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Key for [`QueryQueue::get_query_stage`] lookups.
    pub stage_key: Option<String>,
    /// Caller correlation identifier.
    pub request_id: Option<String>,
}

/// Everything needed to build a [`QueryQueue`].
pub struct QueueSetup {
    /// Queue name (store namespace and log prefix).
    pub name: String,
    /// Store namespace.
    pub store: Arc<dyn QueueStore>,
    /// Handler table.
    pub handlers: QueueHandlers,
    /// Tuning.
    pub options: QueueOptions,
    /// Cross-node notifications; local dispatch when absent.
    pub messenger: Option<Arc<dyn QueueMessenger>>,
    /// Log sink.
    pub events: Arc<dyn OrchestratorEventSink>,
}

/// Shared queue state.
struct QueueInner {
    /// Queue name.
    name: String,
    /// Process-unique suffix for persistent keys.
    process_uid: String,
    /// Store namespace.
    store: Arc<dyn QueueStore>,
    /// Handler table.
    handlers: QueueHandlers,
    /// Tuning.
    options: QueueOptions,
    /// Cross-node notifications.
    messenger: Option<Arc<dyn QueueMessenger>>,
    /// Log sink.
    events: Arc<dyn OrchestratorEventSink>,
    /// Held while a reconcile sweep runs.
    reconcile_lock: tokio::sync::Mutex<()>,
    /// Set when another sweep was requested during a running one.
    reconcile_again: AtomicBool,
    /// Cancellation tokens of locally running entries.
    running: Mutex<HashMap<QueryKeyHash, CancellationToken>>,
    /// Stream receivers awaiting their consumer.
    streams: Mutex<HashMap<QueryKeyHash, mpsc::Receiver<Result<Value, String>>>>,
    /// Wakes stream consumers.
    stream_started: Notify,
    /// Parent of every execution token.
    shutdown: CancellationToken,
}

/// Priority job queue over a [`QueueStore`].
#[derive(Clone)]
pub struct QueryQueue {
    /// Shared state.
    inner: Arc<QueueInner>,
}

impl QueryQueue {
    /// Builds a queue.
    #[must_use]
    pub fn new(setup: QueueSetup) -> Self {
        let process_uid = format!("{:016x}", rand::random::<u64>());
        Self {
            inner: Arc::new(QueueInner {
                name: setup.name,
                process_uid,
                store: setup.store,
                handlers: setup.handlers,
                options: setup.options,
                messenger: setup.messenger,
                events: setup.events,
                reconcile_lock: tokio::sync::Mutex::new(()),
                reconcile_again: AtomicBool::new(false),
                running: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                stream_started: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the process-unique suffix used for persistent keys.
    #[must_use]
    pub fn process_uid(&self) -> &str {
        &self.inner.process_uid
    }

    /// Returns the queue tuning.
    #[must_use]
    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Returns the store hash of a key as this queue computes it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Hash`] when the key cannot be canonicalized.
    pub fn key_hash(&self, key: &QueryKey) -> Result<QueryKeyHash, QueueError> {
        Ok(key.hash(&self.inner.process_uid)?)
    }

    /// Records an event.
    fn emit(&self, event: OrchestratorEvent) {
        self.inner.events.record(&event.with("queue", self.inner.name.clone()));
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Submits `key` and waits for its shared outcome.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ContinueWait`] when the result is not ready in
    /// time, [`QueueError::InvalidPriority`] for out-of-range priorities, and
    /// the entry's failure for failed executions.
    pub async fn execute_in_queue(
        &self,
        handler: HandlerType,
        key: &QueryKey,
        payload: Value,
        priority: i32,
        options: ExecuteOptions,
    ) -> Result<QueueOutput, QueueError> {
        if !(MIN_PRIORITY ..= MAX_PRIORITY).contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }
        let key_hash = self.key_hash(key)?;
        let store = &self.inner.store;
        if handler == HandlerType::Query
            && let Some(result) = store.get_result(&key_hash).await?
        {
            return result_to_output(&key_hash, result);
        }

        let now = unix_millis();
        let orphaned_time = now.saturating_add(duration_millis(self.inner.options.orphaned_timeout));
        let def = QueryDef {
            key_hash: key_hash.clone(),
            query_key: key.value.clone(),
            handler,
            payload,
            priority,
            stage_key: options.stage_key,
            request_id: options.request_id.clone(),
            added_to_queue_time: now,
            start_query_time: None,
            cancel_handler: None,
            owner: key.persistent.then(|| self.inner.process_uid.clone()),
        };
        let response =
            store.add_to_queue(AddToQueueRequest { score: queue_score(now, priority), orphaned_time, def }).await?;
        if response.added {
            self.emit(
                OrchestratorEvent::info("Added to queue")
                    .with("query_key", key_hash.to_string())
                    .with("priority", priority)
                    .with("queue_size", response.queue_size)
                    .with("request_id", options.request_id.clone()),
            );
        }

        self.reconcile_queue().await?;

        match handler {
            HandlerType::Query => {
                self.emit(
                    OrchestratorEvent::info("Waiting for query")
                        .with("query_key", key_hash.to_string())
                        .with("request_id", options.request_id),
                );
                let timeout = self.inner.options.continue_wait_timeout;
                match store.get_result_blocking(&key_hash, timeout).await? {
                    Some(result) => result_to_output(&key_hash, result),
                    None => Err(QueueError::ContinueWait),
                }
            }
            HandlerType::Stream => self.take_stream(&key_hash).await.map(QueueOutput::Stream),
        }
    }

    /// Waits for a stream started for `key_hash` and takes its receiver.
    async fn take_stream(&self, key_hash: &QueryKeyHash) -> Result<QueryStream, QueueError> {
        let deadline = tokio::time::Instant::now() + self.inner.options.continue_wait_timeout;
        loop {
            let notified = self.inner.stream_started.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let receiver = self
                .inner
                .streams
                .lock()
                .map_err(|_| StoreError::Store("queue stream mutex poisoned".to_string()))?
                .remove(key_hash);
            if let Some(receiver) = receiver {
                return Ok(QueryStream { inner: ReceiverStream::new(receiver) });
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::ContinueWait);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reconcile
    // ------------------------------------------------------------------------

    /// Removes stalled and orphaned entries and notifies pending ones.
    ///
    /// Concurrent calls coalesce: a call arriving during a running sweep
    /// makes that sweep run once more instead of starting its own.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] when the sweep fails.
    pub async fn reconcile_queue(&self) -> Result<(), QueueError> {
        self.inner.reconcile_again.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = self.inner.reconcile_lock.try_lock() else {
                return Ok(());
            };
            while self.inner.reconcile_again.swap(false, Ordering::SeqCst) {
                self.reconcile_once().await?;
            }
            drop(guard);
            if !self.inner.reconcile_again.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    /// Runs one reconcile sweep.
    async fn reconcile_once(&self) -> Result<(), QueueError> {
        let options = &self.inner.options;
        let request = ReconcileRequest {
            now: unix_millis(),
            heartbeat_timeout_ms: duration_millis(options.heartbeat_timeout()),
            concurrency: options.concurrency,
            process_uid: self.inner.process_uid.clone(),
        };
        let plan = self.inner.store.reconcile_queue(request).await?;
        for def in plan.removed {
            self.emit(
                OrchestratorEvent::info("Removing orphaned query")
                    .with("query_key", def.key_hash.to_string())
                    .with("request_id", def.request_id.clone()),
            );
            self.send_cancel_message(def).await;
        }
        for key in plan.to_dispatch {
            self.send_process_message(key).await;
        }
        Ok(())
    }

    /// Notifies a worker to process `key`.
    fn send_process_message(&self, key: QueryKeyHash) -> impl Future<Output = ()> + Send + '_ {
        async move {
            if let Some(messenger) = &self.inner.messenger {
                if let Err(err) = messenger.send_process_message(&self.inner.name, &key).await {
                    self.emit(
                        OrchestratorEvent::error("Queue storage error")
                            .with("query_key", key.to_string())
                            .with("error", err.to_string()),
                    );
                }
                return;
            }
            let queue = self.clone();
            tokio::spawn(async move { queue.process_query(key).await });
        }
    }

    /// Notifies a worker to cancel `def`.
    async fn send_cancel_message(&self, def: QueryDef) {
        if let Some(messenger) = &self.inner.messenger {
            if let Err(err) = messenger.send_cancel_message(&self.inner.name, &def).await {
                self.emit(
                    OrchestratorEvent::error("Error while cancel")
                        .with("query_key", def.key_hash.to_string())
                        .with("error", err.to_string()),
                );
            }
            return;
        }
        self.process_cancel(def).await;
    }

    // ------------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------------

    /// Claims and executes `key` if a slot is free. Storage failures are
    /// logged, not returned.
    pub async fn process_query(&self, key: QueryKeyHash) {
        if let Err(err) = self.try_process_query(&key).await {
            self.emit(
                OrchestratorEvent::error("Queue storage error")
                    .with("query_key", key.to_string())
                    .with("error", err.to_string()),
            );
        }
    }

    /// Claims and executes `key`, returning storage failures.
    async fn try_process_query(&self, key: &QueryKeyHash) -> Result<(), QueueError> {
        let store = &self.inner.store;
        let processing_id = store.next_processing_id().await?;
        let retrieved =
            store.retrieve_for_processing(key, processing_id, self.inner.options.concurrency).await?;
        let Some(retrieved) = retrieved else {
            self.emit(
                OrchestratorEvent::info("Skip processing")
                    .with("query_key", key.to_string())
                    .with("processing_id", processing_id.get())
                    .with("lock_acquired", false),
            );
            return Ok(());
        };
        if retrieved.should_execute(key)
            && let Some(def) = retrieved.query
        {
            self.execute_claimed(key, def, processing_id).await?;
            return self.reconcile_queue().await;
        }
        self.emit(
            OrchestratorEvent::info("Skip processing")
                .with("query_key", key.to_string())
                .with("processing_id", processing_id.get())
                .with("queue_size", retrieved.queue_size)
                .with("active", retrieved.active_keys.len())
                .with("activated", retrieved.activated)
                .with("lock_acquired", retrieved.lock_acquired),
        );
        store.free_processing_lock(key, processing_id, retrieved.activated).await?;
        Ok(())
    }

    /// Runs a claimed entry to completion and stores its outcome.
    async fn execute_claimed(
        &self,
        key: &QueryKeyHash,
        def: QueryDef,
        processing_id: ProcessingId,
    ) -> Result<(), QueueError> {
        let store = self.inner.store.clone();
        let started = unix_millis();
        self.emit(
            OrchestratorEvent::info("Performing query")
                .with("query_key", key.to_string())
                .with("processing_id", processing_id.get())
                .with("time_in_queue_ms", started - def.added_to_queue_time)
                .with("request_id", def.request_id.clone()),
        );
        store
            .optimistic_query_update(
                key,
                QueryDefUpdate { start_query_time: Some(started), cancel_handler: None },
                processing_id,
            )
            .await?;

        let token = self.inner.shutdown.child_token();
        self.register_running(key, &token)?;
        let heartbeat = self.spawn_heartbeat(key.clone());
        let context = HandlerContext::new(token.clone(), key.clone(), processing_id, store.clone());
        let outcome = match def.handler {
            HandlerType::Query => self.run_query_handler(&def, context, &token).await,
            HandlerType::Stream => self.run_stream_handler(key, &def, context, &token).await,
        };
        heartbeat.abort();
        self.unregister_running(key);

        match &outcome {
            ExecutionResult::Error { kind, message } => {
                if *kind == ExecutionErrorKind::Timeout {
                    token.cancel();
                    if let Some(current) = store.get_query_def(key).await? {
                        self.emit(
                            OrchestratorEvent::warn("Cancelling query due to timeout")
                                .with("query_key", key.to_string())
                                .with("request_id", current.request_id.clone()),
                        );
                        self.send_cancel_message(current).await;
                    }
                }
                self.emit(
                    OrchestratorEvent::error("Error while querying")
                        .with("query_key", key.to_string())
                        .with("processing_id", processing_id.get())
                        .with("error", message.clone())
                        .with("request_id", def.request_id.clone()),
                );
            }
            ExecutionResult::Success { .. } | ExecutionResult::StreamFinished => {
                self.emit(
                    OrchestratorEvent::info("Performing query completed")
                        .with("query_key", key.to_string())
                        .with("processing_id", processing_id.get())
                        .with("duration_ms", unix_millis() - started)
                        .with("request_id", def.request_id.clone()),
                );
            }
        }

        if !store.set_result_and_remove_query(key, outcome, processing_id).await? {
            self.emit(
                OrchestratorEvent::warn("Orphaned execution result")
                    .with("query_key", key.to_string())
                    .with("processing_id", processing_id.get()),
            );
        }
        Ok(())
    }

    /// Runs a query handler under the execution timeout.
    async fn run_query_handler(
        &self,
        def: &QueryDef,
        context: HandlerContext,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let handler = self.inner.handlers.query.clone();
        let payload = def.payload.clone();
        let mut task = tokio::spawn(async move { handler.execute(payload, context).await });
        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(value)) => ExecutionResult::Success { value },
                Ok(Err(err)) => handler_failure(&err),
                Err(err) => ExecutionResult::Error { kind: ExecutionErrorKind::Handler, message: err.to_string() },
            },
            () = tokio::time::sleep(self.inner.options.execution_timeout) => {
                token.cancel();
                ExecutionResult::Error {
                    kind: ExecutionErrorKind::Timeout,
                    message: self.inner.options.timeout_message(),
                }
            }
            () = token.cancelled() => ExecutionResult::Error {
                kind: ExecutionErrorKind::Cancelled,
                message: format!("Query {} was cancelled", def.key_hash),
            },
        }
    }

    /// Runs a stream handler, exposing its receiver to the waiting caller.
    async fn run_stream_handler(
        &self,
        key: &QueryKeyHash,
        def: &QueryDef,
        context: HandlerContext,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let Some(handler) = self.inner.handlers.stream.clone() else {
            return ExecutionResult::Error {
                kind: ExecutionErrorKind::Handler,
                message: format!("No stream handler for {}", self.inner.name),
            };
        };
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        match self.inner.streams.lock() {
            Ok(mut streams) => {
                streams.insert(key.clone(), receiver);
            }
            Err(_) => {
                return ExecutionResult::Error {
                    kind: ExecutionErrorKind::Handler,
                    message: "queue stream mutex poisoned".to_string(),
                };
            }
        }
        self.inner.stream_started.notify_waiters();
        let sink = StreamSink::new(sender);
        let payload = def.payload.clone();
        let task_sink = sink.clone();
        let mut task = tokio::spawn(async move { handler.stream(payload, task_sink, context).await });
        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(())) => ExecutionResult::StreamFinished,
                Ok(Err(err)) => handler_failure(&err),
                Err(err) => ExecutionResult::Error { kind: ExecutionErrorKind::Handler, message: err.to_string() },
            },
            () = token.cancelled() => ExecutionResult::Error {
                kind: ExecutionErrorKind::Cancelled,
                message: format!("Query {} was cancelled", def.key_hash),
            },
        };
        if let ExecutionResult::Error { message, .. } = &outcome {
            sink.fail(message.clone()).await;
        }
        outcome
    }

    /// Starts the heartbeat task for a running entry.
    fn spawn_heartbeat(&self, key: QueryKeyHash) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.inner.options.heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = queue.inner.store.update_heartbeat(&key).await {
                    queue.emit(
                        OrchestratorEvent::error("Queue storage error")
                            .with("query_key", key.to_string())
                            .with("error", err.to_string()),
                    );
                }
            }
        })
    }

    /// Tracks the token of a locally running entry.
    fn register_running(&self, key: &QueryKeyHash, token: &CancellationToken) -> Result<(), QueueError> {
        self.inner
            .running
            .lock()
            .map_err(|_| StoreError::Store("queue running mutex poisoned".to_string()))?
            .insert(key.clone(), token.clone());
        Ok(())
    }

    /// Stops tracking a locally running entry.
    fn unregister_running(&self, key: &QueryKeyHash) {
        if let Ok(mut running) = self.inner.running.lock() {
            running.remove(key);
        }
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    /// Signals a local execution of `def` and runs the handler's cancel hook.
    /// Failures are logged.
    pub async fn process_cancel(&self, def: QueryDef) {
        let token = self.inner.running.lock().ok().and_then(|running| running.get(&def.key_hash).cloned());
        if let Some(token) = token {
            token.cancel();
        }
        let result = match def.handler {
            HandlerType::Query => self.inner.handlers.query.cancel(&def).await,
            HandlerType::Stream => match &self.inner.handlers.stream {
                Some(handler) => handler.cancel(&def).await,
                None => Err(HandlerError::Failed(format!("No cancel handler for {}", def.handler.as_str()))),
            },
        };
        if let Err(err) = result {
            self.emit(
                OrchestratorEvent::error("Error while cancel")
                    .with("query_key", def.key_hash.to_string())
                    .with("error", err.to_string()),
            );
        }
    }

    /// Removes `key` and cancels it wherever it runs.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when hashing or the store fails.
    pub async fn cancel_query(&self, key: &QueryKey) -> Result<Option<QueryDef>, QueueError> {
        let key_hash = self.key_hash(key)?;
        let Some(def) = self.inner.store.get_query_and_remove(&key_hash).await? else {
            return Ok(None);
        };
        self.emit(
            OrchestratorEvent::info("Cancelling query manual")
                .with("query_key", key_hash.to_string())
                .with("request_id", def.request_id.clone()),
        );
        self.send_cancel_message(def.clone()).await;
        Ok(Some(def))
    }

    /// Cancels every local execution and stops accepting stream consumers.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Ok(mut streams) = self.inner.streams.lock() {
            streams.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Returns the stage of the entry registered under `stage_key`.
    ///
    /// Pending entries report `#n in queue`, where `n` ranks them among
    /// pending entries with priority at least `min_priority`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] when the store cannot be read.
    pub async fn get_query_stage(
        &self,
        stage_key: &str,
        min_priority: Option<i32>,
    ) -> Result<Option<QueryStage>, QueueError> {
        let state = self.inner.store.get_query_stage_state().await?;
        let passes = |def: &QueryDef| min_priority.is_none_or(|min| def.priority >= min);
        let Some(def) = state.defs.iter().find(|def| def.stage_key.as_deref() == Some(stage_key) && passes(def))
        else {
            return Ok(None);
        };
        if state.active.contains(&def.key_hash) {
            return Ok(Some(QueryStage {
                stage: EXECUTING_STAGE.to_string(),
                time_elapsed_ms: def.start_query_time.map(|start| unix_millis() - start),
            }));
        }
        let priorities: HashMap<&QueryKeyHash, i32> =
            state.defs.iter().map(|entry| (&entry.key_hash, entry.priority)).collect();
        let position = state
            .to_process
            .iter()
            .filter(|key| priorities.get(key).is_some_and(|priority| min_priority.is_none_or(|min| *priority >= min)))
            .position(|key| *key == def.key_hash);
        Ok(position.map(|index| QueryStage { stage: format!("#{} in queue", index + 1), time_elapsed_ms: None }))
    }

    /// Lists entries with their status flags.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] when the store cannot be read.
    pub async fn get_queries(&self) -> Result<Vec<QueuedQuery>, QueueError> {
        let store = &self.inner.store;
        let now = unix_millis();
        let state = store.get_query_stage_state().await?;
        let orphaned = store.get_orphaned_queries(now).await?;
        let stalled = store
            .get_stalled_queries(now.saturating_sub(duration_millis(self.inner.options.heartbeat_timeout())))
            .await?;
        let queries = state
            .defs
            .into_iter()
            .map(|def| {
                let key = &def.key_hash;
                let statuses = [
                    (orphaned.contains(key), QueueStatus::Orphaned),
                    (stalled.contains(key), QueueStatus::Stalled),
                    (state.active.contains(key), QueueStatus::Active),
                    (state.to_process.contains(key), QueueStatus::ToProcess),
                ]
                .into_iter()
                .filter_map(|(present, status)| present.then_some(status))
                .collect();
                QueuedQuery { def, statuses }
            })
            .collect();
        Ok(queries)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a stored outcome into the caller-facing result.
fn result_to_output(key: &QueryKeyHash, result: ExecutionResult) -> Result<QueueOutput, QueueError> {
    match result {
        ExecutionResult::Success { value } => Ok(QueueOutput::Value(value)),
        ExecutionResult::Error { kind: ExecutionErrorKind::Timeout, message } => Err(QueueError::Timeout(message)),
        ExecutionResult::Error { kind: ExecutionErrorKind::Handler, message } => Err(QueueError::Handler(message)),
        ExecutionResult::Error { kind: ExecutionErrorKind::Cancelled, message } => {
            Err(QueueError::Cancelled(message))
        }
        ExecutionResult::StreamFinished => Err(QueueError::StreamUnavailable(key.to_string())),
    }
}

/// Maps a handler error to a stored outcome.
fn handler_failure(err: &HandlerError) -> ExecutionResult {
    let kind = match err {
        HandlerError::Cancelled(_) => ExecutionErrorKind::Cancelled,
        _ => ExecutionErrorKind::Handler,
    };
    ExecutionResult::Error { kind, message: err.to_string() }
}
