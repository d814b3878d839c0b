// crates/query-orchestrator-core/src/lib.rs
// ============================================================================
// Module: Query Orchestrator Core Library
// Description: Public API surface for the query orchestration core.
// Purpose: Expose core types, interfaces, and runtime engines.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! The query orchestration core computes expensive analytical queries at
//! most once per cache key across a fleet of cooperating processes. It
//! combines a priority job queue over a shared store, a result cache with
//! refresh-key renewal, and a pre-aggregation engine that builds, versions,
//! and garbage-collects materialized tables. Databases and shared stores
//! are reached only through the traits in [`interfaces`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::BackingStore;
pub use interfaces::CacheStore;
pub use interfaces::ColumnRef;
pub use interfaces::DownloadOptions;
pub use interfaces::DownloadedTable;
pub use interfaces::Driver;
pub use interfaces::DriverCapabilities;
pub use interfaces::DriverError;
pub use interfaces::DriverFactory;
pub use interfaces::EventLevel;
pub use interfaces::HandlerContext;
pub use interfaces::HandlerError;
pub use interfaces::MemoryEventSink;
pub use interfaces::NoopEventSink;
pub use interfaces::OrchestratorEvent;
pub use interfaces::OrchestratorEventSink;
pub use interfaces::QueryHandler;
pub use interfaces::QueryMeta;
pub use interfaces::QueueHandlers;
pub use interfaces::QueueMessenger;
pub use interfaces::QueueStore;
pub use interfaces::Rows;
pub use interfaces::StoreError;
pub use interfaces::StreamHandler;
pub use interfaces::StreamSink;
pub use interfaces::TableRef;
pub use interfaces::TracingEventSink;
pub use interfaces::UploadOptions;
pub use runtime::CacheError;
pub use runtime::CacheQueryOptions;
pub use runtime::CachedQueryResult;
pub use runtime::ExecuteOptions;
pub use runtime::FetchQueryResult;
pub use runtime::InMemoryBackingStore;
pub use runtime::InMemoryCacheStore;
pub use runtime::InMemoryQueueStore;
pub use runtime::MetadataOptions;
pub use runtime::OrchestratorError;
pub use runtime::OrchestratorOptions;
pub use runtime::OrchestratorSetup;
pub use runtime::PreAggregationError;
pub use runtime::PreAggregationPartitions;
pub use runtime::PreAggregationVersionEntries;
pub use runtime::PreAggregations;
pub use runtime::PreAggregationsOptions;
pub use runtime::QueryCache;
pub use runtime::QueryCacheOptions;
pub use runtime::QueryCacheSetup;
pub use runtime::QueryOrchestrator;
pub use runtime::QueryQueue;
pub use runtime::QueryStream;
pub use runtime::QueueError;
pub use runtime::QueueOptions;
pub use runtime::QueueOutput;
pub use runtime::QueueSetup;
pub use runtime::StoreRetention;
