// crates/query-orchestrator-core/src/runtime/mod.rs
// ============================================================================
// Module: Query Orchestrator Runtime
// Description: Queue, cache, pre-aggregation engines, and the façade.
// Purpose: Execute queries at most once per cache key across a fleet.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Runtime modules are layered leaves first: in-memory stores, the
//! [`QueryQueue`], the [`QueryCache`], the pre-aggregation engine, and the
//! [`QueryOrchestrator`] façade. Every caller-facing operation goes through
//! the façade so that queue, cache, and build state stay consistent.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod cache;
pub mod loader;
pub mod memory;
pub mod orchestrator;
pub mod partitions;
pub mod pre_aggregations;
pub mod queue;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use cache::CacheError;
pub use cache::CacheQueryOptions;
pub use cache::CachedQueryResult;
pub use cache::KeyPart;
pub use cache::QueryCache;
pub use cache::QueryCacheOptions;
pub use cache::QueryCacheSetup;
pub use cache::RenewOptions;
pub use cache::fast_compute_cache_key;
pub use cache::replace_pre_aggregation_table_names;
pub use memory::InMemoryBackingStore;
pub use memory::InMemoryCacheStore;
pub use memory::InMemoryQueueStore;
pub use memory::StoreRetention;
pub use orchestrator::FetchQueryResult;
pub use orchestrator::MetadataOptions;
pub use orchestrator::OrchestratorError;
pub use orchestrator::OrchestratorOptions;
pub use orchestrator::OrchestratorSetup;
pub use orchestrator::PreAggregationPartitions;
pub use orchestrator::PreAggregationVersionEntries;
pub use orchestrator::QueryOrchestrator;
pub use partitions::partition_table_name;
pub use pre_aggregations::BuildRangeCacheStatus;
pub use pre_aggregations::ExpandedPreAggregations;
pub use pre_aggregations::LoadedPreAggregations;
pub use pre_aggregations::PreAggregationError;
pub use pre_aggregations::PreAggregations;
pub use pre_aggregations::PreAggregationsOptions;
pub use queue::ExecuteOptions;
pub use queue::QueryQueue;
pub use queue::QueryStream;
pub use queue::QueueError;
pub use queue::QueueOptions;
pub use queue::QueueOutput;
pub use queue::QueueSetup;
