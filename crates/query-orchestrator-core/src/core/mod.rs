// crates/query-orchestrator-core/src/core/mod.rs
// ============================================================================
// Module: Query Orchestrator Core Types
// Description: Canonical query, queue, and pre-aggregation data model.
// Purpose: Provide stable, serializable types and pure helpers for the engines.
// Dependencies: serde, serde_json, sha2, time
// ============================================================================

//! ## Overview
//! Core types describe what callers submit, what the queue persists, and how
//! pre-aggregation tables are versioned and named. Everything here is pure:
//! no I/O, no shared state, no clocks other than [`time::unix_millis`].

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod columns;
pub mod hashing;
pub mod pre_aggregation;
pub mod query;
pub mod queue;
pub mod ranges;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use columns::infer_column_types;
pub use hashing::DEFAULT_HASH_ALGORITHM;
pub use hashing::HashAlgorithm;
pub use hashing::HashDigest;
pub use hashing::HashError;
pub use hashing::version;
pub use pre_aggregation::DateRange;
pub use pre_aggregation::IndexDescription;
pub use pre_aggregation::LoadPreAggregationResult;
pub use pre_aggregation::NamingVersion;
pub use pre_aggregation::PreAggregationDescription;
pub use pre_aggregation::PreAggregationType;
pub use pre_aggregation::StreamOffset;
pub use pre_aggregation::TableColumn;
pub use pre_aggregation::UsedPreAggregation;
pub use pre_aggregation::VersionEntries;
pub use pre_aggregation::VersionEntry;
pub use pre_aggregation::tables_to_version_entries;
pub use query::QueryCacheKey;
pub use query::QueryDescriptor;
pub use query::QueryOptions;
pub use query::QueryWithParams;
pub use queue::ExecutionErrorKind;
pub use queue::ExecutionResult;
pub use queue::HandlerType;
pub use queue::ProcessingId;
pub use queue::QueryDef;
pub use queue::QueryKey;
pub use queue::QueryKeyHash;
pub use queue::QueryStage;
pub use queue::QueueStatus;
pub use queue::QueuedQuery;
pub use ranges::RangeError;
pub use ranges::intersect_date_ranges;
pub use time::Granularity;
pub use time::Precision;
pub use time::TimeError;
pub use time::TimestampFormat;
pub use time::Timezone;
