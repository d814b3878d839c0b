// crates/query-orchestrator-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Backing Store
// Description: Durable queue and cache backing store using SQLite WAL.
// Purpose: Let several orchestrator processes share queue and cache state.
// Dependencies: query-orchestrator-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`query_orchestrator_core::BackingStore`]
//! whose queue namespaces, results, cache entries, and advisory locks live in
//! one database file. Processes that open the same file coordinate through
//! immediate transactions. Security posture: stored payloads are untrusted
//! and decoded fail-closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::MAX_VALUE_BYTES;
pub use store::SqliteBackingStore;
pub use store::SqliteCacheStore;
pub use store::SqliteQueueStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
