// crates/query-orchestrator-config/src/lib.rs
// ============================================================================
// Module: Query Orchestrator Config Library
// Description: Configuration model, validation, and runtime option construction.
// Purpose: Single source of truth for query-orchestrator.toml semantics.
// Dependencies: query-orchestrator-core, query-orchestrator-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `query-orchestrator-config` defines the configuration model for the query
//! orchestrator. It provides strict, fail-closed validation and converts the
//! loaded file into immutable runtime options and a backing store.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
