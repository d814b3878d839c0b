// crates/query-orchestrator-core/src/core/query.rs
// ============================================================================
// Module: Query Orchestrator Query Model
// Description: Query descriptors, parameterized SQL, and cache-key tuples.
// Purpose: Describe what callers submit and how it is identified for caching.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! A [`QueryDescriptor`] is immutable once submitted. Its identity for
//! caching and queue deduplication is the [`QueryCacheKey`] tuple
//! `[sql, params, preAggregations, invalidateKeys]`; the persistent marker
//! affects hashing only.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::core::pre_aggregation::PreAggregationDescription;
use crate::core::queue::QueryKey;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default data source name.
pub const DEFAULT_DATA_SOURCE: &str = "default";

/// Default queue priority for cached queries.
pub const DEFAULT_QUERY_PRIORITY: i32 = 10;

/// Default expiry for cached query results (24 hours).
pub const DEFAULT_EXPIRE_SECS: u64 = 24 * 3600;

/// Returns the default data source name for serde defaults.
fn default_data_source() -> String {
    DEFAULT_DATA_SOURCE.to_string()
}

// ============================================================================
// SECTION: Parameterized SQL
// ============================================================================

/// Per-query execution hints carried alongside SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Seconds a refresh-key result may be reused before it is recomputed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_threshold: Option<u64>,
    /// Whether the query runs against the external (pre-aggregation) store.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    /// Whether the query refreshes a real-time partition incrementally.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub incremental: bool,
    /// Seconds an incremental partition stays open after its range ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_window_seconds: Option<u64>,
    /// Renewal threshold applied once the update window has closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_threshold_outside_update_window: Option<u64>,
}

/// SQL text with positional parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWithParams {
    /// SQL text.
    pub sql: String,
    /// Positional parameter values.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Execution hints.
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryWithParams {
    /// Creates a query without parameters.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new(), options: QueryOptions::default() }
    }

    /// Creates a query with positional parameters.
    #[must_use]
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self { sql: sql.into(), params, options: QueryOptions::default() }
    }

    /// Returns the `[sql, params]` pair used as cache and version identity.
    #[must_use]
    pub fn cache_key(&self) -> Value {
        json!([self.sql, self.params])
    }
}

// ============================================================================
// SECTION: Query Descriptor
// ============================================================================

/// Query submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Main SQL text; `None` when only pre-aggregations should be loaded.
    #[serde(default)]
    pub sql: Option<String>,
    /// Positional parameters for `sql`.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Refresh-key queries whose results gate cache renewal.
    #[serde(default)]
    pub cache_key_queries: Vec<QueryWithParams>,
    /// Pre-aggregations the query reads from.
    #[serde(default)]
    pub pre_aggregations: Vec<PreAggregationDescription>,
    /// Extra invalidation values folded into the cache key.
    #[serde(default)]
    pub invalidate_keys: Vec<Value>,
    /// Data source the query runs against.
    #[serde(default = "default_data_source")]
    pub data_source: String,
    /// Caller correlation identifier.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Force a renewal of cached results and pre-aggregations.
    #[serde(default)]
    pub renew_query: bool,
    /// Execute independently of identical queries from other processes.
    #[serde(default)]
    pub persistent: bool,
    /// Expiry of the cached result in seconds.
    #[serde(default)]
    pub expire_secs: Option<u64>,
    /// Renewal threshold for the main query in seconds.
    #[serde(default)]
    pub renewal_threshold: Option<u64>,
    /// Run the main query on the external store.
    #[serde(default)]
    pub external: bool,
    /// Skip the result cache entirely.
    #[serde(default)]
    pub force_no_cache: bool,
    /// Queue priority for the main query.
    #[serde(default)]
    pub query_priority: Option<i32>,
    /// Rebuild the last pre-aggregation even when its table is current.
    #[serde(default)]
    pub force_build_pre_aggregations: bool,
}

impl QueryDescriptor {
    /// Creates a descriptor for a plain SQL query.
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: Some(sql.into()),
            params,
            cache_key_queries: Vec::new(),
            pre_aggregations: Vec::new(),
            invalidate_keys: Vec::new(),
            data_source: default_data_source(),
            request_id: None,
            renew_query: false,
            persistent: false,
            expire_secs: None,
            renewal_threshold: None,
            external: false,
            force_no_cache: false,
            query_priority: None,
            force_build_pre_aggregations: false,
        }
    }

    /// Creates a descriptor that only loads pre-aggregations.
    #[must_use]
    pub fn pre_aggregations_only(pre_aggregations: Vec<PreAggregationDescription>) -> Self {
        let mut descriptor = Self::new(String::new(), Vec::new());
        descriptor.sql = None;
        descriptor.pre_aggregations = pre_aggregations;
        descriptor
    }

    /// Returns the main query as parameterized SQL when present.
    #[must_use]
    pub fn main_query(&self) -> Option<QueryWithParams> {
        self.sql.as_ref().map(|sql| QueryWithParams {
            sql: sql.clone(),
            params: self.params.clone(),
            options: QueryOptions {
                renewal_threshold: self.renewal_threshold,
                external: self.external,
                ..QueryOptions::default()
            },
        })
    }
}

// ============================================================================
// SECTION: Cache Keys
// ============================================================================

/// Canonical identity of a descriptor for caching and deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCacheKey {
    /// Ordered tuple `[sql, params, preAggregations, invalidateKeys]`.
    pub content: Value,
    /// Whether hashing appends a process-unique suffix.
    pub persistent: bool,
}

impl QueryCacheKey {
    /// Builds the cache key for a descriptor.
    #[must_use]
    pub fn for_descriptor(descriptor: &QueryDescriptor) -> Self {
        let pre_aggregations: Vec<Value> =
            descriptor.pre_aggregations.iter().map(|pre_aggregation| pre_aggregation.load_sql.cache_key()).collect();
        let mut content = vec![
            json!(descriptor.sql),
            Value::Array(descriptor.params.clone()),
            Value::Array(pre_aggregations),
        ];
        if !descriptor.invalidate_keys.is_empty() {
            content.push(Value::Array(descriptor.invalidate_keys.clone()));
        }
        Self { content: Value::Array(content), persistent: descriptor.persistent }
    }

    /// Builds a non-persistent cache key from raw SQL and parameters.
    #[must_use]
    pub fn for_sql(sql: &str, params: &[Value]) -> Self {
        Self { content: json!([sql, params]), persistent: false }
    }

    /// Returns the queue key for this cache key.
    #[must_use]
    pub fn to_query_key(&self) -> QueryKey {
        QueryKey { value: self.content.clone(), persistent: self.persistent }
    }
}
