// crates/query-orchestrator-core/src/core/pre_aggregation.rs
// ============================================================================
// Module: Query Orchestrator Pre-Aggregation Model
// Description: Pre-aggregation descriptions, version entries, and table naming.
// Purpose: Provide the pure naming and versioning rules for materialized tables.
// Dependencies: serde, serde_json, crate::core::{hashing, query, time}
// ============================================================================

//! ## Overview
//! A built pre-aggregation table is named
//! `<table>_<contentVersion>_<structureVersion>_<suffix>`. The suffix is the
//! raw `lastUpdatedAt` millisecond timestamp for naming version 1 and the
//! base-32 rendering of `lastUpdatedAt / 1000` for naming version 2. Parsing
//! a schema's table listing back into [`VersionEntry`] values is the only
//! source of truth for what has been built.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::core::hashing::HashError;
use crate::core::hashing::version;
use crate::core::query::DEFAULT_DATA_SOURCE;
use crate::core::query::QueryWithParams;
use crate::core::time::Granularity;
use crate::core::time::Precision;
use crate::core::time::TimestampFormat;
use crate::core::time::parse_utc_instant;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Digits used for base-32 timestamp suffixes.
const BASE32_DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Suffixes shorter than this many characters are naming version 2.
const RAW_TIMESTAMP_SUFFIX_LENGTH: usize = 13;

/// Default refresh priority for pre-aggregation builds.
pub const DEFAULT_PRE_AGGREGATION_PRIORITY: i32 = 10;

/// Returns the default data source name for serde defaults.
fn default_data_source() -> String {
    DEFAULT_DATA_SOURCE.to_string()
}

/// Returns the default timezone name for serde defaults.
fn default_timezone() -> String {
    "UTC".to_string()
}

// ============================================================================
// SECTION: Descriptions
// ============================================================================

/// Kind of materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreAggregationType {
    /// Aggregated rollup.
    #[default]
    Rollup,
    /// Materialized original SQL.
    OriginalSql,
    /// Composite of several rollups sharing a lambda id.
    RollupLambda,
}

/// Offset used when loading from a streaming source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOffset {
    /// Read from the first retained record.
    Earliest,
    /// Read only new records.
    Latest,
}

/// Index created alongside a pre-aggregation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    /// Index name.
    pub index_name: String,
    /// DDL with the target table placeholder.
    pub sql: QueryWithParams,
}

/// Column name with a generic type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    /// Column name.
    pub name: String,
    /// Generic column type (`int`, `bigint`, `decimal`, `text`, ...).
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Inclusive local date range `[start, end]`.
pub type DateRange = [String; 2];

/// Pre-aggregation (or one partition of it) as compiled by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAggregationDescription {
    /// Logical identifier (`cube.name`).
    #[serde(default)]
    pub pre_aggregation_id: String,
    /// Schema the tables live in.
    pub pre_aggregations_schema: String,
    /// Base table name, schema-qualified.
    pub table_name: String,
    /// Materialization kind.
    #[serde(default, rename = "type")]
    pub kind: PreAggregationType,
    /// Source data source.
    #[serde(default = "default_data_source")]
    pub data_source: String,
    /// Whether the table lives in the external store.
    #[serde(default)]
    pub external: bool,
    /// Queue priority for the build.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Timezone of partition boundaries.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Shape of build-range parameters.
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
    /// Precision of local timestamps.
    #[serde(default)]
    pub timestamp_precision: Precision,
    /// Partition granularity; `None` for unpartitioned tables.
    #[serde(default)]
    pub partition_granularity: Option<Granularity>,
    /// True once this description denotes a single partition.
    #[serde(default)]
    pub expanded_partition: bool,
    /// SQL loading the table.
    pub load_sql: QueryWithParams,
    /// SQL selecting from the table (used for lambda unions).
    #[serde(default)]
    pub sql: Option<QueryWithParams>,
    /// SQL identifying structure drift; defaults to `load_sql`.
    #[serde(default)]
    pub structure_version_load_sql: Option<QueryWithParams>,
    /// Refresh-key queries.
    #[serde(default)]
    pub invalidate_key_queries: Vec<QueryWithParams>,
    /// Per-partition refresh-key queries.
    #[serde(default)]
    pub partition_invalidate_key_queries: Option<Vec<QueryWithParams>>,
    /// Indexes created after loading.
    #[serde(default)]
    pub indexes_sql: Vec<IndexDescription>,
    /// Date range the query's time dimension matched.
    #[serde(default)]
    pub matched_time_dimension_date_range: Option<DateRange>,
    /// Queries returning the earliest and latest source timestamps.
    #[serde(default)]
    pub pre_aggregation_start_end_queries: Option<[QueryWithParams; 2]>,
    /// Explicit build range start (local).
    #[serde(default)]
    pub build_range_start: Option<String>,
    /// Explicit build range end (local).
    #[serde(default)]
    pub build_range_end: Option<String>,
    /// Seconds a real-time partition stays open after its range closes.
    #[serde(default)]
    pub update_window_seconds: Option<u64>,
    /// Instant after which the partition is sealed.
    #[serde(default)]
    pub seal_at: Option<String>,
    /// Shared lambda group identifier.
    #[serde(default)]
    pub rollup_lambda_id: Option<String>,
    /// True for the freshest member of a lambda group.
    #[serde(default)]
    pub last_rollup_lambda: bool,
    /// Streaming source offset.
    #[serde(default)]
    pub stream_offset: Option<StreamOffset>,
    /// Explicit output column types.
    #[serde(default)]
    pub output_column_types: Option<Vec<TableColumn>>,
    /// Refresh-key renewal threshold in seconds.
    #[serde(default)]
    pub refresh_key_renewal_threshold: Option<u64>,
    /// Whether the source database is read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl PreAggregationDescription {
    /// Returns the schema-less base table name.
    #[must_use]
    pub fn base_table_name(&self) -> &str {
        self.table_name.rsplit_once('.').map_or(self.table_name.as_str(), |(_, name)| name)
    }

    /// Returns the structure version of this description.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when canonicalization fails.
    pub fn structure_version(&self) -> Result<String, HashError> {
        let parts = self.version_parts();
        match parts.as_slice() {
            [single] => version(single),
            _ => version(&parts),
        }
    }

    /// Returns the content version for the given invalidation key values.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when canonicalization fails.
    pub fn content_version(&self, invalidation_keys: &[Value]) -> Result<String, HashError> {
        let mut parts = self.version_parts();
        parts.push(Value::Array(invalidation_keys.to_vec()));
        version(&parts)
    }

    /// Collects the identity parts shared by structure and content versions.
    fn version_parts(&self) -> Vec<Value> {
        let base = self.structure_version_load_sql.as_ref().unwrap_or(&self.load_sql);
        let mut parts = vec![base.cache_key()];
        if !self.indexes_sql.is_empty() {
            parts.push(Value::Array(
                self.indexes_sql
                    .iter()
                    .map(|index| serde_json::json!([index.index_name, index.sql.cache_key()]))
                    .collect(),
            ));
        }
        if let Some(offset) = self.stream_offset {
            parts.push(serde_json::to_value(offset).unwrap_or(Value::Null));
        }
        if let Some(columns) = &self.output_column_types {
            parts.push(serde_json::to_value(columns).unwrap_or(Value::Null));
        }
        parts
    }

    /// Returns true when this partition declares an update window that has
    /// closed before `now`. Sealed partitions no longer receive data.
    #[must_use]
    pub fn is_sealed(&self, now: OffsetDateTime) -> bool {
        if self.update_window_seconds.is_none() {
            return false;
        }
        self.seal_at.as_deref().and_then(|seal_at| parse_utc_instant(seal_at).ok()).is_some_and(|seal_at| seal_at <= now)
    }

    /// Returns the build priority, falling back to `default`.
    #[must_use]
    pub fn priority_or(&self, default: i32) -> i32 {
        self.priority.unwrap_or(default)
    }
}

// ============================================================================
// SECTION: Version Entries
// ============================================================================

/// Table naming scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingVersion {
    /// Raw millisecond suffix.
    #[default]
    V1,
    /// Base-32 second suffix.
    V2,
}

/// One built table as discovered from the schema listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Schema-qualified base table name.
    pub table_name: String,
    /// Content version.
    pub content_version: String,
    /// Structure version.
    pub structure_version: String,
    /// Build time in unix milliseconds.
    pub last_updated_at: i64,
    /// Naming scheme of the physical table.
    #[serde(default)]
    pub naming_version: NamingVersion,
}

impl VersionEntry {
    /// Returns the physical table name for this entry.
    #[must_use]
    pub fn target_table_name(&self) -> String {
        let suffix = match self.naming_version {
            NamingVersion::V1 => self.last_updated_at.to_string(),
            NamingVersion::V2 => encode_base32_seconds(self.last_updated_at),
        };
        format!("{}_{}_{}_{}", self.table_name, self.content_version, self.structure_version, suffix)
    }

    /// Returns the key grouping entries by table and structure.
    #[must_use]
    pub fn structure_key(&self) -> String {
        format!("{}_{}", self.table_name, self.structure_version)
    }

    /// Returns the key grouping entries by table and content.
    #[must_use]
    pub fn content_key(&self) -> String {
        format!("{}_{}", self.table_name, self.content_version)
    }
}

/// Version entries indexed for lookups. Every index keeps the newest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntries {
    /// All entries, newest first.
    pub versions: Vec<VersionEntry>,
    /// Newest entry per `table_structure` key.
    pub by_structure: HashMap<String, VersionEntry>,
    /// Newest entry per `table_content` key.
    pub by_content: HashMap<String, VersionEntry>,
    /// Newest entry per table name.
    pub by_table_name: HashMap<String, VersionEntry>,
}

impl VersionEntries {
    /// Indexes entries already ordered newest first.
    #[must_use]
    pub fn from_sorted(versions: Vec<VersionEntry>) -> Self {
        let mut by_structure = HashMap::new();
        let mut by_content = HashMap::new();
        let mut by_table_name = HashMap::new();
        for entry in &versions {
            by_structure.entry(entry.structure_key()).or_insert_with(|| entry.clone());
            by_content.entry(entry.content_key()).or_insert_with(|| entry.clone());
            by_table_name.entry(entry.table_name.clone()).or_insert_with(|| entry.clone());
        }
        Self { versions, by_structure, by_content, by_table_name }
    }
}

/// Parses a schema table listing into version entries, newest first.
///
/// Names split on their last three underscores into base, content,
/// structure, and suffix. Names that do not split into four non-empty parts
/// are ignored.
#[must_use]
pub fn tables_to_version_entries(schema: &str, tables: &[String]) -> Vec<VersionEntry> {
    let mut entries: Vec<VersionEntry> = tables
        .iter()
        .filter_map(|table| {
            let mut parts = table.rsplitn(4, '_');
            let suffix = parts.next()?;
            let structure_version = parts.next()?;
            let content_version = parts.next()?;
            let base = parts.next()?;
            if [suffix, structure_version, content_version, base].iter().any(|part| part.is_empty()) {
                return None;
            }
            let (last_updated_at, naming_version) = if suffix.len() < RAW_TIMESTAMP_SUFFIX_LENGTH {
                (decode_base32_seconds(suffix)?, NamingVersion::V2)
            } else {
                (suffix.parse().ok()?, NamingVersion::V1)
            };
            Some(VersionEntry {
                table_name: format!("{schema}.{base}"),
                content_version: content_version.to_string(),
                structure_version: structure_version.to_string(),
                last_updated_at,
                naming_version,
            })
        })
        .collect();
    entries.sort_by(|left, right| right.last_updated_at.cmp(&left.last_updated_at));
    entries
}

/// Renders `millis / 1000` in base 32.
#[must_use]
pub fn encode_base32_seconds(millis: i64) -> String {
    let mut value = u64::try_from(millis.div_euclid(1000)).unwrap_or_default();
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let index = usize::try_from(value % 32).unwrap_or_default();
        digits.push(BASE32_DIGITS[index]);
        value /= 32;
    }
    digits.iter().rev().map(|digit| char::from(*digit)).collect()
}

/// Parses a base-32 seconds suffix back into unix milliseconds.
#[must_use]
pub fn decode_base32_seconds(suffix: &str) -> Option<i64> {
    let seconds = i64::from_str_radix(suffix, 32).ok()?;
    seconds.checked_mul(1000)
}

// ============================================================================
// SECTION: Load Results
// ============================================================================

/// Table resolved for one pre-aggregation during a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPreAggregationResult {
    /// Schema-qualified base table name.
    pub table_name: String,
    /// Physical table name to read from.
    pub target_table_name: String,
    /// Refresh-key values at build time.
    #[serde(default)]
    pub refresh_key_values: Vec<Value>,
    /// Build time in unix milliseconds.
    pub last_updated_at: i64,
    /// Lambda group the table belongs to.
    #[serde(default)]
    pub rollup_lambda_id: Option<String>,
    /// Local end of the covered range, for lambda stitching.
    #[serde(default)]
    pub build_range_end: Option<String>,
}

/// Pre-aggregation table used to answer a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedPreAggregation {
    /// Physical table name (or a `UNION ALL` over partitions).
    pub target_table_name: String,
    /// Refresh-key values at build time.
    pub refresh_key_values: Vec<Value>,
    /// Build time in unix milliseconds.
    pub last_updated_at: i64,
}

// ============================================================================
// SECTION: Messages
// ============================================================================

/// Returns the error text used when no partitions are available to serve a query.
#[must_use]
pub fn no_partitions_built_message(expected_table_names: &[String]) -> String {
    format!(
        "No pre-aggregation partitions were built yet for the pre-aggregation serving this query \
         and this API instance wasn't set up to build pre-aggregations. Please make sure your \
         refresh worker is configured correctly, running, pre-aggregation tables are built and \
         all pre-aggregation refresh settings like timezone match. Expected table name \
         patterns: {}",
        expected_table_names.join(", ")
    )
}

/// Returns the expected physical name pattern for a description.
#[must_use]
pub fn expected_table_name_pattern(description: &PreAggregationDescription) -> String {
    let structure = description.structure_version().unwrap_or_else(|_| "*".to_string());
    format!("{}_*_{}_*", description.table_name, structure)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn partitions_seal_only_after_a_declared_update_window() {
        let mut description: PreAggregationDescription = serde_json::from_value(serde_json::json!({
            "pre_aggregations_schema": "s",
            "table_name": "s.orders20240101",
            "load_sql": { "sql": "SELECT 1" },
            "seal_at": "2024-01-02T01:00:00.000Z",
        }))
        .unwrap();
        let after = parse_utc_instant("2024-01-03T00:00:00.000Z").unwrap();
        let before = parse_utc_instant("2024-01-02T00:30:00.000Z").unwrap();
        assert!(!description.is_sealed(after));

        description.update_window_seconds = Some(3_600);
        assert!(description.is_sealed(after));
        assert!(!description.is_sealed(before));
    }

    #[test]
    fn base32_round_trips_known_timestamp() {
        assert_eq!(encode_base32_seconds(1_600_329_890_789), "1fm6652");
        assert_eq!(decode_base32_seconds("1fm6652"), Some(1_600_329_890_000));
    }

    #[test]
    fn v2_target_table_name_uses_base32() {
        let entry = VersionEntry {
            table_name: "stb_pre_aggregations.orders".to_string(),
            content_version: "kjypcoio".to_string(),
            structure_version: "5yftl5il".to_string(),
            last_updated_at: 1_600_329_890_789,
            naming_version: NamingVersion::V2,
        };
        assert_eq!(entry.target_table_name(), "stb_pre_aggregations.orders_kjypcoio_5yftl5il_1fm6652");
    }
}
