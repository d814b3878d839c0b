// crates/query-orchestrator-core/src/runtime/partitions.rs
// ============================================================================
// Module: Partition Range Loader
// Description: Partition enumeration and union of partition tables.
// Purpose: Resolve time-partitioned pre-aggregations to one readable relation.
// Dependencies: tokio, crate::{core, runtime::{cache, loader, pre_aggregations}}
// ============================================================================

//! ## Overview
//! A partitioned pre-aggregation covers its build range with one table per
//! calendar bucket. The build range comes from the pre-aggregation's
//! start/end queries (cached under their own renewal policy), is
//! intersected with the date range the query asks for, and is split into
//! partitions with [`time_series`]. Each partition loads like an ordinary
//! pre-aggregation; the query then reads the `UNION ALL` of the partition
//! tables.
//!
//! Partition SQL substitutes [`FROM_PARTITION_RANGE`] and
//! [`TO_PARTITION_RANGE`] parameters with the partition bounds converted to
//! UTC.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::task::JoinSet;

use crate::core::pre_aggregation::DEFAULT_PRE_AGGREGATION_PRIORITY;
use crate::core::pre_aggregation::DateRange;
use crate::core::pre_aggregation::IndexDescription;
use crate::core::pre_aggregation::LoadPreAggregationResult;
use crate::core::pre_aggregation::PreAggregationDescription;
use crate::core::pre_aggregation::expected_table_name_pattern;
use crate::core::pre_aggregation::no_partitions_built_message;
use crate::core::query::QueryWithParams;
use crate::core::ranges::intersect_date_ranges;
use crate::core::time::Granularity;
use crate::core::time::TimeError;
use crate::core::time::Timezone;
use crate::core::time::add_seconds_to_local;
use crate::core::time::bucket_containing;
use crate::core::time::format_utc_iso;
use crate::core::time::local_to_utc;
use crate::core::time::now_local;
use crate::core::time::now_utc;
use crate::core::time::parse_local_timestamp;
use crate::core::time::parse_utc_into_local;
use crate::core::time::time_series;
use crate::core::time::time_series_count;
use crate::runtime::cache::CacheQueryOptions;
use crate::runtime::loader::LoadCache;
use crate::runtime::loader::LoadOptions;
use crate::runtime::loader::PreAggregationLoader;
use crate::runtime::pre_aggregations::PreAggregationError;
use crate::runtime::pre_aggregations::PreAggregations;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Parameter replaced with the UTC start of a partition.
pub const FROM_PARTITION_RANGE: &str = "__FROM_PARTITION_RANGE";

/// Parameter replaced with the UTC end of a partition.
pub const TO_PARTITION_RANGE: &str = "__TO_PARTITION_RANGE";

/// Main-query parameter replaced with the local build range start.
pub const BUILD_RANGE_START_LOCAL: &str = "__BUILD_RANGE_START_LOCAL";

/// Main-query parameter replaced with the local build range end.
pub const BUILD_RANGE_END_LOCAL: &str = "__BUILD_RANGE_END_LOCAL";

/// Expiry and default renewal threshold of build-range query results.
const RANGE_QUERY_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the base table name of the partition starting at `range[0]`.
///
/// # Errors
///
/// Returns [`TimeError`] when the range start is malformed.
pub fn partition_table_name(table_name: &str, granularity: Granularity, range: &DateRange) -> Result<String, TimeError> {
    let start = parse_local_timestamp(&range[0])?;
    Ok(format!("{table_name}{}", granularity.partition_suffix(start)))
}

/// Returns the query cache key of a build-range query.
pub(crate) fn range_query_cache_key(query: &QueryWithParams) -> Value {
    json!([query.sql, query.params, []])
}

/// Returns true when two local timestamps denote the same wall-clock time.
fn same_local_time(left: &str, right: &str) -> Result<bool, PreAggregationError> {
    Ok(parse_local_timestamp(left)? == parse_local_timestamp(right)?)
}

/// Partition ranges and the build range they were cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartitionRanges {
    /// Build range after intersecting with the matched query range.
    build_range: DateRange,
    /// Partition ranges covering the build range.
    partition_ranges: Vec<DateRange>,
}

/// Loaded partition with the range it covers.
type LoadedPartition = (LoadPreAggregationResult, DateRange);

// ============================================================================
// SECTION: Loader
// ============================================================================

/// Loads a pre-aggregation, splitting it into partitions when partitioned.
pub(crate) struct PartitionRangeLoader {
    /// Engine providing caches, queues, and drivers.
    engine: PreAggregations,
    /// Pre-aggregation to load.
    description: PreAggregationDescription,
    /// Tables resolved earlier in the same request.
    tables: Vec<LoadPreAggregationResult>,
    /// Request-scoped memo.
    load_cache: Arc<LoadCache>,
    /// Load behavior.
    options: LoadOptions,
}

impl PartitionRangeLoader {
    /// Creates a loader.
    pub(crate) const fn new(
        engine: PreAggregations,
        description: PreAggregationDescription,
        tables: Vec<LoadPreAggregationResult>,
        load_cache: Arc<LoadCache>,
        options: LoadOptions,
    ) -> Self {
        Self { engine, description, tables, load_cache, options }
    }

    /// Returns the granularity when this pre-aggregation still needs splitting.
    const fn partitioned(&self) -> Option<Granularity> {
        if self.description.expanded_partition { None } else { self.description.partition_granularity }
    }

    /// Returns the pre-aggregation's timezone.
    fn timezone(&self) -> Result<Timezone, PreAggregationError> {
        Ok(Timezone::parse(&self.description.timezone)?)
    }

    /// Returns a single-table loader for a description.
    fn loader(&self, description: PreAggregationDescription) -> Result<PreAggregationLoader, PreAggregationError> {
        PreAggregationLoader::new(
            self.engine.clone(),
            description,
            self.tables.clone(),
            Arc::clone(&self.load_cache),
            self.options.clone(),
        )
    }

    // ------------------------------------------------------------------------
    // Partition SQL
    // ------------------------------------------------------------------------

    /// Rewrites a query for one partition.
    ///
    /// Incremental queries whose update window has closed renew no more
    /// often than the time elapsed since the window closed.
    fn replace_partition_sql(
        &self,
        query: &QueryWithParams,
        range: &DateRange,
        partition_table: &str,
    ) -> Result<QueryWithParams, PreAggregationError> {
        let timezone = self.timezone()?;
        let format = self.description.timestamp_format;
        let mut params = Vec::with_capacity(query.params.len());
        for param in &query.params {
            params.push(match param.as_str() {
                Some(FROM_PARTITION_RANGE) => Value::String(local_to_utc(timezone, format, &range[0])?),
                Some(TO_PARTITION_RANGE) => Value::String(local_to_utc(timezone, format, &range[1])?),
                _ => param.clone(),
            });
        }
        let mut options = query.options.clone();
        if options.incremental {
            let boundary = add_seconds_to_local(timezone, &range[1], options.update_window_seconds.unwrap_or(0))?;
            let now = now_utc();
            if boundary < now {
                let elapsed = u64::try_from((now - boundary).whole_seconds()).unwrap_or(0);
                options.renewal_threshold =
                    Some(options.renewal_threshold_outside_update_window.map_or(elapsed, |limit| elapsed.min(limit)));
            }
        }
        Ok(QueryWithParams { sql: query.sql.replace(&self.description.table_name, partition_table), params, options })
    }

    /// Returns the description of one partition.
    ///
    /// The loaded range stops at the build range end so the last partition
    /// only covers data that exists; structure versions and refresh keys use
    /// the full partition range so they stay stable while it fills.
    fn partition_description(
        &self,
        granularity: Granularity,
        range: &DateRange,
        build_range: &DateRange,
    ) -> Result<PreAggregationDescription, PreAggregationError> {
        let description = &self.description;
        let partition_table = partition_table_name(&description.table_name, granularity, range)?;
        let partition_keys =
            description.partition_invalidate_key_queries.as_ref().unwrap_or(&description.invalidate_key_queries);
        let mut load_range = range.clone();
        if !partition_keys.is_empty() && parse_local_timestamp(&build_range[1])? < parse_local_timestamp(&range[1])? {
            load_range[1].clone_from(&build_range[1]);
        }
        let timezone = self.timezone()?;
        let seal_at =
            format_utc_iso(add_seconds_to_local(timezone, &load_range[1], description.update_window_seconds.unwrap_or(0))?);
        let replace_all = |queries: &[QueryWithParams]| -> Result<Vec<QueryWithParams>, PreAggregationError> {
            queries.iter().map(|query| self.replace_partition_sql(query, range, &partition_table)).collect()
        };
        let indexes_sql = description
            .indexes_sql
            .iter()
            .map(|index| {
                Ok(IndexDescription {
                    index_name: index.index_name.clone(),
                    sql: self.replace_partition_sql(&index.sql, range, &partition_table)?,
                })
            })
            .collect::<Result<Vec<_>, PreAggregationError>>()?;
        Ok(PreAggregationDescription {
            structure_version_load_sql: Some(self.replace_partition_sql(&description.load_sql, range, &partition_table)?),
            load_sql: self.replace_partition_sql(&description.load_sql, &load_range, &partition_table)?,
            sql: description
                .sql
                .as_ref()
                .map(|sql| self.replace_partition_sql(sql, &load_range, &partition_table))
                .transpose()?,
            invalidate_key_queries: replace_all(&description.invalidate_key_queries)?,
            partition_invalidate_key_queries: description
                .partition_invalidate_key_queries
                .as_deref()
                .map(replace_all)
                .transpose()?,
            indexes_sql,
            build_range_start: Some(load_range[0].clone()),
            build_range_end: Some(load_range[1].clone()),
            seal_at: Some(seal_at),
            table_name: partition_table,
            ..description.clone()
        })
    }

    // ------------------------------------------------------------------------
    // Build range
    // ------------------------------------------------------------------------

    /// Resolves the refresh-key values of one partition.
    async fn partition_invalidation_key_values(
        &self,
        granularity: Granularity,
        range: &DateRange,
    ) -> Result<Vec<Value>, PreAggregationError> {
        let partition_table = partition_table_name(&self.description.table_name, granularity, range)?;
        let priority = self.description.priority_or(DEFAULT_PRE_AGGREGATION_PRIORITY);
        let mut values = Vec::with_capacity(self.description.invalidate_key_queries.len());
        for query in &self.description.invalidate_key_queries {
            let query = self.replace_partition_sql(query, range, &partition_table)?;
            values.push(self.load_cache.key_query_result(&query, self.options.wait_for_renew, priority).await?);
        }
        Ok(values)
    }

    /// Runs a build-range query, renewing it when the given partition's
    /// refresh keys change.
    async fn load_range_query(
        &self,
        query: &QueryWithParams,
        partition: Option<(Granularity, &DateRange)>,
    ) -> Result<Value, PreAggregationError> {
        let renewal_key = match partition {
            Some((granularity, range)) => {
                Some(Value::Array(self.partition_invalidation_key_values(granularity, range).await?))
            }
            None => None,
        };
        let cache = self.engine.cache();
        let renewal_threshold = cache
            .options()
            .refresh_key_renewal_threshold
            .or(query.options.renewal_threshold)
            .unwrap_or(RANGE_QUERY_EXPIRE.as_secs());
        let options = CacheQueryOptions {
            renewal_threshold: Some(renewal_threshold),
            renewal_key,
            priority: Some(self.description.priority_or(DEFAULT_PRE_AGGREGATION_PRIORITY)),
            external: query.options.external,
            request_id: self.options.request_id.clone(),
            data_source: self.description.data_source.clone(),
            wait_for_renew: self.options.wait_for_renew,
            use_in_memory: true,
            ..CacheQueryOptions::default()
        };
        Ok(cache.cache_query_result(query, &range_query_cache_key(query), RANGE_QUERY_EXPIRE, options).await?)
    }

    /// Extracts a local timestamp from a range query result.
    fn extract_date(&self, rows: &Value, timezone: Timezone) -> Option<String> {
        rows.as_array().and_then(|rows| parse_utc_into_local(rows, timezone, self.description.timestamp_precision))
    }

    /// Fills missing bounds from the other bound, or from now.
    fn or_now_if_empty(&self, start: Option<String>, end: Option<String>, timezone: Timezone) -> DateRange {
        match (start, end) {
            (Some(start), Some(end)) => [start, end],
            (Some(bound), None) | (None, Some(bound)) => [bound.clone(), bound],
            (None, None) => {
                let now = now_local(timezone, self.description.timestamp_precision);
                [now.clone(), now]
            }
        }
    }

    /// Resolves the local range the pre-aggregation should cover.
    ///
    /// For partitioned pre-aggregations the start and end queries run again
    /// scoped to the first and last partitions so they renew with those
    /// partitions' refresh keys.
    async fn load_build_range(&self) -> Result<DateRange, PreAggregationError> {
        let timezone = self.timezone()?;
        let Some([start_query, end_query]) = &self.description.pre_aggregation_start_end_queries else {
            return Ok(self.or_now_if_empty(
                self.description.build_range_start.clone(),
                self.description.build_range_end.clone(),
                timezone,
            ));
        };
        let start = self.extract_date(&self.load_range_query(start_query, None).await?, timezone);
        let end = self.extract_date(&self.load_range_query(end_query, None).await?, timezone);
        let range = self.or_now_if_empty(start, end, timezone);
        let Some(granularity) = self.description.partition_granularity else {
            return Ok(range);
        };
        if time_series_count(granularity, &range[0], &range[1])? == 0 {
            return Ok(range);
        }
        let precision = self.description.timestamp_precision;
        let first = bucket_containing(granularity, &range[0], precision)?;
        let last = bucket_containing(granularity, &range[1], precision)?;
        let start = self.extract_date(&self.load_range_query(start_query, Some((granularity, &first))).await?, timezone);
        let end = self.extract_date(&self.load_range_query(end_query, Some((granularity, &last))).await?, timezone);
        Ok(self.or_now_if_empty(start, end, timezone))
    }

    /// Splits the build range into partitions.
    ///
    /// Disjoint build and matched ranges collapse to the build range end so
    /// the newest partition still answers.
    async fn partition_ranges(
        &self,
        granularity: Granularity,
        ignore_matched_range: bool,
    ) -> Result<PartitionRanges, PreAggregationError> {
        let build_range = self.load_build_range().await?;
        let matched =
            if ignore_matched_range { None } else { self.description.matched_time_dimension_date_range.as_ref() };
        let build_range = intersect_date_ranges(Some(&build_range), matched)?
            .unwrap_or_else(|| [build_range[1].clone(), build_range[1].clone()]);
        let requested = time_series_count(granularity, &build_range[0], &build_range[1])?;
        if requested > u64::try_from(self.options.max_partitions).unwrap_or(u64::MAX) {
            return Err(PreAggregationError::PartitionCountExceeded {
                table: self.description.table_name.clone(),
                requested,
                limit: self.options.max_partitions,
            });
        }
        let partition_ranges =
            time_series(granularity, &build_range[0], &build_range[1], self.description.timestamp_precision)?;
        Ok(PartitionRanges { build_range, partition_ranges })
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Returns the partitions of this pre-aggregation, or itself when not
    /// partitioned.
    pub(crate) async fn partition_pre_aggregations(&self) -> Result<Vec<PreAggregationDescription>, PreAggregationError> {
        let Some(granularity) = self.partitioned() else {
            return Ok(vec![self.description.clone()]);
        };
        let ranges = self.partition_ranges(granularity, false).await?;
        ranges
            .partition_ranges
            .iter()
            .map(|range| self.partition_description(granularity, range, &ranges.build_range))
            .collect()
    }

    /// Substitutes build-range placeholders in main-query parameters.
    ///
    /// Returns `Ok(None)` when no placeholder is present.
    pub(crate) async fn replace_query_build_range_params(
        &self,
        params: &[Value],
    ) -> Result<Option<Vec<Value>>, PreAggregationError> {
        let is_placeholder =
            |param: &Value| matches!(param.as_str(), Some(BUILD_RANGE_START_LOCAL | BUILD_RANGE_END_LOCAL));
        if !params.iter().any(is_placeholder) {
            return Ok(None);
        }
        let [start, end] = self.load_build_range().await?;
        let format = self.description.timestamp_format;
        let start = format.format(parse_local_timestamp(&start)?);
        let end = format.format(parse_local_timestamp(&end)?);
        let replaced = params
            .iter()
            .map(|param| match param.as_str() {
                Some(BUILD_RANGE_START_LOCAL) => Value::String(start.clone()),
                Some(BUILD_RANGE_END_LOCAL) => Value::String(end.clone()),
                _ => param.clone(),
            })
            .collect();
        Ok(Some(replaced))
    }

    /// Loads every partition concurrently, keeping range order.
    ///
    /// Returns the loaded partitions and the table name patterns expected
    /// for all partitions.
    async fn load_partitions(
        &self,
        granularity: Granularity,
        ranges: &PartitionRanges,
    ) -> Result<(Vec<LoadedPartition>, Vec<String>), PreAggregationError> {
        let mut expected = Vec::with_capacity(ranges.partition_ranges.len());
        let mut tasks = JoinSet::new();
        for (index, range) in ranges.partition_ranges.iter().enumerate() {
            let description = self.partition_description(granularity, range, &ranges.build_range)?;
            expected.push(expected_table_name_pattern(&description));
            let loader = self.loader(description)?;
            let range = range.clone();
            tasks.spawn(async move { (index, loader.load_pre_aggregation(false).await, range) });
        }
        let mut loaded = Vec::with_capacity(ranges.partition_ranges.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, result, range) = joined.map_err(|err| PreAggregationError::Task(err.to_string()))?;
            if let Some(result) = result? {
                loaded.push((index, (result, range)));
            }
        }
        loaded.sort_by_key(|(index, _)| *index);
        Ok((loaded.into_iter().map(|(_, partition)| partition).collect(), expected))
    }

    /// Resolves the relation to read this pre-aggregation from.
    ///
    /// Partitioned pre-aggregations resolve to a `UNION ALL` of their
    /// partition tables unless exactly one partition is used.
    pub(crate) async fn load_pre_aggregations(&self) -> Result<LoadPreAggregationResult, PreAggregationError> {
        let Some(granularity) = self.partitioned() else {
            let loaded = self.loader(self.description.clone())?.load_pre_aggregation(true).await?;
            return loaded.ok_or_else(|| {
                PreAggregationError::NotBuilt(no_partitions_built_message(&[expected_table_name_pattern(
                    &self.description,
                )]))
            });
        };
        let ranges = self.partition_ranges(granularity, false).await?;
        let (mut partitions, mut expected) = self.load_partitions(granularity, &ranges).await?;
        if self.options.external_refresh && partitions.is_empty() {
            let ranges = self.partition_ranges(granularity, true).await?;
            let (retried, retried_expected) = self.load_partitions(granularity, &ranges).await?;
            partitions = retried.into_iter().last().into_iter().collect();
            expected = retried_expected;
        }
        if partitions.is_empty() {
            return Err(PreAggregationError::NotBuilt(no_partitions_built_message(&expected)));
        }
        for (result, _) in &partitions {
            self.engine.add_table_used(&result.target_table_name).await?;
        }
        let mut empty_result = false;
        if let Some(lambda_id) = &self.description.rollup_lambda_id {
            let filtered = self.filter_lambda_partitions(lambda_id, &partitions)?;
            if filtered.is_empty() {
                empty_result = true;
                partitions = partitions.into_iter().last().into_iter().collect();
            } else {
                partitions = filtered;
            }
        }
        Ok(self.union_result(&partitions, empty_result))
    }

    /// Keeps partitions a lambda rollup may read: closed partitions (or all
    /// of them for the last rollup of the lambda) starting after every
    /// earlier rollup of the same lambda ends.
    fn filter_lambda_partitions(
        &self,
        lambda_id: &str,
        partitions: &[LoadedPartition],
    ) -> Result<Vec<LoadedPartition>, PreAggregationError> {
        let earlier_ends: Vec<&str> = self
            .tables
            .iter()
            .filter(|table| table.rollup_lambda_id.as_deref() == Some(lambda_id))
            .filter_map(|table| table.build_range_end.as_deref())
            .collect();
        let mut filtered = Vec::new();
        for (result, range) in partitions {
            let closed = self.description.last_rollup_lambda
                || match result.build_range_end.as_deref() {
                    Some(end) => same_local_time(end, &range[1])?,
                    None => false,
                };
            let mut after_earlier = true;
            for end in &earlier_ends {
                after_earlier &= parse_local_timestamp(end)? < parse_local_timestamp(&range[0])?;
            }
            if closed && after_earlier {
                filtered.push((result.clone(), range.clone()));
            }
        }
        Ok(filtered)
    }

    /// Combines loaded partitions into one load result.
    fn union_result(&self, partitions: &[LoadedPartition], empty_result: bool) -> LoadPreAggregationResult {
        let targets: Vec<&str> = partitions.iter().map(|(result, _)| result.target_table_name.as_str()).collect();
        let target_table_name = match (targets.as_slice(), empty_result) {
            ([single], false) => (*single).to_string(),
            _ => {
                let filter = if empty_result { " WHERE 1 = 0" } else { "" };
                let selects: Vec<String> =
                    targets.iter().map(|target| format!("SELECT * FROM {target}{filter}")).collect();
                format!("({})", selects.join(" UNION ALL "))
            }
        };
        let build_range_end =
            if empty_result { None } else { partitions.last().and_then(|(result, _)| result.build_range_end.clone()) };
        LoadPreAggregationResult {
            table_name: self.description.table_name.clone(),
            target_table_name,
            refresh_key_values: partitions
                .iter()
                .map(|(result, _)| Value::Array(result.refresh_key_values.clone()))
                .collect(),
            last_updated_at: partitions.iter().map(|(result, _)| result.last_updated_at).min().unwrap_or_default(),
            rollup_lambda_id: self.description.rollup_lambda_id.clone(),
            build_range_end,
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    fn range(start: &str, end: &str) -> DateRange {
        [start.to_string(), end.to_string()]
    }

    #[test]
    fn partition_names_append_compact_suffix() {
        let day = range("2024-03-05T00:00:00.000", "2024-03-05T23:59:59.999");
        assert_eq!(partition_table_name("s.orders", Granularity::Day, &day).unwrap(), "s.orders20240305");
        let hour = range("2024-03-05T07:00:00.000", "2024-03-05T07:59:59.999");
        assert_eq!(partition_table_name("s.orders", Granularity::Hour, &hour).unwrap(), "s.orders2024030507");
        let month = range("2024-03-01T00:00:00.000", "2024-03-31T23:59:59.999");
        assert_eq!(partition_table_name("s.orders", Granularity::Month, &month).unwrap(), "s.orders20240301");
    }

    #[test]
    fn range_cache_key_ignores_refresh_keys() {
        let query = QueryWithParams::with_params("SELECT max(ts) FROM t", vec![json!(1)]);
        assert_eq!(range_query_cache_key(&query), json!(["SELECT max(ts) FROM t", [1], []]));
    }

    #[test]
    fn same_local_time_ignores_precision() {
        assert!(same_local_time("2024-01-01T23:59:59.999", "2024-01-01T23:59:59.999").unwrap());
        assert!(!same_local_time("2024-01-01T10:00:00.000", "2024-01-01T23:59:59.999").unwrap());
        assert!(same_local_time("2024-01-01", "2024-01-01T00:00:00.000000").unwrap());
    }
}
