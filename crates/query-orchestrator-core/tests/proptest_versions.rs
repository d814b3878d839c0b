// crates/query-orchestrator-core/tests/proptest_versions.rs
// ============================================================================
// Module: Version and Range Property-Based Tests
// Description: Property tests for version strings, range overlap, and series.
// Purpose: Detect panics and invariants across wide input ranges.
// ============================================================================

//! Property-based tests for version hashing and date range arithmetic.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    clippy::missing_docs_in_private_items,
    reason = "Test-only assertions and helpers are permitted."
)]

use proptest::prelude::*;
use query_orchestrator_core::Granularity;
use query_orchestrator_core::Precision;
use query_orchestrator_core::core::hashing::VERSION_CHARSET;
use query_orchestrator_core::core::hashing::VERSION_LENGTH;
use query_orchestrator_core::core::time::parse_local_timestamp;
use query_orchestrator_core::core::time::time_series;
use query_orchestrator_core::intersect_date_ranges;
use query_orchestrator_core::version;
use serde_json::Value;

fn json_value_strategy(max_depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|v| Value::Number(v.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(max_depth, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0 .. 4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0 .. 4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Renders a day offset from 2020-01-01 as a local timestamp.
fn day(offset: u16, end_of_day: bool) -> String {
    let date = time::Date::from_calendar_date(2020, time::Month::January, 1).unwrap()
        + time::Duration::days(i64::from(offset));
    let suffix = if end_of_day { "23:59:59.999" } else { "00:00:00.000" };
    format!("{date}T{suffix}")
}

fn range_strategy() -> impl Strategy<Value = [String; 2]> {
    (0u16 .. 800, 0u16 .. 60).prop_map(|(start, length)| [day(start, false), day(start + length, true)])
}

proptest! {
    #[test]
    fn version_has_fixed_length_and_charset(value in json_value_strategy(3)) {
        let out = version(&value).unwrap();
        prop_assert_eq!(out.len(), VERSION_LENGTH);
        prop_assert!(out.bytes().all(|byte| VERSION_CHARSET.contains(&byte)));
        prop_assert_eq!(version(&value).unwrap(), out);
    }

    #[test]
    fn intersection_is_symmetric_and_contained(left in range_strategy(), right in range_strategy()) {
        let forward = intersect_date_ranges(Some(&left), Some(&right)).unwrap();
        let backward = intersect_date_ranges(Some(&right), Some(&left)).unwrap();
        prop_assert_eq!(&forward, &backward);
        if let Some([start, end]) = forward {
            let start = parse_local_timestamp(&start).unwrap();
            let end = parse_local_timestamp(&end).unwrap();
            prop_assert!(start <= end);
            for range in [&left, &right] {
                prop_assert!(parse_local_timestamp(&range[0]).unwrap() <= start);
                prop_assert!(end <= parse_local_timestamp(&range[1]).unwrap());
            }
        }
    }

    #[test]
    fn intersection_with_missing_side_is_identity(range in range_strategy()) {
        prop_assert_eq!(intersect_date_ranges(Some(&range), None).unwrap(), Some(range.clone()));
        prop_assert_eq!(intersect_date_ranges(None, Some(&range)).unwrap(), Some(range));
    }

    #[test]
    fn daily_series_is_contiguous(range in range_strategy()) {
        let series = time_series(Granularity::Day, &range[0], &range[1], Precision::Millis).unwrap();
        prop_assert_eq!(series.first().map(|bucket| bucket[0].clone()), Some(range[0].clone()));
        prop_assert_eq!(series.last().map(|bucket| bucket[1].clone()), Some(range[1].clone()));
        for pair in series.windows(2) {
            let end = parse_local_timestamp(&pair[0][1]).unwrap();
            let next = parse_local_timestamp(&pair[1][0]).unwrap();
            prop_assert_eq!(next - end, time::Duration::milliseconds(1));
        }
    }
}
