// crates/query-orchestrator-core/src/core/ranges.rs
// ============================================================================
// Module: Query Orchestrator Date Ranges
// Description: Validation and intersection of local date ranges.
// Purpose: Resolve partition build ranges without ever coercing bad input.
// Dependencies: serde_json, thiserror, crate::core::time
// ============================================================================

//! ## Overview
//! Ranges are `[start, end]` pairs of local timestamps. Intersection is pure:
//! it returns the overlap, the other operand when one side is absent, or
//! `None` when the ranges are disjoint. Malformed input fails immediately.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Value;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::core::pre_aggregation::DateRange;
use crate::core::time::parse_local_timestamp;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Malformed range input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// The range did not have exactly two elements.
    #[error("Date range expected to be an array with 2 elements but {0} found")]
    Arity(String),
    /// An element was not a string.
    #[error("Date range expected to be a string array but {0} found")]
    NotStrings(String),
    /// An element was not a supported timestamp.
    #[error("Date range expected to be in YYYY-MM-DDTHH:mm:ss.SSS format but {0} found")]
    Format(String),
}

// ============================================================================
// SECTION: Validation
// ============================================================================

/// Validates a JSON value as a date range.
///
/// # Errors
///
/// Returns [`RangeError`] for wrong arity, non-string elements, or
/// unsupported timestamp shapes.
pub fn date_range_from_value(value: &Value) -> Result<DateRange, RangeError> {
    let Value::Array(items) = value else {
        return Err(RangeError::Arity(value.to_string()));
    };
    let [start, end] = items.as_slice() else {
        return Err(RangeError::Arity(value.to_string()));
    };
    let (Some(start), Some(end)) = (start.as_str(), end.as_str()) else {
        return Err(RangeError::NotStrings(value.to_string()));
    };
    let range = [start.to_string(), end.to_string()];
    parse_range(&range)?;
    Ok(range)
}

/// Parses both ends of a range.
fn parse_range(range: &DateRange) -> Result<(PrimitiveDateTime, PrimitiveDateTime), RangeError> {
    let format_error = || RangeError::Format(format!("[\"{}\", \"{}\"]", range[0], range[1]));
    let start = parse_local_timestamp(&range[0]).map_err(|_| format_error())?;
    let end = parse_local_timestamp(&range[1]).map_err(|_| format_error())?;
    Ok((start, end))
}

// ============================================================================
// SECTION: Intersection
// ============================================================================

/// Returns the overlap of two inclusive ranges.
///
/// A missing operand yields the other unchanged. Disjoint ranges yield
/// `None`. The returned bounds are the original strings of whichever side
/// supplied them.
///
/// # Errors
///
/// Returns [`RangeError::Format`] when either present range is malformed.
pub fn intersect_date_ranges(
    left: Option<&DateRange>,
    right: Option<&DateRange>,
) -> Result<Option<DateRange>, RangeError> {
    let (left, right) = match (left, right) {
        (None, None) => return Ok(None),
        (Some(range), None) | (None, Some(range)) => {
            parse_range(range)?;
            return Ok(Some(range.clone()));
        }
        (Some(left), Some(right)) => (left, right),
    };
    let (left_start, left_end) = parse_range(left)?;
    let (right_start, right_end) = parse_range(right)?;
    if left_start > right_end || right_start > left_end {
        return Ok(None);
    }
    let start = if left_start >= right_start { &left[0] } else { &right[0] };
    let end = if left_end <= right_end { &left[1] } else { &right[1] };
    Ok(Some([start.clone(), end.clone()]))
}
