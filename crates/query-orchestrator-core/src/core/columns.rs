// crates/query-orchestrator-core/src/core/columns.rs
// ============================================================================
// Module: Query Orchestrator Column Types
// Description: Generic column type inference for downloaded rows.
// Purpose: Type ad-hoc query results before uploading them to an external store.
// Dependencies: serde_json, crate::core::pre_aggregation
// ============================================================================

//! ## Overview
//! Each column is assigned the most specific generic type every present
//! value satisfies, checked in the order timestamp, date, int, bigint,
//! decimal, boolean, string, text. Integers outside the signed 32-bit range
//! are `bigint`; outside the signed 64-bit range they are `decimal`. Values
//! may arrive as JSON numbers or as digit strings.
//!
//! JSON `null` carries no type information and is skipped. A column with no
//! non-null value in the row set is typed `text`, which accepts any value a
//! later load may bring.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Map;
use serde_json::Value;

use crate::core::pre_aggregation::TableColumn;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Candidate generic types, from most to least specific.
const CANDIDATES: [&str; 8] = ["timestamp", "date", "int", "bigint", "decimal", "boolean", "string", "text"];

/// Strings shorter than this many characters may be typed `string`.
const MAX_STRING_LENGTH: usize = 256;

/// Infers generic column types for a row set.
///
/// Columns are taken from the first row in its key order. Returns `None` for
/// an empty row set.
#[must_use]
pub fn infer_column_types(rows: &[Map<String, Value>]) -> Option<Vec<TableColumn>> {
    let first = rows.first()?;
    let columns = first
        .keys()
        .map(|name| {
            let values: Vec<&Value> =
                rows.iter().filter_map(|row| row.get(name)).filter(|value| !value.is_null()).collect();
            let column_type = CANDIDATES
                .iter()
                .find(|candidate| !values.is_empty() && values.iter().all(|value| matches_type(candidate, value)))
                .copied()
                .unwrap_or("text");
            TableColumn { name: name.clone(), column_type: column_type.to_string() }
        })
        .collect();
    Some(columns)
}

/// Returns true when `value` satisfies the generic type.
fn matches_type(column_type: &str, value: &Value) -> bool {
    let text = value_text(value);
    match column_type {
        "timestamp" => looks_like_timestamp(&text),
        "date" => text.len() == 10 && looks_like_date(&text),
        "int" => integer_text(&text).and_then(|digits| digits.parse::<i32>().ok()).is_some(),
        "bigint" => integer_text(&text).and_then(|digits| digits.parse::<i64>().ok()).is_some(),
        "decimal" => value.is_number() || is_decimal(&text),
        "boolean" => value.is_boolean() || text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false"),
        "string" => text.chars().count() < MAX_STRING_LENGTH,
        _ => true,
    }
}

/// Renders a scalar for pattern matching.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Returns the text when it is an optionally negative run of digits.
fn integer_text(text: &str) -> Option<&str> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    (!digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit())).then_some(text)
}

/// Returns true for `-?\d+(\.\d+)?`.
fn is_decimal(text: &str) -> bool {
    let body = text.strip_prefix('-').unwrap_or(text);
    let (whole, fraction) = body.split_once('.').map_or((body, None), |(whole, fraction)| (whole, Some(fraction)));
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit());
    digits(whole) && fraction.is_none_or(digits)
}

/// Returns true for a `YYYY-MM-DD` prefix.
fn looks_like_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 10
        && bytes[.. 4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5 .. 7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8 .. 10].iter().all(u8::is_ascii_digit)
}

/// Returns true for a `YYYY-MM-DDTHH:mm:ss` prefix.
fn looks_like_timestamp(text: &str) -> bool {
    let bytes = text.as_bytes();
    looks_like_date(text)
        && bytes.len() >= 19
        && bytes[10] == b'T'
        && bytes[11 .. 13].iter().all(u8::is_ascii_digit)
        && bytes[13] == b':'
        && bytes[14 .. 16].iter().all(u8::is_ascii_digit)
        && bytes[16] == b':'
        && bytes[17 .. 19].iter().all(u8::is_ascii_digit)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
