// crates/query-orchestrator-core/src/core/time.rs
// ============================================================================
// Module: Query Orchestrator Time Model
// Description: Local timestamps, fixed-offset timezones, and calendar buckets.
// Purpose: Provide deterministic partition arithmetic for pre-aggregation ranges.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Partition ranges travel as local wall-clock strings in the
//! `YYYY-MM-DDTHH:mm:ss.SSS` shape (or six fractional digits). This module
//! parses and formats them, snaps them to calendar buckets, and converts
//! between local time and UTC instants.
//!
//! Timezones are fixed offsets: `UTC`, `Etc/UTC`, `GMT`, `Z`, or a signed
//! `+HH:MM` offset. Named zones with daylight-saving rules are not resolved.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::Date;
use time::Duration;
use time::Month;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::Time;
use time::UtcOffset;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by local time arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// A timestamp string did not match a supported shape.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// A timezone name could not be resolved to an offset.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    /// A granularity name is not supported.
    #[error("unsupported granularity: {0}")]
    UnknownGranularity(String),
    /// Calendar arithmetic left the representable range.
    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Returns the current unix time in milliseconds.
#[must_use]
pub fn unix_millis() -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

/// Returns the current wall-clock instant.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

// ============================================================================
// SECTION: Timezones
// ============================================================================

/// Fixed-offset timezone used for partition boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    /// Coordinated universal time.
    Utc,
    /// Fixed offset east of UTC.
    Fixed(UtcOffset),
}

impl Timezone {
    /// Parses a timezone name.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownTimezone`] for names that are not UTC
    /// aliases or signed `HH:MM` offsets.
    pub fn parse(name: &str) -> Result<Self, TimeError> {
        let trimmed = name.trim();
        match trimmed {
            "" | "UTC" | "Etc/UTC" | "GMT" | "Etc/GMT" | "Z" => return Ok(Self::Utc),
            _ => {}
        }
        let offset = trimmed.strip_prefix("UTC").unwrap_or(trimmed);
        let unknown = || TimeError::UnknownTimezone(name.to_string());
        let (sign, rest) = match offset.as_bytes().first() {
            Some(b'+') => (1_i8, &offset[1 ..]),
            Some(b'-') => (-1_i8, &offset[1 ..]),
            _ => return Err(unknown()),
        };
        let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
        let hours: i8 = hours.parse().map_err(|_| unknown())?;
        let minutes: i8 = minutes.parse().map_err(|_| unknown())?;
        let offset = UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|_| unknown())?;
        if offset.is_utc() { Ok(Self::Utc) } else { Ok(Self::Fixed(offset)) }
    }

    /// Returns the offset east of UTC.
    #[must_use]
    pub const fn offset(&self) -> UtcOffset {
        match self {
            Self::Utc => UtcOffset::UTC,
            Self::Fixed(offset) => *offset,
        }
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utc => f.write_str("UTC"),
            Self::Fixed(offset) => {
                let (hours, minutes, _) = offset.as_hms();
                let sign = if offset.is_negative() { '-' } else { '+' };
                write!(f, "{sign}{:02}:{:02}", hours.unsigned_abs(), minutes.unsigned_abs())
            }
        }
    }
}

// ============================================================================
// SECTION: Timestamp Formats
// ============================================================================

/// Wire shape for build-range parameters handed to the source database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// `YYYY-MM-DDTHH:mm:ss.SSS`
    #[default]
    Millis,
    /// `YYYY-MM-DDTHH:mm:ss.SSSZ`
    MillisZ,
    /// `YYYY-MM-DDTHH:mm:ss.SSSSSS`
    Micros,
    /// `YYYY-MM-DDTHH:mm:ss.SSSSSSZ`
    MicrosZ,
}

impl TimestampFormat {
    /// Returns the fractional precision of this format.
    #[must_use]
    pub const fn precision(self) -> Precision {
        match self {
            Self::Millis | Self::MillisZ => Precision::Millis,
            Self::Micros | Self::MicrosZ => Precision::Micros,
        }
    }

    /// Formats a UTC wall-clock value in this shape.
    #[must_use]
    pub fn format(self, value: PrimitiveDateTime) -> String {
        let base = format_local(value, self.precision());
        match self {
            Self::Millis | Self::Micros => base,
            Self::MillisZ | Self::MicrosZ => format!("{base}Z"),
        }
    }
}

/// Fractional second precision for local timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Three fractional digits.
    #[default]
    Millis,
    /// Six fractional digits.
    Micros,
}

impl Precision {
    /// Returns the smallest representable step for this precision.
    #[must_use]
    pub const fn epsilon(self) -> Duration {
        match self {
            Self::Millis => Duration::milliseconds(1),
            Self::Micros => Duration::microseconds(1),
        }
    }
}

// ============================================================================
// SECTION: Granularity
// ============================================================================

/// Calendar bucket size for partitions and time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One second.
    Second,
    /// One minute.
    Minute,
    /// One hour.
    Hour,
    /// One day.
    Day,
    /// One ISO week starting on Monday.
    Week,
    /// One calendar month.
    Month,
    /// One calendar quarter.
    Quarter,
    /// One calendar year.
    Year,
}

impl Granularity {
    /// Parses a granularity name.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownGranularity`] for unsupported names.
    pub fn parse(name: &str) -> Result<Self, TimeError> {
        match name {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            other => Err(TimeError::UnknownGranularity(other.to_string())),
        }
    }

    /// Returns the lowercase granularity name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }

    /// Number of leading local-timestamp characters kept in partition suffixes.
    const fn suffix_length(self) -> usize {
        match self {
            Self::Hour => 13,
            Self::Minute => 16,
            Self::Second => 19,
            Self::Day | Self::Week | Self::Month | Self::Quarter | Self::Year => 10,
        }
    }

    /// Fixed duration of a bucket, when the bucket is not calendar-variable.
    const fn fixed_step(self) -> Option<Duration> {
        match self {
            Self::Second => Some(Duration::SECOND),
            Self::Minute => Some(Duration::MINUTE),
            Self::Hour => Some(Duration::HOUR),
            Self::Day => Some(Duration::DAY),
            Self::Week => Some(Duration::WEEK),
            Self::Month | Self::Quarter | Self::Year => None,
        }
    }

    /// Month count of a bucket, when the bucket is calendar-variable.
    const fn month_step(self) -> Option<i32> {
        match self {
            Self::Month => Some(1),
            Self::Quarter => Some(3),
            Self::Year => Some(12),
            _ => None,
        }
    }

    /// Snaps a local timestamp down to the start of its bucket.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::OutOfRange`] when the bucket start is not representable.
    pub fn floor(self, value: PrimitiveDateTime) -> Result<PrimitiveDateTime, TimeError> {
        let date = value.date();
        let time = value.time();
        let out_of_range = || TimeError::OutOfRange(format_local(value, Precision::Micros));
        let floored = match self {
            Self::Second => {
                PrimitiveDateTime::new(date, Time::from_hms(time.hour(), time.minute(), time.second()).map_err(|_| out_of_range())?)
            }
            Self::Minute => {
                PrimitiveDateTime::new(date, Time::from_hms(time.hour(), time.minute(), 0).map_err(|_| out_of_range())?)
            }
            Self::Hour => PrimitiveDateTime::new(date, Time::from_hms(time.hour(), 0, 0).map_err(|_| out_of_range())?),
            Self::Day => date.midnight(),
            Self::Week => {
                let back = i64::from(date.weekday().number_days_from_monday());
                date.checked_sub(Duration::days(back)).ok_or_else(out_of_range)?.midnight()
            }
            Self::Month => first_of_month(date.year(), date.month())?.midnight(),
            Self::Quarter => {
                let month_index = (u8::from(date.month()) - 1) / 3 * 3 + 1;
                let month = Month::try_from(month_index).map_err(|_| out_of_range())?;
                first_of_month(date.year(), month)?.midnight()
            }
            Self::Year => first_of_month(date.year(), Month::January)?.midnight(),
        };
        Ok(floored)
    }

    /// Returns the start of the bucket following the one starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::OutOfRange`] when the next bucket is not representable.
    pub fn next(self, start: PrimitiveDateTime) -> Result<PrimitiveDateTime, TimeError> {
        let out_of_range = || TimeError::OutOfRange(format_local(start, Precision::Micros));
        if let Some(step) = self.fixed_step() {
            return start.checked_add(step).ok_or_else(out_of_range);
        }
        let months = self.month_step().ok_or_else(out_of_range)?;
        let date = start.date();
        let index = date.year() * 12 + i32::from(u8::from(date.month()) - 1) + months;
        let year = index.div_euclid(12);
        let month_number = u8::try_from(index.rem_euclid(12) + 1).map_err(|_| out_of_range())?;
        let month = Month::try_from(month_number).map_err(|_| out_of_range())?;
        Ok(first_of_month(year, month)?.midnight())
    }

    /// Returns the number of buckets touched by the inclusive local range.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::OutOfRange`] when bucket arithmetic overflows.
    pub fn bucket_count(self, start: PrimitiveDateTime, end: PrimitiveDateTime) -> Result<u64, TimeError> {
        let first = self.floor(start)?;
        let last = self.floor(end)?;
        if last < first {
            return Ok(0);
        }
        if let Some(step) = self.fixed_step() {
            let span = (last - first).whole_seconds();
            let steps = span / step.whole_seconds();
            return Ok(u64::try_from(steps).unwrap_or(u64::MAX).saturating_add(1));
        }
        let months = i64::from(self.month_step().unwrap_or(1));
        let month_index = |value: PrimitiveDateTime| {
            i64::from(value.year()) * 12 + i64::from(u8::from(value.month()))
        };
        let steps = (month_index(last) - month_index(first)) / months;
        Ok(u64::try_from(steps).unwrap_or(u64::MAX).saturating_add(1))
    }

    /// Returns the compact partition suffix for a bucket start.
    ///
    /// Hour buckets yield `YYYYMMDDHH`, minute buckets `YYYYMMDDHHmm`, second
    /// buckets `YYYYMMDDHHmmss`, and every coarser bucket `YYYYMMDD`.
    #[must_use]
    pub fn partition_suffix(self, start: PrimitiveDateTime) -> String {
        format_local(start, Precision::Millis)
            .chars()
            .take(self.suffix_length())
            .filter(|ch| !matches!(ch, '-' | 'T' | ':'))
            .collect()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Parsing and Formatting
// ============================================================================

/// Parses a local timestamp.
///
/// Accepted shapes: `YYYY-MM-DD`, `YYYY-MM-DDTHH:mm:ss`, and the same with
/// three or six fractional digits. A space may replace `T` and a trailing
/// `Z` is ignored.
///
/// # Errors
///
/// Returns [`TimeError::InvalidTimestamp`] for any other shape.
pub fn parse_local_timestamp(value: &str) -> Result<PrimitiveDateTime, TimeError> {
    let invalid = || TimeError::InvalidTimestamp(value.to_string());
    let text = value.strip_suffix('Z').unwrap_or(value);
    let bytes = text.as_bytes();
    if !matches!(bytes.len(), 10 | 19 | 23 | 26) {
        return Err(invalid());
    }
    if bytes.get(4) != Some(&b'-') || bytes.get(7) != Some(&b'-') {
        return Err(invalid());
    }
    let year = i32::try_from(digits(text, 0, 4).ok_or_else(invalid)?).map_err(|_| invalid())?;
    let month = u8::try_from(digits(text, 5, 2).ok_or_else(invalid)?).map_err(|_| invalid())?;
    let day = u8::try_from(digits(text, 8, 2).ok_or_else(invalid)?).map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    let date = Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
    if bytes.len() == 10 {
        return Ok(date.midnight());
    }
    if !matches!(bytes[10], b'T' | b' ') || bytes[13] != b':' || bytes[16] != b':' {
        return Err(invalid());
    }
    let hour = u8::try_from(digits(text, 11, 2).ok_or_else(invalid)?).map_err(|_| invalid())?;
    let minute = u8::try_from(digits(text, 14, 2).ok_or_else(invalid)?).map_err(|_| invalid())?;
    let second = u8::try_from(digits(text, 17, 2).ok_or_else(invalid)?).map_err(|_| invalid())?;
    let micros = match bytes.len() {
        19 => 0,
        23 if bytes[19] == b'.' => digits(text, 20, 3).ok_or_else(invalid)? * 1_000,
        26 if bytes[19] == b'.' => digits(text, 20, 6).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    let time = Time::from_hms_micro(hour, minute, second, micros).map_err(|_| invalid())?;
    Ok(PrimitiveDateTime::new(date, time))
}

/// Formats a local timestamp with the requested precision.
#[must_use]
pub fn format_local(value: PrimitiveDateTime, precision: Precision) -> String {
    let head = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second()
    );
    match precision {
        Precision::Millis => format!("{head}.{:03}", value.millisecond()),
        Precision::Micros => format!("{head}.{:06}", value.microsecond()),
    }
}

/// Formats a UTC instant as `YYYY-MM-DDTHH:mm:ss.SSSZ`.
#[must_use]
pub fn format_utc_iso(instant: OffsetDateTime) -> String {
    let utc = instant.to_offset(UtcOffset::UTC);
    format!("{}Z", format_local(PrimitiveDateTime::new(utc.date(), utc.time()), Precision::Millis))
}

/// Parses a UTC instant rendered as ISO 8601 with `Z`, an explicit offset,
/// or no zone designator at all (treated as UTC).
///
/// # Errors
///
/// Returns [`TimeError::InvalidTimestamp`] for unsupported shapes.
pub fn parse_utc_instant(value: &str) -> Result<OffsetDateTime, TimeError> {
    let trimmed = value.trim();
    let split = trimmed
        .len()
        .checked_sub(6)
        .filter(|index| *index > 10)
        .filter(|index| matches!(trimmed.as_bytes()[*index], b'+' | b'-'));
    let (local, offset) = match split {
        Some(index) => {
            let zone = Timezone::parse(&trimmed[index ..])
                .map_err(|_| TimeError::InvalidTimestamp(value.to_string()))?;
            (&trimmed[.. index], zone.offset())
        }
        None => (trimmed, UtcOffset::UTC),
    };
    let local = trim_fraction(local);
    let parsed = parse_local_timestamp(&local)?;
    Ok(parsed.assume_offset(offset).to_offset(UtcOffset::UTC))
}

/// Normalizes fractional digits to three or six so the parser accepts them.
fn trim_fraction(value: &str) -> String {
    let body = value.strip_suffix('Z').unwrap_or(value);
    let Some((head, fraction)) = body.split_once('.') else {
        return body.to_string();
    };
    let digits: String = fraction.chars().take_while(char::is_ascii_digit).collect();
    let width = if digits.len() > 3 { 6 } else { 3 };
    let mut padded: String = digits.chars().take(width).collect();
    while padded.len() < width {
        padded.push('0');
    }
    format!("{head}.{padded}")
}

/// Reads `len` ASCII digits starting at `start`.
fn digits(text: &str, start: usize, len: usize) -> Option<u32> {
    let slice = text.get(start .. start + len)?;
    if !slice.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    slice.parse().ok()
}

/// Returns the first day of a month.
fn first_of_month(year: i32, month: Month) -> Result<Date, TimeError> {
    Date::from_calendar_date(year, month, 1).map_err(|_| TimeError::OutOfRange(format!("{year}-{month}")))
}

// ============================================================================
// SECTION: Conversions
// ============================================================================

/// Converts a local timestamp to its UTC rendering in the requested format.
///
/// # Errors
///
/// Returns [`TimeError`] when the input cannot be parsed or shifted.
pub fn local_to_utc(timezone: Timezone, format: TimestampFormat, value: &str) -> Result<String, TimeError> {
    let local = parse_local_timestamp(value)?;
    let utc = local.assume_offset(timezone.offset()).to_offset(UtcOffset::UTC);
    Ok(format.format(PrimitiveDateTime::new(utc.date(), utc.time())))
}

/// Converts an instant to local wall-clock time.
#[must_use]
pub fn utc_to_local(timezone: Timezone, instant: OffsetDateTime) -> PrimitiveDateTime {
    let local = instant.to_offset(timezone.offset());
    PrimitiveDateTime::new(local.date(), local.time())
}

/// Returns the current local time rendered with the given precision.
#[must_use]
pub fn now_local(timezone: Timezone, precision: Precision) -> String {
    format_local(utc_to_local(timezone, now_utc()), precision)
}

/// Reads the first column of the first row as a UTC instant and renders it
/// as local time. Returns `None` for empty results or unparseable values.
#[must_use]
pub fn parse_utc_into_local(rows: &[Value], timezone: Timezone, precision: Precision) -> Option<String> {
    let first = rows.first()?;
    let value = match first {
        Value::Object(map) => map.values().next()?,
        Value::Array(items) => items.first()?,
        other => other,
    };
    let text = value.as_str()?;
    let instant = parse_utc_instant(text).ok()?;
    Some(format_local(utc_to_local(timezone, instant), precision))
}

/// Returns the instant `seconds` after a local timestamp.
///
/// # Errors
///
/// Returns [`TimeError`] when the input cannot be parsed or the sum overflows.
pub fn add_seconds_to_local(
    timezone: Timezone,
    value: &str,
    seconds: u64,
) -> Result<OffsetDateTime, TimeError> {
    let local = parse_local_timestamp(value)?;
    let instant = local.assume_offset(timezone.offset());
    let seconds = i64::try_from(seconds).map_err(|_| TimeError::OutOfRange(value.to_string()))?;
    instant
        .checked_add(Duration::seconds(seconds))
        .ok_or_else(|| TimeError::OutOfRange(value.to_string()))
}

/// Converts unix milliseconds into an instant.
///
/// # Errors
///
/// Returns [`TimeError::OutOfRange`] for values outside the supported calendar.
pub fn instant_from_millis(millis: i64) -> Result<OffsetDateTime, TimeError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|_| TimeError::OutOfRange(millis.to_string()))
}

// ============================================================================
// SECTION: Time Series
// ============================================================================

/// Returns the calendar buckets covering the inclusive local range, each as a
/// `[start, end]` pair where `end` is one precision step before the next
/// bucket starts.
///
/// # Errors
///
/// Returns [`TimeError`] when either bound is malformed or arithmetic overflows.
pub fn time_series(
    granularity: Granularity,
    start: &str,
    end: &str,
    precision: Precision,
) -> Result<Vec<[String; 2]>, TimeError> {
    let start = parse_local_timestamp(start)?;
    let end = parse_local_timestamp(end)?;
    let mut cursor = granularity.floor(start)?;
    let mut series = Vec::new();
    while cursor <= end {
        let (bucket, next) = bucket_from(granularity, cursor, precision)?;
        series.push(bucket);
        cursor = next;
    }
    Ok(series)
}

/// Returns how many buckets [`time_series`] would produce, without
/// materializing them.
///
/// # Errors
///
/// Returns [`TimeError`] when either bound is malformed or arithmetic overflows.
pub fn time_series_count(granularity: Granularity, start: &str, end: &str) -> Result<u64, TimeError> {
    granularity.bucket_count(parse_local_timestamp(start)?, parse_local_timestamp(end)?)
}

/// Returns the `[start, end]` bucket containing a local timestamp.
///
/// # Errors
///
/// Returns [`TimeError`] when the value is malformed or arithmetic overflows.
pub fn bucket_containing(granularity: Granularity, value: &str, precision: Precision) -> Result<[String; 2], TimeError> {
    let start = granularity.floor(parse_local_timestamp(value)?)?;
    Ok(bucket_from(granularity, start, precision)?.0)
}

/// Formats the bucket starting at `start` and returns the next bucket start.
fn bucket_from(
    granularity: Granularity,
    start: PrimitiveDateTime,
    precision: Precision,
) -> Result<([String; 2], PrimitiveDateTime), TimeError> {
    let next = granularity.next(start)?;
    let last =
        next.checked_sub(precision.epsilon()).ok_or_else(|| TimeError::OutOfRange(format_local(next, precision)))?;
    Ok(([format_local(start, precision), format_local(last, precision)], next))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn floors_weeks_to_monday() {
        let value = parse_local_timestamp("2024-01-10T12:00:00.000").unwrap();
        let floored = Granularity::Week.floor(value).unwrap();
        assert_eq!(format_local(floored, Precision::Millis), "2024-01-08T00:00:00.000");
    }

    #[test]
    fn next_month_rolls_year() {
        let value = parse_local_timestamp("2023-12-01T00:00:00.000").unwrap();
        let next = Granularity::Month.next(value).unwrap();
        assert_eq!(format_local(next, Precision::Millis), "2024-01-01T00:00:00.000");
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(Timezone::parse("+09:00").unwrap().to_string(), "+09:00");
        assert_eq!(Timezone::parse("Etc/UTC").unwrap(), Timezone::Utc);
        assert!(Timezone::parse("America/Nowhere").is_err());
    }

    #[test]
    fn parses_utc_instant_with_offset() {
        let instant = parse_utc_instant("2024-01-01T09:00:00.000+09:00").unwrap();
        assert_eq!(format_utc_iso(instant), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn series_count_matches_materialized_series() {
        let cases = [
            (Granularity::Second, "2024-01-01T00:00:58.500", "2024-01-01T00:01:02.000"),
            (Granularity::Minute, "2024-01-01T23:58:00.000", "2024-01-02T00:03:00.000"),
            (Granularity::Hour, "2024-01-01T22:30:00.000", "2024-01-02T01:00:00.000"),
            (Granularity::Week, "2024-01-03T00:00:00.000", "2024-02-01T00:00:00.000"),
            (Granularity::Quarter, "2023-11-15T00:00:00.000", "2024-07-01T00:00:00.000"),
            (Granularity::Day, "2024-01-05T00:00:00.000", "2024-01-01T00:00:00.000"),
        ];
        for (granularity, start, end) in cases {
            let series = time_series(granularity, start, end, Precision::Millis).unwrap();
            let count = time_series_count(granularity, start, end).unwrap();
            assert_eq!(count, u64::try_from(series.len()).unwrap(), "{granularity}");
        }
    }

    #[test]
    fn second_buckets_over_a_month_are_counted_without_listing() {
        let count = time_series_count(Granularity::Second, "2024-01-01T00:00:00.000", "2024-01-31T23:59:59.999").unwrap();
        assert_eq!(count, 2_678_400);
    }

    #[test]
    fn bucket_containing_snaps_to_the_bucket() {
        let bucket = bucket_containing(Granularity::Hour, "2024-03-05T13:45:10.250", Precision::Millis).unwrap();
        assert_eq!(bucket, ["2024-03-05T13:00:00.000".to_string(), "2024-03-05T13:59:59.999".to_string()]);
    }
}
