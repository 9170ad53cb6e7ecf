//! Time utilities.
//!
//! All persisted timestamps are Unix seconds (UTC). Conversion to and from
//! `chrono` happens at the edges (wire types, recurrence arithmetic).

use chrono::{DateTime, Duration, Months, TimeZone, Utc};

use crate::error::{Error, Result};

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a Unix timestamp to a UTC datetime.
pub fn to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::Internal(format!("Timestamp {} out of range", ts)))
}

/// Parse an RFC 3339 timestamp.
pub fn parse_rfc3339(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::invalid(field, format!("not an RFC 3339 timestamp: {}", e)))
}

/// Add whole days to a timestamp.
pub fn add_days(ts: i64, days: i64) -> Result<i64> {
    let dt = to_datetime(ts)?;
    dt.checked_add_signed(Duration::days(days))
        .map(|d| d.timestamp())
        .ok_or_else(|| Error::Internal("Date overflow".into()))
}

/// Add calendar months to a timestamp, clamping to the end of a shorter month
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(ts: i64, months: u32) -> Result<i64> {
    let dt = to_datetime(ts)?;
    dt.checked_add_months(Months::new(months))
        .map(|d| d.timestamp())
        .ok_or_else(|| Error::Internal("Date overflow".into()))
}
