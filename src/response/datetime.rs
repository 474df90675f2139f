//! WMI datetime parsing.
//!
//! Accepted shapes:
//! - `2013-04-09T15:42:20.4124Z` (any number of fraction digits, or none)
//! - `2013-04-09T15:42:20.4124-07:00` (offset normalized to UTC)
//! - `04/09/2013 15:42:20.412400`
//!
//! Fractions finer than a microsecond are truncated, never rounded.

use chrono::{DateTime, NaiveDateTime, Timelike};

use crate::error::{Error, Result};

/// Parse a WMI datetime string into a naive UTC timestamp.
pub fn parse_datetime(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();

    let parsed = if text.contains('T') {
        DateTime::parse_from_rfc3339(text).map(|dt| dt.naive_utc())
    } else {
        NaiveDateTime::parse_from_str(text, "%m/%d/%Y %H:%M:%S%.f")
    }
    .map_err(|e| Error::protocol(format!("Invalid datetime '{}': {}", text, e)))?;

    truncate_to_micros(parsed)
}

fn truncate_to_micros(dt: NaiveDateTime) -> Result<NaiveDateTime> {
    let nanos = dt.nanosecond();
    dt.with_nanosecond(nanos - nanos % 1_000)
        .ok_or_else(|| Error::protocol(format!("Invalid datetime nanoseconds: {}", nanos)))
}
