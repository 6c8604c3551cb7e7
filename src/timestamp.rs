//! Timestamp normalization boundary.
//!
//! Records arrive with creation times in whatever shape the writer used:
//! RFC 3339 strings, plain dates, epoch numbers, or document-store objects
//! such as `{ "seconds": .., "nanoseconds": .. }`. Everything is converted to
//! `DateTime<Utc>` on ingress; formatting never fails.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub const UNKNOWN_DATE: &str = "Unknown date";
pub const INVALID_DATE: &str = "Invalid date";

/// Epoch values above this are taken as milliseconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn normalize(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_str(text),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
        }
        _ => None,
    }
}

/// Ingress default: anything unreadable becomes "now".
pub fn normalize_or_now(value: &Value) -> DateTime<Utc> {
    normalize(value).unwrap_or_else(now)
}

/// Serde hook for stored records: accepts any shape `normalize` reads.
pub fn deserialize_or_now<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_or_now(&value))
}

pub fn parse_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, pattern) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    text.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value >= MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value as i64)
    } else {
        let secs = value.trunc() as i64;
        let nanos = ((value - value.trunc()) * 1_000_000_000.0) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

pub fn format_datetime(ts: &DateTime<Utc>) -> String {
    ts.format("%b %-d, %Y, %-I:%M %p").to_string()
}

/// Display form of an external timestamp value. Never panics.
pub fn format_timestamp(value: &Value) -> String {
    if value.is_null() {
        return UNKNOWN_DATE.to_string();
    }
    match normalize(value) {
        Some(ts) => format_datetime(&ts),
        None => INVALID_DATE.to_string(),
    }
}

/// Short "time ago" label used by the admin lists.
pub fn format_relative(ts: &DateTime<Utc>, now: &DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(*ts);
    if elapsed.num_seconds() < 60 {
        "just now".to_string()
    } else if elapsed.num_minutes() < 60 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_hours() < 24 {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_days() < 7 {
        format!("{}d ago", elapsed.num_days())
    } else {
        ts.format("%b %-d, %Y").to_string()
    }
}
