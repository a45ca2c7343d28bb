//! Persistence layer modules.

pub mod db;
pub mod job_store;
pub mod retention;
pub mod schema;
pub mod session_repo;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Fixed-width RFC 3339 rendering so stored timestamps sort lexically and
/// round-trip without losing precision.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Storage(format!("invalid {field}: {e}")))
}

pub(crate) fn parse_opt_ts(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(field, s)).transpose()
}

pub(crate) fn to_u32(field: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| AppError::Storage(format!("{field} out of range: {value}")))
}

pub(crate) fn to_u64(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| AppError::Storage(format!("{field} out of range: {value}")))
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
