//! Persistence layer modules.

pub mod db;
pub mod run_repo;
pub mod schema;
pub mod session_repo;
pub mod snapshot_repo;
pub mod token_repo;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Parse an RFC 3339 column into a UTC timestamp.
pub(crate) fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

/// Parse a nullable RFC 3339 column.
pub(crate) fn parse_optional_timestamp(
    field: &str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(field, s)).transpose()
}

/// Render a status list as a SQL `IN (...)` body.
///
/// Only ever called with the static status names of this crate's enums,
/// never with caller input.
pub(crate) fn sql_in_list(values: &[&'static str]) -> String {
    values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(",")
}
