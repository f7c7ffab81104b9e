//! SQLite implementations for single-node deployments and tests
//!
//! UUIDs are stored as TEXT and timestamps as unix milliseconds so that
//! ordering and cutoff comparisons are plain integer comparisons.

mod certificates;
mod ledger;

pub use certificates::*;
pub use ledger::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use uuid::Uuid;

use crate::infra::{LedgerError, Result};

/// Open a pool and run migrations. `sqlite::memory:` gets a single
/// connection, since every in-memory connection is its own database.
pub async fn connect_sqlite(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let max_connections = if url.contains(":memory:") {
        1
    } else {
        max_connections.max(1)
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    crate::migrations::run_sqlite(&pool).await?;
    Ok(pool)
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| LedgerError::Internal(format!("timestamp out of range: {millis}")))
}

pub(crate) fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| LedgerError::Internal(format!("bad uuid {text:?}: {e}")))
}
