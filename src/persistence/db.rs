//! `SQLite` connection pool setup and schema bootstrap.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

/// Alias for the shared `SQLite` pool.
pub type Database = SqlitePool;

/// Connect to a file-backed database, creating parent directories and
/// applying the schema.
///
/// # Errors
///
/// Returns `AppError::Storage` if the directory, connection, or schema
/// bootstrap fails.
pub async fn connect(path: &str) -> Result<Database> {
    if path == ":memory:" {
        return connect_memory().await;
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| AppError::Storage(format!("failed to create db dir: {err}")))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Connect to a private in-memory database with the schema applied.
///
/// The pool is capped at one connection so every query sees the same
/// in-memory database.
///
/// # Errors
///
/// Returns `AppError::Storage` if the connection or schema bootstrap fails.
pub async fn connect_memory() -> Result<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
