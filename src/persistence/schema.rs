//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so this is
//! safe to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Storage` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS job (
    id                  TEXT PRIMARY KEY NOT NULL,
    job_type            TEXT NOT NULL CHECK(job_type IN ('discovery','testing','report','bulk')),
    status              TEXT NOT NULL CHECK(status IN ('pending','running','cancelling','completed','failed','cancelled')),
    site_id             TEXT NOT NULL,
    project_id          TEXT,
    requested_by        TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT,
    updated_at          TEXT NOT NULL,
    progress_current    INTEGER NOT NULL DEFAULT 0,
    progress_total      INTEGER NOT NULL DEFAULT 0,
    progress_message    TEXT,
    cancel_requested    INTEGER NOT NULL DEFAULT 0,
    cancel_requested_at TEXT,
    cancel_requested_by TEXT,
    lock_holder         TEXT,
    lock_acquired_at    TEXT,
    lock_expiry         TEXT,
    pages               TEXT NOT NULL,
    scripts             TEXT NOT NULL,
    result              TEXT,
    error               TEXT,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    max_retries         INTEGER NOT NULL DEFAULT 0,
    version             INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS execution_session (
    id              TEXT PRIMARY KEY NOT NULL,
    site_id         TEXT NOT NULL,
    job_id          TEXT,
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    page_sequences  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executed_script (
    session_id      TEXT NOT NULL,
    script_id       TEXT NOT NULL,
    page_id         TEXT NOT NULL,
    executed_at     TEXT NOT NULL,
    success         INTEGER NOT NULL,
    duration_ms     INTEGER NOT NULL,
    PRIMARY KEY (session_id, script_id, page_id)
);

CREATE TABLE IF NOT EXISTS condition_check (
    session_id          TEXT NOT NULL,
    script_id           TEXT NOT NULL,
    page_id             TEXT NOT NULL,
    checked_at          TEXT NOT NULL,
    condition_met       INTEGER NOT NULL,
    violation_reported  INTEGER NOT NULL,
    PRIMARY KEY (session_id, script_id, page_id)
);

CREATE INDEX IF NOT EXISTS idx_job_site_status ON job(site_id, status);
CREATE INDEX IF NOT EXISTS idx_job_type_status_created ON job(job_type, status, created_at);
CREATE INDEX IF NOT EXISTS idx_job_lock_expiry ON job(lock_expiry);
CREATE INDEX IF NOT EXISTS idx_session_site ON execution_session(site_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
