//! Execution session repository for `SQLite` persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{ConditionCheck, ExecutedScriptRecord, ExecutionSession};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_opt_ts, parse_ts, to_i64, to_u64};

/// Repository wrapper around `SQLite` for execution sessions and their
/// per-(script, page) child records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    site_id: String,
    job_id: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    page_sequences: String,
}

#[derive(sqlx::FromRow)]
struct ExecutedRow {
    script_id: String,
    page_id: String,
    executed_at: String,
    success: i64,
    duration_ms: i64,
}

impl ExecutedRow {
    fn into_record(self) -> Result<ExecutedScriptRecord> {
        Ok(ExecutedScriptRecord {
            executed_at: parse_ts("executed_at", &self.executed_at)?,
            success: self.success != 0,
            duration_ms: to_u64("duration_ms", self.duration_ms)?,
            script_id: self.script_id,
            page_id: self.page_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckRow {
    script_id: String,
    page_id: String,
    checked_at: String,
    condition_met: i64,
    violation_reported: i64,
}

impl CheckRow {
    fn into_check(self) -> Result<ConditionCheck> {
        Ok(ConditionCheck {
            checked_at: parse_ts("checked_at", &self.checked_at)?,
            condition_met: self.condition_met != 0,
            violation_reported: self.violation_reported != 0,
            script_id: self.script_id,
            page_id: self.page_id,
        })
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record together with any child records.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the database insert fails.
    pub async fn create(&self, session: &ExecutionSession) -> Result<ExecutionSession> {
        let page_sequences = serde_json::to_string(&session.page_sequences)?;

        sqlx::query(
            "INSERT INTO execution_session (id, site_id, job_id, started_at, ended_at, page_sequences)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&session.id)
        .bind(&session.site_id)
        .bind(&session.job_id)
        .bind(fmt_ts(session.started_at))
        .bind(session.ended_at.map(fmt_ts))
        .bind(&page_sequences)
        .execute(self.db.as_ref())
        .await?;

        for record in &session.executed_scripts {
            self.upsert_executed(&session.id, record).await?;
        }
        for check in &session.condition_checks {
            self.upsert_check(&session.id, check).await?;
        }

        Ok(session.clone())
    }

    /// Retrieve a session by identifier, including its child records.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the query fails or a row is malformed.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ExecutionSession>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM execution_session WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let executed: Vec<ExecutedRow> = sqlx::query_as(
            "SELECT script_id, page_id, executed_at, success, duration_ms \
             FROM executed_script WHERE session_id = ?1 ORDER BY rowid ASC",
        )
        .bind(id)
        .fetch_all(self.db.as_ref())
        .await?;

        let checks: Vec<CheckRow> = sqlx::query_as(
            "SELECT script_id, page_id, checked_at, condition_met, violation_reported \
             FROM condition_check WHERE session_id = ?1 ORDER BY rowid ASC",
        )
        .bind(id)
        .fetch_all(self.db.as_ref())
        .await?;

        let page_sequences: BTreeMap<String, u32> = serde_json::from_str(&row.page_sequences)?;

        Ok(Some(ExecutionSession {
            started_at: parse_ts("started_at", &row.started_at)?,
            ended_at: parse_opt_ts("ended_at", row.ended_at.as_deref())?,
            executed_scripts: executed
                .into_iter()
                .map(ExecutedRow::into_record)
                .collect::<Result<_>>()?,
            condition_checks: checks
                .into_iter()
                .map(CheckRow::into_check)
                .collect::<Result<_>>()?,
            page_sequences,
            id: row.id,
            site_id: row.site_id,
            job_id: row.job_id,
        }))
    }

    /// Insert or overwrite the executed-script record for its
    /// (session, script, page) key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the upsert fails.
    pub async fn upsert_executed(
        &self,
        session_id: &str,
        record: &ExecutedScriptRecord,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO executed_script (session_id, script_id, page_id, executed_at, success, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id, script_id, page_id) DO UPDATE SET
                executed_at = excluded.executed_at,
                success = excluded.success,
                duration_ms = excluded.duration_ms",
        )
        .bind(session_id)
        .bind(&record.script_id)
        .bind(&record.page_id)
        .bind(fmt_ts(record.executed_at))
        .bind(i64::from(record.success))
        .bind(to_i64(record.duration_ms))
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Insert or overwrite the condition check for its
    /// (session, script, page) key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the upsert fails.
    pub async fn upsert_check(&self, session_id: &str, check: &ConditionCheck) -> Result<()> {
        sqlx::query(
            "INSERT INTO condition_check (session_id, script_id, page_id, checked_at, condition_met, violation_reported)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id, script_id, page_id) DO UPDATE SET
                checked_at = excluded.checked_at,
                condition_met = excluded.condition_met,
                violation_reported = excluded.violation_reported",
        )
        .bind(session_id)
        .bind(&check.script_id)
        .bind(&check.page_id)
        .bind(fmt_ts(check.checked_at))
        .bind(i64::from(check.condition_met))
        .bind(i64::from(check.violation_reported))
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Persist the per-page sequence counters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the update fails.
    pub async fn update_page_sequences(
        &self,
        session_id: &str,
        page_sequences: &BTreeMap<String, u32>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(page_sequences)?;
        sqlx::query("UPDATE execution_session SET page_sequences = ?1 WHERE id = ?2")
            .bind(&encoded)
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Close a session, setting `ended_at` only if it is still open.
    ///
    /// Returns the stored session; closing twice leaves the first
    /// `ended_at` untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Storage` if the update fails.
    pub async fn close(&self, id: &str, ended_at: DateTime<Utc>) -> Result<ExecutionSession> {
        sqlx::query("UPDATE execution_session SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL")
            .bind(fmt_ts(ended_at))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// List identifiers of open sessions for a site.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the query fails.
    pub async fn list_open_for_site(&self, site_id: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM execution_session WHERE site_id = ?1 AND ended_at IS NULL \
             ORDER BY started_at ASC",
        )
        .bind(site_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Delete closed sessions (children first) that ended before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if any delete fails.
    pub async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = fmt_ts(cutoff);
        let mut tx = self.db.begin().await?;

        for table in ["executed_script", "condition_check"] {
            // `table` comes from the literal array above.
            let query = format!(
                "DELETE FROM {table} WHERE session_id IN \
                 (SELECT id FROM execution_session WHERE ended_at IS NOT NULL AND ended_at < ?1)"
            );
            sqlx::query(&query).bind(&cutoff).execute(&mut *tx).await?;
        }

        let deleted = sqlx::query(
            "DELETE FROM execution_session WHERE ended_at IS NOT NULL AND ended_at < ?1",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }
}
