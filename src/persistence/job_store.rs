//! Job store contract and its `SQLite` implementation.
//!
//! The job manager only relies on four primitives: point reads, upserts,
//! versioned compare-and-set, and filtered queries. Any document or
//! key-value store that offers them (plus the `(site_id, status)` and
//! `(job_type, status, created_at)` query shapes) can stand in for
//! [`SqliteJobStore`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::models::job::{CancellationState, Job, JobLock, JobStatus, JobType};
use crate::models::progress::Progress;
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_opt_ts, parse_ts, to_i64, to_u32, to_u64};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Query constraints for [`JobStore::query`]; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Restrict to one site.
    pub site_id: Option<String>,
    /// Restrict to one job type.
    pub job_type: Option<JobType>,
    /// Restrict to any of these statuses.
    pub statuses: Vec<JobStatus>,
    /// Only jobs created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Only jobs whose lease expired before this instant.
    pub lock_expired_before: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    pub limit: Option<u32>,
}

impl JobFilter {
    /// Filter on a single status.
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Filter on a site.
    #[must_use]
    pub fn for_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    /// Filter on a job type.
    #[must_use]
    pub fn of_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    /// Cap the number of rows.
    #[must_use]
    pub fn limited_to(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Persisted job collection used by the job manager.
pub trait JobStore: Send + Sync {
    /// Fetch a job by identifier.
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Job>>;

    /// Insert the job, or replace it wholesale if the id exists.
    fn upsert<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()>;

    /// Replace the stored job iff its version equals `expected_version`.
    ///
    /// On success the stored version becomes `expected_version + 1`;
    /// returns `false` when another writer got there first.
    fn compare_and_set<'a>(&'a self, job: &'a Job, expected_version: i64)
        -> StoreFuture<'a, bool>;

    /// List jobs matching `filter`, oldest first.
    fn query<'a>(&'a self, filter: &'a JobFilter) -> StoreFuture<'a, Vec<Job>>;

    /// Delete terminal jobs that finished before `cutoff`.
    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

/// `SQLite`-backed [`JobStore`].
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    site_id: String,
    project_id: Option<String>,
    requested_by: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    progress_current: i64,
    progress_total: i64,
    progress_message: Option<String>,
    cancel_requested: i64,
    cancel_requested_at: Option<String>,
    cancel_requested_by: Option<String>,
    lock_holder: Option<String>,
    lock_acquired_at: Option<String>,
    lock_expiry: Option<String>,
    pages: String,
    scripts: String,
    result: Option<String>,
    error: Option<String>,
    retry_count: i64,
    max_retries: i64,
    version: i64,
}

impl JobRow {
    /// Convert a database row into the domain model.
    fn into_job(self) -> Result<Job> {
        let lock = match (self.lock_holder, self.lock_acquired_at, self.lock_expiry) {
            (Some(holder), Some(acquired_at), Some(expiry)) => Some(JobLock {
                holder,
                acquired_at: parse_ts("lock_acquired_at", &acquired_at)?,
                expiry: parse_ts("lock_expiry", &expiry)?,
            }),
            (None, _, _) => None,
            _ => {
                return Err(AppError::Storage(format!(
                    "job {}: incomplete lock columns",
                    self.id
                )))
            }
        };

        Ok(Job {
            job_type: parse_job_type(&self.job_type)?,
            status: parse_job_status(&self.status)?,
            site_id: self.site_id,
            project_id: self.project_id,
            requested_by: self.requested_by,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            progress: Progress::new(
                to_u64("progress_current", self.progress_current)?,
                to_u64("progress_total", self.progress_total)?,
                self.progress_message,
            ),
            cancellation: CancellationState {
                requested: self.cancel_requested != 0,
                requested_at: parse_opt_ts(
                    "cancel_requested_at",
                    self.cancel_requested_at.as_deref(),
                )?,
                requested_by: self.cancel_requested_by,
            },
            lock,
            pages: serde_json::from_str(&self.pages)?,
            scripts: serde_json::from_str(&self.scripts)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
            retry_count: to_u32("retry_count", self.retry_count)?,
            max_retries: to_u32("max_retries", self.max_retries)?,
            version: self.version,
            id: self.id,
        })
    }
}

/// Column values for one job, encoded for binding.
struct EncodedJob {
    id: String,
    job_type: &'static str,
    status: &'static str,
    site_id: String,
    project_id: Option<String>,
    requested_by: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    progress_current: i64,
    progress_total: i64,
    progress_message: Option<String>,
    cancel_requested: i64,
    cancel_requested_at: Option<String>,
    cancel_requested_by: Option<String>,
    lock_holder: Option<String>,
    lock_acquired_at: Option<String>,
    lock_expiry: Option<String>,
    pages: String,
    scripts: String,
    result: Option<String>,
    error: Option<String>,
    retry_count: i64,
    max_retries: i64,
}

impl EncodedJob {
    fn encode(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            job_type: job_type_str(job.job_type),
            status: job_status_str(job.status),
            site_id: job.site_id.clone(),
            project_id: job.project_id.clone(),
            requested_by: job.requested_by.clone(),
            created_at: fmt_ts(job.created_at),
            started_at: job.started_at.map(fmt_ts),
            completed_at: job.completed_at.map(fmt_ts),
            updated_at: fmt_ts(job.updated_at),
            progress_current: to_i64(job.progress.current),
            progress_total: to_i64(job.progress.total),
            progress_message: job.progress.message.clone(),
            cancel_requested: i64::from(job.cancellation.requested),
            cancel_requested_at: job.cancellation.requested_at.map(fmt_ts),
            cancel_requested_by: job.cancellation.requested_by.clone(),
            lock_holder: job.lock.as_ref().map(|l| l.holder.clone()),
            lock_acquired_at: job.lock.as_ref().map(|l| fmt_ts(l.acquired_at)),
            lock_expiry: job.lock.as_ref().map(|l| fmt_ts(l.expiry)),
            pages: serde_json::to_string(&job.pages)?,
            scripts: serde_json::to_string(&job.scripts)?,
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            error: job.error.clone(),
            retry_count: i64::from(job.retry_count),
            max_retries: i64::from(job.max_retries),
        })
    }
}

const JOB_COLUMNS: &str = "id, job_type, status, site_id, project_id, requested_by, \
     created_at, started_at, completed_at, updated_at, progress_current, progress_total, \
     progress_message, cancel_requested, cancel_requested_at, cancel_requested_by, \
     lock_holder, lock_acquired_at, lock_expiry, pages, scripts, result, error, \
     retry_count, max_retries, version";

/// Push every column value (in `JOB_COLUMNS` order) as separated binds.
fn push_job_values<'q>(builder: &mut QueryBuilder<'q, Sqlite>, row: &'q EncodedJob, version: i64) {
    let mut values = builder.separated(", ");
    values.push_bind(row.id.as_str());
    values.push_bind(row.job_type);
    values.push_bind(row.status);
    values.push_bind(row.site_id.as_str());
    values.push_bind(row.project_id.as_deref());
    values.push_bind(row.requested_by.as_str());
    values.push_bind(row.created_at.as_str());
    values.push_bind(row.started_at.as_deref());
    values.push_bind(row.completed_at.as_deref());
    values.push_bind(row.updated_at.as_str());
    values.push_bind(row.progress_current);
    values.push_bind(row.progress_total);
    values.push_bind(row.progress_message.as_deref());
    values.push_bind(row.cancel_requested);
    values.push_bind(row.cancel_requested_at.as_deref());
    values.push_bind(row.cancel_requested_by.as_deref());
    values.push_bind(row.lock_holder.as_deref());
    values.push_bind(row.lock_acquired_at.as_deref());
    values.push_bind(row.lock_expiry.as_deref());
    values.push_bind(row.pages.as_str());
    values.push_bind(row.scripts.as_str());
    values.push_bind(row.result.as_deref());
    values.push_bind(row.error.as_deref());
    values.push_bind(row.retry_count);
    values.push_bind(row.max_retries);
    values.push_bind(version);
}

fn parse_job_type(s: &str) -> Result<JobType> {
    match s {
        "discovery" => Ok(JobType::Discovery),
        "testing" => Ok(JobType::Testing),
        "report" => Ok(JobType::Report),
        "bulk" => Ok(JobType::Bulk),
        other => Err(AppError::Storage(format!("invalid job_type: {other}"))),
    }
}

/// Stable storage name for a job type.
#[must_use]
pub fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Discovery => "discovery",
        JobType::Testing => "testing",
        JobType::Report => "report",
        JobType::Bulk => "bulk",
    }
}

fn parse_job_status(s: &str) -> Result<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "cancelling" => Ok(JobStatus::Cancelling),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(AppError::Storage(format!("invalid job status: {other}"))),
    }
}

/// Stable storage name for a job status.
#[must_use]
pub fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Cancelling => "cancelling",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

impl SqliteJobStore {
    /// Create a new store instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM job WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn write(&self, job: &Job) -> Result<()> {
        let row = EncodedJob::encode(job)?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("INSERT INTO job ({JOB_COLUMNS}) VALUES ("));
        push_job_values(&mut builder, &row, job.version);
        builder.push(
            ") ON CONFLICT(id) DO UPDATE SET \
             job_type = excluded.job_type, status = excluded.status, \
             site_id = excluded.site_id, project_id = excluded.project_id, \
             requested_by = excluded.requested_by, created_at = excluded.created_at, \
             started_at = excluded.started_at, completed_at = excluded.completed_at, \
             updated_at = excluded.updated_at, progress_current = excluded.progress_current, \
             progress_total = excluded.progress_total, progress_message = excluded.progress_message, \
             cancel_requested = excluded.cancel_requested, \
             cancel_requested_at = excluded.cancel_requested_at, \
             cancel_requested_by = excluded.cancel_requested_by, \
             lock_holder = excluded.lock_holder, lock_acquired_at = excluded.lock_acquired_at, \
             lock_expiry = excluded.lock_expiry, pages = excluded.pages, \
             scripts = excluded.scripts, result = excluded.result, error = excluded.error, \
             retry_count = excluded.retry_count, max_retries = excluded.max_retries, \
             version = excluded.version",
        );
        builder.build().execute(self.db.as_ref()).await?;
        Ok(())
    }

    async fn swap(&self, job: &Job, expected_version: i64) -> Result<bool> {
        let row = EncodedJob::encode(job)?;
        // Delete and re-insert share one transaction; the version predicate
        // on the delete is the compare.
        let mut tx = self.db.begin().await?;
        let deleted = sqlx::query("DELETE FROM job WHERE id = ?1 AND version = ?2")
            .bind(&job.id)
            .bind(expected_version)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!("INSERT INTO job ({JOB_COLUMNS}) VALUES ("));
        push_job_values(&mut builder, &row, expected_version + 1);
        builder.push(")");
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn select(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM job WHERE 1 = 1");
        if let Some(site_id) = &filter.site_id {
            builder.push(" AND site_id = ").push_bind(site_id.as_str());
        }
        if let Some(job_type) = filter.job_type {
            builder.push(" AND job_type = ").push_bind(job_type_str(job_type));
        }
        if !filter.statuses.is_empty() {
            builder.push(" AND status IN (");
            let mut statuses = builder.separated(", ");
            for status in &filter.statuses {
                statuses.push_bind(job_status_str(*status));
            }
            builder.push(")");
        }
        if let Some(created_after) = filter.created_after {
            builder
                .push(" AND created_at >= ")
                .push_bind(fmt_ts(created_after));
        }
        if let Some(cutoff) = filter.lock_expired_before {
            builder
                .push(" AND lock_expiry IS NOT NULL AND lock_expiry < ")
                .push_bind(fmt_ts(cutoff));
        }
        builder.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<JobRow> = builder
            .build_query_as::<JobRow>()
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM job WHERE status IN ('completed', 'failed', 'cancelled') \
             AND completed_at IS NOT NULL AND completed_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

impl JobStore for SqliteJobStore {
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Job>> {
        Box::pin(self.fetch(id))
    }

    fn upsert<'a>(&'a self, job: &'a Job) -> StoreFuture<'a, ()> {
        Box::pin(self.write(job))
    }

    fn compare_and_set<'a>(
        &'a self,
        job: &'a Job,
        expected_version: i64,
    ) -> StoreFuture<'a, bool> {
        Box::pin(self.swap(job, expected_version))
    }

    fn query<'a>(&'a self, filter: &'a JobFilter) -> StoreFuture<'a, Vec<Job>> {
        Box::pin(self.select(filter))
    }

    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(self.purge(cutoff))
    }
}
