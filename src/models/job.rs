//! Job model, lifecycle state machine, and enqueue specification.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::page::PageContext;
use super::progress::Progress;
use super::script::ScriptDefinition;
use crate::{AppError, Result};

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Crawl a site to discover pages.
    Discovery,
    /// Run multi-state tests across listed pages.
    Testing,
    /// Build a report from stored results.
    Report,
    /// Testing across a large page set.
    Bulk,
}

impl JobType {
    /// Whether jobs of this type must list pages at enqueue.
    #[must_use]
    pub fn requires_pages(self) -> bool {
        matches!(self, Self::Testing | Self::Bulk)
    }
}

/// Lifecycle status for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker to acquire the lease.
    Pending,
    /// Owned by a lease holder and executing.
    Running,
    /// Holder observed a cancellation request and is flushing results.
    Cancelling,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or exhausted its retry budget.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl JobStatus {
    /// Terminal states are absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a lease holder is expected in this state.
    #[must_use]
    pub fn is_leased(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Completed
                        | Self::Failed
                        | Self::Cancelled
                        | Self::Cancelling
                        | Self::Pending
                )
                | (Self::Cancelling, Self::Cancelled | Self::Failed)
        )
    }
}

/// Cooperative cancellation flag; the only field writable without the lease.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CancellationState {
    /// Whether cancellation has been requested.
    pub requested: bool,
    /// When the first request arrived.
    pub requested_at: Option<DateTime<Utc>>,
    /// Who asked for it.
    pub requested_by: Option<String>,
}

/// Time-bounded exclusive claim on a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobLock {
    /// Worker identity holding the lease.
    pub holder: String,
    /// When the lease was first acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expiry: DateTime<Utc>,
}

impl JobLock {
    /// Returns true if the lease has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

/// Enqueue request for a new job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobSpec {
    /// Kind of work.
    pub job_type: JobType,
    /// Site the job runs against.
    pub site_id: String,
    /// Optional owning project.
    #[serde(default)]
    pub project_id: Option<String>,
    /// User or session that submitted the job.
    pub requested_by: String,
    /// Pages to visit, in order.
    #[serde(default)]
    pub pages: Vec<PageContext>,
    /// Page-state scripts evaluated on every page.
    #[serde(default)]
    pub scripts: Vec<ScriptDefinition>,
    /// Requeue budget override.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    /// Validate the specification, including every script it carries.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.site_id.trim().is_empty() {
            return Err(AppError::Validation("site_id must not be empty".into()));
        }
        if self.requested_by.trim().is_empty() {
            return Err(AppError::Validation("requested_by must not be empty".into()));
        }
        if self.job_type.requires_pages() && self.pages.is_empty() {
            return Err(AppError::Validation(format!(
                "{:?} jobs require at least one page",
                self.job_type
            )));
        }

        let mut page_ids = HashSet::new();
        for page in &self.pages {
            if page.id.trim().is_empty() || page.url.trim().is_empty() {
                return Err(AppError::Validation(
                    "pages require a non-empty id and url".into(),
                ));
            }
            if !page_ids.insert(page.id.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate page id {}",
                    page.id
                )));
            }
        }

        let mut script_ids = HashSet::new();
        for script in &self.scripts {
            script.validate()?;
            if !script_ids.insert(script.id.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate script id {}",
                    script.id
                )));
            }
        }

        Ok(())
    }
}

/// Persisted unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// Unique record identifier.
    pub id: String,
    /// Kind of work.
    pub job_type: JobType,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Site the job runs against.
    pub site_id: String,
    /// Optional owning project.
    pub project_id: Option<String>,
    /// User or session that submitted the job.
    pub requested_by: String,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
    /// First acquisition timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
    /// Work done so far.
    pub progress: Progress,
    /// Cooperative cancellation flag.
    pub cancellation: CancellationState,
    /// Current lease, present only while running or cancelling.
    pub lock: Option<JobLock>,
    /// Pages to visit, in order.
    pub pages: Vec<PageContext>,
    /// Scripts evaluated on each page.
    pub scripts: Vec<ScriptDefinition>,
    /// Result document written on completion or cancellation.
    pub result: Option<serde_json::Value>,
    /// Failure reason for failed jobs.
    pub error: Option<String>,
    /// How often the job was requeued after a lease expired.
    pub retry_count: u32,
    /// Requeue budget.
    pub max_retries: u32,
    /// Optimistic concurrency version, bumped on every stored write.
    pub version: i64,
}

impl Job {
    /// Construct a pending job from a validated spec.
    #[must_use]
    pub fn from_spec(spec: JobSpec, default_max_retries: u32) -> Self {
        let now = Utc::now();
        let total = spec.pages.len() as u64;
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: spec.job_type,
            status: JobStatus::Pending,
            site_id: spec.site_id,
            project_id: spec.project_id,
            requested_by: spec.requested_by,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            progress: Progress::new(0, total, None),
            cancellation: CancellationState::default(),
            lock: None,
            pages: spec.pages,
            scripts: spec.scripts,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            version: 0,
        }
    }

    /// Whether the job reached an absorbing state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `holder` owns an unexpired lease on this job.
    #[must_use]
    pub fn is_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| lock.holder == holder && !lock.is_expired(now))
    }

    /// Enforce single-owner mutation: `Ok(())` only for the live lease holder.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LeaseExpired` if `holder` owned a lease that lapsed,
    /// or `AppError::NotLockHolder` if someone else (or nobody) holds it.
    pub fn ensure_holder(&self, holder: &str, now: DateTime<Utc>) -> Result<()> {
        match &self.lock {
            Some(lock) if lock.holder == holder && lock.is_expired(now) => {
                Err(AppError::LeaseExpired(format!(
                    "job {} lease held by {holder} expired at {}",
                    self.id, lock.expiry
                )))
            }
            Some(lock) if lock.holder == holder => Ok(()),
            Some(lock) => Err(AppError::NotLockHolder(format!(
                "job {} is leased by {}, not {holder}",
                self.id, lock.holder
            ))),
            None => Err(AppError::NotLockHolder(format!(
                "job {} has no active lease",
                self.id
            ))),
        }
    }

    /// Apply a status transition, stamping timestamps and dropping the lease
    /// when leaving a leased state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the transition is not permitted.
    pub fn transition_to(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "job {}: invalid status transition {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if !next.is_leased() {
            self.lock = None;
        }
        Ok(())
    }

    /// Duration from start to terminal transition, if both are known.
    #[must_use]
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}
