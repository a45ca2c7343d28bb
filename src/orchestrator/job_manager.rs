//! Persisted job lifecycle: enqueue, leased ownership, cooperative
//! cancellation, progress, stale-lease reclamation, and statistics.
//!
//! Every mutation is a read-modify-write against the [`JobStore`] guarded
//! by the document version, so mutual exclusion holds across processes and
//! hosts without any in-process lock. Only the lease holder may change a
//! job's status, progress or result; the cancellation flag is the one field
//! any caller may set.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::job::{Job, JobLock, JobSpec, JobStatus, JobType};
use crate::models::progress::{validate_update, Progress};
use crate::persistence::job_store::{JobFilter, JobStore};
use crate::{AppError, Result};

/// Attempts before a contended compare-and-set gives up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Pending jobs inspected per `claim_next` call.
const CLAIM_SCAN_LIMIT: u32 = 32;

/// Failure reason recorded when the retry budget is exhausted.
pub const LEASE_EXPIRED_REASON: &str = "lease_expired";

/// Decision returned by a mutation closure.
enum Mutation<T> {
    /// Persist the modified job and return the value.
    Write(T),
    /// Leave the stored job untouched and return the value.
    Skip(T),
}

/// What `cleanup_stale` did with one reclaimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reclaim {
    /// Returned to `pending` for another worker.
    Requeued,
    /// Retry budget exhausted; marked failed with `lease_expired`.
    Failed,
    /// Cancellation had been requested; finished as cancelled.
    Cancelled,
}

/// Summary of one `cleanup_stale` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Jobs returned to `pending`.
    pub requeued: Vec<String>,
    /// Jobs failed with `lease_expired`.
    pub failed: Vec<String>,
    /// Jobs finished as cancelled.
    pub cancelled: Vec<String>,
}

impl CleanupReport {
    /// Total jobs reclaimed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len() + self.cancelled.len()
    }
}

/// Aggregates for one job type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    /// Jobs of this type.
    pub count: u64,
    /// Counts per status.
    pub by_status: BTreeMap<JobStatus, u64>,
    /// Mean start-to-finish time of terminal jobs.
    pub avg_run_ms: Option<u64>,
    /// Longest start-to-finish time of terminal jobs.
    pub max_run_ms: Option<u64>,
}

/// Aggregates returned by [`JobManager::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Jobs matched by the filter.
    pub total: u64,
    /// Counts per status across all types.
    pub by_status: BTreeMap<JobStatus, u64>,
    /// Per-type breakdown.
    pub by_type: BTreeMap<JobType, TypeStats>,
    /// Non-terminal jobs with a cancellation request outstanding.
    pub pending_cancellations: u64,
}

/// Job lifecycle manager backed by a shared [`JobStore`].
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    default_max_retries: u32,
}

impl JobManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, default_max_retries: u32) -> Self {
        Self {
            store,
            default_max_retries,
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and persist a new pending job.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a malformed spec (nothing is
    /// persisted), or `AppError::Storage` if the insert fails.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<String> {
        let span = info_span!("enqueue", site_id = %spec.site_id, job_type = ?spec.job_type);

        async move {
            if let Err(err) = spec.validate() {
                warn!(%err, "job spec rejected");
                return Err(err);
            }

            let job = Job::from_spec(spec, self.default_max_retries);
            self.store.upsert(&job).await?;

            info!(
                job_id = %job.id,
                pages = job.pages.len(),
                scripts = job.scripts.len(),
                "job enqueued"
            );
            Ok(job.id)
        }
        .instrument(span)
        .await
    }

    /// Fetch a job.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the job does not exist.
    pub async fn get(&self, job_id: &str) -> Result<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))
    }

    /// List jobs matching a filter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the query fails.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.query(filter).await
    }

    /// Try to take the lease on a pending job.
    ///
    /// Succeeds only if the job is pending, no live lease exists, and no
    /// other job of the same site is running or cancelling; a running job
    /// whose lease lapsed must first be reclaimed by
    /// [`cleanup_stale`](Self::cleanup_stale). Re-acquiring a lease the
    /// caller already holds returns `true` without extending it.
    ///
    /// The site is checked again once the lease is written. If a rival job
    /// of the same site got leased in between, this job goes back to
    /// `pending` with its retry budget untouched and `false` is returned.
    /// Two racing callers may both back off; neither ever runs alongside
    /// the other.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::Storage`, or
    /// `AppError::LockContention` if the compare-and-set kept losing.
    pub async fn acquire_lock(&self, job_id: &str, holder: &str, lease: Duration) -> Result<bool> {
        let span = info_span!("acquire_lock", job_id, holder);

        async move {
            let site_id = self.get(job_id).await?.site_id;
            if self.site_busy(&site_id, job_id).await? {
                debug!(%site_id, "site busy; lock not available");
                return Ok(false);
            }

            let mut prior_start = None;
            let (job, (acquired, fresh)) = self
                .mutate(job_id, |job, now| {
                    if job.is_held_by(holder, now) {
                        return Ok(Mutation::Skip((true, false)));
                    }
                    if job.status != JobStatus::Pending
                        || job.lock.as_ref().is_some_and(|lock| !lock.is_expired(now))
                    {
                        return Ok(Mutation::Skip((false, false)));
                    }
                    prior_start = job.started_at;
                    job.transition_to(JobStatus::Running, now)?;
                    job.lock = Some(JobLock {
                        holder: holder.to_owned(),
                        acquired_at: now,
                        expiry: now + lease,
                    });
                    Ok(Mutation::Write((true, true)))
                })
                .await?;

            if fresh && self.site_busy(&site_id, job_id).await? {
                self.yield_site(job_id, holder, prior_start).await?;
                info!(%site_id, "same-site job leased concurrently; lock released");
                return Ok(false);
            }

            if acquired {
                info!(status = ?job.status, "lock acquired");
            } else {
                debug!(status = ?job.status, "lock not available");
            }
            Ok(acquired)
        }
        .instrument(span)
        .await
    }

    /// Whether a job of `site_id` other than `except` is running or
    /// cancelling.
    async fn site_busy(&self, site_id: &str, except: &str) -> Result<bool> {
        let leased = JobFilter::default()
            .for_site(site_id)
            .with_status(JobStatus::Running)
            .with_status(JobStatus::Cancelling)
            .limited_to(2);
        Ok(self
            .store
            .query(&leased)
            .await?
            .iter()
            .any(|job| job.id != except))
    }

    /// Undo a lease just taken by `holder`: back to `pending` with the
    /// original start time. The retry count is not touched.
    async fn yield_site(
        &self,
        job_id: &str,
        holder: &str,
        prior_start: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.mutate(job_id, |job, now| {
            if job.status != JobStatus::Running || !job.is_held_by(holder, now) {
                return Ok(Mutation::Skip(()));
            }
            job.transition_to(JobStatus::Pending, now)?;
            job.started_at = prior_start;
            Ok(Mutation::Write(()))
        })
        .await?;
        Ok(())
    }

    /// Extend the caller's lease by `lease` from now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LeaseExpired` if the caller's lease already
    /// lapsed, `AppError::NotLockHolder` if someone else holds the job (or
    /// it is terminal), or storage/contention errors.
    pub async fn renew_lock(&self, job_id: &str, holder: &str, lease: Duration) -> Result<JobLock> {
        let (_, lock) = self
            .mutate(job_id, |job, now| {
                if job.is_terminal() {
                    return Err(AppError::NotLockHolder(format!(
                        "job {} is already {:?}",
                        job.id, job.status
                    )));
                }
                job.ensure_holder(holder, now)?;
                let lock = job.lock.as_mut().ok_or_else(|| {
                    AppError::NotLockHolder(format!("job {} has no active lease", job.id))
                })?;
                lock.expiry = now + lease;
                Ok(Mutation::Write(lock.clone()))
            })
            .await?;

        debug!(job_id, holder, expiry = %lock.expiry, "lease renewed");
        Ok(lock)
    }

    /// Record progress; `current` never moves backwards.
    ///
    /// A terminal job is left untouched and its stored progress returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an inconsistent update,
    /// `AppError::NotLockHolder`/`AppError::LeaseExpired` if the caller
    /// does not hold a live lease, or storage/contention errors.
    pub async fn update_progress(
        &self,
        job_id: &str,
        holder: &str,
        progress: Progress,
    ) -> Result<Progress> {
        validate_update(&progress)?;

        let (_, merged) = self
            .mutate(job_id, |job, now| {
                if job.is_terminal() {
                    return Ok(Mutation::Skip(job.progress.clone()));
                }
                job.ensure_holder(holder, now)?;
                let merged = job.progress.advanced_by(&progress);
                if merged == job.progress {
                    return Ok(Mutation::Skip(merged));
                }
                if merged.current != progress.current {
                    warn!(
                        job_id = %job.id,
                        stored = job.progress.current,
                        offered = progress.current,
                        "ignoring backwards progress"
                    );
                }
                job.progress = merged.clone();
                Ok(Mutation::Write(merged))
            })
            .await?;

        debug!(job_id, current = merged.current, total = merged.total, "progress updated");
        Ok(merged)
    }

    /// Ask for a job to stop. Works without holding the lease.
    ///
    /// A pending job is cancelled on the spot; a running job keeps running
    /// until its holder observes the flag at the next page boundary.
    /// Returns `false` (never an error) if the job is already terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or storage/contention errors.
    pub async fn request_cancellation(&self, job_id: &str, requester: &str) -> Result<bool> {
        let span = info_span!("request_cancellation", job_id, requester);

        async move {
            let (job, accepted) = self
                .mutate(job_id, |job, now| {
                    if job.is_terminal() {
                        return Ok(Mutation::Skip(false));
                    }
                    if job.cancellation.requested {
                        return Ok(Mutation::Skip(true));
                    }
                    job.cancellation.requested = true;
                    job.cancellation.requested_at = Some(now);
                    job.cancellation.requested_by = Some(requester.to_owned());
                    if job.status == JobStatus::Pending {
                        job.transition_to(JobStatus::Cancelled, now)?;
                    }
                    Ok(Mutation::Write(true))
                })
                .await?;

            if accepted {
                info!(status = ?job.status, "cancellation requested");
            } else {
                debug!(status = ?job.status, "cancellation ignored for terminal job");
            }
            Ok(accepted)
        }
        .instrument(span)
        .await
    }

    /// Read the cancellation flag; used by the holder at page boundaries.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Storage`.
    pub async fn poll_cancellation(&self, job_id: &str) -> Result<bool> {
        Ok(self.get(job_id).await?.cancellation.requested)
    }

    /// Move a running job to `cancelling` once its holder has seen the flag.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotLockHolder`/`AppError::LeaseExpired` if the
    /// caller does not hold a live lease, or storage/contention errors.
    pub async fn begin_cancelling(&self, job_id: &str, holder: &str) -> Result<Job> {
        let (job, ()) = self
            .mutate(job_id, |job, now| {
                if job.status != JobStatus::Running {
                    return Ok(Mutation::Skip(()));
                }
                job.ensure_holder(holder, now)?;
                job.transition_to(JobStatus::Cancelling, now)?;
                Ok(Mutation::Write(()))
            })
            .await?;

        info!(job_id, status = ?job.status, "cancelling");
        Ok(job)
    }

    /// Finish a job successfully. No-op on a terminal job.
    ///
    /// # Errors
    ///
    /// Returns holder, transition, or storage errors.
    pub async fn complete(&self, job_id: &str, holder: &str, result: serde_json::Value) -> Result<Job> {
        self.finish(job_id, holder, JobStatus::Completed, Some(result), None)
            .await
    }

    /// Finish a job as failed. No-op on a terminal job.
    ///
    /// # Errors
    ///
    /// Returns holder, transition, or storage errors.
    pub async fn fail(
        &self,
        job_id: &str,
        holder: &str,
        error: impl Into<String>,
        partial: Option<serde_json::Value>,
    ) -> Result<Job> {
        self.finish(job_id, holder, JobStatus::Failed, partial, Some(error.into()))
            .await
    }

    /// Finish a job as cancelled, keeping any partial result. No-op on a
    /// terminal job.
    ///
    /// # Errors
    ///
    /// Returns holder, transition, or storage errors.
    pub async fn cancel(
        &self,
        job_id: &str,
        holder: &str,
        partial: Option<serde_json::Value>,
    ) -> Result<Job> {
        self.finish(job_id, holder, JobStatus::Cancelled, partial, None)
            .await
    }

    async fn finish(
        &self,
        job_id: &str,
        holder: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Job> {
        let span = info_span!("finish_job", job_id, holder, status = ?status);

        async move {
            let (job, changed) = self
                .mutate(job_id, |job, now| {
                    if job.is_terminal() {
                        return Ok(Mutation::Skip(false));
                    }
                    job.ensure_holder(holder, now)?;
                    job.transition_to(status, now)?;
                    job.result.clone_from(&result);
                    job.error.clone_from(&error);
                    Ok(Mutation::Write(true))
                })
                .await?;

            if changed {
                info!(error = ?job.error, "job finished");
            } else {
                debug!(status = ?job.status, "job already terminal");
            }
            Ok(job)
        }
        .instrument(span)
        .await
    }

    /// Reclaim jobs whose lease lapsed before `now`.
    ///
    /// Jobs with retry budget left go back to `pending`; the rest fail with
    /// [`LEASE_EXPIRED_REASON`]. A job whose cancellation was requested is
    /// finished as cancelled instead. A job the sweep loses a race on is
    /// skipped and picked up by the next sweep.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the store fails.
    pub async fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let span = info_span!("cleanup_stale");

        async move {
            let filter = JobFilter {
                statuses: vec![JobStatus::Running, JobStatus::Cancelling],
                lock_expired_before: Some(now),
                ..JobFilter::default()
            };
            let stale = self.store.query(&filter).await?;
            let mut report = CleanupReport::default();

            for candidate in stale {
                let outcome = self
                    .mutate(&candidate.id, |job, _| {
                        let expired = job.lock.as_ref().is_some_and(|lock| lock.is_expired(now));
                        if !job.status.is_leased() || !expired {
                            return Ok(Mutation::Skip(None));
                        }
                        let reclaim = if job.cancellation.requested
                            || job.status == JobStatus::Cancelling
                        {
                            job.transition_to(JobStatus::Cancelled, now)?;
                            Reclaim::Cancelled
                        } else if job.retry_count < job.max_retries {
                            job.transition_to(JobStatus::Pending, now)?;
                            job.retry_count += 1;
                            Reclaim::Requeued
                        } else {
                            job.transition_to(JobStatus::Failed, now)?;
                            job.error = Some(LEASE_EXPIRED_REASON.to_owned());
                            Reclaim::Failed
                        };
                        Ok(Mutation::Write(Some(reclaim)))
                    })
                    .await;

                match outcome {
                    Ok((job, Some(reclaim))) => {
                        warn!(job_id = %job.id, retry_count = job.retry_count, ?reclaim, "lease reclaimed");
                        match reclaim {
                            Reclaim::Requeued => report.requeued.push(job.id),
                            Reclaim::Failed => report.failed.push(job.id),
                            Reclaim::Cancelled => report.cancelled.push(job.id),
                        }
                    }
                    Ok((_, None)) | Err(AppError::NotFound(_)) => {}
                    Err(AppError::LockContention(msg)) => {
                        debug!(job_id = %candidate.id, %msg, "reclaim contended; retry next sweep");
                    }
                    Err(err) => return Err(err),
                }
            }

            if report.total() > 0 {
                info!(
                    requeued = report.requeued.len(),
                    failed = report.failed.len(),
                    cancelled = report.cancelled.len(),
                    "stale leases reclaimed"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Claim the oldest pending job this holder can lease.
    ///
    /// Jobs for a site that already has a running job are passed over by
    /// [`acquire_lock`](Self::acquire_lock), so runs of the same site
    /// serialize.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the store fails.
    pub async fn claim_next(
        &self,
        holder: &str,
        lease: Duration,
        job_type: Option<JobType>,
    ) -> Result<Option<Job>> {
        let filter = JobFilter {
            job_type,
            statuses: vec![JobStatus::Pending],
            limit: Some(CLAIM_SCAN_LIMIT),
            ..JobFilter::default()
        };

        for candidate in self.store.query(&filter).await? {
            match self.acquire_lock(&candidate.id, holder, lease).await {
                Ok(true) => return self.get(&candidate.id).await.map(Some),
                Ok(false) | Err(AppError::LockContention(_) | AppError::NotFound(_)) => {
                    debug!(job_id = %candidate.id, site_id = %candidate.site_id, "candidate skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Counts and run times by type and status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the query fails.
    pub async fn stats(&self, filter: &JobFilter) -> Result<JobStats> {
        let jobs = self.store.query(filter).await?;
        let mut stats = JobStats::default();
        let mut run_times: BTreeMap<JobType, Vec<u64>> = BTreeMap::new();

        for job in &jobs {
            stats.total += 1;
            *stats.by_status.entry(job.status).or_default() += 1;
            if job.cancellation.requested && !job.is_terminal() {
                stats.pending_cancellations += 1;
            }

            let per_type = stats.by_type.entry(job.job_type).or_default();
            per_type.count += 1;
            *per_type.by_status.entry(job.status).or_default() += 1;

            if let Some(ms) = job
                .run_duration()
                .and_then(|d| u64::try_from(d.num_milliseconds()).ok())
            {
                run_times.entry(job.job_type).or_default().push(ms);
            }
        }

        for (job_type, times) in run_times {
            if let Some(per_type) = stats.by_type.get_mut(&job_type) {
                let count = times.len() as u64;
                per_type.avg_run_ms = Some(times.iter().sum::<u64>() / count.max(1));
                per_type.max_run_ms = times.iter().copied().max();
            }
        }

        Ok(stats)
    }

    /// Read-modify-write loop with optimistic concurrency.
    ///
    /// `apply` must leave the job untouched when it returns
    /// [`Mutation::Skip`].
    async fn mutate<T, F>(&self, job_id: &str, mut apply: F) -> Result<(Job, T)>
    where
        F: FnMut(&mut Job, DateTime<Utc>) -> Result<Mutation<T>> + Send,
        T: Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut job = self.get(job_id).await?;
            let expected = job.version;
            let now = Utc::now();

            match apply(&mut job, now)? {
                Mutation::Skip(value) => return Ok((job, value)),
                Mutation::Write(value) => {
                    job.updated_at = now;
                    if self.store.compare_and_set(&job, expected).await? {
                        job.version = expected + 1;
                        return Ok((job, value));
                    }
                    debug!(job_id, attempt, "compare-and-set lost; re-reading");
                }
            }
        }

        Err(AppError::LockContention(format!(
            "job {job_id}: {MAX_CAS_ATTEMPTS} conflicting writes in a row"
        )))
    }
}
