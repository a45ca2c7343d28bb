//! Reference job worker: owns one leased job end to end.
//!
//! Cancellation is checked only at page boundaries, so a cancellation
//! request takes effect after at most one page's remaining work. Results
//! produced before the stop are flushed into the job. The lease is renewed
//! on a heartbeat of a third of its length while a page loads and runs, so
//! a page may take longer than one lease.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::driver::Browser;
use crate::models::job::{Job, JobType};
use crate::models::progress::Progress;
use crate::models::session::{ConditionCheck, ExecutionSession};
use crate::models::test_result::{PageReport, StepFailure};
use crate::{AppError, Result};

use super::job_manager::JobManager;
use super::session_manager::SessionManager;
use super::state_runner::StateRunner;

/// A script that ran and failed on a page.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScriptFailure {
    /// Page the script ran on.
    pub page_id: String,
    /// Script that failed.
    pub script_id: String,
    /// The aborting step, if one was recorded.
    pub failure: Option<StepFailure>,
}

/// A page the step backend could not open.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnreachablePage {
    /// Page that failed to load.
    pub page_id: String,
    /// Backend error.
    pub error: String,
}

/// Aggregate written as the job result (or partial result).
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunSummary {
    /// Job the run belongs to.
    pub job_id: String,
    /// Session the run recorded into.
    pub session_id: String,
    /// Pages listed by the job.
    pub pages_total: usize,
    /// Pages fully tested before the run stopped.
    pub pages_tested: usize,
    /// Test snapshots captured.
    pub results: usize,
    /// Scripts that failed, in page order.
    pub failures: Vec<ScriptFailure>,
    /// Violations detected, in page order.
    pub violations: Vec<ConditionCheck>,
    /// Pages skipped because they could not be opened.
    pub unreachable: Vec<UnreachablePage>,
}

impl RunSummary {
    fn new(job: &Job, session: &ExecutionSession) -> Self {
        Self {
            job_id: job.id.clone(),
            session_id: session.id.clone(),
            pages_total: job.pages.len(),
            ..Self::default()
        }
    }

    fn absorb(&mut self, report: &PageReport) {
        self.pages_tested += 1;
        self.results += report.results.len();
        self.failures
            .extend(report.failures().map(|outcome| ScriptFailure {
                page_id: report.page_id.clone(),
                script_id: outcome.script_id.clone(),
                failure: outcome.failure.clone(),
            }));
        self.violations.extend(report.violations.iter().cloned());
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The job was leased by someone else or was not pending.
    NotAcquired,
    /// Every page was processed and the job completed.
    Completed(RunSummary),
    /// A cancellation request was honoured at a page boundary.
    Cancelled(RunSummary),
    /// The lease lapsed mid-run; the job is left to the stale sweeper.
    LeaseLost(RunSummary),
}

/// Shortest interval between heartbeat renewals.
const MIN_HEARTBEAT: std::time::Duration = std::time::Duration::from_millis(50);

enum Finish {
    Completed,
    Cancelled,
}

/// Runs jobs under a lease, one at a time.
pub struct JobWorker {
    jobs: Arc<JobManager>,
    runner: StateRunner,
    worker_id: String,
    lease: Duration,
}

impl JobWorker {
    /// Create a worker identified by `worker_id` taking leases of `lease`.
    #[must_use]
    pub fn new(
        jobs: Arc<JobManager>,
        runner: StateRunner,
        worker_id: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            jobs,
            runner,
            worker_id: worker_id.into(),
            lease,
        }
    }

    /// Create a worker with the identity, lease length and default step
    /// timeout from `config`.
    #[must_use]
    pub fn from_config(
        jobs: Arc<JobManager>,
        sessions: SessionManager,
        config: &GlobalConfig,
    ) -> Self {
        Self::new(
            jobs,
            StateRunner::new(sessions, config.default_step_timeout()),
            config.worker_id.clone(),
            config.lease_duration(),
        )
    }

    /// Length of the leases this worker takes.
    #[must_use]
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Identifier used as the lease holder.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn sessions(&self) -> &SessionManager {
        self.runner.sessions()
    }

    /// Lease `job_id` and run it to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown job, or storage errors.
    /// On a storage error mid-run the session is closed and the job is left
    /// leased for the stale sweeper.
    pub async fn run(&self, job_id: &str, browser: &Browser) -> Result<RunOutcome> {
        if !self
            .jobs
            .acquire_lock(job_id, &self.worker_id, self.lease)
            .await?
        {
            info!(job_id, worker_id = %self.worker_id, "job not acquired");
            return Ok(RunOutcome::NotAcquired);
        }
        let job = self.jobs.get(job_id).await?;
        self.execute(job, browser).await
    }

    /// Claim the oldest pending job (optionally of one type) and run it.
    /// Returns `None` when nothing is claimable.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn run_next(
        &self,
        job_type: Option<JobType>,
        browser: &Browser,
    ) -> Result<Option<RunOutcome>> {
        let Some(job) = self
            .jobs
            .claim_next(&self.worker_id, self.lease, job_type)
            .await?
        else {
            return Ok(None);
        };
        self.execute(job, browser).await.map(Some)
    }

    async fn execute(&self, job: Job, browser: &Browser) -> Result<RunOutcome> {
        let span = info_span!("run_job", job_id = %job.id, site_id = %job.site_id, worker_id = %self.worker_id);

        async move {
            let mut session = self
                .sessions()
                .start_session(&job.site_id, Some(&job.id))
                .await?;
            let mut summary = RunSummary::new(&job, &session);

            let driven = self.drive(&job, &mut session, &mut summary, browser).await;

            let closed = self.sessions().end_session(&session.id).await;
            if let Err(err) = &closed {
                warn!(session_id = %session.id, %err, "failed to close session");
            }

            let outcome = match driven {
                Ok(Finish::Completed) => RunOutcome::Completed(summary),
                Ok(Finish::Cancelled) => RunOutcome::Cancelled(summary),
                Err(AppError::LeaseExpired(reason) | AppError::NotLockHolder(reason)) => {
                    warn!(%reason, pages_tested = summary.pages_tested, "lease lost; abandoning run");
                    RunOutcome::LeaseLost(summary)
                }
                Err(err) => return Err(err),
            };
            closed?;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        job: &Job,
        session: &mut ExecutionSession,
        summary: &mut RunSummary,
        browser: &Browser,
    ) -> Result<Finish> {
        let total = job.pages.len() as u64;
        let holder = self.worker_id.as_str();

        for (index, page) in job.pages.iter().enumerate() {
            if self.jobs.poll_cancellation(&job.id).await? {
                info!(pages_tested = summary.pages_tested, "cancellation observed");
                self.jobs.begin_cancelling(&job.id, holder).await?;
                self.jobs
                    .cancel(&job.id, holder, Some(summary.to_value()?))
                    .await?;
                return Ok(Finish::Cancelled);
            }

            self.jobs.renew_lock(&job.id, holder, self.lease).await?;

            match self
                .under_lease(&job.id, browser.steps.open_page(page))
                .await?
            {
                Ok(()) => {
                    let report = self
                        .under_lease(
                            &job.id,
                            self.runner.run_page(session, page, &job.scripts, browser),
                        )
                        .await??;
                    summary.absorb(&report);
                }
                Err(err) => {
                    warn!(page_id = %page.id, %err, "page could not be opened; skipped");
                    summary.unreachable.push(UnreachablePage {
                        page_id: page.id.clone(),
                        error: err.to_string(),
                    });
                }
            }

            let done = index as u64 + 1;
            self.jobs
                .update_progress(
                    &job.id,
                    holder,
                    Progress::new(done, total, Some(format!("page {done} of {total}"))),
                )
                .await?;
        }

        self.jobs
            .complete(&job.id, holder, summary.to_value()?)
            .await?;
        info!(
            pages_tested = summary.pages_tested,
            violations = summary.violations.len(),
            failures = summary.failures.len(),
            "run completed"
        );
        Ok(Finish::Completed)
    }

    /// Await `work` while renewing this worker's lease on `job_id` every
    /// third of the lease. A failed renewal abandons `work`.
    async fn under_lease<T>(&self, job_id: &str, work: impl Future<Output = T>) -> Result<T> {
        let every = (self.lease / 3)
            .to_std()
            .unwrap_or_default()
            .max(MIN_HEARTBEAT);
        let mut heartbeat = interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return Ok(out),
                _ = heartbeat.tick() => {
                    self.jobs.renew_lock(job_id, &self.worker_id, self.lease).await?;
                }
            }
        }
    }
}
