//! Per-page multi-state test runner.
//!
//! For every in-scope script on a page the runner walks the
//! `Initial -> [TestBefore] -> Executing -> [TestAfter] -> Done` machine,
//! capturing tester snapshots tagged with a per-page `state_sequence`.
//! A failing step ends only its own script; the page's remaining scripts
//! still run.

use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn, Instrument};

use crate::driver::{Browser, StepBackend, Tester};
use crate::models::page::PageContext;
use crate::models::script::ScriptDefinition;
use crate::models::session::ExecutionSession;
use crate::models::test_result::{
    PageReport, ScriptOutcome, StateLabel, StepFailure, StepFailureKind, TestResult,
    ViolationNotice,
};
use crate::{AppError, Result};

use super::session_manager::{probe_condition, SessionManager};

/// Phase of one (page, script) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    /// Nothing has happened yet.
    Initial,
    /// Capturing the pre-state snapshot.
    TestBefore,
    /// Running the script's steps.
    Executing,
    /// Capturing the post-state snapshot.
    TestAfter,
    /// Finished, successfully or with a recorded step failure.
    Done,
    /// Aborted by an infrastructure error.
    Error,
}

impl ScriptPhase {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Check whether a transition from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Initial, Self::TestBefore | Self::Executing)
            | (Self::TestBefore, Self::Executing)
            | (Self::Executing, Self::TestAfter | Self::Done)
            | (Self::TestAfter, Self::Done) => true,
            (current, Self::Error) => !current.is_terminal(),
            _ => false,
        }
    }
}

struct PhaseTracker<'a> {
    script_id: &'a str,
    phase: ScriptPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(script_id: &'a str) -> Self {
        Self {
            script_id,
            phase: ScriptPhase::Initial,
        }
    }

    fn advance(&mut self, next: ScriptPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "script {}: invalid phase transition {:?} -> {next:?}",
                self.script_id, self.phase
            )));
        }
        debug!(script_id = self.script_id, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        Ok(())
    }

    fn abort(&mut self) {
        if !self.phase.is_terminal() {
            warn!(script_id = self.script_id, phase = ?self.phase, "script aborted");
            self.phase = ScriptPhase::Error;
        }
    }
}

/// Sequences probes, steps, and tester calls for one page at a time.
#[derive(Clone)]
pub struct StateRunner {
    sessions: SessionManager,
    default_step_timeout: Duration,
}

impl StateRunner {
    /// Create a runner using `default_step_timeout` for steps without their
    /// own timeout.
    #[must_use]
    pub fn new(sessions: SessionManager, default_step_timeout: Duration) -> Self {
        Self {
            sessions,
            default_step_timeout,
        }
    }

    /// The session manager backing trigger decisions.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run every applicable script of `scripts` on `page`.
    ///
    /// Step failures are recorded in the report, never raised.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if session bookkeeping cannot be
    /// persisted, or `AppError::Validation` if the session is closed.
    pub async fn run_page(
        &self,
        session: &mut ExecutionSession,
        page: &PageContext,
        scripts: &[ScriptDefinition],
        browser: &Browser,
    ) -> Result<PageReport> {
        let span = info_span!("run_page", session_id = %session.id, page_id = %page.id);

        async move {
            let mut report = PageReport {
                page_id: page.id.clone(),
                ..PageReport::default()
            };

            for script in scripts.iter().filter(|s| s.applies_to(page)) {
                let outcome = self
                    .run_script(session, page, script, browser, &mut report)
                    .await?;
                report.outcomes.push(outcome);
            }

            info!(
                results = report.results.len(),
                failures = report.failures().count(),
                violations = report.violations.len(),
                "page tested"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_script(
        &self,
        session: &mut ExecutionSession,
        page: &PageContext,
        script: &ScriptDefinition,
        browser: &Browser,
        report: &mut PageReport,
    ) -> Result<ScriptOutcome> {
        let mut tracker = PhaseTracker::new(&script.id);

        let condition = if script.needs_condition_probe() {
            probe_condition(browser.probe.as_ref(), page, script).await
        } else {
            None
        };

        // The violation rule looks at prior executions only, so it must run
        // before this page's execution is recorded.
        let mut violation = None;
        if let (Some(present), true) = (condition, script.reports_violations()) {
            let check = self
                .sessions
                .check_violation(session, script, page, present)
                .await
                .inspect_err(|_| tracker.abort())?;
            if check.violation_reported {
                violation = Some(ViolationNotice {
                    code: script.violation.code.clone(),
                    message: script.violation.message.clone(),
                });
                report.violations.push(check);
            }
        }

        if !SessionManager::decide(script, session, page, condition) {
            debug!(script_id = %script.id, trigger = ?script.trigger, "script skipped");
            return Ok(ScriptOutcome {
                script_id: script.id.clone(),
                executed: false,
                success: false,
                steps_completed: 0,
                duration_ms: 0,
                failure: None,
            });
        }

        if script.test_before {
            tracker.advance(ScriptPhase::TestBefore)?;
            let label = StateLabel::Before {
                script_id: script.id.clone(),
            };
            if let Some(result) = self
                .capture(session, page, label, browser.tester.as_ref())
                .await
                .inspect_err(|_| tracker.abort())?
            {
                report.results.push(result);
            }
        }

        tracker.advance(ScriptPhase::Executing)?;
        let started = Instant::now();
        let (steps_completed, failure) =
            self.execute_steps(page, script, browser.steps.as_ref()).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let success = failure.is_none();

        self.sessions
            .mark_executed(session, &script.id, &page.id, success, duration_ms)
            .await
            .inspect_err(|_| tracker.abort())?;

        if script.test_after {
            tracker.advance(ScriptPhase::TestAfter)?;
            let label = StateLabel::After {
                script_id: script.id.clone(),
            };
            if let Some(result) = self
                .capture(session, page, label, browser.tester.as_ref())
                .await
                .inspect_err(|_| tracker.abort())?
            {
                report.results.push(result.with_outcome(success, violation));
            }
        }

        tracker.advance(ScriptPhase::Done)?;
        Ok(ScriptOutcome {
            script_id: script.id.clone(),
            executed: true,
            success,
            steps_completed,
            duration_ms,
            failure,
        })
    }

    /// Invoke the tester and tag its output with the page's next sequence
    /// number. A tester error skips the snapshot without consuming a number.
    async fn capture(
        &self,
        session: &mut ExecutionSession,
        page: &PageContext,
        label: StateLabel,
        tester: &dyn Tester,
    ) -> Result<Option<TestResult>> {
        let payload = match tester.test(page, &label).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(script_id = label.script_id(), ?label, %err, "tester failed; snapshot skipped");
                return Ok(None);
            }
        };

        let sequence = self.sessions.next_sequence(session, &page.id).await?;
        Ok(Some(TestResult::new(
            session.id.clone(),
            page.id.clone(),
            label,
            sequence,
            payload,
        )))
    }

    /// Run steps in order until one fails. Each step is attempted once.
    async fn execute_steps(
        &self,
        page: &PageContext,
        script: &ScriptDefinition,
        backend: &dyn StepBackend,
    ) -> (usize, Option<StepFailure>) {
        for (index, step) in script.steps.iter().enumerate() {
            let limit = step
                .timeout_ms
                .map_or(self.default_step_timeout, Duration::from_millis);

            let (kind, message) =
                match tokio::time::timeout(limit, backend.execute_step(page, step)).await {
                    Ok(Ok(outcome)) if outcome.success => {
                        debug!(script_id = %script.id, step_index = index, kind = ?step.kind, "step ok");
                        continue;
                    }
                    Ok(Ok(outcome)) => (
                        StepFailureKind::Execution,
                        outcome
                            .error
                            .unwrap_or_else(|| "step reported failure".to_owned()),
                    ),
                    Ok(Err(AppError::StepTimeout(msg))) => (StepFailureKind::Timeout, msg),
                    Ok(Err(AppError::StepExecution(msg))) => (StepFailureKind::Execution, msg),
                    Ok(Err(other)) => (StepFailureKind::Execution, other.to_string()),
                    Err(_) => (
                        StepFailureKind::Timeout,
                        format!("step {index} exceeded {} ms", limit.as_millis()),
                    ),
                };

            let diagnostic = match backend.capture_diagnostics(page).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    debug!(script_id = %script.id, %err, "no diagnostic snapshot");
                    None
                }
            };

            warn!(
                script_id = %script.id,
                step_index = index,
                kind = ?kind,
                %message,
                "step failed; remaining steps skipped"
            );
            return (
                index,
                Some(StepFailure {
                    step_index: index,
                    kind,
                    message,
                    diagnostic,
                }),
            );
        }

        (script.steps.len(), None)
    }
}
