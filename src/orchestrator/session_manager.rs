//! Execution session tracking, trigger policy, and violation detection.
//!
//! A session spans every page tested in one run of one site. It decides per
//! (script, page) whether a script must run and records when a condition
//! a script already suppressed shows up again later in the run.

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::driver::DomProbe;
use crate::models::page::PageContext;
use crate::models::script::{ScriptDefinition, ScriptTrigger};
use crate::models::session::{ConditionCheck, ExecutedScriptRecord, ExecutionSession};
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// Session lifecycle and trigger evaluation backed by [`SessionRepo`].
#[derive(Clone)]
pub struct SessionManager {
    repo: SessionRepo,
}

impl SessionManager {
    /// Create a manager over `repo`.
    #[must_use]
    pub fn new(repo: SessionRepo) -> Self {
        Self { repo }
    }

    /// Open and persist a new session for `site_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a blank site, or
    /// `AppError::Storage` if persistence fails.
    pub async fn start_session(
        &self,
        site_id: &str,
        job_id: Option<&str>,
    ) -> Result<ExecutionSession> {
        if site_id.trim().is_empty() {
            return Err(AppError::Validation("site_id must not be empty".into()));
        }

        let span = info_span!("start_session", site_id, job_id);

        async move {
            let open = self.repo.list_open_for_site(site_id).await?;
            if !open.is_empty() {
                warn!(open = open.len(), "site already has open sessions");
            }

            let session = ExecutionSession::new(site_id.to_owned(), job_id.map(str::to_owned));
            let session = self.repo.create(&session).await?;
            info!(session_id = %session.id, "session started");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Close a session. Closing an already closed session is a no-op that
    /// returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn end_session(&self, session_id: &str) -> Result<ExecutionSession> {
        let session = self.repo.close(session_id, Utc::now()).await?;
        info!(
            session_id,
            executed = session.executed_scripts.len(),
            violations = session.violations().count(),
            "session ended"
        );
        Ok(session)
    }

    /// Load a session with all of its records.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn load(&self, session_id: &str) -> Result<ExecutionSession> {
        self.repo
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// Trigger decision table, given the probed condition (if any).
    ///
    /// A conditional script with no probe result never runs.
    #[must_use]
    pub fn decide(
        script: &ScriptDefinition,
        session: &ExecutionSession,
        page: &PageContext,
        condition_present: Option<bool>,
    ) -> bool {
        match script.trigger {
            ScriptTrigger::OncePerSession => !session.has_executed(&script.id),
            ScriptTrigger::OncePerPage => session.record_for(&script.id, &page.id).is_none(),
            ScriptTrigger::Conditional => condition_present.unwrap_or(false),
            ScriptTrigger::Always => true,
        }
    }

    /// Decide whether `script` must run on `page`, probing the DOM for
    /// conditional triggers. A failed probe counts as an absent condition,
    /// so the script is skipped.
    ///
    /// # Errors
    ///
    /// Currently never fails.
    pub async fn should_execute(
        &self,
        script: &ScriptDefinition,
        session: &ExecutionSession,
        page: &PageContext,
        probe: &dyn DomProbe,
    ) -> Result<bool> {
        let condition = if script.trigger == ScriptTrigger::Conditional {
            probe_condition(probe, page, script).await
        } else {
            None
        };
        Ok(Self::decide(script, session, page, condition))
    }

    /// Record an execution of `script_id` on `page_id`, overwriting any
    /// earlier record for the same pair.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the session is closed, or
    /// `AppError::Storage` if persistence fails.
    pub async fn mark_executed(
        &self,
        session: &mut ExecutionSession,
        script_id: &str,
        page_id: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<ExecutedScriptRecord> {
        ensure_open(session)?;

        let record = ExecutedScriptRecord {
            script_id: script_id.to_owned(),
            page_id: page_id.to_owned(),
            executed_at: Utc::now(),
            success,
            duration_ms,
        };
        self.repo.upsert_executed(&session.id, &record).await?;
        session.upsert_record(record.clone());

        debug!(session_id = %session.id, script_id, page_id, success, duration_ms, "script recorded");
        Ok(record)
    }

    /// Evaluate the violation rule for `script` on `page`.
    ///
    /// A violation is flagged only when reporting is enabled, the condition
    /// is present, and the script already executed earlier in this session.
    /// Call this before recording the current page's execution, so the
    /// first page a script runs on never counts. Only violations are
    /// persisted, at most one per (script, page) pair.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the session is closed, or
    /// `AppError::Storage` if persistence fails.
    pub async fn check_violation(
        &self,
        session: &mut ExecutionSession,
        script: &ScriptDefinition,
        page: &PageContext,
        condition_present: bool,
    ) -> Result<ConditionCheck> {
        ensure_open(session)?;

        if let Some(existing) = session
            .check_for(&script.id, &page.id)
            .filter(|c| c.violation_reported)
        {
            debug!(script_id = %script.id, page_id = %page.id, "violation already recorded");
            return Ok(existing.clone());
        }

        let violation =
            script.reports_violations() && condition_present && session.has_executed(&script.id);
        let check = ConditionCheck {
            script_id: script.id.clone(),
            page_id: page.id.clone(),
            checked_at: Utc::now(),
            condition_met: condition_present,
            violation_reported: violation,
        };

        if violation {
            self.repo.upsert_check(&session.id, &check).await?;
            session.upsert_check(check.clone());
            info!(
                session_id = %session.id,
                script_id = %script.id,
                page_id = %page.id,
                code = %script.violation.code,
                "violation detected"
            );
        } else {
            debug!(script_id = %script.id, page_id = %page.id, condition_present, "no violation");
        }

        Ok(check)
    }

    /// Issue and persist the next `state_sequence` for a page.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the session is closed, or
    /// `AppError::Storage` if persistence fails.
    pub async fn next_sequence(&self, session: &mut ExecutionSession, page_id: &str) -> Result<u32> {
        ensure_open(session)?;
        let sequence = session.next_sequence(page_id);
        self.repo
            .update_page_sequences(&session.id, &session.page_sequences)
            .await?;
        Ok(sequence)
    }
}

fn ensure_open(session: &ExecutionSession) -> Result<()> {
    if session.is_open() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "session {} is already closed",
            session.id
        )))
    }
}

/// Probe the script's condition selector. A failed probe counts as unknown.
pub(crate) async fn probe_condition(
    probe: &dyn DomProbe,
    page: &PageContext,
    script: &ScriptDefinition,
) -> Option<bool> {
    let selector = script.condition_selector.as_deref()?;
    match probe.matches(page, selector).await {
        Ok(present) => {
            debug!(script_id = %script.id, selector, present, "condition probed");
            Some(present)
        }
        Err(err) => {
            warn!(script_id = %script.id, selector, %err, "condition probe failed");
            None
        }
    }
}
