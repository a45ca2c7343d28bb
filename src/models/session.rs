//! Execution session model: the "once per session" scope of one site run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One logical execution of a script on a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutedScriptRecord {
    /// Script that ran.
    pub script_id: String,
    /// Page it ran on.
    pub page_id: String,
    /// When the latest execution finished.
    pub executed_at: DateTime<Utc>,
    /// Whether every step succeeded.
    pub success: bool,
    /// Wall-clock time spent in the steps.
    pub duration_ms: u64,
}

/// Outcome of evaluating a script's condition on a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConditionCheck {
    /// Script whose condition was probed.
    pub script_id: String,
    /// Page the probe ran on.
    pub page_id: String,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
    /// Whether the condition selector matched.
    pub condition_met: bool,
    /// Whether this check produced a violation.
    pub violation_reported: bool,
}

/// Scope boundary for `once_per_session` triggers within one site run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionSession {
    /// Unique record identifier.
    pub id: String,
    /// Site under test.
    pub site_id: String,
    /// Job driving this run, if any.
    pub job_id: Option<String>,
    /// When the first page of the run began.
    pub started_at: DateTime<Utc>,
    /// When the run ended; set exactly once.
    pub ended_at: Option<DateTime<Utc>>,
    /// One record per (script, page) pair.
    pub executed_scripts: Vec<ExecutedScriptRecord>,
    /// Violation-bearing condition checks, one per (script, page) pair.
    pub condition_checks: Vec<ConditionCheck>,
    /// Last `state_sequence` issued per page.
    pub page_sequences: BTreeMap<String, u32>,
}

impl ExecutionSession {
    /// Construct a new open session with a generated identifier.
    #[must_use]
    pub fn new(site_id: String, job_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            site_id,
            job_id,
            started_at: Utc::now(),
            ended_at: None,
            executed_scripts: Vec::new(),
            condition_checks: Vec::new(),
            page_sequences: BTreeMap::new(),
        }
    }

    /// Whether the session still accepts records.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Record for a (script, page) pair.
    #[must_use]
    pub fn record_for(&self, script_id: &str, page_id: &str) -> Option<&ExecutedScriptRecord> {
        self.executed_scripts
            .iter()
            .find(|r| r.script_id == script_id && r.page_id == page_id)
    }

    /// Whether the script has executed on any page of this session.
    #[must_use]
    pub fn has_executed(&self, script_id: &str) -> bool {
        self.executed_scripts.iter().any(|r| r.script_id == script_id)
    }

    /// Condition check for a (script, page) pair.
    #[must_use]
    pub fn check_for(&self, script_id: &str, page_id: &str) -> Option<&ConditionCheck> {
        self.condition_checks
            .iter()
            .find(|c| c.script_id == script_id && c.page_id == page_id)
    }

    /// Insert or overwrite the record for its (script, page) pair.
    pub fn upsert_record(&mut self, record: ExecutedScriptRecord) {
        match self
            .executed_scripts
            .iter_mut()
            .find(|r| r.script_id == record.script_id && r.page_id == record.page_id)
        {
            Some(existing) => *existing = record,
            None => self.executed_scripts.push(record),
        }
    }

    /// Insert or overwrite the check for its (script, page) pair.
    pub fn upsert_check(&mut self, check: ConditionCheck) {
        match self
            .condition_checks
            .iter_mut()
            .find(|c| c.script_id == check.script_id && c.page_id == check.page_id)
        {
            Some(existing) => *existing = check,
            None => self.condition_checks.push(check),
        }
    }

    /// Issue the next `state_sequence` for a page.
    pub fn next_sequence(&mut self, page_id: &str) -> u32 {
        let slot = self.page_sequences.entry(page_id.to_owned()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Violations recorded so far.
    pub fn violations(&self) -> impl Iterator<Item = &ConditionCheck> {
        self.condition_checks.iter().filter(|c| c.violation_reported)
    }
}
