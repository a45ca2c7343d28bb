//! State-tagged test results and per-page run outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::ConditionCheck;

/// Which page state a test snapshot was captured in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum StateLabel {
    /// Before the script's steps ran.
    Before {
        /// Script about to run.
        script_id: String,
    },
    /// After the script's steps ran (successfully or not).
    After {
        /// Script that just ran.
        script_id: String,
    },
}

impl StateLabel {
    /// Script the state belongs to.
    #[must_use]
    pub fn script_id(&self) -> &str {
        match self {
            Self::Before { script_id } | Self::After { script_id } => script_id,
        }
    }
}

/// Violation details attached to a post-state result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ViolationNotice {
    /// Violation code from the script definition.
    pub code: String,
    /// Violation message from the script definition.
    pub message: String,
}

/// Immutable test snapshot produced by the tester callback.
///
/// Instances are only created by the state runner; all fields are read
/// through accessors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TestResult {
    session_id: String,
    page_id: String,
    state: StateLabel,
    state_sequence: u32,
    captured_at: DateTime<Utc>,
    payload: serde_json::Value,
    script_success: Option<bool>,
    violation: Option<ViolationNotice>,
}

impl TestResult {
    pub(crate) fn new(
        session_id: String,
        page_id: String,
        state: StateLabel,
        state_sequence: u32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            page_id,
            state,
            state_sequence,
            captured_at: Utc::now(),
            payload,
            script_success: None,
            violation: None,
        }
    }

    pub(crate) fn with_outcome(mut self, success: bool, violation: Option<ViolationNotice>) -> Self {
        self.script_success = Some(success);
        self.violation = violation;
        self
    }

    /// Session the result was captured in.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Page the result was captured on.
    #[must_use]
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Page state label.
    #[must_use]
    pub fn state(&self) -> &StateLabel {
        &self.state
    }

    /// Ordinal position within the page's multi-state run.
    #[must_use]
    pub fn state_sequence(&self) -> u32 {
        self.state_sequence
    }

    /// Capture timestamp.
    #[must_use]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Opaque tester output.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Script success, present on post-state results only.
    #[must_use]
    pub fn script_success(&self) -> Option<bool> {
        self.script_success
    }

    /// Violation flagged for this script on this page.
    #[must_use]
    pub fn violation(&self) -> Option<&ViolationNotice> {
        self.violation.as_ref()
    }
}

/// Why a step failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    /// The step exceeded its timeout.
    Timeout,
    /// The step backend reported an error.
    Execution,
}

/// Diagnostic record for the step that aborted a script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StepFailure {
    /// Index of the failing step.
    pub step_index: usize,
    /// Failure class.
    pub kind: StepFailureKind,
    /// Backend or timeout message.
    pub message: String,
    /// Page snapshot captured right after the failure, if available.
    pub diagnostic: Option<String>,
}

/// Per-script outcome on one page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScriptOutcome {
    /// Script evaluated.
    pub script_id: String,
    /// Whether the trigger policy let it run.
    pub executed: bool,
    /// Whether every step succeeded; false when skipped.
    pub success: bool,
    /// Steps that completed.
    pub steps_completed: usize,
    /// Time spent executing steps.
    pub duration_ms: u64,
    /// The aborting failure, if any.
    pub failure: Option<StepFailure>,
}

/// Everything `run_page` produced for one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PageReport {
    /// Page tested.
    pub page_id: String,
    /// Results in `state_sequence` order.
    pub results: Vec<TestResult>,
    /// One entry per in-scope script.
    pub outcomes: Vec<ScriptOutcome>,
    /// Violations detected on this page.
    pub violations: Vec<ConditionCheck>,
}

impl PageReport {
    /// Scripts that ran and failed.
    pub fn failures(&self) -> impl Iterator<Item = &ScriptOutcome> {
        self.outcomes.iter().filter(|o| o.executed && !o.success)
    }
}
