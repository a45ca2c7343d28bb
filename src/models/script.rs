//! Page-state script definitions: scope, trigger policy, steps, violations.
//!
//! Scripts are authored outside the core and are read-only during a run.
//! All string-typed knobs of the authoring format are closed enums here, and
//! [`ScriptDefinition::validate`] rejects inconsistent combinations before a
//! job carrying the script is ever persisted.

use serde::{Deserialize, Serialize};

use super::page::PageContext;
use crate::{AppError, Result};

/// Where a script applies within a site run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptScope {
    /// Applies to every page of the site.
    Website,
    /// Applies only to pages whose URL contains `url_pattern`.
    Page {
        /// Substring matched against the page URL.
        url_pattern: String,
    },
    /// Runs once at the start of the test run (e.g. authentication).
    TestRun,
}

/// Policy deciding whether a script executes for a given page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptTrigger {
    /// At most once within an execution session.
    OncePerSession,
    /// At most once per page within an execution session.
    OncePerPage,
    /// Whenever the condition selector matches on the page.
    Conditional,
    /// On every page visit.
    Always,
}

/// Browser action performed by a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Load the URL in `target`.
    Navigate,
    /// Click the element matched by `target`.
    Click,
    /// Type `value` into the element matched by `target`.
    Type,
    /// Choose option `value` in the select matched by `target`.
    Select,
    /// Move the pointer over `target`.
    Hover,
    /// Press the key named in `value`.
    PressKey,
    /// Block until `target` appears.
    WaitForSelector,
    /// Sleep for `value` milliseconds.
    Wait,
    /// Scroll `target` (or the page) into view.
    Scroll,
}

impl StepKind {
    fn requires_target(self) -> bool {
        matches!(
            self,
            Self::Navigate
                | Self::Click
                | Self::Type
                | Self::Select
                | Self::Hover
                | Self::WaitForSelector
        )
    }

    fn requires_value(self) -> bool {
        matches!(self, Self::Type | Self::Select | Self::PressKey | Self::Wait)
    }
}

/// One ordered action within a script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScriptStep {
    /// Action to perform.
    pub kind: StepKind,
    /// CSS selector or URL, depending on `kind`.
    #[serde(default)]
    pub target: Option<String>,
    /// Text, key or option value, depending on `kind`.
    #[serde(default)]
    pub value: Option<String>,
    /// Per-step timeout; the runner default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ScriptStep {
    /// Construct a step without value or explicit timeout.
    #[must_use]
    pub fn new(kind: StepKind, target: Option<String>) -> Self {
        Self {
            kind,
            target,
            value: None,
            timeout_ms: None,
        }
    }

    fn validate(&self, script_id: &str, index: usize) -> Result<()> {
        let blank = |v: &Option<String>| v.as_deref().unwrap_or_default().trim().is_empty();
        if self.kind.requires_target() && blank(&self.target) {
            return Err(AppError::Validation(format!(
                "script {script_id} step {index}: {:?} requires a target",
                self.kind
            )));
        }
        if self.kind.requires_value() && blank(&self.value) {
            return Err(AppError::Validation(format!(
                "script {script_id} step {index}: {:?} requires a value",
                self.kind
            )));
        }
        if self.kind == StepKind::Wait
            && self
                .value
                .as_deref()
                .is_some_and(|v| v.trim().parse::<u64>().is_err())
        {
            return Err(AppError::Validation(format!(
                "script {script_id} step {index}: wait value must be milliseconds"
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(AppError::Validation(format!(
                "script {script_id} step {index}: timeout must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Violation reporting for a condition the script is meant to suppress.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ViolationConfig {
    /// Report a violation when the condition reappears after the script ran.
    #[serde(default)]
    pub report_if_condition_met: bool,
    /// Message attached to the violation.
    #[serde(default)]
    pub message: String,
    /// Machine-readable violation code.
    #[serde(default)]
    pub code: String,
}

fn default_true() -> bool {
    true
}

/// A scripted page-state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScriptDefinition {
    /// Unique script identifier within a job.
    pub id: String,
    /// Where the script applies.
    pub scope: ScriptScope,
    /// Execution policy.
    pub trigger: ScriptTrigger,
    /// Selector probed for conditional triggers and violation detection.
    #[serde(default)]
    pub condition_selector: Option<String>,
    /// Ordered steps.
    pub steps: Vec<ScriptStep>,
    /// Capture a test snapshot before the script runs.
    #[serde(default)]
    pub test_before: bool,
    /// Capture a test snapshot after the script runs.
    #[serde(default = "default_true")]
    pub test_after: bool,
    /// Violation reporting settings.
    #[serde(default)]
    pub violation: ViolationConfig,
}

impl ScriptDefinition {
    /// Whether violation reporting is switched on.
    #[must_use]
    pub fn reports_violations(&self) -> bool {
        self.violation.report_if_condition_met
    }

    /// Whether the runner must probe the condition selector on each page.
    #[must_use]
    pub fn needs_condition_probe(&self) -> bool {
        self.trigger == ScriptTrigger::Conditional || self.reports_violations()
    }

    /// Whether this script is in scope for `page`.
    #[must_use]
    pub fn applies_to(&self, page: &PageContext) -> bool {
        match &self.scope {
            ScriptScope::Website | ScriptScope::TestRun => true,
            ScriptScope::Page { url_pattern } => page.url.contains(url_pattern.as_str()),
        }
    }

    /// Validate internal consistency of the definition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::Validation("script id must not be empty".into()));
        }
        let id = self.id.as_str();

        if self.steps.is_empty() {
            return Err(AppError::Validation(format!(
                "script {id} must declare at least one step"
            )));
        }

        match &self.scope {
            ScriptScope::Page { url_pattern } if url_pattern.trim().is_empty() => {
                return Err(AppError::Validation(format!(
                    "script {id}: page scope requires a url_pattern"
                )));
            }
            ScriptScope::TestRun if self.trigger != ScriptTrigger::OncePerSession => {
                return Err(AppError::Validation(format!(
                    "script {id}: test_run scope only supports once_per_session"
                )));
            }
            _ => {}
        }

        let has_selector = self
            .condition_selector
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if self.needs_condition_probe() && !has_selector {
            return Err(AppError::Validation(format!(
                "script {id}: condition_selector is required for conditional triggers and violation reporting"
            )));
        }
        if !self.needs_condition_probe() && self.condition_selector.is_some() {
            return Err(AppError::Validation(format!(
                "script {id}: condition_selector is only allowed for conditional triggers or violation reporting"
            )));
        }

        if self.reports_violations()
            && (self.violation.message.trim().is_empty() || self.violation.code.trim().is_empty())
        {
            return Err(AppError::Validation(format!(
                "script {id}: violation reporting requires a message and a code"
            )));
        }

        for (index, step) in self.steps.iter().enumerate() {
            step.validate(id, index)?;
        }

        Ok(())
    }
}
