//! Browser-side collaborators consumed by the orchestration core.
//!
//! The core never drives a browser itself. It sequences calls into three
//! seams: a [`DomProbe`] answering selector queries, a [`StepBackend`]
//! performing script steps, and a [`Tester`] capturing an opaque test
//! snapshot of the current page state. Every call is a suspension point
//! from the worker's point of view.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::page::PageContext;
use crate::models::script::ScriptStep;
use crate::models::test_result::StateLabel;
use crate::Result;

/// Boxed future returned by driver calls.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outcome reported by the step backend for one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StepReport {
    /// Whether the step did what it was asked.
    pub success: bool,
    /// Backend error message when it did not.
    pub error: Option<String>,
}

impl StepReport {
    /// A successful step.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed step with a reason.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Answers whether a selector currently matches on a page.
pub trait DomProbe: Send + Sync {
    /// Query `selector` against the live page.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the page cannot be queried.
    fn matches<'a>(&'a self, page: &'a PageContext, selector: &'a str) -> DriverFuture<'a, bool>;
}

/// Executes script steps against a live page.
pub trait StepBackend: Send + Sync {
    /// Load the page before any script runs on it.
    ///
    /// # Errors
    ///
    /// Implementations return an error if navigation fails.
    fn open_page<'a>(&'a self, page: &'a PageContext) -> DriverFuture<'a, ()>;

    /// Perform one step.
    ///
    /// # Errors
    ///
    /// An `Err` is treated like a failed [`StepReport`].
    fn execute_step<'a>(
        &'a self,
        page: &'a PageContext,
        step: &'a ScriptStep,
    ) -> DriverFuture<'a, StepReport>;

    /// Capture a diagnostic snapshot (markup, screenshot path, ...) after a
    /// step failure.
    ///
    /// # Errors
    ///
    /// Implementations return an error if nothing could be captured.
    fn capture_diagnostics<'a>(&'a self, page: &'a PageContext) -> DriverFuture<'a, String>;
}

/// Captures an opaque test snapshot of the page in a given state.
pub trait Tester: Send + Sync {
    /// Test the page as it currently is.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the test could not run.
    fn test<'a>(
        &'a self,
        page: &'a PageContext,
        state: &'a StateLabel,
    ) -> DriverFuture<'a, serde_json::Value>;
}

/// The three collaborators a worker hands to the state runner for one job.
#[derive(Clone)]
pub struct Browser {
    /// Selector queries.
    pub probe: Arc<dyn DomProbe>,
    /// Step execution and page loading.
    pub steps: Arc<dyn StepBackend>,
    /// Test snapshots.
    pub tester: Arc<dyn Tester>,
}
