//! Page identity handed to every collaborator.

use serde::{Deserialize, Serialize};

/// A page under test within a site run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub struct PageContext {
    /// Stable page identifier within the site.
    pub id: String,
    /// Absolute URL the browser navigates to.
    pub url: String,
}

impl PageContext {
    /// Construct a page context.
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}
