//! Progress tracking for long-running jobs.

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Snapshot of how far a job has advanced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Progress {
    /// Units of work finished (pages tested).
    pub current: u64,
    /// Units of work planned.
    pub total: u64,
    /// Human-readable status line.
    pub message: Option<String>,
    /// Completion percentage derived from `current / total`.
    pub percent: u8,
}

impl Progress {
    /// Build a progress snapshot, deriving `percent`.
    #[must_use]
    pub fn new(current: u64, total: u64, message: Option<String>) -> Self {
        Self {
            current,
            total,
            message,
            percent: percent_of(current, total),
        }
    }

    /// Merge an incoming update without ever moving `current` backwards.
    #[must_use]
    pub fn advanced_by(&self, update: &Progress) -> Self {
        let current = self.current.max(update.current);
        let total = update.total.max(current);
        Self::new(current, total, update.message.clone())
    }
}

fn percent_of(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = current.min(total).saturating_mul(100) / total;
    u8::try_from(pct).unwrap_or(100)
}

/// Validate that a progress update is well-formed.
///
/// # Errors
///
/// Returns `AppError::Validation` if `current` exceeds a non-zero `total`.
pub fn validate_update(update: &Progress) -> Result<()> {
    if update.total > 0 && update.current > update.total {
        return Err(AppError::Validation(format!(
            "progress current {} exceeds total {}",
            update.current, update.total
        )));
    }
    Ok(())
}
