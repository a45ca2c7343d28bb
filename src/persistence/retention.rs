//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting terminal jobs and closed execution
//! sessions (children first) older than `retention_days`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::job_store::JobStore;
use super::session_repo::SessionRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Counts removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Terminal jobs deleted.
    pub jobs: u64,
    /// Closed sessions deleted.
    pub sessions: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it deletes jobs that reached a
/// terminal state, and sessions that closed, more than `retention_days` ago.
#[must_use]
pub fn spawn_retention_task(
    jobs: Arc<dyn JobStore>,
    sessions: SessionRepo,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(jobs.as_ref(), &sessions, retention_days).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run a single purge pass.
///
/// # Errors
///
/// Returns `AppError::Storage` if any delete fails.
pub async fn purge(
    jobs: &dyn JobStore,
    sessions: &SessionRepo,
    retention_days: u32,
) -> Result<PurgeReport> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

    let sessions = sessions.purge_closed_before(cutoff).await?;
    let jobs = jobs.delete_terminal_before(cutoff).await?;

    info!(retention_days, jobs, sessions, "retention purge completed");
    Ok(PurgeReport { jobs, sessions })
}
