//! Periodic stale-lease sweeper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::job_manager::JobManager;

/// Spawn a task calling [`JobManager::cleanup_stale`] every `interval`
/// until `cancel` fires.
#[must_use]
pub fn spawn_cleanup_task(
    manager: Arc<JobManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("cleanup task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match manager.cleanup_stale(Utc::now()).await {
                        Ok(report) if report.total() > 0 => info!(
                            requeued = report.requeued.len(),
                            failed = report.failed.len(),
                            cancelled = report.cancelled.len(),
                            "stale leases reclaimed"
                        ),
                        Ok(_) => {}
                        Err(err) => error!(%err, "stale lease sweep failed"),
                    }
                }
            }
        }
    })
}
