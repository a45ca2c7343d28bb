//! Integration tests for stale-lease reclamation.

use std::sync::Arc;

use a11y_orchestrator::models::job::JobStatus;
use a11y_orchestrator::models::progress::Progress;
use a11y_orchestrator::orchestrator::cleanup::spawn_cleanup_task;
use a11y_orchestrator::orchestrator::job_manager::LEASE_EXPIRED_REASON;
use a11y_orchestrator::AppError;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{page, test_job_manager, testing_spec};

fn later() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::seconds(30)
}

#[tokio::test]
async fn expired_lease_is_requeued_within_budget() {
    let (manager, _db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-dead", Duration::seconds(1))
        .await
        .expect("acquire");

    let report = manager.cleanup_stale(later()).await.expect("cleanup");

    assert_eq!(report.requeued, vec![job_id.clone()]);
    assert_eq!(report.total(), 1);
    let job = manager.get(&job_id).await.expect("get");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.lock.is_none());
    assert_eq!(job.retry_count, 1);

    assert!(manager
        .acquire_lock(&job_id, "worker-2", Duration::seconds(60))
        .await
        .expect("reacquire"));
}

#[tokio::test]
async fn exhausted_budget_fails_with_lease_expired() {
    let (manager, _db) = test_job_manager().await;
    let mut spec = testing_spec("site-a", vec![page("p1")], vec![]);
    spec.max_retries = Some(0);
    let job_id = manager.enqueue(spec).await.expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-dead", Duration::seconds(1))
        .await
        .expect("acquire");

    let report = manager.cleanup_stale(later()).await.expect("cleanup");

    assert_eq!(report.failed, vec![job_id.clone()]);
    let job = manager.get(&job_id).await.expect("get");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(LEASE_EXPIRED_REASON));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn live_lease_is_left_alone() {
    let (manager, _db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-1", Duration::seconds(60))
        .await
        .expect("acquire");

    let report = manager.cleanup_stale(Utc::now()).await.expect("cleanup");

    assert_eq!(report.total(), 0);
    assert_eq!(
        manager.get(&job_id).await.expect("get").status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn abandoned_cancellation_is_finished_as_cancelled() {
    let (manager, _db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-dead", Duration::seconds(1))
        .await
        .expect("acquire");
    manager
        .request_cancellation(&job_id, "user-1")
        .await
        .expect("request");

    let report = manager.cleanup_stale(later()).await.expect("cleanup");

    assert_eq!(report.cancelled, vec![job_id.clone()]);
    assert_eq!(
        manager.get(&job_id).await.expect("get").status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn reclaimed_holder_can_no_longer_write() {
    let (manager, _db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-dead", Duration::seconds(1))
        .await
        .expect("acquire");
    manager.cleanup_stale(later()).await.expect("cleanup");

    let err = manager
        .update_progress(&job_id, "worker-dead", Progress::new(1, 1, None))
        .await
        .expect_err("stale holder");
    assert!(matches!(err, AppError::NotLockHolder(_)));
    let err = manager
        .complete(&job_id, "worker-dead", serde_json::json!({}))
        .await
        .expect_err("stale holder");
    assert!(matches!(err, AppError::NotLockHolder(_)));
}

#[tokio::test]
async fn lapsed_holder_sees_lease_expired() {
    let (manager, _db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-1", Duration::milliseconds(-1))
        .await
        .expect("acquire");

    let err = manager
        .renew_lock(&job_id, "worker-1", Duration::seconds(60))
        .await
        .expect_err("lapsed lease");
    assert!(matches!(err, AppError::LeaseExpired(_)));
}

#[tokio::test]
async fn cleanup_task_sweeps_until_cancelled() {
    let (manager, _db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    manager
        .acquire_lock(&job_id, "worker-dead", Duration::milliseconds(-1))
        .await
        .expect("acquire");

    let ct = CancellationToken::new();
    let handle = spawn_cleanup_task(
        Arc::clone(&manager),
        std::time::Duration::from_millis(20),
        ct.clone(),
    );

    let mut status = JobStatus::Running;
    for _ in 0..50 {
        status = manager.get(&job_id).await.expect("get").status;
        if status == JobStatus::Pending {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    ct.cancel();
    handle.await.expect("cleanup task exits");

    assert_eq!(status, JobStatus::Pending);
}
