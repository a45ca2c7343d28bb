//! Integration tests for the retention purge.
//!
//! Validates:
//! - Terminal jobs older than the window are deleted, live and recent ones kept
//! - Closed sessions are deleted together with their child records
//! - Open sessions are never purged

use std::sync::Arc;

use a11y_orchestrator::models::job::{Job, JobStatus};
use a11y_orchestrator::models::session::{ConditionCheck, ExecutedScriptRecord, ExecutionSession};
use a11y_orchestrator::persistence::job_store::{JobStore, SqliteJobStore};
use a11y_orchestrator::persistence::retention;
use a11y_orchestrator::persistence::session_repo::SessionRepo;
use chrono::{Duration, Utc};

use super::test_helpers::{page, test_db, testing_spec};

fn job_finished_days_ago(site: &str, days_ago: Option<i64>) -> Job {
    let mut job = Job::from_spec(testing_spec(site, vec![page("p1")], vec![]), 3);
    if let Some(days) = days_ago {
        let at = Utc::now() - Duration::days(days);
        job.status = JobStatus::Completed;
        job.started_at = Some(at);
        job.completed_at = Some(at);
    }
    job
}

fn session_ended_days_ago(days_ago: Option<i64>) -> ExecutionSession {
    let mut session = ExecutionSession::new("site-a".into(), None);
    session.ended_at = days_ago.map(|days| Utc::now() - Duration::days(days));
    session.upsert_record(ExecutedScriptRecord {
        script_id: "cookie-dismiss".into(),
        page_id: "p1".into(),
        executed_at: session.started_at,
        success: true,
        duration_ms: 25,
    });
    session.upsert_check(ConditionCheck {
        script_id: "cookie-dismiss".into(),
        page_id: "p2".into(),
        checked_at: session.started_at,
        condition_met: true,
        violation_reported: true,
    });
    session
}

#[tokio::test]
async fn purge_removes_only_expired_terminal_data() {
    let db = test_db().await;
    let store = SqliteJobStore::new(Arc::clone(&db));
    let sessions = SessionRepo::new(Arc::clone(&db));

    let old_job = job_finished_days_ago("site-a", Some(45));
    let recent_job = job_finished_days_ago("site-a", Some(2));
    let pending_job = job_finished_days_ago("site-a", None);
    for job in [&old_job, &recent_job, &pending_job] {
        store.upsert(job).await.expect("insert job");
    }

    let old_session = session_ended_days_ago(Some(45));
    let open_session = session_ended_days_ago(None);
    sessions.create(&old_session).await.expect("create");
    sessions.create(&open_session).await.expect("create");

    let report = retention::purge(&store, &sessions, 30).await.expect("purge");

    assert_eq!(report.jobs, 1);
    assert_eq!(report.sessions, 1);
    assert!(store.get(&old_job.id).await.expect("get").is_none());
    assert!(store.get(&recent_job.id).await.expect("get").is_some());
    assert!(store.get(&pending_job.id).await.expect("get").is_some());
    assert!(sessions
        .get_by_id(&old_session.id)
        .await
        .expect("get")
        .is_none());
    let kept = sessions
        .get_by_id(&open_session.id)
        .await
        .expect("get")
        .expect("open session kept");
    assert_eq!(kept.executed_scripts.len(), 1);
    assert_eq!(kept.condition_checks.len(), 1);

    for table in ["executed_script", "condition_check"] {
        let query = format!("SELECT COUNT(*) FROM {table} WHERE session_id = ?1");
        let (count,): (i64,) = sqlx::query_as(&query)
            .bind(&old_session.id)
            .fetch_one(db.as_ref())
            .await
            .expect("count");
        assert_eq!(count, 0, "{table} children must be purged");
    }
}

#[tokio::test]
async fn purge_on_empty_database_is_a_no_op() {
    let db = test_db().await;
    let store = SqliteJobStore::new(Arc::clone(&db));
    let sessions = SessionRepo::new(Arc::clone(&db));

    let report = retention::purge(&store, &sessions, 30).await.expect("purge");

    assert_eq!(report, retention::PurgeReport::default());
}
