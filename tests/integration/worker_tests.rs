//! Integration tests for the reference job worker.

use std::sync::Arc;

use std::time::Duration;

use a11y_orchestrator::models::job::{JobStatus, JobType};
use a11y_orchestrator::models::script::ScriptTrigger;
use a11y_orchestrator::orchestrator::worker::{JobWorker, RunOutcome};
use a11y_orchestrator::persistence::session_repo::SessionRepo;
use a11y_orchestrator::GlobalConfig;

use super::test_helpers::{
    click_script, cookie_dismiss, page, test_job_manager, test_session_manager, test_worker,
    test_worker_with_lease, testing_spec, FakeBackend, FakeBrowser, FakeProbe, RecordingTester,
    StepBehavior,
};

#[tokio::test]
async fn run_completes_job_and_closes_session() {
    let (manager, db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec(
            "site-a",
            vec![page("p1"), page("p2")],
            vec![cookie_dismiss(), click_script("scroll", ScriptTrigger::Always)],
        ))
        .await
        .expect("enqueue");
    let fakes = FakeBrowser::plain();
    fakes.probe.show("p1", ".cookie-banner");
    fakes.probe.show("p2", ".cookie-banner");
    let worker = test_worker(&manager, &db, "worker-1");

    let outcome = worker.run(&job_id, &fakes.browser).await.expect("run");

    let RunOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.pages_total, 2);
    assert_eq!(summary.pages_tested, 2);
    assert_eq!(summary.violations.len(), 1);
    assert!(summary.failures.is_empty());

    let job = manager.get(&job_id).await.expect("get");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.lock.is_none());
    assert_eq!(job.progress.current, 2);
    assert_eq!(job.progress.percent, 100);
    let result = job.result.expect("result stored");
    assert_eq!(result["pages_tested"], 2);
    assert_eq!(result["violations"][0]["page_id"], "p2");

    let open = SessionRepo::new(Arc::clone(&db))
        .list_open_for_site("site-a")
        .await
        .expect("open sessions");
    assert!(open.is_empty());
    assert_eq!(fakes.backend.opened(), vec!["p1", "p2"]);
}

#[tokio::test]
async fn cancellation_is_honoured_at_the_next_page_boundary() {
    let (manager, db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec(
            "site-a",
            vec![page("p1"), page("p2"), page("p3")],
            vec![click_script("scroll", ScriptTrigger::Always)],
        ))
        .await
        .expect("enqueue");

    let hook_manager = Arc::clone(&manager);
    let hook_job = job_id.clone();
    let backend = FakeBackend::default().on_open(move |opened| {
        (opened.id == "p1").then(|| {
            let manager = Arc::clone(&hook_manager);
            let job_id = hook_job.clone();
            tokio::spawn(async move {
                assert!(manager
                    .request_cancellation(&job_id, "user-2")
                    .await
                    .expect("request"));
            })
        })
    });
    let fakes = FakeBrowser::new(FakeProbe::default(), backend, RecordingTester::default());
    let worker = test_worker(&manager, &db, "worker-1");

    let outcome = worker.run(&job_id, &fakes.browser).await.expect("run");

    let RunOutcome::Cancelled(summary) = outcome else {
        panic!("expected cancellation, got {outcome:?}");
    };
    assert_eq!(summary.pages_tested, 1);
    assert_eq!(fakes.backend.opened(), vec!["p1"]);

    let job = manager.get(&job_id).await.expect("get");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancellation.requested);
    assert_eq!(job.cancellation.requested_by.as_deref(), Some("user-2"));
    assert_eq!(job.result.expect("partial result")["pages_tested"], 1);
    assert_eq!(job.progress.current, 1);
}

#[tokio::test]
async fn run_does_nothing_for_a_job_leased_elsewhere() {
    let (manager, db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    assert!(manager
        .acquire_lock(&job_id, "worker-other", chrono::Duration::seconds(60))
        .await
        .expect("acquire"));
    let fakes = FakeBrowser::plain();
    let worker = test_worker(&manager, &db, "worker-1");

    let outcome = worker.run(&job_id, &fakes.browser).await.expect("run");

    assert_eq!(outcome, RunOutcome::NotAcquired);
    assert!(fakes.backend.opened().is_empty());
    let job = manager.get(&job_id).await.expect("get");
    assert_eq!(job.lock.expect("lock").holder, "worker-other");
}

#[tokio::test]
async fn unreachable_page_is_skipped_and_reported() {
    let (manager, db) = test_job_manager().await;
    let job_id = manager
        .enqueue(testing_spec(
            "site-a",
            vec![page("p1"), page("p2"), page("p3")],
            vec![click_script("scroll", ScriptTrigger::Always)],
        ))
        .await
        .expect("enqueue");
    let fakes = FakeBrowser::new(
        FakeProbe::default(),
        FakeBackend::default().with_unreachable("p2"),
        RecordingTester::default(),
    );
    let worker = test_worker(&manager, &db, "worker-1");

    let outcome = worker.run(&job_id, &fakes.browser).await.expect("run");

    let RunOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.pages_tested, 2);
    assert_eq!(summary.unreachable.len(), 1);
    assert_eq!(summary.unreachable[0].page_id, "p2");
    assert_eq!(manager.get(&job_id).await.expect("get").progress.current, 3);
}

#[tokio::test]
async fn run_next_claims_oldest_pending_job_of_type() {
    let (manager, db) = test_job_manager().await;
    let first = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    let second = manager
        .enqueue(testing_spec("site-b", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    let fakes = FakeBrowser::plain();
    let worker = test_worker(&manager, &db, "worker-1");

    let outcome = worker
        .run_next(Some(JobType::Testing), &fakes.browser)
        .await
        .expect("run next")
        .expect("job claimed");
    let RunOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.job_id, first);

    assert!(worker
        .run_next(Some(JobType::Discovery), &fakes.browser)
        .await
        .expect("run next")
        .is_none());
    assert_eq!(
        manager.get(&second).await.expect("get").status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn same_site_run_waits_for_the_running_job() {
    let (manager, db) = test_job_manager().await;
    let first = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    let second = manager
        .enqueue(testing_spec("site-a", vec![page("q1")], vec![]))
        .await
        .expect("enqueue");

    let hook_manager = Arc::clone(&manager);
    let hook_db = Arc::clone(&db);
    let hook_job = second.clone();
    let backend = FakeBackend::default().on_open(move |opened| {
        (opened.id == "p1").then(|| {
            let manager = Arc::clone(&hook_manager);
            let db = Arc::clone(&hook_db);
            let job_id = hook_job.clone();
            tokio::spawn(async move {
                let rival = test_worker(&manager, &db, "worker-2");
                let fakes = FakeBrowser::plain();
                let outcome = rival.run(&job_id, &fakes.browser).await.expect("run");
                assert_eq!(outcome, RunOutcome::NotAcquired);
                assert!(fakes.backend.opened().is_empty());
            })
        })
    });
    let fakes = FakeBrowser::new(FakeProbe::default(), backend, RecordingTester::default());
    let worker = test_worker(&manager, &db, "worker-1");

    let outcome = worker.run(&first, &fakes.browser).await.expect("run");
    assert!(matches!(outcome, RunOutcome::Completed(_)), "got {outcome:?}");

    let waiting = manager.get(&second).await.expect("get");
    assert_eq!(waiting.status, JobStatus::Pending);
    assert_eq!(waiting.retry_count, 0);
    assert!(waiting.started_at.is_none());

    let rival = test_worker(&manager, &db, "worker-2");
    let outcome = rival
        .run(&second, &FakeBrowser::plain().browser)
        .await
        .expect("run");
    assert!(matches!(outcome, RunOutcome::Completed(_)), "got {outcome:?}");
}

#[tokio::test]
async fn page_longer_than_the_lease_keeps_it_alive() {
    let (manager, db) = test_job_manager().await;
    let slow = click_script("wait-spinner", ScriptTrigger::Always);
    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![slow]))
        .await
        .expect("enqueue");
    let fakes = FakeBrowser::new(
        FakeProbe::default(),
        FakeBackend::default().with_behavior(
            "#wait-spinner",
            StepBehavior::Slow(Duration::from_millis(1500)),
        ),
        RecordingTester::default(),
    );
    let worker =
        test_worker_with_lease(&manager, &db, "worker-1", chrono::Duration::milliseconds(600));

    let outcome = worker.run(&job_id, &fakes.browser).await.expect("run");

    let RunOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.pages_tested, 1);
    assert!(summary.failures.is_empty());
    let job = manager.get(&job_id).await.expect("get");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.current, 1);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn worker_from_config_takes_identity_and_lease() {
    let (manager, db) = test_job_manager().await;
    let config = GlobalConfig::from_toml_str(
        r#"
db_path = ":memory:"
worker_id = "worker-ci"

[jobs]
lease_seconds = 90

[runner]
default_step_timeout_ms = 2000
"#,
    )
    .expect("config");
    let worker = JobWorker::from_config(Arc::clone(&manager), test_session_manager(&db), &config);

    assert_eq!(worker.worker_id(), "worker-ci");
    assert_eq!(worker.lease(), chrono::Duration::seconds(90));

    let job_id = manager
        .enqueue(testing_spec("site-a", vec![page("p1")], vec![]))
        .await
        .expect("enqueue");
    let outcome = worker
        .run(&job_id, &FakeBrowser::plain().browser)
        .await
        .expect("run");
    assert!(matches!(outcome, RunOutcome::Completed(_)), "got {outcome:?}");
}
