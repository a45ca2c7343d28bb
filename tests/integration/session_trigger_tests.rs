//! Integration tests for session lifecycle, the trigger decision table,
//! execution records, and violation detection.

use a11y_orchestrator::models::script::ScriptTrigger;
use a11y_orchestrator::orchestrator::session_manager::SessionManager;
use a11y_orchestrator::AppError;

use super::test_helpers::{click_script, cookie_dismiss, page, test_db, test_session_manager, FakeProbe};

#[tokio::test]
async fn once_per_session_runs_only_on_first_page() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("login", ScriptTrigger::OncePerSession);

    assert!(SessionManager::decide(&script, &session, &page("p1"), None));
    sessions
        .mark_executed(&mut session, "login", "p1", true, 12)
        .await
        .expect("mark");

    for id in ["p2", "p3", "p1"] {
        assert!(
            !SessionManager::decide(&script, &session, &page(id), None),
            "once_per_session must not run again on {id}"
        );
    }
}

#[tokio::test]
async fn once_per_page_skips_revisits_only() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("expand-menu", ScriptTrigger::OncePerPage);

    sessions
        .mark_executed(&mut session, "expand-menu", "p1", true, 5)
        .await
        .expect("mark");

    assert!(!SessionManager::decide(&script, &session, &page("p1"), None));
    assert!(SessionManager::decide(&script, &session, &page("p2"), None));
}

#[tokio::test]
async fn always_runs_on_every_visit() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("scroll", ScriptTrigger::Always);

    sessions
        .mark_executed(&mut session, "scroll", "p1", true, 5)
        .await
        .expect("mark");

    assert!(SessionManager::decide(&script, &session, &page("p1"), None));
    assert!(SessionManager::decide(&script, &session, &page("p2"), None));
}

#[tokio::test]
async fn conditional_follows_probe_regardless_of_history() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("modal", ScriptTrigger::Conditional);
    let probe = FakeProbe::default();
    probe.show("p1", ".modal");
    probe.show("p2", ".modal");

    assert!(sessions
        .should_execute(&script, &session, &page("p1"), &probe)
        .await
        .expect("probe"));
    sessions
        .mark_executed(&mut session, "modal", "p1", true, 3)
        .await
        .expect("mark");

    assert!(sessions
        .should_execute(&script, &session, &page("p2"), &probe)
        .await
        .expect("probe"));
    assert!(!sessions
        .should_execute(&script, &session, &page("p3"), &probe)
        .await
        .expect("probe"));
}

#[tokio::test]
async fn conditional_without_probe_result_does_not_run() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("modal", ScriptTrigger::Conditional);

    assert!(!SessionManager::decide(&script, &session, &page("p1"), None));
}

#[tokio::test]
async fn conditional_with_failing_dom_query_is_skipped() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("modal", ScriptTrigger::Conditional);

    let run = sessions
        .should_execute(&script, &session, &page("p1"), &FakeProbe::failing())
        .await
        .expect("a failed DOM query is not an error");
    assert!(!run);

    let always = click_script("scroll", ScriptTrigger::Always);
    assert!(sessions
        .should_execute(&always, &session, &page("p1"), &FakeProbe::failing())
        .await
        .expect("unconditional scripts never query the DOM"));
}

#[tokio::test]
async fn mark_executed_overwrites_single_record() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");

    sessions
        .mark_executed(&mut session, "expand-menu", "p1", false, 40)
        .await
        .expect("first mark");
    sessions
        .mark_executed(&mut session, "expand-menu", "p1", true, 15)
        .await
        .expect("second mark");

    assert_eq!(session.executed_scripts.len(), 1);
    let record = session.record_for("expand-menu", "p1").expect("record");
    assert!(record.success);
    assert_eq!(record.duration_ms, 15);

    let stored = sessions.load(&session.id).await.expect("load");
    assert_eq!(stored.executed_scripts.len(), 1);
    assert_eq!(stored.executed_scripts[0], *record);
}

#[tokio::test]
async fn cookie_banner_reappearing_is_one_violation() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = cookie_dismiss();

    // Page 1: banner present, script never ran before.
    let check = sessions
        .check_violation(&mut session, &script, &page("p1"), true)
        .await
        .expect("check p1");
    assert!(!check.violation_reported);
    assert!(SessionManager::decide(&script, &session, &page("p1"), Some(true)));
    sessions
        .mark_executed(&mut session, &script.id, "p1", true, 30)
        .await
        .expect("mark p1");

    // Page 2: banner is back.
    let check = sessions
        .check_violation(&mut session, &script, &page("p2"), true)
        .await
        .expect("check p2");
    assert!(check.violation_reported);
    assert!(!SessionManager::decide(&script, &session, &page("p2"), Some(true)));

    // Page 3: banner gone.
    let check = sessions
        .check_violation(&mut session, &script, &page("p3"), false)
        .await
        .expect("check p3");
    assert!(!check.violation_reported);
    assert!(!SessionManager::decide(&script, &session, &page("p3"), Some(false)));

    let stored = sessions.end_session(&session.id).await.expect("end");
    assert_eq!(stored.executed_scripts.len(), 1);
    assert_eq!(stored.condition_checks.len(), 1);
    let violation = &stored.condition_checks[0];
    assert_eq!(violation.script_id, "cookie-dismiss");
    assert_eq!(violation.page_id, "p2");
    assert!(violation.condition_met);
    assert!(violation.violation_reported);
}

#[tokio::test]
async fn violation_recorded_at_most_once_per_pair() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = cookie_dismiss();

    sessions
        .mark_executed(&mut session, &script.id, "p1", true, 30)
        .await
        .expect("mark");
    let first = sessions
        .check_violation(&mut session, &script, &page("p2"), true)
        .await
        .expect("first check");
    let second = sessions
        .check_violation(&mut session, &script, &page("p2"), true)
        .await
        .expect("second check");

    assert_eq!(first, second);
    let stored = sessions.load(&session.id).await.expect("load");
    assert_eq!(stored.violations().count(), 1);
}

#[tokio::test]
async fn no_violation_without_reporting_enabled() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut session = sessions.start_session("site-a", None).await.expect("start");
    let script = click_script("login", ScriptTrigger::OncePerSession);

    sessions
        .mark_executed(&mut session, "login", "p1", true, 10)
        .await
        .expect("mark");
    let check = sessions
        .check_violation(&mut session, &script, &page("p2"), true)
        .await
        .expect("check");

    assert!(check.condition_met);
    assert!(!check.violation_reported);
    assert!(session.condition_checks.is_empty());
}

#[tokio::test]
async fn end_session_is_idempotent_and_seals_the_session() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let session = sessions
        .start_session("site-a", Some("job-1"))
        .await
        .expect("start");

    let first = sessions.end_session(&session.id).await.expect("first end");
    let second = sessions.end_session(&session.id).await.expect("second end");
    assert!(first.ended_at.is_some());
    assert_eq!(first.ended_at, second.ended_at);
    assert_eq!(second.job_id.as_deref(), Some("job-1"));

    let mut closed = second;
    let err = sessions
        .mark_executed(&mut closed, "login", "p1", true, 1)
        .await
        .expect_err("closed session rejects records");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn end_unknown_session_is_not_found() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);

    let err = sessions
        .end_session("missing")
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn sequences_are_numbered_per_session_and_page() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);
    let mut first = sessions.start_session("site-a", None).await.expect("start");
    let mut second = sessions.start_session("site-a", None).await.expect("start");

    assert_eq!(sessions.next_sequence(&mut first, "p1").await.expect("seq"), 1);
    assert_eq!(sessions.next_sequence(&mut first, "p1").await.expect("seq"), 2);
    assert_eq!(sessions.next_sequence(&mut first, "p2").await.expect("seq"), 1);
    assert_eq!(sessions.next_sequence(&mut second, "p1").await.expect("seq"), 1);

    let stored = sessions.load(&first.id).await.expect("load");
    assert_eq!(stored.page_sequences.get("p1"), Some(&2));
    assert_eq!(stored.page_sequences.get("p2"), Some(&1));
}

#[tokio::test]
async fn start_session_rejects_blank_site() {
    let db = test_db().await;
    let sessions = test_session_manager(&db);

    let err = sessions
        .start_session("  ", None)
        .await
        .expect_err("blank site");
    assert!(matches!(err, AppError::Validation(_)));
}
