use std::sync::Arc;

use a11y_orchestrator::models::session::{ConditionCheck, ExecutedScriptRecord, ExecutionSession};
use a11y_orchestrator::persistence::{db, session_repo::SessionRepo};
use chrono::{Duration, Utc};

async fn repo() -> (SessionRepo, Arc<db::Database>) {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    (SessionRepo::new(Arc::clone(&pool)), pool)
}

fn record(script: &str, page: &str, success: bool) -> ExecutedScriptRecord {
    ExecutedScriptRecord {
        script_id: script.into(),
        page_id: page.into(),
        executed_at: Utc::now(),
        success,
        duration_ms: 42,
    }
}

/// Schema bootstrap creates every table the core writes to.
#[tokio::test]
async fn in_memory_connect_creates_all_tables() {
    let pool = db::connect_memory()
        .await
        .expect("in-memory connect should succeed");

    for table in ["job", "execution_session", "executed_script", "condition_check"] {
        let query = format!("SELECT COUNT(*) AS cnt FROM {table}");
        let row: (i64,) = sqlx::query_as(&query)
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn empty_session_round_trips() {
    let (repo, _pool) = repo().await;
    let session = ExecutionSession::new("site-a".into(), None);

    repo.create(&session).await.expect("create");
    let loaded = repo.get_by_id(&session.id).await.expect("get").expect("exists");

    assert_eq!(loaded, session);
}

#[tokio::test]
async fn populated_session_round_trips() {
    let (repo, _pool) = repo().await;
    let mut session = ExecutionSession::new("site-a".into(), Some("job-7".into()));
    session.upsert_record(record("login", "p1", true));
    session.upsert_record(record("menu", "p1", false));
    session.upsert_check(ConditionCheck {
        script_id: "login".into(),
        page_id: "p2".into(),
        checked_at: Utc::now(),
        condition_met: true,
        violation_reported: true,
    });
    session.next_sequence("p1");
    session.next_sequence("p1");

    repo.create(&session).await.expect("create");
    let loaded = repo.get_by_id(&session.id).await.expect("get").expect("exists");

    assert_eq!(loaded, session);
    assert_eq!(loaded.page_sequences.get("p1"), Some(&2));
}

#[tokio::test]
async fn upserts_overwrite_by_pair() {
    let (repo, _pool) = repo().await;
    let session = ExecutionSession::new("site-a".into(), None);
    repo.create(&session).await.expect("create");

    repo.upsert_executed(&session.id, &record("menu", "p1", false))
        .await
        .expect("first");
    let latest = record("menu", "p1", true);
    repo.upsert_executed(&session.id, &latest)
        .await
        .expect("second");

    let loaded = repo.get_by_id(&session.id).await.expect("get").expect("exists");
    assert_eq!(loaded.executed_scripts, vec![latest]);
}

#[tokio::test]
async fn page_sequences_are_persisted() {
    let (repo, _pool) = repo().await;
    let mut session = ExecutionSession::new("site-a".into(), None);
    repo.create(&session).await.expect("create");

    session.next_sequence("p3");
    repo.update_page_sequences(&session.id, &session.page_sequences)
        .await
        .expect("update");

    let loaded = repo.get_by_id(&session.id).await.expect("get").expect("exists");
    assert_eq!(loaded.page_sequences.get("p3"), Some(&1));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (repo, _pool) = repo().await;
    let session = ExecutionSession::new("site-a".into(), None);
    repo.create(&session).await.expect("create");

    let first_end = Utc::now();
    let closed = repo.close(&session.id, first_end).await.expect("close");
    let again = repo
        .close(&session.id, first_end + Duration::seconds(5))
        .await
        .expect("close again");

    assert_eq!(closed.ended_at, Some(first_end));
    assert_eq!(again.ended_at, Some(first_end));
    assert!(repo.close("missing", Utc::now()).await.is_err());
}

#[tokio::test]
async fn list_open_for_site_skips_closed_and_other_sites() {
    let (repo, _pool) = repo().await;
    let open = ExecutionSession::new("site-a".into(), None);
    let closed = ExecutionSession::new("site-a".into(), None);
    let other = ExecutionSession::new("site-b".into(), None);
    for session in [&open, &closed, &other] {
        repo.create(session).await.expect("create");
    }
    repo.close(&closed.id, Utc::now()).await.expect("close");

    let ids = repo.list_open_for_site("site-a").await.expect("list");
    assert_eq!(ids, vec![open.id]);
}

#[tokio::test]
async fn missing_session_is_none() {
    let (repo, _pool) = repo().await;
    assert!(repo.get_by_id("nope").await.expect("get").is_none());
}
