use std::sync::Arc;

use cloud_migration::models::run::{MigrationRun, RunStatus};
use cloud_migration::models::session::CloudMigrationSession;
use cloud_migration::persistence::{db, run_repo::RunRepo, session_repo::SessionRepo};

async fn setup() -> (RunRepo, CloudMigrationSession) {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let session = SessionRepo::new(Arc::clone(&db))
        .create(&CloudMigrationSession::new(1, "t".into(), "stack".into()))
        .await
        .expect("create session");
    (RunRepo::new(db), session)
}

#[tokio::test]
async fn new_run_starts_pending() {
    let (repo, session) = setup().await;
    let run = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create run");

    let fetched = repo.get(1, &run.uid).await.expect("get").expect("exists");
    assert_eq!(fetched.status, RunStatus::Pending);
    assert!(fetched.finished_at.is_none());
    assert!(repo.get(2, &run.uid).await.expect("get").is_none());
}

#[tokio::test]
async fn transition_is_compare_and_set() {
    let (repo, session) = setup().await;
    let run = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create run");

    assert!(repo
        .transition(&run.uid, &[RunStatus::Pending], RunStatus::Running, None)
        .await
        .expect("start"));
    assert!(
        !repo
            .transition(&run.uid, &[RunStatus::Pending], RunStatus::Error, Some("late"))
            .await
            .expect("stale transition"),
        "guard no longer matches"
    );

    let running = repo.get(1, &run.uid).await.expect("get").expect("exists");
    assert_eq!(running.status, RunStatus::Running);
    assert!(running.error_message.is_none());
}

#[tokio::test]
async fn terminal_transition_stamps_finish_time_and_message() {
    let (repo, session) = setup().await;
    let run = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create run");

    repo.transition(
        &run.uid,
        &[RunStatus::Pending, RunStatus::Running],
        RunStatus::Error,
        Some("upload failed"),
    )
    .await
    .expect("fail run");

    let failed = repo.get(1, &run.uid).await.expect("get").expect("exists");
    assert_eq!(failed.status, RunStatus::Error);
    assert_eq!(failed.error_message.as_deref(), Some("upload failed"));
    assert!(failed.finished_at.is_some());
}

#[tokio::test]
async fn active_listing_excludes_terminal_runs() {
    let (repo, session) = setup().await;
    let done = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create");
    repo.transition(&done.uid, &[RunStatus::Pending], RunStatus::Cancelled, None)
        .await
        .expect("cancel");
    let live = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create");

    let active = repo
        .list_active_for_session(1, &session.uid)
        .await
        .expect("list active");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].uid, live.uid);

    let all = repo.list_for_session(1, &session.uid).await.expect("list");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].uid, live.uid, "most recent first");
}

#[tokio::test]
async fn remote_status_is_recorded() {
    let (repo, session) = setup().await;
    let run = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create");

    repo.set_remote_status(&run.uid, "complete")
        .await
        .expect("set remote status");
    let fetched = repo.get(1, &run.uid).await.expect("get").expect("exists");
    assert_eq!(fetched.remote_status.as_deref(), Some("complete"));
}

#[tokio::test]
async fn fail_all_active_only_touches_live_runs() {
    let (repo, session) = setup().await;
    let finished = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create");
    repo.transition(&finished.uid, &[RunStatus::Pending], RunStatus::Running, None)
        .await
        .expect("start");
    repo.transition(&finished.uid, &[RunStatus::Running], RunStatus::Finished, None)
        .await
        .expect("finish");
    let stale = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create");

    let failed = repo.fail_all_active("interrupted").await.expect("fail all");
    assert_eq!(failed, 1);

    let stale = repo.get(1, &stale.uid).await.expect("get").expect("exists");
    assert_eq!(stale.status, RunStatus::Error);
    assert_eq!(stale.error_message.as_deref(), Some("interrupted"));
    let finished = repo.get(1, &finished.uid).await.expect("get").expect("exists");
    assert_eq!(finished.status, RunStatus::Finished);
}

#[tokio::test]
async fn delete_for_session_counts_rows() {
    let (repo, session) = setup().await;
    for _ in 0..3 {
        repo.create(&MigrationRun::new(1, session.uid.clone()))
            .await
            .expect("create");
    }
    assert_eq!(repo.delete_for_session(2, &session.uid).await.expect("delete"), 0);
    assert_eq!(repo.delete_for_session(1, &session.uid).await.expect("delete"), 3);
}

#[tokio::test]
async fn transition_ignores_sources_the_lifecycle_forbids() {
    let (repo, session) = setup().await;
    let run = repo
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("create");

    let moved = repo
        .transition(&run.uid, &[RunStatus::Pending], RunStatus::Finished, None)
        .await
        .expect("transition");

    assert!(!moved, "a pending run cannot finish without running");
    let stored = repo.get(1, &run.uid).await.expect("get").expect("exists");
    assert_eq!(stored.status, RunStatus::Pending);
}
