use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cloud_migration::models::run::RunStatus;
use cloud_migration::models::snapshot::{CloudMigrationSnapshot, SnapshotState};
use cloud_migration::persistence::snapshot_repo::SnapshotRepo;
use cloud_migration::orchestrator::CallContext;
use cloud_migration::AppError;

use super::test_helpers::{test_config, user, Harness};

#[tokio::test]
async fn run_creates_and_uploads_snapshots_until_finished() {
    let h = Harness::new().await;
    h.producer.set_dashboards(5);
    let session = h.session(1).await;

    let handle = h.start_run(&session).await;
    assert_eq!(handle.session_uid, session.uid);
    let status = h.finish_run(handle, 1).await;

    assert_eq!(status.run.status, RunStatus::Finished);
    assert!(status.run.error_message.is_none());
    assert!(status.run.finished_at.is_some());

    let counts: Vec<u32> = status.snapshots.iter().map(|s| s.resource_count).collect();
    assert_eq!(counts, vec![2, 2, 1], "batched by max_resources_per_snapshot");
    assert!(status
        .snapshots
        .iter()
        .all(|s| s.state == SnapshotState::Finished && s.run_uid == status.run.uid));
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 3);
    assert_eq!(
        status.latest_snapshot().map(|s| s.uid.clone()),
        status.snapshots.last().map(|s| s.uid.clone())
    );
}

#[tokio::test]
async fn run_is_running_when_started() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();

    let handle = h.start_run(&session).await;
    let status = h
        .service
        .get_migration_status(&CallContext::default(), 1, &handle.run_uid)
        .await
        .expect("status");
    assert_eq!(status.run.status, RunStatus::Running);

    h.gateway.open_gate();
    assert_eq!(h.finish_run(handle, 1).await.run.status, RunStatus::Finished);
}

#[tokio::test]
async fn empty_export_still_produces_one_snapshot() {
    let h = Harness::new().await;
    h.producer.set_dashboards(0);
    let session = h.session(1).await;

    let status = h.finish_run(h.start_run(&session).await, 1).await;

    assert_eq!(status.run.status, RunStatus::Finished);
    assert_eq!(status.snapshots.len(), 1);
    assert_eq!(status.snapshots[0].resource_count, 0);
}

#[tokio::test]
async fn failing_snapshot_fails_the_run() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.fail_upload_nth.store(2, Ordering::SeqCst);

    let status = h.finish_run(h.start_run(&session).await, 1).await;

    assert_eq!(status.run.status, RunStatus::Error);
    assert!(status
        .run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("remote rejected snapshot")));
    let states: Vec<SnapshotState> = status.snapshots.iter().map(|s| s.state).collect();
    assert_eq!(states, vec![SnapshotState::Finished, SnapshotState::Error]);
}

#[tokio::test]
async fn enumeration_failure_fails_the_run() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.producer.fail.store(true, Ordering::SeqCst);

    let status = h.finish_run(h.start_run(&session).await, 1).await;

    assert_eq!(status.run.status, RunStatus::Error);
    assert_eq!(status.snapshots.len(), 1);
    assert_eq!(status.snapshots[0].state, SnapshotState::Error);
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_token_records_a_failed_run() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.reject_tokens.store(true, Ordering::SeqCst);

    let err = h
        .service
        .run_migration(&CallContext::default(), &user(1), &session.uid)
        .await
        .expect_err("token rejected");
    assert!(matches!(err, AppError::InvalidToken(_)));

    let runs = h
        .service
        .get_migration_run_list(1, &session.uid)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert!(runs[0].error_message.is_some());
    assert_eq!(h.producer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_run_on_busy_session_conflicts() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();
    let handle = h.start_run(&session).await;

    let err = h
        .service
        .run_migration(&CallContext::default(), &user(1), &session.uid)
        .await
        .expect_err("session busy");
    assert!(matches!(err, AppError::Conflict(_)));

    h.gateway.open_gate();
    h.finish_run(handle, 1).await;

    let again = h.start_run(&session).await;
    assert_eq!(h.finish_run(again, 1).await.run.status, RunStatus::Finished);

    let runs = h
        .service
        .get_migration_run_list(1, &session.uid)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn concurrent_runs_allowed_when_configured() {
    let mut config = test_config(2, 3600);
    config.run.allow_concurrent_runs = true;
    let h = Harness::with_config(&config).await;
    let session = h.session(1).await;

    let a = h.start_run(&session).await;
    let b = h.start_run(&session).await;
    assert_ne!(a.run_uid, b.run_uid);

    assert_eq!(h.finish_run(a, 1).await.run.status, RunStatus::Finished);
    assert_eq!(h.finish_run(b, 1).await.run.status, RunStatus::Finished);
}

#[tokio::test]
async fn run_deadline_fails_the_run() {
    let h = Harness::with_config(&test_config(2, 1)).await;
    let session = h.session(1).await;
    h.gateway.close_gate();

    let status = h.finish_run(h.start_run(&session).await, 1).await;

    assert_eq!(status.run.status, RunStatus::Error);
    assert!(status
        .run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("deadline exceeded")));
    assert!(status
        .snapshots
        .iter()
        .all(|s| s.state == SnapshotState::Error));
}

#[tokio::test]
async fn unknown_session_cannot_run() {
    let h = Harness::new().await;
    let err = h
        .service
        .run_migration(&CallContext::default(), &user(1), "missing")
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn shutdown_interrupts_in_flight_runs() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();
    let handle = h.start_run(&session).await;
    h.gateway.wait_uploads_started(1).await;

    assert_eq!(h.service.runs().in_flight(), 1);
    assert!(h.service.shutdown(Duration::from_secs(2)).await);
    assert_eq!(h.service.runs().in_flight(), 0);

    let status = h.finish_run(handle, 1).await;
    assert_eq!(status.run.status, RunStatus::Error);
    assert!(status
        .snapshots
        .iter()
        .all(|s| s.state == SnapshotState::Error));
}

#[tokio::test]
async fn snapshot_added_to_a_live_run_is_uploaded_too() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();
    let handle = h.start_run(&session).await;
    h.gateway.wait_uploads_started(1).await;

    let extra = h
        .service
        .create_snapshot(&CallContext::default(), &user(1), &session.uid, &handle.run_uid)
        .await
        .expect("extra snapshot");
    h.gateway.open_gate();
    let status = h.finish_run(handle, 1).await;

    assert_eq!(status.run.status, RunStatus::Finished);
    assert_eq!(status.snapshots.len(), 3);
    assert!(status.snapshots.iter().any(|s| s.uid == extra.uid));
    assert!(status
        .snapshots
        .iter()
        .all(|s| s.state == SnapshotState::Finished));
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unpackaged_snapshot_fails_the_run_with_a_reason() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();
    let handle = h.start_run(&session).await;
    h.gateway.wait_uploads_started(1).await;

    let stray = SnapshotRepo::new(Arc::clone(&h.db))
        .create(&CloudMigrationSnapshot::new(
            1,
            session.uid.clone(),
            handle.run_uid.clone(),
        ))
        .await
        .expect("stray snapshot");
    h.gateway.open_gate();
    let status = h.finish_run(handle, 1).await;

    assert_eq!(status.run.status, RunStatus::Error);
    assert!(status.run.error_message.is_some());
    let stored = status
        .snapshots
        .iter()
        .find(|s| s.uid == stray.uid)
        .expect("stray listed");
    assert_eq!(stored.state, SnapshotState::Error);
    assert!(stored.error_message.is_some());
    assert!(status.snapshots.iter().all(|s| s.state.is_terminal()));
}
