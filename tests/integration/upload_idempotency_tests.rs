//! Concurrent and repeated uploads of one snapshot reach the remote side once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cloud_migration::models::run::{MigrationRun, RunStatus};
use cloud_migration::models::snapshot::{CloudMigrationSnapshot, GetSnapshotsQuery, SnapshotState};
use cloud_migration::orchestrator::CallContext;
use cloud_migration::persistence::run_repo::RunRepo;
use cloud_migration::persistence::snapshot_repo::SnapshotRepo;

use super::test_helpers::{user, Harness};

async fn packaged_snapshot(h: &Harness) -> CloudMigrationSnapshot {
    let session = h.session(1).await;
    let runs = RunRepo::new(Arc::clone(&h.db));
    let run = runs
        .create(&MigrationRun::new(1, session.uid.clone()))
        .await
        .expect("run");
    runs.transition(&run.uid, &[RunStatus::Pending], RunStatus::Running, None)
        .await
        .expect("start");
    h.service
        .create_snapshot(&CallContext::default(), &user(1), &session.uid, &run.uid)
        .await
        .expect("snapshot")
}

#[tokio::test]
async fn concurrent_uploads_share_one_transfer() {
    let h = Harness::new().await;
    let snapshot = packaged_snapshot(&h).await;
    h.gateway.close_gate();

    let first = {
        let service = Arc::clone(&h.service);
        let (session, uid) = (snapshot.session_uid.clone(), snapshot.uid.clone());
        tokio::spawn(async move {
            service
                .upload_snapshot(&CallContext::default(), 1, &session, &uid)
                .await
        })
    };
    h.gateway.wait_uploads_started(1).await;

    let second = {
        let service = Arc::clone(&h.service);
        let (session, uid) = (snapshot.session_uid.clone(), snapshot.uid.clone());
        tokio::spawn(async move {
            service
                .upload_snapshot(&CallContext::default(), 1, &session, &uid)
                .await
        })
    };
    tokio::task::yield_now().await;
    h.gateway.open_gate();

    first.await.expect("join").expect("first upload");
    second.await.expect("join").expect("second upload");
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn joined_caller_sees_the_shared_failure() {
    let h = Harness::new().await;
    let snapshot = packaged_snapshot(&h).await;
    h.gateway.fail_upload_nth.store(1, Ordering::SeqCst);
    h.gateway.close_gate();

    let first = {
        let service = Arc::clone(&h.service);
        let (session, uid) = (snapshot.session_uid.clone(), snapshot.uid.clone());
        tokio::spawn(async move {
            service
                .upload_snapshot(&CallContext::default(), 1, &session, &uid)
                .await
        })
    };
    h.gateway.wait_uploads_started(1).await;

    let joined = {
        let service = Arc::clone(&h.service);
        let (session, uid) = (snapshot.session_uid.clone(), snapshot.uid.clone());
        tokio::spawn(async move {
            service
                .upload_snapshot(&CallContext::default(), 1, &session, &uid)
                .await
        })
    };
    tokio::task::yield_now().await;
    h.gateway.open_gate();

    let a = first.await.expect("join").expect_err("upload fails");
    assert!(a.is_remote());
    // The second caller either joined the failing upload or arrived after it
    // settled; both observe a failure and nothing is re-sent.
    joined.await.expect("join").expect_err("no second transfer");
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_caller_does_not_abandon_the_upload() {
    let h = Harness::new().await;
    let snapshot = packaged_snapshot(&h).await;
    h.gateway.close_gate();

    let caller = {
        let service = Arc::clone(&h.service);
        let (session, uid) = (snapshot.session_uid.clone(), snapshot.uid.clone());
        tokio::spawn(async move {
            service
                .upload_snapshot(&CallContext::default(), 1, &session, &uid)
                .await
        })
    };
    h.gateway.wait_uploads_started(1).await;
    caller.abort();
    let _ = caller.await;

    h.gateway.open_gate();
    // A fresh call joins the still-running transfer or sees it finished.
    h.service
        .upload_snapshot(&CallContext::default(), 1, &snapshot.session_uid, &snapshot.uid)
        .await
        .expect("upload completes");

    let stored = h
        .service
        .get_snapshot(&GetSnapshotsQuery {
            org_id: 1,
            session_uid: snapshot.session_uid.clone(),
            snapshot_uid: snapshot.uid.clone(),
        })
        .await
        .expect("get");
    assert_eq!(stored.state, SnapshotState::Finished);
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn orphaned_upload_is_resent_under_the_same_key() {
    let h = Harness::new().await;
    let snapshot = packaged_snapshot(&h).await;

    // Simulate a process that died mid-upload: the row is `Uploading` but
    // no task owns it.
    SnapshotRepo::new(Arc::clone(&h.db))
        .transition(
            &snapshot.uid,
            &[SnapshotState::PendingUpload],
            SnapshotState::Uploading,
        )
        .await
        .expect("mark uploading");

    h.service
        .upload_snapshot(&CallContext::default(), 1, &snapshot.session_uid, &snapshot.uid)
        .await
        .expect("resumed upload");

    let key = snapshot.upload_key.expect("key");
    assert!(!h.gateway.received(&key).is_empty());
    assert_eq!(h.gateway.accepted.load(Ordering::SeqCst), 1);
}
