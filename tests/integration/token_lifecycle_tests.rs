use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cloud_migration::models::run::RunStatus;
use cloud_migration::models::token::{token_hint, DeletePolicy};
use cloud_migration::orchestrator::CallContext;
use cloud_migration::AppError;

use super::test_helpers::{user, Harness};

#[tokio::test]
async fn create_token_exposes_secret_only_once() {
    let h = Harness::new().await;
    let ctx = CallContext::default();

    let created = h.service.create_token(&ctx, 1).await.expect("create token");
    assert!(!created.token.is_empty());
    assert_eq!(created.view.token_hint, token_hint(&created.token));
    assert_eq!(created.view.remote_account_id, "stack-1");

    let view = h.service.get_token(1).await.expect("get token");
    assert_eq!(view, created.view);
    let json = serde_json::to_string(&view).expect("serialize");
    assert!(!json.contains(&created.token), "metadata never carries the secret");
}

#[tokio::test]
async fn get_token_without_token_is_not_found() {
    let h = Harness::new().await;
    let err = h.service.get_token(1).await.expect_err("no token yet");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn second_active_token_conflicts() {
    let h = Harness::new().await;
    let ctx = CallContext::default();
    let first = h.service.create_token(&ctx, 1).await.expect("first token");

    let err = h
        .service
        .create_token(&ctx, 1)
        .await
        .expect_err("one active token per org");
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.gateway.issued.load(Ordering::SeqCst), 1, "no remote call");
    assert_eq!(h.service.get_token(1).await.expect("get").uid, first.view.uid);
}

#[tokio::test]
async fn expired_token_is_replaced() {
    let h = Harness::new().await;
    let ctx = CallContext::default();

    h.gateway.issue_expired.store(true, Ordering::SeqCst);
    let stale = h.service.create_token(&ctx, 1).await.expect("expired token");
    h.gateway.issue_expired.store(false, Ordering::SeqCst);

    let fresh = h.service.create_token(&ctx, 1).await.expect("replacement");
    assert_ne!(fresh.view.uid, stale.view.uid);
    assert_eq!(h.service.get_token(1).await.expect("get").uid, fresh.view.uid);
}

#[tokio::test]
async fn concurrent_creates_yield_one_token() {
    let h = Harness::new().await;
    let (ctx_a, ctx_b) = (CallContext::default(), CallContext::default());

    let (a, b) = tokio::join!(
        h.service.create_token(&ctx_a, 1),
        h.service.create_token(&ctx_b, 1),
    );
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    assert!(matches!(a.err().or(b.err()), Some(AppError::Conflict(_))));
}

#[tokio::test]
async fn issue_failure_stores_nothing() {
    let h = Harness::new().await;
    h.gateway.fail_issue.store(true, Ordering::SeqCst);

    let err = h
        .service
        .create_token(&CallContext::default(), 1)
        .await
        .expect_err("issuer down");
    assert!(err.is_remote());
    assert!(matches!(h.service.get_token(1).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn delete_token_revokes_then_removes() {
    let h = Harness::new().await;
    let ctx = CallContext::default();
    let token = h.service.create_token(&ctx, 1).await.expect("token");

    h.service
        .delete_token(&ctx, 1, &token.view.uid, DeletePolicy::Refuse)
        .await
        .expect("delete");

    assert_eq!(h.gateway.revoked.load(Ordering::SeqCst), 1);
    assert!(matches!(h.service.get_token(1).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn delete_unknown_token_is_not_found_without_remote_call() {
    let h = Harness::new().await;
    let err = h
        .service
        .delete_token(&CallContext::default(), 1, "missing", DeletePolicy::Refuse)
        .await
        .expect_err("unknown token");
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(h.gateway.revoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn delete_token_of_other_org_is_not_found() {
    let h = Harness::new().await;
    let ctx = CallContext::default();
    let token = h.service.create_token(&ctx, 1).await.expect("token");

    let err = h
        .service
        .delete_token(&ctx, 2, &token.view.uid, DeletePolicy::Refuse)
        .await
        .expect_err("foreign token");
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(h.service.get_token(1).await.is_ok());
}

#[tokio::test]
async fn session_outlives_revoked_token_but_cannot_run() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    let ctx = CallContext::default();

    h.service
        .delete_token(&ctx, 1, &session.token_uid, DeletePolicy::Refuse)
        .await
        .expect("delete idle token");

    assert!(h.service.get_session(1, &session.uid).await.is_ok());
    let err = h
        .service
        .run_migration(&ctx, &user(1), &session.uid)
        .await
        .expect_err("token is gone");
    assert!(matches!(err, AppError::InvalidToken(_)));
}

#[tokio::test]
async fn refuse_policy_keeps_token_while_runs_are_active() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();
    let handle = h.start_run(&session).await;
    h.gateway.wait_uploads_started(1).await;

    let err = h
        .service
        .delete_token(
            &CallContext::default(),
            1,
            &session.token_uid,
            DeletePolicy::Refuse,
        )
        .await
        .expect_err("run in progress");
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.gateway.revoked.load(Ordering::SeqCst), 0);
    assert!(h.service.get_token(1).await.is_ok());

    h.gateway.open_gate();
    let status = h.finish_run(handle, 1).await;
    assert_eq!(status.run.status, RunStatus::Finished);
}

#[tokio::test]
async fn cascade_policy_cancels_runs_before_revoking() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    h.gateway.close_gate();
    let handle = h.start_run(&session).await;
    h.gateway.wait_uploads_started(1).await;

    h.service
        .delete_token(
            &CallContext::default(),
            1,
            &session.token_uid,
            DeletePolicy::CascadeCancel,
        )
        .await
        .expect("cascade delete");

    assert_eq!(h.gateway.revoked.load(Ordering::SeqCst), 1);
    assert!(matches!(h.service.get_token(1).await, Err(AppError::NotFound(_))));

    let status = h.finish_run(handle, 1).await;
    assert_eq!(status.run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn run_cannot_start_while_its_token_is_being_deleted() {
    let h = Harness::new().await;
    let session = h.session(1).await;
    *h.gateway.revoke_delay.lock().expect("delay lock") = Some(Duration::from_millis(200));

    let delete = {
        let service = Arc::clone(&h.service);
        let token_uid = session.token_uid.clone();
        tokio::spawn(async move {
            service
                .delete_token(&CallContext::default(), 1, &token_uid, DeletePolicy::Refuse)
                .await
        })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.gateway.revoked.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("revoke started");

    let err = h
        .service
        .run_migration(&CallContext::default(), &user(1), &session.uid)
        .await
        .expect_err("token is going away");
    assert!(matches!(err, AppError::InvalidToken(_)));

    delete.await.expect("join").expect("idle token deleted");
    assert!(matches!(h.service.get_token(1).await, Err(AppError::NotFound(_))));
    assert!(h
        .service
        .get_migration_run_list(1, &session.uid)
        .await
        .expect("runs")
        .is_empty());
}
