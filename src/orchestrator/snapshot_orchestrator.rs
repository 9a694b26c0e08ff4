//! Snapshot lifecycle: create, upload, cancel, inspect.
//!
//! State machine: `Init → Creating → PendingUpload → Uploading → Finished`,
//! with `Error` and `Cancelled` reachable from every non-terminal state.
//! Each transition is a guarded update, so a cancel racing an upload
//! leaves exactly one winner.
//!
//! Uploads run in a spawned task registered in an in-flight table keyed by
//! snapshot uid. A second `upload_snapshot` on the same snapshot joins the
//! running upload instead of sending the payload again; an `Uploading`
//! snapshot with no registered task (e.g. after a restart) is re-sent
//! under its original idempotency key so the remote side can deduplicate.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SnapshotConfig;
use crate::gateway::{chunked_stream, RemoteGateway};
use crate::models::resource::MigrationResource;
use crate::models::session::CloudMigrationSession;
use crate::models::snapshot::{
    CloudMigrationSnapshot, GetSnapshotsQuery, ListSnapshotsQuery, SnapshotState,
};
use crate::models::user::SignedInUser;
use crate::persistence::db::Database;
use crate::persistence::snapshot_repo::SnapshotRepo;
use crate::resources::ResourceProducer;
use crate::{AppError, Result};

use super::context::CallContext;
use super::session_manager::SessionManager;

type UploadOutcome = Option<Result<()>>;

struct InFlightUpload {
    cancel: CancellationToken,
    done: watch::Receiver<UploadOutcome>,
}

type InFlightTable = Arc<Mutex<HashMap<String, InFlightUpload>>>;

/// Owns migration snapshots.
pub struct SnapshotOrchestrator {
    repo: SnapshotRepo,
    sessions: Arc<SessionManager>,
    gateway: Arc<dyn RemoteGateway>,
    producer: Arc<dyn ResourceProducer>,
    settings: SnapshotConfig,
    uploads: InFlightTable,
}

impl SnapshotOrchestrator {
    /// Create an orchestrator over its collaborators.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        sessions: Arc<SessionManager>,
        gateway: Arc<dyn RemoteGateway>,
        producer: Arc<dyn ResourceProducer>,
        settings: SnapshotConfig,
    ) -> Self {
        Self {
            repo: SnapshotRepo::new(db),
            sessions,
            gateway,
            producer,
            settings,
            uploads: Arc::default(),
        }
    }

    /// Enumerate the organization's resources into one snapshot of `run_uid`.
    ///
    /// Moves the snapshot `Init → Creating → PendingUpload` and records
    /// `resource_count`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not in the user's
    /// organization, `AppError::InvalidToken` if the session's token fails
    /// validation, or the enumeration error (the snapshot is then `Error`).
    pub async fn create_snapshot(
        &self,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
        run_uid: &str,
    ) -> Result<CloudMigrationSnapshot> {
        let mut created = self
            .create_snapshots_sized(ctx, user, session_uid, run_uid, usize::MAX)
            .await?;
        created
            .pop()
            .ok_or_else(|| AppError::Db("snapshot creation produced no snapshot".into()))
    }

    /// Like [`SnapshotOrchestrator::create_snapshot`], but splits the
    /// resources into snapshots of at most `max_resources_per_snapshot`.
    ///
    /// Always produces at least one snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`SnapshotOrchestrator::create_snapshot`].
    pub async fn create_snapshots(
        &self,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
        run_uid: &str,
    ) -> Result<Vec<CloudMigrationSnapshot>> {
        let batch = self.settings.max_resources_per_snapshot;
        self.create_snapshots_sized(ctx, user, session_uid, run_uid, batch)
            .await
    }

    async fn create_snapshots_sized(
        &self,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
        run_uid: &str,
        batch_size: usize,
    ) -> Result<Vec<CloudMigrationSnapshot>> {
        let span = info_span!("create_snapshot", org_id = user.org_id, session_uid, run_uid);
        async move {
            let session = self.sessions.get_session(user.org_id, session_uid).await?;
            self.sessions.tokens().validate_token(ctx, &session).await?;

            // ── First snapshot row exists before enumeration ─
            let first = self.open_snapshot(&session, run_uid).await?;

            let resources = match ctx
                .guard("enumerate resources", self.producer.collect(user))
                .await
            {
                Ok(resources) => resources,
                Err(err) => return Err(self.fail(&first.uid, err).await),
            };
            info!(resource_count = resources.len(), login = %user.login, "resources enumerated");

            // ── Package one snapshot per batch ───────────────
            let batches: Vec<&[MigrationResource]> = if resources.is_empty() {
                vec![&[]]
            } else {
                resources.chunks(batch_size.max(1)).collect()
            };

            let mut created = Vec::with_capacity(batches.len());
            for (index, batch) in batches.into_iter().enumerate() {
                let snapshot = if index == 0 {
                    first.clone()
                } else {
                    self.open_snapshot(&session, run_uid).await?
                };
                created.push(self.package(&session, snapshot, batch).await?);
            }

            Ok(created)
        }
        .instrument(span)
        .await
    }

    /// Insert an `Init` row and move it to `Creating`.
    async fn open_snapshot(
        &self,
        session: &CloudMigrationSession,
        run_uid: &str,
    ) -> Result<CloudMigrationSnapshot> {
        let mut snapshot =
            CloudMigrationSnapshot::new(session.org_id, session.uid.clone(), run_uid.to_owned());
        self.repo.create(&snapshot).await?;
        if !self
            .repo
            .transition(&snapshot.uid, &[SnapshotState::Init], SnapshotState::Creating)
            .await?
        {
            return Err(self.conflict_for(&snapshot, "start creating").await);
        }
        snapshot.state = SnapshotState::Creating;
        Ok(snapshot)
    }

    async fn package(
        &self,
        session: &CloudMigrationSession,
        snapshot: CloudMigrationSnapshot,
        batch: &[MigrationResource],
    ) -> Result<CloudMigrationSnapshot> {
        let packaged = serde_json::to_vec(batch)
            .map_err(AppError::from)
            .and_then(|payload| {
                u32::try_from(batch.len())
                    .map(|count| (payload, count))
                    .map_err(|_| AppError::Validation("too many resources in one snapshot".into()))
            });
        let (payload, count) = match packaged {
            Ok(parts) => parts,
            Err(err) => return Err(self.fail(&snapshot.uid, err).await),
        };

        let key = upload_key(&session.uid, &snapshot.uid, &payload);
        if !self
            .repo
            .mark_packaged(&snapshot.uid, count, &key, &payload)
            .await?
        {
            return Err(self.conflict_for(&snapshot, "finish creating").await);
        }

        info!(snapshot_uid = %snapshot.uid, resource_count = count, "snapshot packaged");
        self.repo
            .get(session.org_id, &session.uid, &snapshot.uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("snapshot {} not found", snapshot.uid)))
    }

    /// Stream a packaged snapshot to the remote side.
    ///
    /// `PendingUpload → Uploading → Finished`, or `Error` on failure.
    /// Calling again while an upload is in flight waits for that upload
    /// and returns its outcome; calling on a `Finished` snapshot is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown snapshots, `AppError::Conflict`
    /// if the snapshot is not uploadable, `AppError::Cancelled` if it was
    /// cancelled before or during the upload, or `AppError::Remote` if the
    /// upload failed.
    pub async fn upload_snapshot(
        &self,
        ctx: &CallContext,
        org_id: i64,
        session_uid: &str,
        snapshot_uid: &str,
    ) -> Result<()> {
        let span = info_span!("upload_snapshot", org_id, session_uid, snapshot_uid);
        async move {
            self.sessions.get_session(org_id, session_uid).await?;

            let mut uploads = self.uploads.lock().await;

            // ── Join an upload already in flight ─────────────
            if let Some(inflight) = uploads.get(snapshot_uid) {
                let done = inflight.done.clone();
                drop(uploads);
                info!("joining in-flight upload");
                return ctx.guard("await in-flight upload", wait_outcome(done)).await;
            }

            let snapshot = self.load(org_id, session_uid, snapshot_uid).await?;
            match snapshot.state {
                SnapshotState::Finished => {
                    info!("snapshot already uploaded");
                    return Ok(());
                }
                SnapshotState::PendingUpload => {
                    if !self
                        .repo
                        .transition(
                            snapshot_uid,
                            &[SnapshotState::PendingUpload],
                            SnapshotState::Uploading,
                        )
                        .await?
                    {
                        return Err(self.conflict_for(&snapshot, "start upload").await);
                    }
                }
                SnapshotState::Uploading => {
                    warn!("resuming orphaned upload with its original idempotency key");
                }
                SnapshotState::Cancelled => {
                    return Err(AppError::Cancelled(format!(
                        "snapshot {snapshot_uid} was cancelled before upload"
                    )));
                }
                other => {
                    return Err(AppError::Conflict(format!(
                        "snapshot {snapshot_uid} is {other:?} and cannot be uploaded"
                    )));
                }
            }

            let Some(key) = snapshot.upload_key.clone() else {
                let err = AppError::Db(format!("snapshot {snapshot_uid} has no upload key"));
                return Err(self.fail(snapshot_uid, err).await);
            };

            // ── Register and spawn the upload task ───────────
            let cancel = CancellationToken::new();
            let (tx, done) = watch::channel(None);
            uploads.insert(
                snapshot_uid.to_owned(),
                InFlightUpload {
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
            drop(uploads);

            let job = UploadJob {
                repo: self.repo.clone(),
                gateway: Arc::clone(&self.gateway),
                chunk_size: self.settings.upload_chunk_bytes,
                session_uid: session_uid.to_owned(),
                snapshot_uid: snapshot_uid.to_owned(),
                key,
            };
            let table = Arc::clone(&self.uploads);
            let task_ctx = ctx.clone();
            tokio::spawn(
                async move {
                    let outcome = job.run(&task_ctx, &cancel).await;
                    table.lock().await.remove(&job.snapshot_uid);
                    tx.send_replace(Some(outcome));
                }
                .instrument(info_span!("upload_task", snapshot_uid)),
            );

            wait_outcome(done).await
        }
        .instrument(span)
        .await
    }

    /// Cancel a snapshot that has not reached a terminal state.
    ///
    /// An in-flight upload is signalled and stops at its next chance;
    /// whatever the remote side kept is reconciled on the next status poll.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown snapshots and
    /// `AppError::Conflict` for terminal ones (state left unchanged).
    pub async fn cancel_snapshot(
        &self,
        org_id: i64,
        session_uid: &str,
        snapshot_uid: &str,
    ) -> Result<()> {
        let span = info_span!("cancel_snapshot", org_id, session_uid, snapshot_uid);
        async move {
            self.sessions.get_session(org_id, session_uid).await?;

            if !self.repo.cancel(org_id, session_uid, snapshot_uid).await? {
                let snapshot = self.load(org_id, session_uid, snapshot_uid).await?;
                return Err(AppError::Conflict(format!(
                    "snapshot {snapshot_uid} is already {:?}",
                    snapshot.state
                )));
            }

            if let Some(inflight) = self.uploads.lock().await.get(snapshot_uid) {
                inflight.cancel.cancel();
                info!("signalled in-flight upload to stop");
            }

            info!("snapshot cancelled");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Retrieve one snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent or outside the organization.
    pub async fn get_snapshot(&self, query: &GetSnapshotsQuery) -> Result<CloudMigrationSnapshot> {
        self.load(query.org_id, &query.session_uid, &query.snapshot_uid)
            .await
    }

    /// List snapshots of a session, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_snapshot_list(
        &self,
        query: &ListSnapshotsQuery,
    ) -> Result<Vec<CloudMigrationSnapshot>> {
        self.repo.list(query).await
    }

    /// All snapshots of a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn snapshots_for_run(
        &self,
        org_id: i64,
        run_uid: &str,
    ) -> Result<Vec<CloudMigrationSnapshot>> {
        self.repo.list_for_run(org_id, run_uid).await
    }

    /// Stop every non-terminal snapshot of a run.
    ///
    /// With `cancel` set they become `Cancelled`, otherwise `Error` with `reason`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if an update fails.
    pub async fn stop_run_snapshots(
        &self,
        org_id: i64,
        run_uid: &str,
        cancel: bool,
        reason: &str,
    ) -> Result<()> {
        for snapshot in self.repo.list_for_run(org_id, run_uid).await? {
            if snapshot.state.is_terminal() {
                continue;
            }
            if cancel {
                match self
                    .cancel_snapshot(org_id, &snapshot.session_uid, &snapshot.uid)
                    .await
                {
                    Ok(()) | Err(AppError::Conflict(_)) => {}
                    Err(err) => return Err(err),
                }
            } else {
                self.repo.mark_error(&snapshot.uid, reason).await?;
            }
        }
        Ok(())
    }

    /// Clear reconciliation flags on a run's snapshots.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn clear_reconcile(&self, run_uid: &str) -> Result<()> {
        self.repo.clear_reconcile_for_run(run_uid).await
    }

    /// Delete every snapshot of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, org_id: i64, session_uid: &str) -> Result<u64> {
        self.repo.delete_for_session(org_id, session_uid).await
    }

    /// Fail every snapshot left in progress by a previous process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn recover_interrupted(&self, reason: &str) -> Result<u64> {
        self.repo.fail_all_in_progress(reason).await
    }

    async fn load(
        &self,
        org_id: i64,
        session_uid: &str,
        snapshot_uid: &str,
    ) -> Result<CloudMigrationSnapshot> {
        self.repo
            .get(org_id, session_uid, snapshot_uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("snapshot {snapshot_uid} not found")))
    }

    /// Mark a snapshot `Error` and hand back the error that caused it.
    async fn fail(&self, uid: &str, err: AppError) -> AppError {
        if let Err(db_err) = self.repo.mark_error(uid, &err.to_string()).await {
            warn!(%db_err, snapshot_uid = uid, "failed to record snapshot error");
        }
        err
    }

    /// Build the error for a guarded transition that lost a race.
    ///
    /// Losing to a cancel yields `AppError::Cancelled`; anything else is a conflict.
    async fn conflict_for(&self, snapshot: &CloudMigrationSnapshot, action: &str) -> AppError {
        let current = self
            .repo
            .get(snapshot.org_id, &snapshot.session_uid, &snapshot.uid)
            .await
            .ok()
            .flatten()
            .map(|s| s.state);
        match current {
            Some(SnapshotState::Cancelled) => AppError::Cancelled(format!(
                "snapshot {} was cancelled before it could {action}",
                snapshot.uid
            )),
            Some(state) => AppError::Conflict(format!(
                "cannot {action} for snapshot {}: state is {state:?}",
                snapshot.uid
            )),
            None => AppError::Conflict(format!(
                "cannot {action} for snapshot {}: state is gone",
                snapshot.uid
            )),
        }
    }
}

/// Everything the detached upload task needs.
struct UploadJob {
    repo: SnapshotRepo,
    gateway: Arc<dyn RemoteGateway>,
    chunk_size: usize,
    session_uid: String,
    snapshot_uid: String,
    key: String,
}

enum UploadEnd {
    Cancelled,
    Done(Result<()>),
}

impl UploadJob {
    async fn run(&self, ctx: &CallContext, cancel: &CancellationToken) -> Result<()> {
        let payload = match self.repo.load_payload(&self.snapshot_uid).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                return Err(self
                    .fail(AppError::Db(format!(
                        "snapshot {} has no stored payload",
                        self.snapshot_uid
                    )))
                    .await);
            }
            Err(err) => return Err(self.fail(err).await),
        };
        let bytes = payload.len();
        let data = chunked_stream(payload, self.chunk_size);

        // Cancellation is polled whenever the transport yields, i.e. between chunks.
        let end = tokio::select! {
            biased;
            () = cancel.cancelled() => UploadEnd::Cancelled,
            res = ctx.guard(
                "upload snapshot",
                self.gateway.accept_snapshot(&self.session_uid, &self.snapshot_uid, data, &self.key),
            ) => UploadEnd::Done(res),
        };

        match end {
            UploadEnd::Cancelled => {
                self.abort_remote(ctx).await;
                Err(AppError::Cancelled(format!(
                    "snapshot {} was cancelled during upload",
                    self.snapshot_uid
                )))
            }
            UploadEnd::Done(Ok(())) => {
                if self
                    .repo
                    .transition(
                        &self.snapshot_uid,
                        &[SnapshotState::Uploading],
                        SnapshotState::Finished,
                    )
                    .await?
                {
                    info!(bytes, "snapshot upload acknowledged");
                    Ok(())
                } else {
                    // Cancelled locally after the remote side already took the data.
                    self.repo.flag_reconcile(&self.snapshot_uid).await?;
                    Err(AppError::Cancelled(format!(
                        "snapshot {} was cancelled during upload",
                        self.snapshot_uid
                    )))
                }
            }
            UploadEnd::Done(Err(err)) => {
                warn!(%err, "snapshot upload failed");
                Err(self.fail(err).await)
            }
        }
    }

    async fn abort_remote(&self, ctx: &CallContext) {
        let abort = self
            .gateway
            .abort_snapshot(&self.session_uid, &self.snapshot_uid, &self.key);
        match ctx.guard("abort upload", abort).await {
            Ok(true) => info!("remote upload aborted"),
            Ok(false) => info!("transport cannot abort uploads; remote state reconciled on next poll"),
            Err(err) => warn!(%err, "remote abort failed; remote state reconciled on next poll"),
        }
    }

    async fn fail(&self, err: AppError) -> AppError {
        if let Err(db_err) = self.repo.mark_error(&self.snapshot_uid, &err.to_string()).await {
            warn!(%db_err, "failed to record snapshot error");
        }
        err
    }
}

async fn wait_outcome(mut done: watch::Receiver<UploadOutcome>) -> Result<()> {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => outcome
            .clone()
            .unwrap_or_else(|| Err(AppError::Remote("upload ended without an outcome".into()))),
        Err(_) => Err(AppError::Remote(
            "upload task ended without reporting an outcome".into(),
        )),
    }
}

/// Idempotency key for a packaged snapshot: SHA-256 over session, snapshot and payload.
#[must_use]
pub fn upload_key(session_uid: &str, snapshot_uid: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_uid.as_bytes());
    hasher.update([0u8]);
    hasher.update(snapshot_uid.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}
