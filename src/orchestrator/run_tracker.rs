//! Migration run lifecycle and background execution.
//!
//! `run_migration` records a `Pending` run, re-validates the session's
//! token, moves the run to `Running` and spawns a detached task that
//! creates and uploads the run's snapshots. Callers observe progress only
//! by polling [`RunTracker::get_migration_status`]; the persisted run row
//! is the durable record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::RunConfig;
use crate::gateway::RemoteGateway;
use crate::models::run::{resolve_run_status, MigrationRun, MigrationStatus, RunHandle, RunStatus};
use crate::models::snapshot::SnapshotState;
use crate::models::user::SignedInUser;
use crate::persistence::db::Database;
use crate::persistence::run_repo::RunRepo;
use crate::{AppError, Result};

use super::context::CallContext;
use super::session_manager::SessionManager;
use super::snapshot_orchestrator::SnapshotOrchestrator;

/// In-memory control for a run whose task is alive.
#[derive(Clone)]
struct RunControl {
    /// Fired by `cancel_run`.
    cancel: CancellationToken,
    /// Fired by the task once the run row is terminal.
    settled: CancellationToken,
}

/// Owns migration runs and their background tasks.
pub struct RunTracker {
    repo: RunRepo,
    sessions: Arc<SessionManager>,
    snapshots: Arc<SnapshotOrchestrator>,
    gateway: Arc<dyn RemoteGateway>,
    settings: RunConfig,
    /// Parent of every run context; cancelled on shutdown.
    root: CallContext,
    tasks: TaskTracker,
    active: Mutex<HashMap<String, RunControl>>,
}

impl RunTracker {
    /// Create a run tracker over its collaborators.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        sessions: Arc<SessionManager>,
        snapshots: Arc<SnapshotOrchestrator>,
        gateway: Arc<dyn RemoteGateway>,
        settings: RunConfig,
    ) -> Self {
        Self {
            repo: RunRepo::new(db),
            sessions,
            snapshots,
            gateway,
            settings,
            root: CallContext::default(),
            tasks: TaskTracker::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a migration run and return without waiting for it.
    ///
    /// The run is `Running` when this returns; the spawned task moves it to
    /// `Finished`, `Error` or `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not in the user's
    /// organization, `AppError::Conflict` if the session already has a run
    /// in progress and concurrent runs are disabled, or
    /// `AppError::InvalidToken` / `AppError::Remote` if re-validation fails
    /// (the run is then recorded as `Error`).
    pub async fn run_migration(
        self: &Arc<Self>,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
    ) -> Result<RunHandle> {
        let org_id = user.org_id;
        let span = info_span!("run_migration", org_id, session_uid);
        async move {
            let session = self.sessions.get_session(org_id, session_uid).await?;

            // ── Record the run under the session and token locks ─
            let run = {
                let _session_guard = self.sessions.lock_session(session_uid).await;
                let tokens = self.sessions.tokens();
                let _token_guard = tokens.lock_token(&session.token_uid).await;
                if !tokens.token_exists(org_id, &session.token_uid).await? {
                    return Err(AppError::InvalidToken(format!(
                        "token {} of session {session_uid} no longer exists",
                        session.token_uid
                    )));
                }
                if !self.settings.allow_concurrent_runs
                    && !self
                        .repo
                        .list_active_for_session(org_id, session_uid)
                        .await?
                        .is_empty()
                {
                    return Err(AppError::Conflict(format!(
                        "session {session_uid} already has a run in progress"
                    )));
                }
                self.repo
                    .create(&MigrationRun::new(org_id, session_uid.to_owned()))
                    .await?
            };
            info!(run_uid = %run.uid, "migration run created");

            // ── Re-validate before doing any work ────────────
            if let Err(err) = self.sessions.tokens().validate_token(ctx, &session).await {
                self.repo
                    .transition(
                        &run.uid,
                        &[RunStatus::Pending],
                        RunStatus::Error,
                        Some(&err.to_string()),
                    )
                    .await?;
                warn!(run_uid = %run.uid, %err, "run failed token validation");
                return Err(err);
            }

            if !self
                .repo
                .transition(&run.uid, &[RunStatus::Pending], RunStatus::Running, None)
                .await?
            {
                return Err(AppError::Conflict(format!(
                    "run {} left pending before it could start",
                    run.uid
                )));
            }

            // ── Detach the run ───────────────────────────────
            let control = RunControl {
                cancel: CancellationToken::new(),
                settled: CancellationToken::new(),
            };
            self.live_controls().insert(run.uid.clone(), control.clone());

            let run_ctx = self
                .root
                .child(Some(Duration::from_secs(self.settings.timeout_seconds)));
            let this = Arc::clone(self);
            let task_user = user.clone();
            let task_session = session_uid.to_owned();
            let task_run = run.uid.clone();
            let task = self.tasks.spawn(
                async move {
                    this.execute(&run_ctx, &control, &task_user, &task_session, &task_run)
                        .await;
                }
                .instrument(info_span!("migration_run", org_id, run_uid = %run.uid)),
            );

            info!(run_uid = %run.uid, "migration run started");
            Ok(RunHandle {
                run_uid: run.uid,
                session_uid: session_uid.to_owned(),
                task,
            })
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        control: &RunControl,
        user: &SignedInUser,
        session_uid: &str,
        run_uid: &str,
    ) {
        let outcome = tokio::select! {
            biased;
            () = control.cancel.cancelled() => Err(AppError::Cancelled(format!("run {run_uid} cancelled"))),
            res = self.drive(ctx, user, session_uid, run_uid) => res,
        };

        // An explicit snapshot or run cancel ends the run `Cancelled`;
        // shutdown and deadlines end it in `Error`.
        let cancelled = control.cancel.is_cancelled()
            || (matches!(outcome, Err(AppError::Cancelled(_))) && !ctx.is_cancelled());

        if let Err(err) = self.finish(user.org_id, run_uid, outcome, cancelled).await {
            error!(%err, run_uid, "failed to record run outcome");
        }

        self.live_controls().remove(run_uid);
        control.settled.cancel();
    }

    async fn drive(
        &self,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
        run_uid: &str,
    ) -> Result<()> {
        let created = self
            .snapshots
            .create_snapshots(ctx, user, session_uid, run_uid)
            .await?;
        info!(snapshot_count = created.len(), "run snapshots created");

        // Re-read the run's snapshots each round so ones added while the run
        // is live get uploaded too, and a cancelled or failed sibling stops it.
        loop {
            if ctx.is_cancelled() {
                return Err(AppError::Cancelled(format!("run {run_uid} interrupted")));
            }
            let snapshots = self.snapshots.snapshots_for_run(user.org_id, run_uid).await?;
            if let Some(cancelled) = snapshots
                .iter()
                .find(|s| s.state == SnapshotState::Cancelled)
            {
                return Err(AppError::Cancelled(format!(
                    "snapshot {} of run {run_uid} was cancelled",
                    cancelled.uid
                )));
            }
            if snapshots.iter().any(|s| s.state == SnapshotState::Error) {
                warn!("a run snapshot failed; skipping the rest");
                return Ok(());
            }
            let Some(next) = snapshots.iter().find(|s| {
                matches!(s.state, SnapshotState::PendingUpload | SnapshotState::Uploading)
            }) else {
                return Ok(());
            };
            self.snapshots
                .upload_snapshot(ctx, user.org_id, session_uid, &next.uid)
                .await?;
        }
    }

    /// Settle leftover snapshots and write the run's terminal status.
    async fn finish(
        &self,
        org_id: i64,
        run_uid: &str,
        outcome: Result<()>,
        cancelled: bool,
    ) -> Result<()> {
        match &outcome {
            Err(err) => {
                self.snapshots
                    .stop_run_snapshots(org_id, run_uid, cancelled, &err.to_string())
                    .await?;
            }
            // Snapshots the run did not upload end in `Error`.
            Ok(()) => {
                self.snapshots
                    .stop_run_snapshots(
                        org_id,
                        run_uid,
                        false,
                        "run ended before the snapshot was uploaded",
                    )
                    .await?;
            }
        }

        let snapshots = self.snapshots.snapshots_for_run(org_id, run_uid).await?;
        let states: Vec<SnapshotState> = snapshots.iter().map(|s| s.state).collect();
        let status = if states.is_empty() && cancelled {
            RunStatus::Cancelled
        } else {
            resolve_run_status(&states)
        };

        let message = match (&outcome, status) {
            (_, RunStatus::Finished) => None,
            (Err(err), _) => Some(err.to_string()),
            (Ok(()), _) => snapshots.iter().find_map(|s| s.error_message.clone()),
        };

        if self
            .repo
            .transition(
                run_uid,
                &[RunStatus::Pending, RunStatus::Running],
                status,
                message.as_deref(),
            )
            .await?
        {
            info!(run_uid, ?status, "migration run completed");
        } else {
            warn!(run_uid, ?status, "run was already terminal");
        }
        Ok(())
    }

    /// Poll the latest state of a run and its snapshots.
    ///
    /// If a snapshot was cancelled mid-upload, the remote run status is
    /// fetched once and recorded; a failed fetch is retried on the next poll.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the run is absent or outside the
    /// organization.
    pub async fn get_migration_status(
        &self,
        ctx: &CallContext,
        org_id: i64,
        run_uid: &str,
    ) -> Result<MigrationStatus> {
        let mut run = self.get_run(org_id, run_uid).await?;
        let mut snapshots = self.snapshots.snapshots_for_run(org_id, run_uid).await?;

        if snapshots.iter().any(|s| s.reconcile_pending) {
            match ctx
                .guard("report run status", self.gateway.report_run_status(run_uid))
                .await
            {
                Ok(remote) => {
                    self.repo.set_remote_status(run_uid, &remote.state).await?;
                    self.snapshots.clear_reconcile(run_uid).await?;
                    info!(run_uid, remote_state = %remote.state, "reconciled abandoned upload");
                    run.remote_status = Some(remote.state);
                    snapshots = self.snapshots.snapshots_for_run(org_id, run_uid).await?;
                }
                Err(err) => warn!(run_uid, %err, "reconciliation deferred to next poll"),
            }
        }

        Ok(MigrationStatus { run, snapshots })
    }

    /// All runs of a session, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_migration_run_list(
        &self,
        org_id: i64,
        session_uid: &str,
    ) -> Result<Vec<MigrationRun>> {
        self.repo.list_for_session(org_id, session_uid).await
    }

    /// Retrieve one run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent or outside the organization.
    pub async fn get_run(&self, org_id: i64, run_uid: &str) -> Result<MigrationRun> {
        self.repo
            .get(org_id, run_uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_uid} not found")))
    }

    /// Runs of a session that are `Pending` or `Running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn active_runs(&self, org_id: i64, session_uid: &str) -> Result<Vec<MigrationRun>> {
        self.repo.list_active_for_session(org_id, session_uid).await
    }

    /// Cancel a run by cancelling its non-terminal snapshots.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown runs and
    /// `AppError::Conflict` for runs already terminal.
    pub async fn cancel_run(&self, org_id: i64, run_uid: &str) -> Result<()> {
        let span = info_span!("cancel_run", org_id, run_uid);
        async move {
            let run = self.get_run(org_id, run_uid).await?;
            if run.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "run {run_uid} is already {:?}",
                    run.status
                )));
            }

            let control = self.live_controls().get(run_uid).cloned();
            self.snapshots
                .stop_run_snapshots(org_id, run_uid, true, "run cancelled")
                .await?;

            match control {
                Some(control) => control.cancel.cancel(),
                None => {
                    // No live task (never spawned, or lost): settle here.
                    self.repo
                        .transition(
                            run_uid,
                            &[RunStatus::Pending, RunStatus::Running],
                            RunStatus::Cancelled,
                            None,
                        )
                        .await?;
                }
            }
            info!("run cancellation requested");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Wait until a run's task has written its terminal status.
    ///
    /// Returns immediately when no task is alive for the run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` or `AppError::Remote` if `ctx` gives up first.
    pub async fn wait_settled(&self, ctx: &CallContext, run_uid: &str) -> Result<()> {
        let Some(control) = self.live_controls().get(run_uid).cloned() else {
            return Ok(());
        };
        ctx.guard("wait for run", async move {
            control.settled.cancelled().await;
            Ok(())
        })
        .await
    }

    /// Delete every run of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, org_id: i64, session_uid: &str) -> Result<u64> {
        self.repo.delete_for_session(org_id, session_uid).await
    }

    /// Fail runs and snapshots left in progress by a previous process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if an update fails.
    pub async fn recover_interrupted(&self) -> Result<(u64, u64)> {
        const REASON: &str = "interrupted by restart";
        let runs = self.repo.fail_all_active(REASON).await?;
        let snapshots = self.snapshots.recover_interrupted(REASON).await?;
        if runs > 0 || snapshots > 0 {
            warn!(runs, snapshots, "failed work interrupted by a previous shutdown");
        }
        Ok((runs, snapshots))
    }

    /// Number of runs whose task is still alive.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.live_controls().len()
    }

    /// Cancel every in-flight run and wait up to `grace` for them to settle.
    ///
    /// Interrupted runs end in `Error`. Returns whether all tasks finished.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.root.cancel_token().cancel();
        self.tasks.close();
        let settled = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        if settled {
            info!("all migration runs settled");
        } else {
            warn!(remaining = self.in_flight(), "migration runs still active after grace period");
        }
        settled
    }

    fn live_controls(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunControl>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
