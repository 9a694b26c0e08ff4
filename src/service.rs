//! Orchestration API consumed by the request-handling layer.
//!
//! [`MigrationService`] wires the four components together and owns the
//! operations that span more than one of them: token deletion (which must
//! not orphan in-progress runs) and session deletion (which must refuse
//! while runs are active and cascades over finished history). Every
//! operation takes the caller's organization explicitly.

use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::config::GlobalConfig;
use crate::gateway::RemoteGateway;
use crate::models::run::{MigrationRun, MigrationStatus, RunHandle, RunStatus};
use crate::models::session::{CloudMigrationSession, CreateSessionRequest};
use crate::models::snapshot::{CloudMigrationSnapshot, GetSnapshotsQuery, ListSnapshotsQuery};
use crate::models::token::{CreateTokenResponse, DeletePolicy, TokenView};
use crate::models::user::SignedInUser;
use crate::orchestrator::run_tracker::RunTracker;
use crate::orchestrator::session_manager::SessionManager;
use crate::orchestrator::snapshot_orchestrator::SnapshotOrchestrator;
use crate::orchestrator::token_manager::TokenManager;
use crate::orchestrator::CallContext;
use crate::persistence::db::Database;
use crate::resources::ResourceProducer;
use crate::{AppError, Result};

/// The cloud migration core.
pub struct MigrationService {
    tokens: Arc<TokenManager>,
    sessions: Arc<SessionManager>,
    snapshots: Arc<SnapshotOrchestrator>,
    runs: Arc<RunTracker>,
}

impl MigrationService {
    /// Build the component graph over shared collaborators.
    #[must_use]
    pub fn new(
        config: &GlobalConfig,
        db: Arc<Database>,
        gateway: Arc<dyn RemoteGateway>,
        producer: Arc<dyn ResourceProducer>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(Arc::clone(&db), Arc::clone(&gateway)));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&db), Arc::clone(&tokens)));
        let snapshots = Arc::new(SnapshotOrchestrator::new(
            Arc::clone(&db),
            Arc::clone(&sessions),
            Arc::clone(&gateway),
            producer,
            config.snapshot.clone(),
        ));
        let runs = Arc::new(RunTracker::new(
            db,
            Arc::clone(&sessions),
            Arc::clone(&snapshots),
            gateway,
            config.run.clone(),
        ));
        Self {
            tokens,
            sessions,
            snapshots,
            runs,
        }
    }

    /// Token component.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Session component.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Snapshot component.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotOrchestrator> {
        &self.snapshots
    }

    /// Run component.
    #[must_use]
    pub fn runs(&self) -> &Arc<RunTracker> {
        &self.runs
    }

    // ── Tokens ───────────────────────────────────────────────

    /// See [`TokenManager::get_token`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the organization has no token.
    pub async fn get_token(&self, org_id: i64) -> Result<TokenView> {
        self.tokens.get_token(org_id).await
    }

    /// See [`TokenManager::create_token`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` or `AppError::Remote`.
    pub async fn create_token(&self, ctx: &CallContext, org_id: i64) -> Result<CreateTokenResponse> {
        self.tokens.create_token(ctx, org_id).await
    }

    /// See [`TokenManager::validate_token`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidToken` or `AppError::Remote`.
    pub async fn validate_token(
        &self,
        ctx: &CallContext,
        session: &CloudMigrationSession,
    ) -> Result<()> {
        self.tokens.validate_token(ctx, session).await
    }

    /// Revoke a token, applying `policy` to runs that still use it.
    ///
    /// With [`DeletePolicy::Refuse`] any in-progress run under a session
    /// bound to the token fails the call. With
    /// [`DeletePolicy::CascadeCancel`] those runs are cancelled and awaited
    /// before the token is revoked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::Conflict` (refused), or
    /// `AppError::Remote` if revocation fails.
    pub async fn delete_token(
        &self,
        ctx: &CallContext,
        org_id: i64,
        uid: &str,
        policy: DeletePolicy,
    ) -> Result<()> {
        let span = info_span!("delete_token_policy", org_id, token_uid = uid, ?policy);
        async move {
            // Held until the token is gone so no run can start on it meanwhile.
            let _token_guard = self.tokens.lock_token(uid).await;

            let mut busy = Vec::new();
            for session in self.sessions.sessions_for_token(org_id, uid).await? {
                busy.extend(self.runs.active_runs(org_id, &session.uid).await?);
            }

            if !busy.is_empty() {
                match policy {
                    DeletePolicy::Refuse => {
                        return Err(AppError::Conflict(format!(
                            "token {uid} is used by {} in-progress run(s)",
                            busy.len()
                        )));
                    }
                    DeletePolicy::CascadeCancel => {
                        for run in &busy {
                            match self.runs.cancel_run(org_id, &run.uid).await {
                                Ok(()) | Err(AppError::Conflict(_)) => {}
                                Err(err) => return Err(err),
                            }
                            self.runs.wait_settled(ctx, &run.uid).await?;
                        }
                        info!(cancelled = busy.len(), "cancelled runs before token deletion");
                    }
                }
            }

            self.tokens.delete_token(ctx, org_id, uid).await
        }
        .instrument(span)
        .await
    }

    // ── Sessions ─────────────────────────────────────────────

    /// See [`SessionManager::create_session`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation`, `AppError::InvalidToken` or `AppError::Remote`.
    pub async fn create_session(
        &self,
        ctx: &CallContext,
        request: &CreateSessionRequest,
    ) -> Result<CloudMigrationSession> {
        self.sessions.create_session(ctx, request).await
    }

    /// See [`SessionManager::get_session`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`.
    pub async fn get_session(&self, org_id: i64, uid: &str) -> Result<CloudMigrationSession> {
        self.sessions.get_session(org_id, uid).await
    }

    /// See [`SessionManager::get_session_list`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_session_list(&self, org_id: i64) -> Result<Vec<CloudMigrationSession>> {
        self.sessions.get_session_list(org_id).await
    }

    /// Delete a session whose runs are all terminal, with its runs and snapshots.
    ///
    /// Returns the deleted session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent and `AppError::Conflict` if
    /// any run of the session is still `Pending` or `Running`.
    pub async fn delete_session(&self, org_id: i64, uid: &str) -> Result<CloudMigrationSession> {
        let span = info_span!("delete_session", org_id, session_uid = uid);
        async move {
            self.sessions.get_session(org_id, uid).await?;
            let _session_guard = self.sessions.lock_session(uid).await;
            let session = self.sessions.get_session(org_id, uid).await?;

            let active = self.runs.active_runs(org_id, uid).await?;
            if !active.is_empty() {
                return Err(AppError::Conflict(format!(
                    "session {uid} has {} run(s) in progress",
                    active.len()
                )));
            }

            let snapshots = self.snapshots.delete_for_session(org_id, uid).await?;
            let runs = self.runs.delete_for_session(org_id, uid).await?;
            self.sessions.remove_session(org_id, uid).await?;

            info!(runs, snapshots, "session history removed");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    // ── Runs ─────────────────────────────────────────────────

    /// See [`RunTracker::run_migration`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::Conflict`,
    /// `AppError::InvalidToken` or `AppError::Remote`.
    pub async fn run_migration(
        &self,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
    ) -> Result<RunHandle> {
        self.runs.run_migration(ctx, user, session_uid).await
    }

    /// See [`RunTracker::get_migration_status`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`.
    pub async fn get_migration_status(
        &self,
        ctx: &CallContext,
        org_id: i64,
        run_uid: &str,
    ) -> Result<MigrationStatus> {
        self.runs.get_migration_status(ctx, org_id, run_uid).await
    }

    /// See [`RunTracker::get_migration_run_list`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_migration_run_list(
        &self,
        org_id: i64,
        session_uid: &str,
    ) -> Result<Vec<MigrationRun>> {
        self.runs.get_migration_run_list(org_id, session_uid).await
    }

    /// See [`RunTracker::cancel_run`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Conflict`.
    pub async fn cancel_run(&self, org_id: i64, run_uid: &str) -> Result<()> {
        self.runs.cancel_run(org_id, run_uid).await
    }

    // ── Snapshots ────────────────────────────────────────────

    /// Create a snapshot inside a running run of the session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session or run is unknown,
    /// `AppError::Conflict` if the run is not `Running`, or the errors of
    /// [`SnapshotOrchestrator::create_snapshot`].
    pub async fn create_snapshot(
        &self,
        ctx: &CallContext,
        user: &SignedInUser,
        session_uid: &str,
        run_uid: &str,
    ) -> Result<CloudMigrationSnapshot> {
        let run = self.runs.get_run(user.org_id, run_uid).await?;
        if run.session_uid != session_uid {
            return Err(AppError::NotFound(format!(
                "run {run_uid} not found in session {session_uid}"
            )));
        }
        if run.status != RunStatus::Running {
            return Err(AppError::Conflict(format!(
                "run {run_uid} is {:?}, snapshots can only be added to a running run",
                run.status
            )));
        }
        self.snapshots
            .create_snapshot(ctx, user, session_uid, run_uid)
            .await
    }

    /// See [`SnapshotOrchestrator::upload_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::Conflict`,
    /// `AppError::Cancelled` or `AppError::Remote`.
    pub async fn upload_snapshot(
        &self,
        ctx: &CallContext,
        org_id: i64,
        session_uid: &str,
        snapshot_uid: &str,
    ) -> Result<()> {
        self.snapshots
            .upload_snapshot(ctx, org_id, session_uid, snapshot_uid)
            .await
    }

    /// See [`SnapshotOrchestrator::cancel_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::Conflict`.
    pub async fn cancel_snapshot(
        &self,
        org_id: i64,
        session_uid: &str,
        snapshot_uid: &str,
    ) -> Result<()> {
        self.snapshots
            .cancel_snapshot(org_id, session_uid, snapshot_uid)
            .await
    }

    /// See [`SnapshotOrchestrator::get_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`.
    pub async fn get_snapshot(&self, query: &GetSnapshotsQuery) -> Result<CloudMigrationSnapshot> {
        self.snapshots.get_snapshot(query).await
    }

    /// See [`SnapshotOrchestrator::get_snapshot_list`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_snapshot_list(
        &self,
        query: &ListSnapshotsQuery,
    ) -> Result<Vec<CloudMigrationSnapshot>> {
        self.snapshots.get_snapshot_list(query).await
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Fail work left in progress by a previous process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if an update fails.
    pub async fn recover_interrupted(&self) -> Result<(u64, u64)> {
        self.runs.recover_interrupted().await
    }

    /// Stop in-flight runs, waiting up to `grace`.
    pub async fn shutdown(&self, grace: std::time::Duration) -> bool {
        self.runs.shutdown(grace).await
    }
}
