//! Session lifecycle: create against a validated token, read, delete.

use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::models::session::{CloudMigrationSession, CreateSessionRequest};
use crate::persistence::db::Database;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

use super::context::CallContext;
use super::locks::KeyedLocks;
use super::token_manager::TokenManager;

/// Owns migration sessions.
pub struct SessionManager {
    repo: SessionRepo,
    tokens: Arc<TokenManager>,
    locks: KeyedLocks,
}

impl SessionManager {
    /// Create a session manager delegating validation to `tokens`.
    #[must_use]
    pub fn new(db: Arc<Database>, tokens: Arc<TokenManager>) -> Self {
        Self {
            repo: SessionRepo::new(db),
            tokens,
            locks: KeyedLocks::default(),
        }
    }

    /// The token manager sessions validate against.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Validate the requested token, then persist a new session.
    ///
    /// No session row is written unless validation succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a malformed request,
    /// `AppError::InvalidToken` if validation fails, or `AppError::Remote`
    /// if the remote check cannot be completed.
    pub async fn create_session(
        &self,
        ctx: &CallContext,
        request: &CreateSessionRequest,
    ) -> Result<CloudMigrationSession> {
        let span = info_span!("create_session", org_id = request.org_id);
        async move {
            if request.org_id <= 0 {
                return Err(AppError::Validation("org_id must be positive".into()));
            }
            if request.token_uid.trim().is_empty() {
                return Err(AppError::Validation("token_uid must not be empty".into()));
            }

            let token = self
                .tokens
                .validate_token_uid(ctx, request.org_id, &request.token_uid)
                .await?;

            let session =
                CloudMigrationSession::new(request.org_id, token.uid, token.remote_account_id);
            let created = self.repo.create(&session).await?;

            info!(session_uid = %created.uid, "migration session created");
            Ok(created)
        }
        .instrument(span)
        .await
    }

    /// Retrieve a session of the organization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is absent or belongs to
    /// another organization.
    pub async fn get_session(&self, org_id: i64, uid: &str) -> Result<CloudMigrationSession> {
        self.repo
            .get(org_id, uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {uid} not found")))
    }

    /// List the organization's sessions in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_session_list(&self, org_id: i64) -> Result<Vec<CloudMigrationSession>> {
        self.repo.list_for_org(org_id).await
    }

    /// List the organization's sessions bound to a token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn sessions_for_token(
        &self,
        org_id: i64,
        token_uid: &str,
    ) -> Result<Vec<CloudMigrationSession>> {
        self.repo.list_for_token(org_id, token_uid).await
    }

    /// Serialize work on one session; held across run creation and deletion.
    pub async fn lock_session(&self, uid: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.lock(uid).await
    }

    /// Remove the session row. Callers must hold [`SessionManager::lock_session`]
    /// and have cleared runs and snapshots first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is absent.
    pub async fn remove_session(&self, org_id: i64, uid: &str) -> Result<()> {
        if self.repo.delete(org_id, uid).await? {
            info!(org_id, session_uid = uid, "migration session deleted");
            Ok(())
        } else {
            Err(AppError::NotFound(format!("session {uid} not found")))
        }
    }
}
