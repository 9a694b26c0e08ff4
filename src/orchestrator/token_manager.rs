//! Migration token lifecycle: issue, inspect, validate, revoke.
//!
//! The token manager is the only component that reads or writes token
//! secrets. At most one token exists per organization; an expired token
//! no longer counts and is replaced by the next `create_token`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, info_span, warn, Instrument};

use crate::gateway::RemoteGateway;
use crate::models::session::CloudMigrationSession;
use crate::models::token::{CreateTokenResponse, MigrationToken, TokenView};
use crate::persistence::db::Database;
use crate::persistence::token_repo::TokenRepo;
use crate::{AppError, Result};

use super::context::CallContext;
use super::locks::KeyedLocks;

/// Owns the migration token of every organization.
pub struct TokenManager {
    repo: TokenRepo,
    gateway: Arc<dyn RemoteGateway>,
    locks: KeyedLocks,
}

impl TokenManager {
    /// Create a token manager over the shared database and gateway.
    #[must_use]
    pub fn new(db: Arc<Database>, gateway: Arc<dyn RemoteGateway>) -> Self {
        Self {
            repo: TokenRepo::new(db),
            gateway,
            locks: KeyedLocks::default(),
        }
    }

    /// Return the organization's token metadata, never the secret.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the organization has no token.
    pub async fn get_token(&self, org_id: i64) -> Result<TokenView> {
        self.repo
            .get_for_org(org_id)
            .await?
            .map(|token| token.view())
            .ok_or_else(|| AppError::NotFound(format!("no migration token for org {org_id}")))
    }

    /// Request a new token from the remote side and store it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if an unexpired token already exists,
    /// or `AppError::Remote` if issuing fails.
    pub async fn create_token(&self, ctx: &CallContext, org_id: i64) -> Result<CreateTokenResponse> {
        let span = info_span!("create_token", org_id);
        async move {
            let _org_guard = self.locks.lock(&org_id.to_string()).await;

            // ── Enforce one active token per org ─────────────
            let replaces = match self.repo.get_for_org(org_id).await? {
                Some(existing) if !existing.is_expired_at(Utc::now()) => {
                    return Err(AppError::Conflict(format!(
                        "org {org_id} already has an active migration token"
                    )));
                }
                Some(expired) => {
                    info!(token_uid = %expired.uid, "replacing expired token");
                    Some(expired.uid)
                }
                None => None,
            };

            // ── Issue remotely ───────────────────────────────
            let material = ctx
                .guard("issue token", self.gateway.issue_token(org_id))
                .await?;
            if material.secret.is_empty() {
                return Err(AppError::Remote("remote issued an empty token".into()));
            }

            // ── Persist, revoking the remote token if that fails ──
            let token = MigrationToken::new(org_id, material);
            if let Err(err) = self.repo.insert(&token, replaces.as_deref()).await {
                let material = token.material();
                if let Err(revoke_err) = ctx
                    .guard("revoke token", self.gateway.revoke_token(&material))
                    .await
                {
                    warn!(%revoke_err, "failed to revoke token after local insert failure");
                }
                return Err(err);
            }

            info!(token_uid = %token.uid, account = %token.remote_account_id, "migration token created");
            Ok(CreateTokenResponse {
                token: token.secret.clone(),
                view: token.view(),
            })
        }
        .instrument(span)
        .await
    }

    /// Confirm the token bound to `session` is still accepted remotely.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidToken` if the token is gone, expired, or
    /// rejected, and `AppError::Remote` if the remote check fails.
    pub async fn validate_token(
        &self,
        ctx: &CallContext,
        session: &CloudMigrationSession,
    ) -> Result<()> {
        self.validate_token_uid(ctx, session.org_id, &session.token_uid)
            .await
            .map(|_| ())
    }

    /// Validate a token by identifier and return it.
    ///
    /// Local checks (existence, expiry) run before any remote call.
    ///
    /// # Errors
    ///
    /// Same as [`TokenManager::validate_token`].
    pub async fn validate_token_uid(
        &self,
        ctx: &CallContext,
        org_id: i64,
        token_uid: &str,
    ) -> Result<MigrationToken> {
        let span = info_span!("validate_token", org_id, token_uid);
        async move {
            let token = self.repo.get(org_id, token_uid).await?.ok_or_else(|| {
                AppError::InvalidToken(format!("token {token_uid} does not exist"))
            })?;
            if token.is_expired_at(Utc::now()) {
                return Err(AppError::InvalidToken(format!("token {token_uid} has expired")));
            }

            let material = token.material();
            let accepted = ctx
                .guard("validate token", self.gateway.validate_token(&material))
                .await?;
            if !accepted {
                warn!("token rejected by remote side");
                return Err(AppError::InvalidToken(format!(
                    "token {token_uid} was rejected by the remote service"
                )));
            }

            info!("token validated");
            Ok(token)
        }
        .instrument(span)
        .await
    }

    /// Serialize deletion of a token against runs starting on it.
    ///
    /// `MigrationService::delete_token` holds this across its busy-run
    /// check and the revoke; `RunTracker::run_migration` holds it while
    /// recording a new run.
    pub async fn lock_token(&self, uid: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(&format!("token:{uid}")).await
    }

    /// Whether the organization still holds token `uid`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn token_exists(&self, org_id: i64, uid: &str) -> Result<bool> {
        Ok(self.repo.get(org_id, uid).await?.is_some())
    }

    /// Revoke a token remotely, then delete it locally.
    ///
    /// Callers decide what happens to runs using the token before calling
    /// this; see `MigrationService::delete_token`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the token does not exist in the
    /// organization, or `AppError::Remote` if revocation fails (the local
    /// record is then kept).
    pub async fn delete_token(&self, ctx: &CallContext, org_id: i64, uid: &str) -> Result<()> {
        let span = info_span!("delete_token", org_id, token_uid = uid);
        async move {
            let _org_guard = self.locks.lock(&org_id.to_string()).await;

            let token = self
                .repo
                .get(org_id, uid)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("token {uid} not found")))?;

            let material = token.material();
            ctx.guard("revoke token", self.gateway.revoke_token(&material))
                .await?;

            self.repo.delete(org_id, uid).await?;
            info!("migration token revoked and deleted");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
