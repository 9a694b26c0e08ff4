//! HTTP implementation of [`RemoteGateway`] over `reqwest`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::models::token::TokenMaterial;
use crate::{AppError, Result};

use super::{GatewayFuture, RemoteGateway, RemoteRunStatus, SnapshotStream};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Serialize)]
struct IssueTokenRequest {
    org_id: i64,
}

#[derive(Deserialize)]
struct IssueTokenResponse {
    token: String,
    account_id: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Remote gateway speaking JSON over HTTPS with bearer authentication.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    /// Build a gateway with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &RemoteConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base_url)
    }

    fn snapshot_url(&self, session_uid: &str, snapshot_uid: &str) -> String {
        self.url(&format!("sessions/{session_uid}/snapshots/{snapshot_uid}"))
    }
}

/// Map a non-success status to `AppError::Remote`, keeping the body for context.
async fn ensure_success(response: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Remote(format!("{op} failed with {status}: {body}")))
}

impl RemoteGateway for HttpGateway {
    fn issue_token(&self, org_id: i64) -> GatewayFuture<'_, TokenMaterial> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("tokens"))
                .bearer_auth(&self.api_key)
                .json(&IssueTokenRequest { org_id })
                .send()
                .await?;
            let issued: IssueTokenResponse = ensure_success(response, "issue token")
                .await?
                .json()
                .await?;
            Ok(TokenMaterial {
                secret: issued.token,
                remote_account_id: issued.account_id,
                expires_at: issued.expires_at,
            })
        })
    }

    fn validate_token<'a>(&'a self, token: &'a TokenMaterial) -> GatewayFuture<'a, bool> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("tokens/validate"))
                .bearer_auth(&token.secret)
                .send()
                .await?;
            match response.status() {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
                _ => {
                    ensure_success(response, "validate token").await?;
                    Ok(true)
                }
            }
        })
    }

    fn revoke_token<'a>(&'a self, token: &'a TokenMaterial) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .client
                .delete(self.url("tokens"))
                .bearer_auth(&token.secret)
                .send()
                .await?;
            // Already gone remotely counts as revoked.
            if response.status() == StatusCode::NOT_FOUND {
                warn!(account = %token.remote_account_id, "token already absent on remote side");
                return Ok(());
            }
            ensure_success(response, "revoke token").await?;
            Ok(())
        })
    }

    fn accept_snapshot<'a>(
        &'a self,
        session_uid: &'a str,
        snapshot_uid: &'a str,
        data: SnapshotStream,
        idempotency_key: &'a str,
    ) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            let body = reqwest::Body::wrap_stream(data.map(Ok::<_, std::io::Error>));
            let response = self
                .client
                .put(self.snapshot_url(session_uid, snapshot_uid))
                .bearer_auth(&self.api_key)
                .header(IDEMPOTENCY_HEADER, idempotency_key)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await?;
            ensure_success(response, "upload snapshot").await?;
            debug!(session_uid, snapshot_uid, "snapshot accepted by remote side");
            Ok(())
        })
    }

    fn abort_snapshot<'a>(
        &'a self,
        session_uid: &'a str,
        snapshot_uid: &'a str,
        idempotency_key: &'a str,
    ) -> GatewayFuture<'a, bool> {
        Box::pin(async move {
            let response = self
                .client
                .delete(self.snapshot_url(session_uid, snapshot_uid))
                .bearer_auth(&self.api_key)
                .header(IDEMPOTENCY_HEADER, idempotency_key)
                .send()
                .await?;
            if matches!(
                response.status(),
                StatusCode::NOT_IMPLEMENTED | StatusCode::METHOD_NOT_ALLOWED
            ) {
                return Ok(false);
            }
            ensure_success(response, "abort snapshot").await?;
            Ok(true)
        })
    }

    fn report_run_status<'a>(&'a self, run_uid: &'a str) -> GatewayFuture<'a, RemoteRunStatus> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url(&format!("runs/{run_uid}/status")))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let status = ensure_success(response, "report run status")
                .await?
                .json()
                .await?;
            Ok(status)
        })
    }
}
