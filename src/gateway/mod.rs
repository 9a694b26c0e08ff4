//! Remote migration service abstraction.
//!
//! The [`RemoteGateway`] trait decouples the orchestration core from the
//! transport used to reach the remote migration service. [`http`] provides
//! the production implementation; tests substitute an in-process fake.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::models::token::TokenMaterial;
use crate::Result;

/// Boxed future returned by gateway operations.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Chunked snapshot payload handed to [`RemoteGateway::accept_snapshot`].
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Bytes> + Send + Sync + 'static>>;

/// Run status as reported by the remote side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteRunStatus {
    /// Run the status refers to.
    pub run_uid: String,
    /// Remote state label, e.g. `processing` or `complete`.
    pub state: String,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

/// Authenticated calls to the remote migration service.
///
/// Implementations must not retry silently; every failure surfaces as
/// [`AppError::Remote`](crate::AppError::Remote).
pub trait RemoteGateway: Send + Sync {
    /// Issue a new migration token for an organization.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`](crate::AppError::Remote) if the call fails.
    fn issue_token(&self, org_id: i64) -> GatewayFuture<'_, TokenMaterial>;

    /// Ask whether the remote side still accepts `token`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`](crate::AppError::Remote) if the call fails.
    fn validate_token<'a>(&'a self, token: &'a TokenMaterial) -> GatewayFuture<'a, bool>;

    /// Revoke `token` on the remote side.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`](crate::AppError::Remote) if the call fails.
    fn revoke_token<'a>(&'a self, token: &'a TokenMaterial) -> GatewayFuture<'a, ()>;

    /// Stream a snapshot payload to the remote side.
    ///
    /// `idempotency_key` is stable per snapshot; the remote side must treat
    /// a repeated key as the same upload rather than new data.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`](crate::AppError::Remote) if the upload fails.
    fn accept_snapshot<'a>(
        &'a self,
        session_uid: &'a str,
        snapshot_uid: &'a str,
        data: SnapshotStream,
        idempotency_key: &'a str,
    ) -> GatewayFuture<'a, ()>;

    /// Ask the remote side to abort an in-flight upload.
    ///
    /// Returns `Ok(false)` when the transport has no abort support, which is
    /// the default.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`](crate::AppError::Remote) if the call fails.
    fn abort_snapshot<'a>(
        &'a self,
        _session_uid: &'a str,
        _snapshot_uid: &'a str,
        _idempotency_key: &'a str,
    ) -> GatewayFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    /// Read the remote view of a run, used to reconcile abandoned uploads.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`](crate::AppError::Remote) if the call fails.
    fn report_run_status<'a>(&'a self, run_uid: &'a str) -> GatewayFuture<'a, RemoteRunStatus>;
}

/// Split a payload into a stream of `chunk_size` chunks without copying.
#[must_use]
pub fn chunked_stream(payload: Vec<u8>, chunk_size: usize) -> SnapshotStream {
    let bytes = Bytes::from(payload);
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| bytes.slice(start..bytes.len().min(start + chunk_size)))
        .collect();
    Box::pin(stream::iter(chunks))
}
