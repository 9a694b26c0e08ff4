//! Caller-supplied cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{AppError, Result};

/// Cancellation token plus optional deadline, passed to every operation
/// that waits on the remote side.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(CancellationToken::new(), None)
    }
}

impl CallContext {
    /// Build a context from explicit parts.
    #[must_use]
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    /// Derived context cancelled with `self`, whose deadline is the earlier
    /// of the parent's and `now + timeout`.
    #[must_use]
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self::new(self.cancel.child_token(), deadline)
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the caller has cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await `fut`, giving up on cancellation or deadline expiry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` when the token fires and
    /// `AppError::Remote` when the deadline passes first; otherwise the
    /// future's own result.
    pub async fn guard<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AppError::Cancelled(format!("{op} cancelled by caller"))),
            () = sleep_until(self.deadline) => Err(AppError::Remote(format!("{op}: deadline exceeded"))),
            res = fut => res,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
