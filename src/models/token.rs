//! Migration token model and views.
//!
//! The secret material only ever leaves [`MigrationToken`] once, inside the
//! [`CreateTokenResponse`] returned at creation time.

use std::fmt::{Debug, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of trailing secret characters kept in the display hint.
const HINT_LEN: usize = 4;

/// Credential material issued by the remote migration service.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenMaterial {
    /// Opaque secret presented to the remote service.
    pub secret: String,
    /// Remote account (stack) the token authorizes migration into.
    pub remote_account_id: String,
    /// Expiry reported by the issuer.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Token record owned by the token manager.
#[derive(Clone, PartialEq, Eq)]
pub struct MigrationToken {
    /// Unique record identifier.
    pub uid: String,
    /// Owning organization.
    pub org_id: i64,
    /// Secret material; never serialized.
    pub secret: String,
    /// Remote account identifier.
    pub remote_account_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

const REDACTED: &str = "[redacted]";

impl Debug for TokenMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMaterial")
            .field("secret", &REDACTED)
            .field("remote_account_id", &self.remote_account_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Debug for MigrationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationToken")
            .field("uid", &self.uid)
            .field("org_id", &self.org_id)
            .field("secret", &REDACTED)
            .field("remote_account_id", &self.remote_account_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl MigrationToken {
    /// Build a token record from freshly issued material.
    #[must_use]
    pub fn new(org_id: i64, material: TokenMaterial) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            org_id,
            secret: material.secret,
            remote_account_id: material.remote_account_id,
            created_at: Utc::now(),
            expires_at: material.expires_at,
        }
    }

    /// Whether the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Rebuild the material handed to the remote gateway.
    #[must_use]
    pub fn material(&self) -> TokenMaterial {
        TokenMaterial {
            secret: self.secret.clone(),
            remote_account_id: self.remote_account_id.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Metadata view without the secret.
    #[must_use]
    pub fn view(&self) -> TokenView {
        TokenView {
            uid: self.uid.clone(),
            org_id: self.org_id,
            remote_account_id: self.remote_account_id.clone(),
            token_hint: token_hint(&self.secret),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Token metadata safe to show to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TokenView {
    /// Token identifier.
    pub uid: String,
    /// Owning organization.
    pub org_id: i64,
    /// Remote account identifier.
    pub remote_account_id: String,
    /// Masked suffix of the secret, e.g. `****a1b2`.
    pub token_hint: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a successful token creation; the only place the secret is exposed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CreateTokenResponse {
    /// Raw secret, shown once.
    pub token: String,
    /// Metadata of the stored token.
    pub view: TokenView,
}

/// What to do with in-progress runs when their token is deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Fail with a conflict while any referencing session has active runs.
    Refuse,
    /// Cancel the active runs first, then revoke.
    CascadeCancel,
}

/// Mask a secret down to its last few characters.
#[must_use]
pub fn token_hint(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(HINT_LEN)..].iter().collect();
    format!("****{tail}")
}
