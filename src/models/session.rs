//! Cloud migration session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An organization's authorization to migrate, bound to one validated token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CloudMigrationSession {
    /// Unique record identifier.
    pub uid: String,
    /// Owning organization; immutable after creation.
    pub org_id: i64,
    /// Token validated when the session was created.
    pub token_uid: String,
    /// Remote account the token targets.
    pub remote_account_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CloudMigrationSession {
    /// Construct a new session with a generated identifier.
    #[must_use]
    pub fn new(org_id: i64, token_uid: String, remote_account_id: String) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            org_id,
            token_uid,
            remote_account_id,
            created_at: Utc::now(),
        }
    }
}

/// Request to open a session against an existing token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CreateSessionRequest {
    /// Calling organization.
    pub org_id: i64,
    /// Token to bind the session to.
    pub token_uid: String,
}
