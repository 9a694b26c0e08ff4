//! Caller identity passed down from the request layer.

use serde::{Deserialize, Serialize};

/// An authenticated user acting within one organization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SignedInUser {
    /// User identifier.
    pub user_id: i64,
    /// Organization the user is acting in.
    pub org_id: i64,
    /// Login name, for logging.
    pub login: String,
}
