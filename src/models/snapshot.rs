//! Cloud migration snapshot model and queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Row created, nothing enumerated yet.
    Init,
    /// Resources are being enumerated and packaged.
    Creating,
    /// Packaged payload stored locally, waiting for upload.
    PendingUpload,
    /// Payload is being streamed to the remote side.
    Uploading,
    /// Remote side acknowledged the upload.
    Finished,
    /// Creation or upload failed.
    Error,
    /// Cancelled explicitly.
    Cancelled,
}

impl SnapshotState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Init,
        Self::Creating,
        Self::PendingUpload,
        Self::Uploading,
        Self::Finished,
        Self::Error,
        Self::Cancelled,
    ];

    /// Terminal states never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Creating => self == Self::Init,
            Self::PendingUpload => self == Self::Creating,
            Self::Uploading => self == Self::PendingUpload,
            Self::Finished => self == Self::Uploading,
            Self::Error | Self::Cancelled => !self.is_terminal(),
            Self::Init => false,
        }
    }

    /// States from which `next` may be entered.
    #[must_use]
    pub fn sources(next: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

/// A packaged, point-in-time export of resources produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CloudMigrationSnapshot {
    /// Unique snapshot identifier.
    pub uid: String,
    /// Owning organization.
    pub org_id: i64,
    /// Session the snapshot belongs to.
    pub session_uid: String,
    /// Run that spawned the snapshot.
    pub run_uid: String,
    /// Current lifecycle state.
    pub state: SnapshotState,
    /// Number of resources packaged.
    pub resource_count: u32,
    /// Idempotency key handed to the remote side on upload.
    pub upload_key: Option<String>,
    /// Failure reason for `Error` snapshots.
    pub error_message: Option<String>,
    /// Cancelled mid-upload; remote state must be reconciled.
    pub reconcile_pending: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set once the snapshot is terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl CloudMigrationSnapshot {
    /// Construct a new snapshot in `Init`.
    #[must_use]
    pub fn new(org_id: i64, session_uid: String, run_uid: String) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            org_id,
            session_uid,
            run_uid,
            state: SnapshotState::Init,
            resource_count: 0,
            upload_key: None,
            error_message: None,
            reconcile_pending: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Lookup of a single snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetSnapshotsQuery {
    /// Calling organization.
    pub org_id: i64,
    /// Session the snapshot belongs to.
    pub session_uid: String,
    /// Snapshot identifier.
    pub snapshot_uid: String,
}

/// Paged listing of a session's snapshots, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSnapshotsQuery {
    /// Calling organization.
    pub org_id: i64,
    /// Session to list.
    pub session_uid: String,
    /// Restrict to one run.
    pub run_uid: Option<String>,
    /// 1-based page number.
    pub page: u32,
    /// Page size; 0 means unlimited.
    pub limit: u32,
}

impl ListSnapshotsQuery {
    /// Unpaged listing for a session.
    #[must_use]
    pub fn for_session(org_id: i64, session_uid: impl Into<String>) -> Self {
        Self {
            org_id,
            session_uid: session_uid.into(),
            run_uid: None,
            page: 1,
            limit: 0,
        }
    }
}
