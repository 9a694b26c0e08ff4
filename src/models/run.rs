//! Migration run model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::snapshot::{CloudMigrationSnapshot, SnapshotState};

/// Lifecycle status for one "migrate now" execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, token not yet re-validated.
    Pending,
    /// Background task is producing and uploading snapshots.
    Running,
    /// Every snapshot reached `Finished`.
    Finished,
    /// At least one snapshot or step failed.
    Error,
    /// The active snapshot was cancelled explicitly.
    Cancelled,
}

impl RunStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Finished,
        Self::Error,
        Self::Cancelled,
    ];

    /// Terminal statuses never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Error | Self::Cancelled)
                | (Self::Running, Self::Finished | Self::Error | Self::Cancelled)
        )
    }

    /// Statuses from which `next` may be entered.
    #[must_use]
    pub fn sources(next: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

/// One execution of a migration within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MigrationRun {
    /// Unique run identifier.
    pub uid: String,
    /// Owning organization.
    pub org_id: i64,
    /// Session the run executes in.
    pub session_uid: String,
    /// Current status.
    pub status: RunStatus,
    /// Failure reason for `Error` runs.
    pub error_message: Option<String>,
    /// Last status reported by the remote side during reconciliation.
    pub remote_status: Option<String>,
    /// Creation timestamp.
    pub started_at: DateTime<Utc>,
    /// Set once the run is terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRun {
    /// Construct a new `Pending` run.
    #[must_use]
    pub fn new(org_id: i64, session_uid: String) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            org_id,
            session_uid,
            status: RunStatus::Pending,
            error_message: None,
            remote_status: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Handle returned by `run_migration`; the persisted run row is the durable record.
#[derive(Debug)]
pub struct RunHandle {
    /// Identifier to poll with.
    pub run_uid: String,
    /// Session the run belongs to.
    pub session_uid: String,
    /// Background task driving the run.
    pub task: tokio::task::JoinHandle<()>,
}

/// Polling view of a run and the snapshots it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MigrationStatus {
    /// Latest persisted run row.
    pub run: MigrationRun,
    /// Snapshots spawned by the run, oldest first.
    pub snapshots: Vec<CloudMigrationSnapshot>,
}

impl MigrationStatus {
    /// Most recently created snapshot, if any.
    #[must_use]
    pub fn latest_snapshot(&self) -> Option<&CloudMigrationSnapshot> {
        self.snapshots.last()
    }
}

/// Derive a run's terminal status from the states of its snapshots.
///
/// Any `Error` snapshot fails the run; otherwise any `Cancelled` snapshot
/// cancels it; the run finishes only if it spawned at least one snapshot
/// and every one is `Finished`. Anything else is an incomplete run and
/// resolves to `Error`.
#[must_use]
pub fn resolve_run_status(states: &[SnapshotState]) -> RunStatus {
    if states.contains(&SnapshotState::Error) {
        RunStatus::Error
    } else if states.contains(&SnapshotState::Cancelled) {
        RunStatus::Cancelled
    } else if !states.is_empty() && states.iter().all(|s| *s == SnapshotState::Finished) {
        RunStatus::Finished
    } else {
        RunStatus::Error
    }
}
