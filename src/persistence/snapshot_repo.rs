//! Migration snapshot repository for `SQLite` persistence.
//!
//! Every state change is a compare-and-set `UPDATE` guarded on the
//! current state. The packaged payload is only read by [`SnapshotRepo::load_payload`]
//! and is dropped once the upload is acknowledged.

use std::sync::Arc;

use chrono::Utc;

use crate::models::snapshot::{CloudMigrationSnapshot, ListSnapshotsQuery, SnapshotState};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_optional_timestamp, parse_timestamp, sql_in_list};

const COLUMNS: &str = "uid, org_id, session_uid, run_uid, state, resource_count, upload_key, \
                       error_message, reconcile_pending, created_at, finished_at";

/// Repository wrapper around `SQLite` for snapshot records.
#[derive(Clone)]
pub struct SnapshotRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SnapshotRow {
    uid: String,
    org_id: i64,
    session_uid: String,
    run_uid: String,
    state: String,
    resource_count: i64,
    upload_key: Option<String>,
    error_message: Option<String>,
    reconcile_pending: bool,
    created_at: String,
    finished_at: Option<String>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<CloudMigrationSnapshot> {
        let resource_count = u32::try_from(self.resource_count)
            .map_err(|e| AppError::Db(format!("invalid resource_count: {e}")))?;
        Ok(CloudMigrationSnapshot {
            state: parse_snapshot_state(&self.state)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            finished_at: parse_optional_timestamp("finished_at", self.finished_at.as_deref())?,
            resource_count,
            uid: self.uid,
            org_id: self.org_id,
            session_uid: self.session_uid,
            run_uid: self.run_uid,
            upload_key: self.upload_key,
            error_message: self.error_message,
            reconcile_pending: self.reconcile_pending,
        })
    }
}

fn parse_snapshot_state(s: &str) -> Result<SnapshotState> {
    match s {
        "init" => Ok(SnapshotState::Init),
        "creating" => Ok(SnapshotState::Creating),
        "pending_upload" => Ok(SnapshotState::PendingUpload),
        "uploading" => Ok(SnapshotState::Uploading),
        "finished" => Ok(SnapshotState::Finished),
        "error" => Ok(SnapshotState::Error),
        "cancelled" => Ok(SnapshotState::Cancelled),
        other => Err(AppError::Db(format!("invalid snapshot state: {other}"))),
    }
}

/// Column value for a snapshot state.
#[must_use]
pub fn snapshot_state_str(s: SnapshotState) -> &'static str {
    match s {
        SnapshotState::Init => "init",
        SnapshotState::Creating => "creating",
        SnapshotState::PendingUpload => "pending_upload",
        SnapshotState::Uploading => "uploading",
        SnapshotState::Finished => "finished",
        SnapshotState::Error => "error",
        SnapshotState::Cancelled => "cancelled",
    }
}

fn in_list(states: &[SnapshotState]) -> String {
    sql_in_list(&states.iter().map(|s| snapshot_state_str(*s)).collect::<Vec<_>>())
}

impl SnapshotRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new snapshot record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, snapshot: &CloudMigrationSnapshot) -> Result<CloudMigrationSnapshot> {
        sqlx::query(
            "INSERT INTO migration_snapshot (uid, org_id, session_uid, run_uid, state,
             resource_count, upload_key, error_message, reconcile_pending, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&snapshot.uid)
        .bind(snapshot.org_id)
        .bind(&snapshot.session_uid)
        .bind(&snapshot.run_uid)
        .bind(snapshot_state_str(snapshot.state))
        .bind(i64::from(snapshot.resource_count))
        .bind(&snapshot.upload_key)
        .bind(&snapshot.error_message)
        .bind(snapshot.reconcile_pending)
        .bind(snapshot.created_at.to_rfc3339())
        .bind(snapshot.finished_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(snapshot.clone())
    }

    /// Retrieve a snapshot scoped to its organization and session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(
        &self,
        org_id: i64,
        session_uid: &str,
        uid: &str,
    ) -> Result<Option<CloudMigrationSnapshot>> {
        let query = format!(
            "SELECT {COLUMNS} FROM migration_snapshot
             WHERE uid = ?1 AND org_id = ?2 AND session_uid = ?3"
        );
        let row: Option<SnapshotRow> = sqlx::query_as(&query)
            .bind(uid)
            .bind(org_id)
            .bind(session_uid)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// List a session's snapshots, newest first, optionally narrowed to a run and paged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, query: &ListSnapshotsQuery) -> Result<Vec<CloudMigrationSnapshot>> {
        let limit = if query.limit == 0 {
            -1
        } else {
            i64::from(query.limit)
        };
        let offset = i64::from(query.page.saturating_sub(1)) * i64::from(query.limit);

        let sql = format!(
            "SELECT {COLUMNS} FROM migration_snapshot
             WHERE org_id = ?1 AND session_uid = ?2 AND (?3 IS NULL OR run_uid = ?3)
             ORDER BY created_at DESC, rowid DESC LIMIT ?4 OFFSET ?5"
        );
        let rows: Vec<SnapshotRow> = sqlx::query_as(&sql)
            .bind(query.org_id)
            .bind(&query.session_uid)
            .bind(&query.run_uid)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    /// List a run's snapshots in creation order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_run(
        &self,
        org_id: i64,
        run_uid: &str,
    ) -> Result<Vec<CloudMigrationSnapshot>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM migration_snapshot
             WHERE org_id = ?1 AND run_uid = ?2 ORDER BY rowid ASC"
        );
        let rows: Vec<SnapshotRow> = sqlx::query_as(&sql)
            .bind(org_id)
            .bind(run_uid)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    /// Move a snapshot to `to` if its current state is one of `from`.
    ///
    /// Entries of `from` that the lifecycle does not allow to reach `to`
    /// are ignored.
    ///
    /// Terminal targets stamp `finished_at`; `Finished` also drops the
    /// stored payload. Returns `false` when the guard did not match.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn transition(
        &self,
        uid: &str,
        from: &[SnapshotState],
        to: SnapshotState,
    ) -> Result<bool> {
        let from: Vec<SnapshotState> = from
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(to))
            .collect();
        if from.is_empty() {
            return Ok(false);
        }
        let finished_at = to.is_terminal().then(|| Utc::now().to_rfc3339());
        let drop_payload = to == SnapshotState::Finished;
        let query = format!(
            "UPDATE migration_snapshot
             SET state = ?1, finished_at = COALESCE(?2, finished_at),
                 payload = CASE WHEN ?3 THEN NULL ELSE payload END
             WHERE uid = ?4 AND state IN ({})",
            in_list(&from),
        );

        let result = sqlx::query(&query)
            .bind(snapshot_state_str(to))
            .bind(finished_at)
            .bind(drop_payload)
            .bind(uid)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Store the packaged payload and move `Creating` to `PendingUpload`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_packaged(
        &self,
        uid: &str,
        resource_count: u32,
        upload_key: &str,
        payload: &[u8],
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE migration_snapshot
             SET state = 'pending_upload', resource_count = ?1, upload_key = ?2, payload = ?3
             WHERE uid = ?4 AND state = 'creating'",
        )
        .bind(i64::from(resource_count))
        .bind(upload_key)
        .bind(payload)
        .bind(uid)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move any non-terminal snapshot to `Error` with a reason.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_error(&self, uid: &str, reason: &str) -> Result<bool> {
        let query = format!(
            "UPDATE migration_snapshot
             SET state = 'error', error_message = ?1, finished_at = ?2
             WHERE uid = ?3 AND state IN ({})",
            in_list(&SnapshotState::sources(SnapshotState::Error)),
        );
        let result = sqlx::query(&query)
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .bind(uid)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel a snapshot that is not yet terminal.
    ///
    /// A snapshot cancelled while `Uploading` is flagged for reconciliation,
    /// since the remote side may still have accepted the data.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn cancel(&self, org_id: i64, session_uid: &str, uid: &str) -> Result<bool> {
        let query = format!(
            "UPDATE migration_snapshot
             SET state = 'cancelled', finished_at = ?1,
                 reconcile_pending = CASE WHEN state = 'uploading' THEN 1 ELSE 0 END
             WHERE uid = ?2 AND org_id = ?3 AND session_uid = ?4 AND state IN ({})",
            in_list(&SnapshotState::sources(SnapshotState::Cancelled)),
        );
        let result = sqlx::query(&query)
            .bind(Utc::now().to_rfc3339())
            .bind(uid)
            .bind(org_id)
            .bind(session_uid)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Flag a snapshot whose remote outcome is unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn flag_reconcile(&self, uid: &str) -> Result<()> {
        sqlx::query("UPDATE migration_snapshot SET reconcile_pending = 1 WHERE uid = ?1")
            .bind(uid)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Clear the reconciliation flag on every snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn clear_reconcile_for_run(&self, run_uid: &str) -> Result<()> {
        sqlx::query("UPDATE migration_snapshot SET reconcile_pending = 0 WHERE run_uid = ?1")
            .bind(run_uid)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Read the packaged payload of a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn load_payload(&self, uid: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Option<Vec<u8>>,)> =
            sqlx::query_as("SELECT payload FROM migration_snapshot WHERE uid = ?1")
                .bind(uid)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(row.and_then(|(payload,)| payload))
    }

    /// Delete all snapshots of a session. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, org_id: i64, session_uid: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM migration_snapshot WHERE org_id = ?1 AND session_uid = ?2")
                .bind(org_id)
                .bind(session_uid)
                .execute(self.db.as_ref())
                .await?;
        Ok(result.rows_affected())
    }

    /// Fail every snapshot left in progress, e.g. after a restart.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail_all_in_progress(&self, reason: &str) -> Result<u64> {
        let query = format!(
            "UPDATE migration_snapshot SET state = 'error', error_message = ?1, finished_at = ?2
             WHERE state IN ({})",
            in_list(&SnapshotState::sources(SnapshotState::Error)),
        );
        let result = sqlx::query(&query)
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
