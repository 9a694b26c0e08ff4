//! Migration run repository for `SQLite` persistence.
//!
//! Status changes are compare-and-set updates guarded on the current
//! status, so concurrent writers on one run can never both succeed.

use std::sync::Arc;

use chrono::Utc;

use crate::models::run::{MigrationRun, RunStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_optional_timestamp, parse_timestamp, sql_in_list};

/// Repository wrapper around `SQLite` for run records.
#[derive(Clone)]
pub struct RunRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct RunRow {
    uid: String,
    org_id: i64,
    session_uid: String,
    status: String,
    error_message: Option<String>,
    remote_status: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<MigrationRun> {
        Ok(MigrationRun {
            status: parse_run_status(&self.status)?,
            started_at: parse_timestamp("started_at", &self.started_at)?,
            finished_at: parse_optional_timestamp("finished_at", self.finished_at.as_deref())?,
            uid: self.uid,
            org_id: self.org_id,
            session_uid: self.session_uid,
            error_message: self.error_message,
            remote_status: self.remote_status,
        })
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "finished" => Ok(RunStatus::Finished),
        "error" => Ok(RunStatus::Error),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(AppError::Db(format!("invalid run status: {other}"))),
    }
}

/// Column value for a run status.
#[must_use]
pub fn run_status_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Finished => "finished",
        RunStatus::Error => "error",
        RunStatus::Cancelled => "cancelled",
    }
}

const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];

impl RunRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new run record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, run: &MigrationRun) -> Result<MigrationRun> {
        sqlx::query(
            "INSERT INTO migration_run (uid, org_id, session_uid, status, error_message,
             remote_status, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&run.uid)
        .bind(run.org_id)
        .bind(&run.session_uid)
        .bind(run_status_str(run.status))
        .bind(&run.error_message)
        .bind(&run.remote_status)
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(run.clone())
    }

    /// Retrieve a run by identifier within an organization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, org_id: i64, uid: &str) -> Result<Option<MigrationRun>> {
        let row: Option<RunRow> =
            sqlx::query_as("SELECT * FROM migration_run WHERE uid = ?1 AND org_id = ?2")
                .bind(uid)
                .bind(org_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(RunRow::into_run).transpose()
    }

    /// List a session's runs, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(
        &self,
        org_id: i64,
        session_uid: &str,
    ) -> Result<Vec<MigrationRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM migration_run WHERE org_id = ?1 AND session_uid = ?2
             ORDER BY started_at DESC, rowid DESC",
        )
        .bind(org_id)
        .bind(session_uid)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// List a session's runs that are still `Pending` or `Running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active_for_session(
        &self,
        org_id: i64,
        session_uid: &str,
    ) -> Result<Vec<MigrationRun>> {
        let query = format!(
            "SELECT * FROM migration_run WHERE org_id = ?1 AND session_uid = ?2
             AND status IN ({}) ORDER BY started_at DESC, rowid DESC",
            sql_in_list(&ACTIVE.map(run_status_str)),
        );
        let rows: Vec<RunRow> = sqlx::query_as(&query)
            .bind(org_id)
            .bind(session_uid)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Move a run to `to` if its current status is one of `from`.
    ///
    /// Terminal targets also stamp `finished_at`. Returns `false` when the
    /// guard did not match, leaving the row untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn transition(
        &self,
        uid: &str,
        from: &[RunStatus],
        to: RunStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let from: Vec<&str> = from
            .iter()
            .filter(|s| s.can_transition_to(to))
            .map(|s| run_status_str(*s))
            .collect();
        if from.is_empty() {
            return Ok(false);
        }
        let from_list = sql_in_list(&from);
        let finished_at = to.is_terminal().then(|| Utc::now().to_rfc3339());
        let query = format!(
            "UPDATE migration_run
             SET status = ?1, error_message = COALESCE(?2, error_message),
                 finished_at = COALESCE(?3, finished_at)
             WHERE uid = ?4 AND status IN ({from_list})"
        );

        let result = sqlx::query(&query)
            .bind(run_status_str(to))
            .bind(error_message)
            .bind(finished_at)
            .bind(uid)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the status last reported by the remote side.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_remote_status(&self, uid: &str, remote_status: &str) -> Result<()> {
        sqlx::query("UPDATE migration_run SET remote_status = ?1 WHERE uid = ?2")
            .bind(remote_status)
            .bind(uid)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Delete all runs of a session. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, org_id: i64, session_uid: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM migration_run WHERE org_id = ?1 AND session_uid = ?2")
                .bind(org_id)
                .bind(session_uid)
                .execute(self.db.as_ref())
                .await?;
        Ok(result.rows_affected())
    }

    /// Fail every run left `Pending` or `Running`, e.g. after a restart.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail_all_active(&self, reason: &str) -> Result<u64> {
        let query = format!(
            "UPDATE migration_run SET status = 'error', error_message = ?1, finished_at = ?2
             WHERE status IN ({})",
            sql_in_list(&ACTIVE.map(run_status_str)),
        );
        let result = sqlx::query(&query)
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
