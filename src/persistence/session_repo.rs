//! Migration session repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::session::CloudMigrationSession;
use crate::Result;

use super::db::Database;
use super::parse_timestamp;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    uid: String,
    org_id: i64,
    token_uid: String,
    remote_account_id: String,
    created_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<CloudMigrationSession> {
        Ok(CloudMigrationSession {
            created_at: parse_timestamp("created_at", &self.created_at)?,
            uid: self.uid,
            org_id: self.org_id,
            token_uid: self.token_uid,
            remote_account_id: self.remote_account_id,
        })
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &CloudMigrationSession) -> Result<CloudMigrationSession> {
        sqlx::query(
            "INSERT INTO migration_session (uid, org_id, token_uid, remote_account_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session.uid)
        .bind(session.org_id)
        .bind(&session.token_uid)
        .bind(&session.remote_account_id)
        .bind(session.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier within an organization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, org_id: i64, uid: &str) -> Result<Option<CloudMigrationSession>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM migration_session WHERE uid = ?1 AND org_id = ?2")
                .bind(uid)
                .bind(org_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// List an organization's sessions in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_org(&self, org_id: i64) -> Result<Vec<CloudMigrationSession>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM migration_session WHERE org_id = ?1 ORDER BY rowid ASC")
                .bind(org_id)
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List the sessions bound to a token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_token(
        &self,
        org_id: i64,
        token_uid: &str,
    ) -> Result<Vec<CloudMigrationSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM migration_session WHERE org_id = ?1 AND token_uid = ?2 ORDER BY rowid ASC",
        )
        .bind(org_id)
        .bind(token_uid)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Delete a session. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, org_id: i64, uid: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM migration_session WHERE uid = ?1 AND org_id = ?2")
            .bind(uid)
            .bind(org_id)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
