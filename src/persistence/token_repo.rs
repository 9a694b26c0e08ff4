//! Migration token repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::token::MigrationToken;
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_optional_timestamp, parse_timestamp};

/// Repository wrapper around `SQLite` for token records.
#[derive(Clone)]
pub struct TokenRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct TokenRow {
    uid: String,
    org_id: i64,
    secret: String,
    remote_account_id: String,
    created_at: String,
    expires_at: Option<String>,
}

impl TokenRow {
    fn into_token(self) -> Result<MigrationToken> {
        Ok(MigrationToken {
            created_at: parse_timestamp("created_at", &self.created_at)?,
            expires_at: parse_optional_timestamp("expires_at", self.expires_at.as_deref())?,
            uid: self.uid,
            org_id: self.org_id,
            secret: self.secret,
            remote_account_id: self.remote_account_id,
        })
    }
}

impl TokenRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a token, replacing `replaces` (an expired token) atomically.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the organization already holds a
    /// token, or `AppError::Db` if the write fails.
    pub async fn insert(
        &self,
        token: &MigrationToken,
        replaces: Option<&str>,
    ) -> Result<MigrationToken> {
        let mut tx = self.db.begin().await?;

        if let Some(old_uid) = replaces {
            sqlx::query("DELETE FROM migration_token WHERE uid = ?1 AND org_id = ?2")
                .bind(old_uid)
                .bind(token.org_id)
                .execute(&mut *tx)
                .await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO migration_token (uid, org_id, secret, remote_account_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&token.uid)
        .bind(token.org_id)
        .bind(&token.secret)
        .bind(&token.remote_account_id)
        .bind(token.created_at.to_rfc3339())
        .bind(token.expires_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(AppError::Conflict(format!(
                    "organization {} already has a migration token",
                    token.org_id
                )));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(token.clone())
    }

    /// Retrieve the organization's token, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_for_org(&self, org_id: i64) -> Result<Option<MigrationToken>> {
        let row: Option<TokenRow> =
            sqlx::query_as("SELECT * FROM migration_token WHERE org_id = ?1")
                .bind(org_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(TokenRow::into_token).transpose()
    }

    /// Retrieve a token by identifier within an organization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, org_id: i64, uid: &str) -> Result<Option<MigrationToken>> {
        let row: Option<TokenRow> =
            sqlx::query_as("SELECT * FROM migration_token WHERE uid = ?1 AND org_id = ?2")
                .bind(uid)
                .bind(org_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(TokenRow::into_token).transpose()
    }

    /// Delete a token. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, org_id: i64, uid: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM migration_token WHERE uid = ?1 AND org_id = ?2")
            .bind(uid)
            .bind(org_id)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
