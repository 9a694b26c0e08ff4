//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so this is
//! safe to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// Every table carries `org_id`; list and get queries always filter on it.
/// Sessions keep a plain `token_uid` rather than a foreign key so a revoked
/// token leaves its sessions in place (they fail validation from then on).
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS migration_token (
    uid               TEXT PRIMARY KEY NOT NULL,
    org_id            INTEGER NOT NULL,
    secret            TEXT NOT NULL,
    remote_account_id TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    expires_at        TEXT
);

CREATE TABLE IF NOT EXISTS migration_session (
    uid               TEXT PRIMARY KEY NOT NULL,
    org_id            INTEGER NOT NULL,
    token_uid         TEXT NOT NULL,
    remote_account_id TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_run (
    uid               TEXT PRIMARY KEY NOT NULL,
    org_id            INTEGER NOT NULL,
    session_uid       TEXT NOT NULL REFERENCES migration_session(uid),
    status            TEXT NOT NULL CHECK(status IN ('pending','running','finished','error','cancelled')),
    error_message     TEXT,
    remote_status     TEXT,
    started_at        TEXT NOT NULL,
    finished_at       TEXT
);

CREATE TABLE IF NOT EXISTS migration_snapshot (
    uid               TEXT PRIMARY KEY NOT NULL,
    org_id            INTEGER NOT NULL,
    session_uid       TEXT NOT NULL REFERENCES migration_session(uid),
    run_uid           TEXT NOT NULL REFERENCES migration_run(uid),
    state             TEXT NOT NULL CHECK(state IN ('init','creating','pending_upload','uploading','finished','error','cancelled')),
    resource_count    INTEGER NOT NULL DEFAULT 0,
    upload_key        TEXT,
    payload           BLOB,
    error_message     TEXT,
    reconcile_pending INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    finished_at       TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_token_org ON migration_token(org_id);
CREATE INDEX IF NOT EXISTS idx_session_org ON migration_session(org_id);
CREATE INDEX IF NOT EXISTS idx_run_session ON migration_run(org_id, session_uid);
CREATE INDEX IF NOT EXISTS idx_snapshot_session ON migration_snapshot(org_id, session_uid);
CREATE INDEX IF NOT EXISTS idx_snapshot_run ON migration_snapshot(run_uid);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
