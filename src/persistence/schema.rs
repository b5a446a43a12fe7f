//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS auth_session (
    id              TEXT PRIMARY KEY NOT NULL,
    user_id         TEXT NOT NULL,
    provider        TEXT NOT NULL CHECK(provider IN ('codex','claude_code','gemini_cli')),
    status          TEXT NOT NULL CHECK(status IN ('started','vm_created','ready','awaiting_user_auth','completed','failed','timeout','cancelled')),
    ephemeral_vm_id TEXT,
    vm_ip           TEXT,
    display_url     TEXT,
    auth_url        TEXT,
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    timeout_at      TEXT
);

CREATE TABLE IF NOT EXISTS provider_credential (
    id              TEXT PRIMARY KEY NOT NULL,
    user_id         TEXT NOT NULL,
    slot            TEXT NOT NULL,
    ciphertext      TEXT NOT NULL,
    salt            TEXT NOT NULL,
    is_valid        INTEGER NOT NULL DEFAULT 1,
    last_verified   TEXT,
    expires_at      TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE(user_id, slot)
);

CREATE TABLE IF NOT EXISTS vm_cleanup_task (
    id              TEXT PRIMARY KEY NOT NULL,
    vm_id           TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    due_at          TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','processing','completed','failed')),
    error           TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS display_handshake (
    session_id      TEXT PRIMARY KEY NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_user ON auth_session(user_id);
CREATE INDEX IF NOT EXISTS idx_session_status ON auth_session(status);
CREATE INDEX IF NOT EXISTS idx_cleanup_due ON vm_cleanup_task(status, due_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
