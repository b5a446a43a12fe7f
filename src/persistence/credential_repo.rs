//! Encrypted credential repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::credential::{CredentialSlot, StoredCredential};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for credential records.
#[derive(Clone)]
pub struct CredentialRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    user_id: String,
    slot: String,
    ciphertext: String,
    salt: String,
    is_valid: bool,
    last_verified: Option<String>,
    expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CredentialRow {
    fn into_credential(self) -> Result<StoredCredential> {
        let slot: CredentialSlot = self
            .slot
            .parse()
            .map_err(|_| AppError::Db(format!("invalid credential slot: {}", self.slot)))?;
        Ok(StoredCredential {
            id: self.id,
            user_id: self.user_id,
            slot,
            ciphertext: self.ciphertext,
            salt: self.salt,
            is_valid: self.is_valid,
            last_verified: parse_opt_ts("last_verified", self.last_verified.as_deref())?,
            expires_at: parse_opt_ts("expires_at", self.expires_at.as_deref())?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

impl CredentialRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the credential occupying `(user_id, slot)`.
    ///
    /// Replacing resets the validation state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn upsert(
        &self,
        user_id: &str,
        slot: CredentialSlot,
        ciphertext: &str,
        salt: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<StoredCredential> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO provider_credential (id, user_id, slot, ciphertext, salt, is_valid,
             last_verified, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, NULL, ?6, ?7, ?7)
             ON CONFLICT(user_id, slot) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                salt = excluded.salt,
                is_valid = 1,
                last_verified = NULL,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(slot.as_str())
        .bind(ciphertext)
        .bind(salt)
        .bind(expires_at.map(|dt| dt.to_rfc3339()))
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        self.get(user_id, slot)
            .await?
            .ok_or_else(|| AppError::Db("credential vanished after upsert".into()))
    }

    /// Retrieve the credential for `(user_id, slot)`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, user_id: &str, slot: CredentialSlot) -> Result<Option<StoredCredential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT * FROM provider_credential WHERE user_id = ?1 AND slot = ?2",
        )
        .bind(user_id)
        .bind(slot.as_str())
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(CredentialRow::into_credential).transpose()
    }

    /// List every credential stored for a user.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        let rows: Vec<CredentialRow> = sqlx::query_as(
            "SELECT * FROM provider_credential WHERE user_id = ?1 ORDER BY slot",
        )
        .bind(user_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(CredentialRow::into_credential).collect()
    }

    /// Record a validation outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_validation(&self, id: &str, is_valid: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE provider_credential SET is_valid = ?1, last_verified = ?2, updated_at = ?2
             WHERE id = ?3",
        )
        .bind(is_valid)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}
