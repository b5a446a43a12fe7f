//! Encrypting credential store with tier fan-out.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::cipher::CredentialCipher;
use super::fanout::{credential_expiry, storage_slots};
use crate::models::credential::{CredentialSlot, StoredCredential};
use crate::models::provider::Provider;
use crate::persistence::credential_repo::CredentialRepo;
use crate::{AppError, Result};

/// Persists credentials encrypted, one record per logical slot.
#[derive(Clone)]
pub struct CredentialStore {
    repo: CredentialRepo,
    cipher: Arc<CredentialCipher>,
}

impl CredentialStore {
    /// Create a store over `repo` sealing with `cipher`.
    #[must_use]
    pub fn new(repo: CredentialRepo, cipher: Arc<CredentialCipher>) -> Self {
        Self { repo, cipher }
    }

    /// Encrypt and persist `credentials` under every slot the payload qualifies for.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encryption` if sealing fails, `AppError::Db` if persisting fails.
    pub async fn store(
        &self,
        user_id: &str,
        provider: Provider,
        credentials: &Value,
    ) -> Result<Vec<StoredCredential>> {
        let plaintext = serde_json::to_vec(credentials)
            .map_err(|err| AppError::Encryption(format!("cannot serialize credentials: {err}")))?;
        let expires_at = credential_expiry(credentials);

        let slots = storage_slots(provider, credentials);
        let mut stored = Vec::with_capacity(slots.len());
        for slot in slots {
            // Each slot gets its own salt and nonce.
            let blob = self.cipher.encrypt(&plaintext)?;
            let record = self
                .repo
                .upsert(user_id, slot, &blob.ciphertext, &blob.salt, expires_at)
                .await?;
            info!(user_id, slot = %slot, "credential stored");
            stored.push(record);
        }
        Ok(stored)
    }

    /// Look up a slot's record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find(&self, user_id: &str, slot: CredentialSlot) -> Result<Option<StoredCredential>> {
        self.repo.get(user_id, slot).await
    }

    /// List every record for a user.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        self.repo.list_for_user(user_id).await
    }

    /// Decrypt a record back into its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encryption` if authentication or parsing fails.
    pub fn decrypt(&self, record: &StoredCredential) -> Result<Value> {
        let plaintext = self.cipher.decrypt(&record.ciphertext, &record.salt)?;
        serde_json::from_slice(&plaintext)
            .map_err(|err| AppError::Encryption(format!("decrypted payload is not json: {err}")))
    }

    /// Record a validation outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_validation(&self, id: &str, is_valid: bool) -> Result<()> {
        self.repo.update_validation(id, is_valid).await
    }
}
