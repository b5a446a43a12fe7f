//! AES-256-GCM encryption for stored credentials.
//!
//! ```text
//! master key (64 hex chars) ─┬─► HKDF-SHA256 ─► per-record key
//!                            │
//! per-record random salt ────┘
//! ```
//!
//! The stored blob is `hex(nonce || ciphertext || tag)`; the salt is stored
//! hex-encoded next to it.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::config::validate_master_key;
use crate::{AppError, Result};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const HKDF_INFO: &[u8] = b"authbridge-credentials-v1";

/// Ciphertext and salt produced by [`CredentialCipher::encrypt`], both hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// `nonce || ciphertext || tag`.
    pub ciphertext: String,
    /// Key-derivation salt.
    pub salt: String,
}

/// Encrypts and decrypts credential payloads with a process-wide master key.
pub struct CredentialCipher {
    master_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Build a cipher from a 64-character hex master key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the key is malformed.
    pub fn from_hex(master_key: &str) -> Result<Self> {
        validate_master_key(master_key)?;
        let bytes = hex::decode(master_key)
            .map_err(|err| AppError::Config(format!("master key is not hex: {err}")))?;
        let master_key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| AppError::Config("master key must decode to 32 bytes".into()))?;
        Ok(Self { master_key })
    }

    /// Encrypt `plaintext` under a freshly derived key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encryption` if key derivation or sealing fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let mut salt = [0u8; SALT_SIZE];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);

        let cipher = self.cipher_for(&salt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|err| AppError::Encryption(format!("seal failed: {err}")))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);

        Ok(EncryptedBlob {
            ciphertext: hex::encode(blob),
            salt: hex::encode(salt),
        })
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encryption` if the inputs are not hex, too short,
    /// or fail authentication.
    pub fn decrypt(&self, ciphertext: &str, salt: &str) -> Result<Vec<u8>> {
        let blob = hex::decode(ciphertext)
            .map_err(|err| AppError::Encryption(format!("ciphertext is not hex: {err}")))?;
        let salt = hex::decode(salt)
            .map_err(|err| AppError::Encryption(format!("salt is not hex: {err}")))?;
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(AppError::Encryption("ciphertext too short".into()));
        }

        let cipher = self.cipher_for(&salt)?;
        let (nonce, sealed) = blob.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| AppError::Encryption("authentication failed".into()))
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.master_key);
        let mut derived = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut derived)
            .map_err(|_| AppError::Encryption("key derivation failed".into()))?;
        Aes256Gcm::new_from_slice(&derived)
            .map_err(|err| AppError::Encryption(format!("invalid derived key: {err}")))
    }
}
