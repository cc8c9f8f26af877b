use std::path::Path;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use thiserror::Error;
use tracing::{debug, warn};

use crate::provider::{Provider, ProviderAuth};
use crate::store::{ByokKeyRow, KeyTestStatus, SqliteStore, StoreError};

const NONCE_SIZE: usize = 12;
/// Ciphertext format marker; bump if the scheme ever changes.
const CIPHERTEXT_PREFIX: &str = "enc1:";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("no key on file for ({user_id}, {provider})")]
    NotFound { user_id: String, provider: String },
    #[error("master key io error: {0}")]
    KeyFile(#[from] std::io::Error),
}

/// Encrypted store of user-supplied provider credentials. The master key
/// lives outside the primary datastore; plaintext secrets exist only
/// transiently inside the router's outbound-call path.
#[derive(Clone)]
pub struct ByokVault {
    master_key: [u8; 32],
    store: SqliteStore,
}

impl std::fmt::Debug for ByokVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByokVault")
            .field("master_key", &"<redacted>")
            .field("store", &self.store)
            .finish()
    }
}

impl ByokVault {
    pub fn new(master_key: [u8; 32], store: SqliteStore) -> Self {
        Self { master_key, store }
    }

    pub fn from_key_file(path: &Path, store: SqliteStore) -> Result<Self, VaultError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() != 32 {
            return Err(VaultError::Cipher(format!(
                "master key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self::new(key, store))
    }

    /// Generates a fresh master key and writes it to `path`.
    pub fn generate_key_file(path: &Path, store: SqliteStore) -> Result<Self, VaultError> {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        std::fs::write(path, key)?;
        Ok(Self::new(key, store))
    }

    /// Encrypts and persists a user's provider secret. A re-stored key
    /// resets to `Unverified` until it passes a live test again.
    pub async fn store_key(
        &self,
        user_id: &str,
        provider: &str,
        plaintext_secret: &str,
    ) -> Result<ByokKeyRow, VaultError> {
        let encrypted_secret = self.encrypt(plaintext_secret)?;
        let row = ByokKeyRow {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            encrypted_secret,
            enabled: true,
            last_tested_at_ms: None,
            test_status: KeyTestStatus::Unverified,
        };
        self.store.upsert_byok_key(&row).await?;
        debug!(user_id, provider, "stored byok key");
        Ok(row)
    }

    /// Decrypts the secret for one (user, provider) pair. Callers must
    /// not persist or log the returned value.
    pub async fn get_secret(&self, user_id: &str, provider: &str) -> Result<String, VaultError> {
        let row = self
            .store
            .get_byok_key(user_id, provider)
            .await?
            .ok_or_else(|| VaultError::NotFound {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
            })?;
        self.decrypt(&row.encrypted_secret)
    }

    pub async fn get_record(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<ByokKeyRow>, VaultError> {
        Ok(self.store.get_byok_key(user_id, provider).await?)
    }

    /// Enabled key rows for a user, keyed by provider. Secrets stay
    /// encrypted; this is what candidate selection consumes.
    pub async fn usable_keys(
        &self,
        user_id: &str,
    ) -> Result<Vec<ByokKeyRow>, VaultError> {
        let rows = self.store.list_byok_keys(user_id).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.enabled && row.test_status != KeyTestStatus::Failed)
            .collect())
    }

    /// Validates the stored secret with a live probe against the
    /// provider and records the outcome.
    pub async fn test_key(
        &self,
        user_id: &str,
        provider: &dyn Provider,
    ) -> Result<KeyTestStatus, VaultError> {
        let secret = self.get_secret(user_id, provider.id()).await?;
        let status = match provider.probe(ProviderAuth::Byok(&secret)).await {
            Ok(_) => KeyTestStatus::Passed,
            Err(err) => {
                warn!(user_id, provider = provider.id(), error = %err, "byok key test failed");
                KeyTestStatus::Failed
            }
        };
        self.store
            .set_byok_test_status(
                user_id,
                provider.id(),
                status,
                crate::store::now_millis() as u64,
            )
            .await?;
        Ok(status)
    }

    pub async fn revoke(&self, user_id: &str, provider: &str) -> Result<bool, VaultError> {
        let removed = self.store.delete_byok_key(user_id, provider).await?;
        if removed {
            debug!(user_id, provider, "revoked byok key");
        }
        Ok(removed)
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.master_key)
            .map_err(|err| VaultError::Cipher(err.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| VaultError::Cipher(err.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        let encoded = base64::engine::general_purpose::STANDARD.encode(&combined);
        Ok(format!("{CIPHERTEXT_PREFIX}{encoded}"))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String, VaultError> {
        let encoded = encrypted
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(VaultError::MalformedCiphertext)?;
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::MalformedCiphertext)?;
        if combined.len() < NONCE_SIZE {
            return Err(VaultError::MalformedCiphertext);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(&self.master_key)
            .map_err(|err| VaultError::Cipher(err.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|err| VaultError::Cipher(err.to_string()))?;

        String::from_utf8(plaintext).map_err(|_| VaultError::MalformedCiphertext)
    }
}
