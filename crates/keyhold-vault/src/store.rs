//! The credential vault.
//!
//! [`CredentialVault`] owns the persisted [`TokenRecord`] and
//! [`StoredApiKey`]. It serializes them to JSON and hands the bytes to the
//! [`StorageBackend`] chosen at construction. Raw API keys are reduced to
//! their SHA-256 digest before anything reaches the backend.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::backend::{HostCapabilities, Slot, StorageBackend, resolve_backend};
use crate::error::{Result, VaultError};
use crate::record::{ApiKeyMetadata, StoredApiKey, TokenRecord, TokenType, normalize_api_key};

/// Encrypted at-rest storage for one principal's credentials.
pub struct CredentialVault {
    backend: Arc<dyn StorageBackend>,
    /// Set once legacy migration has been attempted on this instance.
    pub(crate) migration_attempted: AtomicBool,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl CredentialVault {
    /// A vault over an explicit backend.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            migration_attempted: AtomicBool::new(false),
        }
    }

    /// A vault over the best backend the host offers.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NoBackend`] when the capabilities are empty.
    pub fn from_capabilities(caps: &HostCapabilities) -> Result<Self> {
        Ok(Self::new(resolve_backend(caps)?))
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    // -----------------------------------------------------------------------
    // Token record
    // -----------------------------------------------------------------------

    /// Persist a token record, replacing any previous one.
    ///
    /// API-key records are stored with their key reduced to its digest and
    /// with no expiry.
    pub fn store(&self, record: &TokenRecord) -> Result<()> {
        let mut record = record.clone().normalized();
        if record.token_type == TokenType::ApiKey {
            record.access_token =
                normalize_api_key(Zeroizing::new(std::mem::take(&mut record.access_token)))?;
        }
        self.write_json(Slot::Token, &record)?;
        tracing::debug!(
            backend = self.backend.name(),
            token_type = %record.token_type,
            "stored token record"
        );
        Ok(())
    }

    /// The persisted token record, if any.
    pub fn retrieve(&self) -> Result<Option<TokenRecord>> {
        Ok(self
            .read_json::<TokenRecord>(Slot::Token)?
            .map(TokenRecord::normalized))
    }

    /// Remove the token record. Clearing an empty vault is not an error.
    pub fn clear(&self) -> Result<()> {
        self.backend.delete(Slot::Token)?;
        tracing::info!(backend = self.backend.name(), "cleared token record");
        Ok(())
    }

    /// Whether `record` should no longer be presented to the server.
    pub fn is_expired(&self, record: &TokenRecord) -> bool {
        record.is_expired()
    }

    // -----------------------------------------------------------------------
    // API key record
    // -----------------------------------------------------------------------

    /// Persist the digest of `raw` with its metadata.
    ///
    /// `raw` is dropped (and wiped) as soon as it has been hashed. Storing an
    /// already-digested value writes the same digest again.
    pub fn store_api_key(
        &self,
        raw: Zeroizing<String>,
        metadata: ApiKeyMetadata,
    ) -> Result<StoredApiKey> {
        let digest = normalize_api_key(raw)?;
        let stored = StoredApiKey::new(digest, metadata, Utc::now());
        self.write_json(Slot::ApiKey, &stored)?;
        tracing::info!(
            backend = self.backend.name(),
            org_id = stored.org_id.as_deref().unwrap_or("-"),
            environment = stored.environment.as_deref().unwrap_or("-"),
            "stored api key digest"
        );
        Ok(stored)
    }

    /// The persisted API key record.
    ///
    /// A record whose digest is not in canonical form is normalized and
    /// rewritten before it is returned.
    pub fn retrieve_api_key(&self) -> Result<Option<StoredApiKey>> {
        let Some(mut stored) = self.read_json::<StoredApiKey>(Slot::ApiKey)? else {
            return Ok(None);
        };

        let digest = normalize_api_key(Zeroizing::new(stored.digest.clone()))?;
        if digest != stored.digest {
            stored.digest = digest;
            self.write_json(Slot::ApiKey, &stored)?;
            tracing::info!("rewrote api key record in normalized form");
        }
        Ok(Some(stored))
    }

    /// Replace the metadata on the stored API key, keeping its digest and
    /// creation time. Returns `None` when no key is stored.
    pub fn rotate_api_key_metadata(
        &self,
        metadata: ApiKeyMetadata,
    ) -> Result<Option<StoredApiKey>> {
        let Some(current) = self.read_json::<StoredApiKey>(Slot::ApiKey)? else {
            return Ok(None);
        };

        let digest = normalize_api_key(Zeroizing::new(current.digest))?;
        let rotated = StoredApiKey::new(digest, metadata, current.created_at);
        self.write_json(Slot::ApiKey, &rotated)?;
        tracing::info!(backend = self.backend.name(), "rotated api key metadata");
        Ok(Some(rotated))
    }

    /// Remove the API key record.
    pub fn clear_api_key(&self) -> Result<()> {
        self.backend.delete(Slot::ApiKey)?;
        tracing::info!(backend = self.backend.name(), "cleared api key record");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn write_json<T: Serialize>(&self, slot: Slot, value: &T) -> Result<()> {
        let bytes = Zeroizing::new(serde_json::to_vec(value)?);
        self.backend.write(slot, &bytes)
    }

    fn read_json<T: DeserializeOwned>(&self, slot: Slot) -> Result<Option<T>> {
        let Some(bytes) = self.backend.read(slot)? else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(bytes);
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VaultError::CorruptEntry {
                slot: slot.as_str(),
                reason: format!("unreadable record: {e}"),
            })
    }
}
