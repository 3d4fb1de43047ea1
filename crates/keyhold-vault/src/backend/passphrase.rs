//! Encrypted storage over a browser-style string key/value store.
//!
//! On first write a random passphrase is generated and persisted under its
//! own key next to the ciphertext. Every slot value is a base64 envelope
//! sealed with a PBKDF2-derived AES-256-GCM key. This only keeps values
//! opaque to casual inspection of the store; anything that can read the
//! store can read the passphrase too.

use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use zeroize::Zeroizing;

use super::{Slot, StorageBackend};
use crate::crypto;
use crate::error::{Result, VaultError};

const PASSPHRASE_KEY: &str = "keyhold.vault.passphrase";
const PASSPHRASE_BYTES: usize = 32;

/// String key/value storage supplied by the host (e.g. `localStorage`).
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// [`StorageBackend`] that encrypts values before handing them to a
/// [`KeyValueStore`].
pub struct PassphraseBackend {
    store: Arc<dyn KeyValueStore>,
    passphrase: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl PassphraseBackend {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            passphrase: Mutex::new(None),
        }
    }

    fn item_key(slot: Slot) -> String {
        format!("keyhold.vault.{}", slot.as_str())
    }

    /// Load the persisted passphrase, creating it when `create` is set.
    fn passphrase(&self, create: bool) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let mut cached = self
            .passphrase
            .lock()
            .map_err(|e| VaultError::Internal(format!("passphrase lock poisoned: {e}")))?;

        if let Some(pass) = cached.as_ref() {
            return Ok(Some(pass.clone()));
        }

        if let Some(encoded) = self.store.get_item(PASSPHRASE_KEY)? {
            let decoded = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| VaultError::CorruptEntry {
                    slot: "passphrase",
                    reason: format!("invalid base64: {e}"),
                })?;
            let pass = Zeroizing::new(decoded);
            *cached = Some(pass.clone());
            return Ok(Some(pass));
        }

        if !create {
            return Ok(None);
        }

        let pass = Zeroizing::new(crypto::random_bytes(PASSPHRASE_BYTES)?);
        self.store
            .set_item(PASSPHRASE_KEY, &STANDARD.encode(pass.as_slice()))?;
        tracing::debug!("generated local vault passphrase");
        *cached = Some(pass.clone());
        Ok(Some(pass))
    }
}

impl StorageBackend for PassphraseBackend {
    fn name(&self) -> &'static str {
        "passphrase"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.store.get_item(&Self::item_key(slot))? else {
            return Ok(None);
        };

        let envelope = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| VaultError::CorruptEntry {
                slot: slot.as_str(),
                reason: format!("invalid base64: {e}"),
            })?;

        let pass = self.passphrase(false)?.ok_or_else(|| VaultError::CorruptEntry {
            slot: slot.as_str(),
            reason: "ciphertext present but passphrase missing".into(),
        })?;

        crypto::open_envelope(&envelope, &pass, slot.as_str()).map(Some)
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        let pass = self
            .passphrase(true)?
            .ok_or_else(|| VaultError::Internal("passphrase unavailable after create".into()))?;
        let envelope = crypto::seal_envelope(bytes, &pass)?;
        self.store
            .set_item(&Self::item_key(slot), &STANDARD.encode(envelope))
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        self.store.remove_item(&Self::item_key(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn roundtrip_and_passphrase_persisted_alongside() {
        let host = Arc::new(MemoryBackend::new());
        let backend = PassphraseBackend::new(host.clone());

        backend.write(Slot::Token, b"{\"t\":1}").unwrap();
        assert!(host.raw(PASSPHRASE_KEY).is_some());

        let stored = String::from_utf8(host.raw("keyhold.vault.token").unwrap()).unwrap();
        assert!(!stored.contains("\"t\""));

        // A fresh backend over the same store finds the same passphrase.
        let reopened = PassphraseBackend::new(host);
        assert_eq!(reopened.read(Slot::Token).unwrap().unwrap(), b"{\"t\":1}");
    }

    #[test]
    fn missing_passphrase_with_ciphertext_is_corrupt() {
        let host = Arc::new(MemoryBackend::new());
        PassphraseBackend::new(host.clone())
            .write(Slot::Token, b"x")
            .unwrap();
        host.remove_item(PASSPHRASE_KEY).unwrap();

        let result = PassphraseBackend::new(host).read(Slot::Token);
        assert!(matches!(result, Err(VaultError::CorruptEntry { .. })));
    }

    #[test]
    fn empty_store_reads_none_without_creating_passphrase() {
        let host = Arc::new(MemoryBackend::new());
        let backend = PassphraseBackend::new(host.clone());
        assert!(backend.read(Slot::ApiKey).unwrap().is_none());
        assert!(host.is_empty());
    }
}
