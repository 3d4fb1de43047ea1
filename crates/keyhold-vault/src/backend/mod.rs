//! Storage backends for the credential vault.
//!
//! The vault never probes the host itself. The host application describes
//! what it has in a [`HostCapabilities`] value and [`resolve_backend`] picks
//! one backend, in priority order:
//!
//! 1. OS keychain ([`KeychainBackend`])
//! 2. Encrypted file ([`EncryptedFileBackend`])
//! 3. Platform secure storage ([`PlatformSecureBackend`])
//! 4. Passphrase-encrypted key/value storage ([`PassphraseBackend`])
//!
//! Backends store opaque bytes per [`Slot`]. Backends that do not offer
//! OS-level protection encrypt what they persist.

mod file;
mod keychain;
mod memory;
mod passphrase;
mod platform;

use std::path::PathBuf;
use std::sync::Arc;

pub use file::EncryptedFileBackend;
pub use keychain::KeychainBackend;
pub use memory::MemoryBackend;
pub use passphrase::{KeyValueStore, PassphraseBackend};
pub use platform::{PlatformSecureBackend, PlatformSecureStore};

use crate::error::{Result, VaultError};

/// A named storage location inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The OAuth / API-key [`TokenRecord`](crate::TokenRecord).
    Token,
    /// The [`StoredApiKey`](crate::StoredApiKey) digest record.
    ApiKey,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::ApiKey => "api_key",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte storage for vault slots.
///
/// Implementations must be `Send + Sync` so a vault can be shared across
/// async tasks.
pub trait StorageBackend: Send + Sync {
    /// Short backend identifier for logs and errors.
    fn name(&self) -> &'static str;

    /// Read a slot. `Ok(None)` when nothing is stored.
    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a slot.
    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()>;

    /// Remove a slot. Removing an empty slot is not an error.
    fn delete(&self, slot: Slot) -> Result<()>;
}

/// What the host can offer, resolved once by the host application.
#[derive(Default, Clone)]
pub struct HostCapabilities {
    /// Keychain service name, when an OS keychain is usable.
    pub keychain_service: Option<String>,
    /// Writable directory for the encrypted file backend.
    pub data_dir: Option<PathBuf>,
    /// Mobile / embedded secure enclave primitives.
    pub platform_store: Option<Arc<dyn PlatformSecureStore>>,
    /// Browser-style key/value storage.
    pub key_value_store: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("keychain_service", &self.keychain_service)
            .field("data_dir", &self.data_dir)
            .field("platform_store", &self.platform_store.is_some())
            .field("key_value_store", &self.key_value_store.is_some())
            .finish()
    }
}

/// Pick the highest-priority backend the host supports.
///
/// # Errors
///
/// Returns [`VaultError::NoBackend`] if the host offers nothing usable.
pub fn resolve_backend(caps: &HostCapabilities) -> Result<Arc<dyn StorageBackend>> {
    if let Some(service) = &caps.keychain_service {
        match KeychainBackend::new(service) {
            Ok(backend) => {
                tracing::info!(backend = backend.name(), "using OS keychain for credentials");
                return Ok(Arc::new(backend));
            }
            Err(e) => {
                tracing::debug!(error = %e, "OS keychain unavailable, trying next backend");
            }
        }
    }

    if let Some(dir) = &caps.data_dir {
        let backend = EncryptedFileBackend::host_bound(dir);
        tracing::info!(dir = %dir.display(), "using encrypted file storage for credentials");
        return Ok(Arc::new(backend));
    }

    if let Some(store) = &caps.platform_store {
        tracing::info!("using platform secure storage for credentials");
        return Ok(Arc::new(PlatformSecureBackend::new(Arc::clone(store))));
    }

    if let Some(store) = &caps.key_value_store {
        tracing::info!("using passphrase-encrypted key/value storage for credentials");
        return Ok(Arc::new(PassphraseBackend::new(Arc::clone(store))));
    }

    Err(VaultError::NoBackend)
}
