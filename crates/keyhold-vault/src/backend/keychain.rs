//! OS keychain storage.
//!
//! - **macOS**: Keychain Services via `security-framework` generic passwords.
//! - **Linux / Windows**: the native credential stores via `keyring`
//!   (kernel keyutils, Windows Credential Manager).
//! - **Elsewhere**: unavailable; [`resolve_backend`](super::resolve_backend)
//!   falls through to the next backend.
//!
//! The keychain protects entries itself, so slot bytes are stored as-is.
//! Each slot is one entry with `account = slot name`.

use super::{Slot, StorageBackend};
use crate::error::{Result, VaultError};

/// The Security framework "item not found" code (`errSecItemNotFound`).
#[cfg(target_os = "macos")]
const MACOS_ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// Slot storage in the OS keychain.
pub struct KeychainBackend {
    service: String,
}

impl KeychainBackend {
    /// Keychain storage under `service` (e.g. `dev.keyhold.vault`).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::BackendUnavailable`] on platforms without a
    /// supported keychain.
    pub fn new(service: impl Into<String>) -> Result<Self> {
        let service = service.into();
        if cfg!(any(
            target_os = "macos",
            target_os = "linux",
            target_os = "windows"
        )) {
            Ok(Self { service })
        } else {
            Err(VaultError::BackendUnavailable {
                backend: "keychain",
                reason: "no supported OS keychain on this platform".into(),
            })
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn failed(slot: Slot, reason: impl std::fmt::Display) -> VaultError {
        VaultError::BackendFailed {
            backend: "keychain",
            slot: slot.as_str(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(target_os = "macos")]
impl StorageBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        use security_framework::passwords::get_generic_password;

        match get_generic_password(&self.service, slot.as_str()) {
            Ok(data) => Ok(Some(data.to_vec())),
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(e) => Err(Self::failed(slot, e)),
        }
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        use security_framework::passwords::set_generic_password;

        set_generic_password(&self.service, slot.as_str(), bytes)
            .map_err(|e| Self::failed(slot, e))?;
        tracing::debug!(service = %self.service, slot = %slot, "wrote keychain entry");
        Ok(())
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        use security_framework::passwords::delete_generic_password;

        match delete_generic_password(&self.service, slot.as_str()) {
            Ok(()) => {
                tracing::info!(service = %self.service, slot = %slot, "deleted keychain entry");
                Ok(())
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(Self::failed(slot, e)),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl StorageBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        let entry =
            keyring::Entry::new(&self.service, slot.as_str()).map_err(|e| Self::failed(slot, e))?;
        match entry.get_secret() {
            Ok(data) => Ok(Some(data)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Self::failed(slot, e)),
        }
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        let entry =
            keyring::Entry::new(&self.service, slot.as_str()).map_err(|e| Self::failed(slot, e))?;
        entry.set_secret(bytes).map_err(|e| Self::failed(slot, e))?;
        tracing::debug!(service = %self.service, slot = %slot, "wrote keychain entry");
        Ok(())
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        let entry =
            keyring::Entry::new(&self.service, slot.as_str()).map_err(|e| Self::failed(slot, e))?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::info!(service = %self.service, slot = %slot, "deleted keychain entry");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Self::failed(slot, e)),
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
impl StorageBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        Err(Self::failed(slot, "keychain unsupported on this platform"))
    }

    fn write(&self, slot: Slot, _bytes: &[u8]) -> Result<()> {
        Err(Self::failed(slot, "keychain unsupported on this platform"))
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        Err(Self::failed(slot, "keychain unsupported on this platform"))
    }
}
