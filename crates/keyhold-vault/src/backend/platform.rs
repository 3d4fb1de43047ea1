//! Adapter over host-provided secure storage (mobile keystores, secure
//! enclaves, TPM-backed stores on embedded targets).

use std::sync::Arc;

use super::{Slot, StorageBackend};
use crate::error::Result;

/// Key prefix applied to every entry written through the adapter.
const KEY_PREFIX: &str = "keyhold.";

/// Secure storage primitives supplied by the host. The host guarantees the
/// bytes are protected at rest.
pub trait PlatformSecureStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// [`StorageBackend`] over a [`PlatformSecureStore`].
pub struct PlatformSecureBackend {
    store: Arc<dyn PlatformSecureStore>,
}

impl PlatformSecureBackend {
    pub fn new(store: Arc<dyn PlatformSecureStore>) -> Self {
        Self { store }
    }

    fn key(slot: Slot) -> String {
        format!("{KEY_PREFIX}{}", slot.as_str())
    }
}

impl StorageBackend for PlatformSecureBackend {
    fn name(&self) -> &'static str {
        "platform-secure"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        self.store.get(&Self::key(slot))
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        self.store.set(&Self::key(slot), bytes)
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        self.store.remove(&Self::key(slot))
    }
}
