//! In-process storage, used by tests and by hosts that must not persist.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyValueStore, PlatformSecureStore, Slot, StorageBackend};
use crate::error::{Result, VaultError};

/// Volatile map-backed storage.
///
/// Also implements [`PlatformSecureStore`] and [`KeyValueStore`] so it can
/// stand in for either host primitive.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes under `key`, for inspecting what a wrapping backend wrote.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| VaultError::Internal(format!("memory backend lock poisoned: {e}")))?;
        Ok(f(&mut entries))
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        self.with_entries(|e| e.get(slot.as_str()).cloned())
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        self.with_entries(|e| {
            e.insert(slot.as_str().to_string(), bytes.to_vec());
        })
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        self.with_entries(|e| {
            e.remove(slot.as_str());
        })
    }
}

impl PlatformSecureStore for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_entries(|e| e.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_entries(|e| {
            e.insert(key.to_string(), value.to_vec());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_entries(|e| {
            e.remove(key);
        })
    }
}

impl KeyValueStore for MemoryBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|e| {
            e.get(key)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        })
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|e| {
            e.insert(key.to_string(), value.as_bytes().to_vec());
        })
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.with_entries(|e| {
            e.remove(key);
        })
    }
}
