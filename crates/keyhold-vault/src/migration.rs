//! One-shot migration from the legacy plaintext credentials file.
//!
//! Older clients kept credentials in a plain JSON file. On first run the
//! file is read, its contents are written through the vault (so the API key
//! is hashed and the token encrypted), and the file is deleted. A failed
//! delete only logs: migrating the same file again later is harmless.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::record::{ApiKeyMetadata, TokenRecord, TokenType};
use crate::store::CredentialVault;

/// Location of a legacy plaintext credentials file.
#[derive(Debug, Clone)]
pub struct LegacyCredentials {
    path: PathBuf,
}

/// The plaintext layout written by older clients.
#[derive(Deserialize)]
struct LegacyFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Issue time in epoch milliseconds.
    #[serde(default)]
    issued_at: Option<i64>,
    #[serde(default)]
    api_key: Option<String>,
}

impl LegacyCredentials {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<LegacyFile>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VaultError::MigrationFailed {
                    reason: format!("cannot read legacy file: {e}"),
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VaultError::MigrationFailed {
                reason: format!("legacy file is not valid JSON: {e}"),
            })
    }
}

/// What a migration run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub token_migrated: bool,
    pub api_key_migrated: bool,
    pub legacy_removed: bool,
}

impl MigrationReport {
    /// True when nothing was found or the migration had already run.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

impl CredentialVault {
    /// Move legacy plaintext credentials into the vault and delete the
    /// legacy file.
    ///
    /// Only the first call on a vault instance does any work. Records
    /// already present in the vault are not overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MigrationFailed`] when the legacy file cannot
    /// be read or parsed; the file is left in place. Vault write errors
    /// propagate as-is.
    pub fn migrate_legacy(&self, legacy: &LegacyCredentials) -> Result<MigrationReport> {
        if self.migration_attempted.swap(true, Ordering::SeqCst) {
            tracing::debug!("legacy migration already attempted on this vault");
            return Ok(MigrationReport::default());
        }

        let Some(file) = legacy.load()? else {
            return Ok(MigrationReport::default());
        };

        let mut report = MigrationReport::default();

        if let Some(access_token) = file.access_token.filter(|t| !t.is_empty()) {
            if self.retrieve()?.is_none() {
                let record = TokenRecord {
                    access_token,
                    refresh_token: file.refresh_token,
                    token_type: TokenType::Bearer,
                    expires_in_seconds: file.expires_in.unwrap_or(0),
                    issued_at_epoch_ms: file.issued_at,
                };
                self.store(&record)?;
                report.token_migrated = true;
            } else {
                tracing::debug!("vault already holds a token record, legacy token ignored");
            }
        }

        if let Some(api_key) = file.api_key.filter(|k| !k.trim().is_empty()) {
            if self.retrieve_api_key()?.is_none() {
                self.store_api_key(Zeroizing::new(api_key), ApiKeyMetadata::default())?;
                report.api_key_migrated = true;
            } else {
                tracing::debug!("vault already holds an api key, legacy key ignored");
            }
        }

        match std::fs::remove_file(legacy.path()) {
            Ok(()) => report.legacy_removed = true,
            Err(e) => {
                tracing::warn!(
                    path = %legacy.path().display(),
                    error = %e,
                    "migrated legacy credentials but could not delete the legacy file"
                );
            }
        }

        tracing::info!(
            token = report.token_migrated,
            api_key = report.api_key_migrated,
            removed = report.legacy_removed,
            "legacy credential migration finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::crypto;

    fn write_legacy(dir: &Path, body: serde_json::Value) -> LegacyCredentials {
        let path = dir.join("credentials.json");
        std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        LegacyCredentials::at(path)
    }

    #[test]
    fn migrates_token_and_key_then_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = write_legacy(
            dir.path(),
            serde_json::json!({
                "access_token": "at-legacy",
                "refresh_token": "rt-legacy",
                "expires_in": 3600,
                "issued_at": 1_700_000_000_000_i64,
                "api_key": "sk-legacy",
            }),
        );
        let vault = CredentialVault::new(Arc::new(MemoryBackend::new()));

        let report = vault.migrate_legacy(&legacy).unwrap();
        assert!(report.token_migrated && report.api_key_migrated && report.legacy_removed);
        assert!(!legacy.path().exists());

        let token = vault.retrieve().unwrap().unwrap();
        assert_eq!(token.access_token, "at-legacy");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-legacy"));
        assert_eq!(
            vault.retrieve_api_key().unwrap().unwrap().digest,
            crypto::sha256_hex(b"sk-legacy")
        );
    }

    #[test]
    fn second_run_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = write_legacy(dir.path(), serde_json::json!({ "api_key": "sk-1" }));
        let vault = CredentialVault::new(Arc::new(MemoryBackend::new()));

        assert!(!vault.migrate_legacy(&legacy).unwrap().is_noop());

        // Even a freshly reappearing file is left alone by this instance.
        let legacy = write_legacy(dir.path(), serde_json::json!({ "api_key": "sk-2" }));
        assert!(vault.migrate_legacy(&legacy).unwrap().is_noop());
        assert!(legacy.path().exists());
    }

    #[test]
    fn missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::new(Arc::new(MemoryBackend::new()));
        let report = vault
            .migrate_legacy(&LegacyCredentials::at(dir.path().join("absent.json")))
            .unwrap();
        assert!(report.is_noop());
    }

    #[test]
    fn unparsable_file_fails_and_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, b"{ nope").unwrap();
        let vault = CredentialVault::new(Arc::new(MemoryBackend::new()));

        let result = vault.migrate_legacy(&LegacyCredentials::at(&path));
        assert!(matches!(result, Err(VaultError::MigrationFailed { .. })));
        assert!(path.exists());
        assert!(vault.retrieve().unwrap().is_none());
    }

    #[test]
    fn existing_records_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::new(Arc::new(MemoryBackend::new()));
        vault
            .store(&TokenRecord::bearer("current", None, 3600))
            .unwrap();

        let legacy = write_legacy(dir.path(), serde_json::json!({ "access_token": "old" }));
        let report = vault.migrate_legacy(&legacy).unwrap();

        assert!(!report.token_migrated);
        assert!(report.legacy_removed);
        assert_eq!(vault.retrieve().unwrap().unwrap().access_token, "current");
    }
}
