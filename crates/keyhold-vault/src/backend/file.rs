//! Encrypted file storage.
//!
//! Each slot is one file under the data directory holding a
//! [`crypto::seal_envelope`] envelope. The passphrase is derived from
//! host-stable identifiers (hostname and username), so the files are
//! unreadable if copied to another machine or account. This is weaker than
//! an OS keychain: anyone running as the same user on the same host can
//! reconstruct it.
//!
//! Files are written to a temporary sibling and renamed into place, with
//! owner-only permissions on Unix.

use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use super::{Slot, StorageBackend};
use crate::crypto;
use crate::error::{Result, VaultError};

/// Application context mixed into the host-derived passphrase.
const APP_CONTEXT: &[u8] = b"keyhold-vault-file-v1";

/// Slot files encrypted with AES-256-GCM.
pub struct EncryptedFileBackend {
    dir: PathBuf,
    passphrase: Zeroizing<Vec<u8>>,
}

impl EncryptedFileBackend {
    /// Storage under `dir` keyed to this host and user.
    pub fn host_bound(dir: impl Into<PathBuf>) -> Self {
        Self::with_passphrase(dir, host_passphrase())
    }

    /// Storage under `dir` with an explicit passphrase.
    pub fn with_passphrase(dir: impl Into<PathBuf>, passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            dir: dir.into(),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    /// Path of the file backing `slot`.
    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("{}.enc", slot.as_str()))
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

impl StorageBackend for EncryptedFileBackend {
    fn name(&self) -> &'static str {
        "encrypted-file"
    }

    fn read(&self, slot: Slot) -> Result<Option<Vec<u8>>> {
        let path = self.slot_path(slot);
        let envelope = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::Io(e)),
        };

        let plaintext = crypto::open_envelope(&envelope, &self.passphrase, slot.as_str())?;
        tracing::debug!(slot = %slot, "read encrypted slot file");
        Ok(Some(plaintext))
    }

    fn write(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        self.ensure_dir()?;

        let envelope = crypto::seal_envelope(bytes, &self.passphrase)?;
        let path = self.slot_path(slot);
        let tmp = path.with_extension("enc.tmp");

        write_owner_only(&tmp, &envelope)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(slot = %slot, path = %path.display(), "wrote encrypted slot file");
        Ok(())
    }

    fn delete(&self, slot: Slot) -> Result<()> {
        let path = self.slot_path(slot);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(slot = %slot, "deleted encrypted slot file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::Io(e)),
        }
    }
}

#[cfg(unix)]
fn write_owner_only(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    Ok(())
}

/// `host \0 user \0 context`, stable for one account on one machine.
fn host_passphrase() -> Vec<u8> {
    let host = machine_name();
    let user = first_env(&["USER", "USERNAME"]).unwrap_or_else(|| "unknown-user".into());
    [host.as_bytes(), user.as_bytes(), APP_CONTEXT].join(&0u8)
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|v| !v.trim().is_empty())
}

fn machine_name() -> String {
    #[cfg(unix)]
    let found = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| first_env(&["HOSTNAME", "HOST"]));
    #[cfg(not(unix))]
    let found = first_env(&["COMPUTERNAME", "HOSTNAME"]);

    found.unwrap_or_else(|| "unknown-host".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_slot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = EncryptedFileBackend::with_passphrase(dir.path(), b"pw".to_vec());

        assert!(backend.read(Slot::Token).unwrap().is_none());
        backend.write(Slot::Token, b"{\"a\":1}").unwrap();
        assert_eq!(backend.read(Slot::Token).unwrap().unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn file_never_contains_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let backend = EncryptedFileBackend::with_passphrase(dir.path(), b"pw".to_vec());
        backend.write(Slot::ApiKey, b"plain-marker-value").unwrap();

        let on_disk = std::fs::read(backend.slot_path(Slot::ApiKey)).unwrap();
        let needle = b"plain-marker-value";
        assert!(!on_disk.windows(needle.len()).any(|w| w == needle));
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = EncryptedFileBackend::with_passphrase(dir.path(), b"pw".to_vec());
        backend.write(Slot::Token, b"x").unwrap();

        let mode = std::fs::metadata(backend.slot_path(Slot::Token))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn other_passphrase_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        EncryptedFileBackend::with_passphrase(dir.path(), b"one".to_vec())
            .write(Slot::Token, b"x")
            .unwrap();

        let result = EncryptedFileBackend::with_passphrase(dir.path(), b"two".to_vec())
            .read(Slot::Token);
        assert!(matches!(result, Err(VaultError::DecryptionFailed { .. })));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = EncryptedFileBackend::host_bound(dir.path());
        backend.write(Slot::Token, b"x").unwrap();
        backend.delete(Slot::Token).unwrap();
        backend.delete(Slot::Token).unwrap();
        assert!(backend.read(Slot::Token).unwrap().is_none());
    }
}
