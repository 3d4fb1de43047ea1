//! Vault error types.
//!
//! Every public vault API returns [`VaultError`]. Variants name the backend
//! and slot involved, never the credential material.

/// Unified error type for the keyhold credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Envelope crypto ----------------------------------------------------
    /// Sealing an envelope failed.
    #[error("could not seal vault entry: {reason}")]
    EncryptionFailed { reason: String },

    /// An envelope did not authenticate under the backend passphrase.
    #[error("could not open vault entry: {reason}")]
    DecryptionFailed { reason: String },

    /// The derived key was unusable.
    #[error("vault key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Backend errors -----------------------------------------------------
    /// The selected storage backend is unavailable on this host.
    #[error("storage backend `{backend}` unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// The backend rejected a read, write or delete.
    #[error("storage backend `{backend}` failed on slot `{slot}`: {reason}")]
    BackendFailed {
        backend: &'static str,
        slot: &'static str,
        reason: String,
    },

    /// No backend could be resolved from the host capabilities.
    #[error("no storage backend available on this host")]
    NoBackend,

    /// A persisted envelope has an unknown layout or version.
    #[error("corrupt vault entry in slot `{slot}`: {reason}")]
    CorruptEntry { slot: &'static str, reason: String },

    // -- Record errors ------------------------------------------------------
    /// An API key was empty or otherwise unusable.
    #[error("invalid api key: {reason}")]
    InvalidApiKey { reason: String },

    /// Legacy-storage migration could not complete.
    #[error("legacy migration failed: {reason}")]
    MigrationFailed { reason: String },

    // -- Wrapped ------------------------------------------------------------
    /// A record could not be encoded.
    #[error("record encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure in the encrypted file backend.
    #[error("vault file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Lock poisoning or CSPRNG failure.
    #[error("vault internal error: {0}")]
    Internal(String),
}

/// Result alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failed_names_slot_not_contents() {
        let err = VaultError::BackendFailed {
            backend: "encrypted-file",
            slot: "token",
            reason: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "storage backend `encrypted-file` failed on slot `token`: permission denied"
        );
    }

    #[test]
    fn crosses_task_boundaries() {
        fn send_sync<T: Send + Sync + 'static>() {}
        send_sync::<VaultError>();
    }
}
