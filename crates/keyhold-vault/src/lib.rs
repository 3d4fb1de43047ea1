//! Encrypted credential vault for keyhold.
//!
//! This crate persists one principal's OAuth token record and API key
//! digest on whatever host it runs on. Storage is pluggable: the host
//! describes what it offers in [`HostCapabilities`] and the vault picks the
//! strongest option once, at construction.
//!
//! # Modules
//!
//! - [`crypto`]: AES-256-GCM encryption/decryption, PBKDF2 key derivation.
//! - [`backend`]: keychain, encrypted file, platform and passphrase storage.
//! - [`record`]: [`TokenRecord`] / [`StoredApiKey`] and their invariants.
//! - [`store`]: the [`CredentialVault`] API.
//! - [`migration`]: one-shot import of legacy plaintext credentials.
//! - [`error`]: Unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyhold_vault::{CredentialVault, HostCapabilities, TokenRecord};
//!
//! # fn example() -> keyhold_vault::Result<()> {
//! let caps = HostCapabilities {
//!     keychain_service: Some("dev.keyhold.vault".into()),
//!     data_dir: Some("/var/lib/keyhold".into()),
//!     ..Default::default()
//! };
//! let vault = CredentialVault::from_capabilities(&caps)?;
//!
//! vault.store(&TokenRecord::bearer("access", Some("refresh".into()), 3600))?;
//! if let Some(record) = vault.retrieve()? {
//!     assert!(!vault.is_expired(&record));
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod crypto;
pub mod error;
pub mod migration;
pub mod record;
pub mod store;

pub use backend::{
    EncryptedFileBackend, HostCapabilities, KeyValueStore, KeychainBackend, MemoryBackend,
    PassphraseBackend, PlatformSecureBackend, PlatformSecureStore, Slot, StorageBackend,
    resolve_backend,
};
pub use error::{Result, VaultError};
pub use migration::{LegacyCredentials, MigrationReport};
pub use record::{
    ApiKeyMetadata, EXPIRY_LEAD_SECS, StoredApiKey, TokenRecord, TokenType, is_digest,
    normalize_api_key,
};
pub use store::CredentialVault;
