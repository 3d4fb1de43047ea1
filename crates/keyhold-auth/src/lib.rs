//! Authentication for keyhold.
//!
//! This crate obtains and maintains one principal's OAuth credentials
//! against the keyhold authorization server:
//!
//! - **Device flow** with a PKCE binding (RFC 8628 + RFC 7636) for terminals
//! - **Redirect flow** with PKCE and a loopback callback for desktops
//! - **Refresh** (single attempt) and **revocation** (RFC 7009)
//! - **Credential verification** and introspection (RFC 7662)
//!
//! Tokens are persisted through [`keyhold_vault::CredentialVault`].
//!
//! # Architecture
//!
//! ```text
//! FlowEngine
//! ├── DeviceCodeFlow  (device grant + polling)
//! ├── CallbackServer  (loopback listener)
//! ├── UserPrompt      (host-supplied display hook)
//! └── CredentialVault (encrypted token storage)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyhold_auth::{FlowEngine, FlowOptions, LogPrompt};
//! use keyhold_endpoint::PinnedEndpoint;
//! use keyhold_vault::{CredentialVault, MemoryBackend};
//!
//! # async fn example() -> keyhold_auth::Result<()> {
//! let endpoint = PinnedEndpoint::parse("https://auth.keyhold.dev")?;
//! let vault = Arc::new(CredentialVault::new(Arc::new(MemoryBackend::new())));
//! let engine = FlowEngine::new(endpoint, FlowOptions::new("cli"), vault, Arc::new(LogPrompt))?;
//!
//! let record = engine.authenticate().await?;
//! assert!(!record.is_expired());
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod device;
pub mod error;
pub mod flow;
pub mod pkce;
pub mod prompt;
pub mod token;
pub mod verify;

pub use callback::{CallbackParams, CallbackServer};
pub use error::{AuthError, Result};
pub use flow::{FlowEngine, FlowOptions, FlowState, FlowVariant, TokenKind};
pub use pkce::{PkcePair, generate_pkce_verifier, pkce_challenge};
pub use prompt::{DevicePrompt, LogPrompt, UserPrompt};
pub use verify::{ApiKeyVerification, CredentialVerifier, Introspection, TokenVerification};
