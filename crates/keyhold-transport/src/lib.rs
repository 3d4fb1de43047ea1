//! Dual-mode transport client for keyhold.
//!
//! A [`Transport`] talks to the keyhold resource server with exactly one
//! credential, chosen at construction:
//!
//! - **OAuth mode**: `Authorization: Bearer <token>`, with tokens loaded from
//!   the vault, renewed through [`keyhold_auth::FlowEngine`] and refreshed
//!   automatically 300 seconds before expiry.
//! - **Key mode**: `x-api-key: <key>`. A 401 is final.
//!
//! # Architecture
//!
//! ```text
//! Transport
//! ├── TokenCell           (current credential, single-flight refresh)
//! ├── RefreshRetryPolicy  (one refresh + one retry on 401, OAuth only)
//! ├── Channel             (WebSocket | SSE | HTTP, picked from the URL)
//! ├── supervisor task     (reconnect with fixed backoff)
//! └── auto-refresh task
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyhold_auth::LogPrompt;
//! use keyhold_transport::{ApiKeyCredential, ClientConfig, ClientCredential, Transport};
//! use keyhold_vault::{CredentialVault, MemoryBackend};
//! use zeroize::Zeroizing;
//!
//! # async fn example() -> keyhold_transport::Result<()> {
//! let credential = ClientCredential::ApiKey(ApiKeyCredential {
//!     key: Zeroizing::new("kh_live_...".into()),
//!     base_url: "https://auth.keyhold.dev".into(),
//! });
//! let config = ClientConfig::new(credential, "https://api.keyhold.dev");
//! let vault = Arc::new(CredentialVault::new(Arc::new(MemoryBackend::new())));
//!
//! let transport = Transport::new(config, vault, Arc::new(LogPrompt))?;
//! transport.connect().await?;
//! let tools = transport.request("tools/list", serde_json::json!({})).await?;
//! # let _ = tools;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod policy;
pub mod token_cell;

pub use channel::{
    AUTH_CLOSE_CODES, ChannelKind, CloseInfo, Notification, WsStream, connect_websocket,
    infer_channel_kind,
};
pub use client::{ConnectionState, Transport};
pub use config::{
    ApiKeyCredential, AuthMode, ClientConfig, ClientCredential, CredentialSource,
    DEFAULT_CHANNEL_PATH, DEFAULT_REQUEST_TIMEOUT, OAuthCredential,
};
pub use error::{Result, TransportError};
pub use policy::{Attempt, ReconnectPolicy, RefreshRetryPolicy};
pub use token_cell::{TokenCell, TokenRenewer, TokenSnapshot};
