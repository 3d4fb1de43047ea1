//! Client credentials and connection settings.

use std::time::Duration;

use keyhold_auth::FlowVariant;
use keyhold_endpoint::{EndpointOptions, TlsOptions};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, TransportError};
use crate::policy::ReconnectPolicy;

/// Default request timeout for channel and REST calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Path of the request/response endpoint when no channel URL is configured.
pub const DEFAULT_CHANNEL_PATH: &str = "/mcp";

// ---------------------------------------------------------------------------
// Auth mode
// ---------------------------------------------------------------------------

/// How requests are authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` from the PKCE flow.
    #[default]
    #[serde(rename = "oauth")]
    OAuth,
    /// `x-api-key: <key>`.
    ApiKey,
}

impl AuthMode {
    /// Header the credential is sent in.
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::OAuth => "authorization",
            Self::ApiKey => "x-api-key",
        }
    }

    /// Header value for `credential` in this mode.
    pub fn header_value(&self, credential: &str) -> String {
        match self {
            Self::OAuth => format!("Bearer {credential}"),
            Self::ApiKey => credential.to_string(),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OAuth => f.write_str("oauth"),
            Self::ApiKey => f.write_str("api-key"),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// OAuth client registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredential {
    pub client_id: String,
    pub auth_base_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

/// A static API key and the server it authenticates against.
#[derive(Clone)]
pub struct ApiKeyCredential {
    pub key: Zeroizing<String>,
    pub base_url: String,
}

impl std::fmt::Debug for ApiKeyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyCredential")
            .field("key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// The one credential a client instance authenticates with.
#[derive(Debug, Clone)]
pub enum ClientCredential {
    OAuth(OAuthCredential),
    ApiKey(ApiKeyCredential),
}

impl ClientCredential {
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::OAuth(_) => AuthMode::OAuth,
            Self::ApiKey(_) => AuthMode::ApiKey,
        }
    }

    /// Base URL of the authorization server.
    pub fn auth_base_url(&self) -> &str {
        match self {
            Self::OAuth(c) => &c.auth_base_url,
            Self::ApiKey(c) => &c.base_url,
        }
    }
}

/// Loosely-specified credential settings, as read from configuration.
///
/// [`resolve`](Self::resolve) turns them into exactly one
/// [`ClientCredential`]: an explicit `mode` wins; otherwise an API key
/// selects key mode and anything else selects OAuth.
#[derive(Clone, Default)]
pub struct CredentialSource {
    pub mode: Option<AuthMode>,
    pub api_key: Option<Zeroizing<String>>,
    pub client_id: Option<String>,
    pub auth_base_url: Option<String>,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("mode", &self.mode)
            .field("has_api_key", &self.api_key.is_some())
            .field("client_id", &self.client_id)
            .field("auth_base_url", &self.auth_base_url)
            .finish()
    }
}

impl CredentialSource {
    /// The effective mode for these settings.
    pub fn effective_mode(&self) -> AuthMode {
        match (self.mode, &self.api_key) {
            (Some(mode), _) => mode,
            (None, Some(_)) => AuthMode::ApiKey,
            (None, None) => AuthMode::OAuth,
        }
    }

    /// Build the credential for [`effective_mode`](Self::effective_mode).
    ///
    /// # Errors
    ///
    /// Fails when the fields that mode needs are missing or empty.
    pub fn resolve(self) -> Result<ClientCredential> {
        let auth_base_url = self
            .auth_base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| TransportError::config("auth base URL is required"))?;

        match self.effective_mode() {
            AuthMode::ApiKey => {
                let key = self
                    .api_key
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| TransportError::config("api-key mode requires an API key"))?;
                Ok(ClientCredential::ApiKey(ApiKeyCredential {
                    key,
                    base_url: auth_base_url,
                }))
            }
            AuthMode::OAuth => {
                let client_id = self
                    .client_id
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| TransportError::config("oauth mode requires a client id"))?;
                Ok(ClientCredential::OAuth(OAuthCredential {
                    client_id,
                    auth_base_url,
                    redirect_uri: self.redirect_uri,
                    scopes: self.scopes,
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Everything a [`Transport`](crate::Transport) needs besides the vault.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credential: ClientCredential,
    /// Base URL of the resource server (REST calls are joined onto it).
    pub resource_url: String,
    /// Persistent channel URL. Defaults to `{resource_url}/mcp`.
    pub channel_url: Option<String>,
    pub endpoint_options: EndpointOptions,
    pub tls: TlsOptions,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    pub flow_variant: FlowVariant,
    /// Whether an expired OAuth session may start an interactive flow.
    pub interactive: bool,
}

impl ClientConfig {
    pub fn new(credential: ClientCredential, resource_url: impl Into<String>) -> Self {
        Self {
            credential,
            resource_url: resource_url.into(),
            channel_url: None,
            endpoint_options: EndpointOptions::default(),
            tls: TlsOptions::default(),
            reconnect: ReconnectPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            flow_variant: FlowVariant::default(),
            interactive: true,
        }
    }

    pub fn with_channel_url(mut self, url: impl Into<String>) -> Self {
        self.channel_url = Some(url.into());
        self
    }

    pub fn mode(&self) -> AuthMode {
        self.credential.mode()
    }
}
