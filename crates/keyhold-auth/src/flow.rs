//! The PKCE flow engine.
//!
//! [`FlowEngine`] runs one principal's authentication against the
//! authorization server and keeps the result in the vault:
//!
//! ```text
//! Idle ─▶ AuthorizationRequested ─▶ Authorized ─▶ Active
//!                                                  │  ▲
//!                                                  ▼  │
//!                                               Refreshing
//!                                                  │
//!                                      Revoked / Expired ─▶ Idle
//! ```
//!
//! `authenticate()` never retries on its own and `refresh_token()` makes
//! exactly one HTTP call; falling back from a failed refresh to a full
//! authentication is the caller's decision (see [`FlowEngine::ensure_token`]).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyhold_endpoint::PinnedEndpoint;
use keyhold_vault::{CredentialVault, TokenRecord, TokenType};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::callback::CallbackServer;
use crate::device::DeviceCodeFlow;
use crate::error::{AuthError, Result};
use crate::pkce::PkcePair;
use crate::prompt::UserPrompt;
use crate::token::parse_token_response;

/// Default loopback redirect for the redirect flow.
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8400/callback";

/// Default wait for the browser redirect (5 minutes).
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default upper bound on device code polling (15 minutes).
const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(900);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AuthorizationRequested,
    Authorized,
    Active,
    Refreshing,
    Revoked,
    Expired,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AuthorizationRequested => "authorization-requested",
            Self::Authorized => "authorized",
            Self::Active => "active",
            Self::Refreshing => "refreshing",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Which interactive flow `authenticate()` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowVariant {
    /// Terminal flow: show a user code and poll.
    #[default]
    Device,
    /// Desktop flow: open a browser and catch the loopback redirect.
    Redirect,
}

/// Which token a revocation refers to (RFC 7009 `token_type_hint`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    AccessToken,
    RefreshToken,
}

impl TokenKind {
    pub fn hint(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Client registration and flow tuning.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub client_id: String,
    /// Loopback URI registered for the redirect flow.
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub variant: FlowVariant,
    pub callback_timeout: Duration,
    pub device_timeout: Duration,
    /// When false, [`FlowEngine::ensure_token`] never starts an interactive
    /// flow and reports the missing credential instead.
    pub interactive: bool,
}

impl FlowOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: Vec::new(),
            variant: FlowVariant::default(),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            interactive: true,
        }
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// Authentication, refresh and revocation for one principal.
pub struct FlowEngine {
    endpoint: PinnedEndpoint,
    options: FlowOptions,
    client: reqwest::Client,
    vault: Arc<CredentialVault>,
    prompt: Arc<dyn UserPrompt>,
    state: Mutex<FlowState>,
}

impl FlowEngine {
    /// Create an engine talking to the authorization server at `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails if `client_id` is empty or the HTTP client cannot be built.
    pub fn new(
        endpoint: PinnedEndpoint,
        options: FlowOptions,
        vault: Arc<CredentialVault>,
        prompt: Arc<dyn UserPrompt>,
    ) -> Result<Self> {
        if options.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                reason: "client_id must not be empty".into(),
            });
        }
        let client = endpoint.http_client()?;
        Ok(Self {
            endpoint,
            options,
            client,
            vault,
            prompt,
            state: Mutex::new(FlowState::Idle),
        })
    }

    pub fn state(&self) -> FlowState {
        self.state.lock().map(|s| *s).unwrap_or(FlowState::Idle)
    }

    pub fn options(&self) -> &FlowOptions {
        &self.options
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn endpoint(&self) -> &PinnedEndpoint {
        &self.endpoint
    }

    fn set_state(&self, next: FlowState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                tracing::debug!(from = %*state, to = %next, "flow state transition");
                *state = next;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Authenticate
    // -----------------------------------------------------------------------

    /// Run the configured interactive flow once and store the result.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AuthenticationFailed`] on denial, timeout,
    /// state mismatch or a rejected code exchange. Never retries.
    pub async fn authenticate(&self) -> Result<TokenRecord> {
        tracing::info!(variant = ?self.options.variant, "starting authentication flow");

        let result = match self.options.variant {
            FlowVariant::Device => self.device_flow().await,
            FlowVariant::Redirect => self.redirect_flow().await,
        };

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                self.set_state(FlowState::Idle);
                let e = match e {
                    AuthError::InvalidGrant { reason } => {
                        AuthError::failed(format!("token exchange rejected: {reason}"))
                    }
                    AuthError::CallbackTimeout { timeout_secs } => AuthError::failed(format!(
                        "no authorization redirect within {timeout_secs} seconds"
                    )),
                    other => other,
                };
                tracing::warn!(error = %e, "authentication flow failed");
                return Err(e);
            }
        };

        self.vault.store(&record)?;
        self.set_state(FlowState::Active);
        tracing::info!("authentication completed");
        Ok(record)
    }

    async fn device_flow(&self) -> Result<TokenRecord> {
        let pkce = PkcePair::generate()?;
        let flow = DeviceCodeFlow {
            client: &self.client,
            device_url: self.endpoint.join("/oauth/device"),
            token_url: self.endpoint.join("/oauth/token"),
            client_id: &self.options.client_id,
            scopes: &self.options.scopes,
        };

        let device = flow.request_device_code(pkce.challenge()).await?;
        self.set_state(FlowState::AuthorizationRequested);
        self.prompt.show_device_code(&device.prompt);

        let timeout = self
            .options
            .device_timeout
            .min(Duration::from_secs(device.prompt.expires_in_secs));
        let record = flow
            .poll_for_token(&device, pkce.verifier(), timeout)
            .await?;
        self.set_state(FlowState::Authorized);
        Ok(record)
    }

    async fn redirect_flow(&self) -> Result<TokenRecord> {
        let port = loopback_port(&self.options.redirect_uri)?;
        let pkce = PkcePair::generate()?;
        let state = uuid::Uuid::now_v7().to_string();

        let server = CallbackServer::bind(port).await?;
        let auth_url = self.authorization_url(&state, pkce.challenge())?;

        self.set_state(FlowState::AuthorizationRequested);
        self.prompt.open_authorization_url(&auth_url);

        let params = server.wait(self.options.callback_timeout).await?;
        if params.state != state {
            return Err(AuthError::failed("state mismatch in authorization redirect"));
        }
        self.set_state(FlowState::Authorized);
        tracing::debug!("state parameter verified, exchanging code for tokens");

        self.exchange_code(&params.code, pkce.verifier()).await
    }

    /// Build the authorization URL for the redirect flow.
    pub fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String> {
        let mut url = Url::parse(&self.endpoint.join("/oauth/authorize"))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.options.client_id);
            params.append_pair("redirect_uri", &self.options.redirect_uri);
            params.append_pair("state", state);
            params.append_pair("code_challenge", code_challenge);
            params.append_pair("code_challenge_method", "S256");
            if !self.options.scopes.is_empty() {
                params.append_pair("scope", &self.options.scopes.join(" "));
            }
        }
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenRecord> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.options.redirect_uri.as_str()),
            ("client_id", self.options.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        let response = self
            .client
            .post(self.endpoint.join("/oauth/token"))
            .form(&params)
            .send()
            .await?;
        parse_token_response(response, None).await
    }

    // -----------------------------------------------------------------------
    // Refresh / revoke
    // -----------------------------------------------------------------------

    /// Exchange `refresh_token` for a new record and store it.
    ///
    /// Exactly one HTTP call. On failure the engine moves to
    /// [`FlowState::Expired`] and the error is returned.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRecord> {
        self.set_state(FlowState::Refreshing);
        tracing::debug!("refreshing access token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.options.client_id.as_str()),
        ];
        let result = async {
            let response = self
                .client
                .post(self.endpoint.join("/oauth/token"))
                .form(&params)
                .send()
                .await?;
            parse_token_response(response, Some(refresh_token)).await
        }
        .await;

        match result {
            Ok(record) => {
                self.vault.store(&record)?;
                self.set_state(FlowState::Active);
                tracing::info!("access token refreshed");
                Ok(record)
            }
            Err(e) => {
                self.set_state(FlowState::Expired);
                tracing::warn!(error = %e, "token refresh failed");
                Err(e)
            }
        }
    }

    /// Revoke one token at `{auth}/oauth/revoke` (RFC 7009).
    pub async fn revoke_token(&self, token: &str, kind: TokenKind) -> Result<()> {
        let params = [
            ("token", token),
            ("token_type_hint", kind.hint()),
            ("client_id", self.options.client_id.as_str()),
        ];
        let response = self
            .client
            .post(self.endpoint.join("/oauth/revoke"))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::UnexpectedStatus {
                endpoint: "/oauth/revoke",
                status: status.as_u16(),
            });
        }
        tracing::debug!(kind = kind.hint(), "token revoked");
        Ok(())
    }

    /// Revoke both tokens (best-effort) and clear the vault.
    ///
    /// Revocation failures are logged and never returned; only a failure to
    /// clear local storage is.
    pub async fn logout(&self) -> Result<()> {
        let record = match self.vault.retrieve() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "could not read stored token during logout");
                None
            }
        };

        if let Some(record) = record.filter(|r| r.token_type == TokenType::Bearer) {
            if let Some(refresh) = record.refresh_token.as_deref() {
                if let Err(e) = self.revoke_token(refresh, TokenKind::RefreshToken).await {
                    tracing::warn!(error = %e, "refresh token revocation failed");
                }
            }
            if let Err(e) = self
                .revoke_token(&record.access_token, TokenKind::AccessToken)
                .await
            {
                tracing::warn!(error = %e, "access token revocation failed");
            }
        }

        self.vault.clear()?;
        self.vault.clear_api_key()?;
        self.set_state(FlowState::Revoked);
        tracing::info!("logged out");
        Ok(())
    }

    /// A usable bearer record: the cached one, a refreshed one, or a new
    /// one from [`authenticate`](Self::authenticate).
    ///
    /// # Errors
    ///
    /// With `interactive` off, returns [`AuthError::TokenExpiredNoRefresh`]
    /// (or the refresh error) instead of starting a flow.
    pub async fn ensure_token(&self) -> Result<TokenRecord> {
        let cached = self
            .vault
            .retrieve()?
            .filter(|r| r.token_type == TokenType::Bearer);

        if let Some(record) = &cached
            && !record.is_expired()
        {
            self.set_state(FlowState::Active);
            return Ok(record.clone());
        }
        self.renew(cached.as_ref()).await
    }

    /// Replace `current` regardless of its expiry: refresh when it carries a
    /// refresh token, otherwise (or if that fails) authenticate again.
    pub async fn renew(&self, current: Option<&TokenRecord>) -> Result<TokenRecord> {
        let fallback = match current {
            Some(record) => match record.refresh_token.as_deref() {
                Some(refresh) => match self.refresh_token(refresh).await {
                    Ok(refreshed) => return Ok(refreshed),
                    Err(e) => e,
                },
                None => {
                    self.set_state(FlowState::Expired);
                    AuthError::TokenExpiredNoRefresh
                }
            },
            None => AuthError::failed("no stored credentials; log in first"),
        };

        if !self.options.interactive {
            return Err(fallback);
        }
        tracing::info!(reason = %fallback, "re-authenticating");
        self.authenticate().await
    }
}

/// Port of a loopback `redirect_uri`.
fn loopback_port(redirect_uri: &str) -> Result<u16> {
    let url = Url::parse(redirect_uri)?;
    let loopback = matches!(url.host_str(), Some("127.0.0.1") | Some("localhost"));
    if url.scheme() != "http" || !loopback {
        return Err(AuthError::InvalidConfig {
            reason: "redirect_uri must be http://127.0.0.1 or http://localhost".into(),
        });
    }
    url.port_or_known_default().ok_or_else(|| AuthError::InvalidConfig {
        reason: "redirect_uri has no port".into(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keyhold_endpoint::{EndpointOptions, TlsOptions};
    use keyhold_vault::MemoryBackend;

    use super::*;
    use crate::prompt::LogPrompt;

    fn engine(options: FlowOptions) -> FlowEngine {
        let endpoint = PinnedEndpoint::new(
            "https://auth.example.com",
            &EndpointOptions::default(),
            &TlsOptions::default(),
        )
        .unwrap();
        let vault = Arc::new(CredentialVault::new(Arc::new(MemoryBackend::new())));
        FlowEngine::new(endpoint, options, vault, Arc::new(LogPrompt)).unwrap()
    }

    #[test]
    fn authorization_url_includes_all_params() {
        let mut options = FlowOptions::new("test-client-id");
        options.scopes = vec!["read".into(), "write".into()];
        let engine = engine(options);

        let url = Url::parse(&engine.authorization_url("random-state", "chal").unwrap()).unwrap();
        assert_eq!(url.path(), "/oauth/authorize");
        let params: std::collections::HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(params.get("response_type").unwrap(), "code");
        assert_eq!(params.get("client_id").unwrap(), "test-client-id");
        assert_eq!(params.get("redirect_uri").unwrap(), DEFAULT_REDIRECT_URI);
        assert_eq!(params.get("state").unwrap(), "random-state");
        assert_eq!(params.get("code_challenge").unwrap(), "chal");
        assert_eq!(params.get("code_challenge_method").unwrap(), "S256");
        assert_eq!(params.get("scope").unwrap(), "read write");
    }

    #[test]
    fn empty_client_id_rejected() {
        let endpoint = PinnedEndpoint::parse("https://auth.example.com").unwrap();
        let vault = Arc::new(CredentialVault::new(Arc::new(MemoryBackend::new())));
        let result = FlowEngine::new(endpoint, FlowOptions::new(" "), vault, Arc::new(LogPrompt));
        assert!(matches!(result, Err(AuthError::InvalidConfig { .. })));
    }

    #[test]
    fn starts_idle() {
        assert_eq!(engine(FlowOptions::new("c")).state(), FlowState::Idle);
    }

    #[test]
    fn loopback_port_rules() {
        assert_eq!(loopback_port("http://127.0.0.1:8400/callback").unwrap(), 8400);
        assert_eq!(loopback_port("http://localhost/cb").unwrap(), 80);
        assert!(loopback_port("https://127.0.0.1:8400/cb").is_err());
        assert!(loopback_port("http://example.com:8400/cb").is_err());
    }

    #[test]
    fn token_kind_hints() {
        assert_eq!(TokenKind::AccessToken.hint(), "access_token");
        assert_eq!(TokenKind::RefreshToken.hint(), "refresh_token");
    }

    #[tokio::test]
    async fn non_interactive_without_credentials_fails() {
        let mut options = FlowOptions::new("c");
        options.interactive = false;
        let err = engine(options).ensure_token().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn non_interactive_expired_without_refresh_reports_it() {
        let mut options = FlowOptions::new("c");
        options.interactive = false;
        let engine = engine(options);
        let mut record = TokenRecord::bearer("at", None, 60);
        record.issued_at_epoch_ms = Some(0);
        engine.vault().store(&record).unwrap();

        let err = engine.ensure_token().await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExpiredNoRefresh));
        assert_eq!(engine.state(), FlowState::Expired);
    }

    #[test]
    fn assert_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<FlowEngine>();
    }
}
