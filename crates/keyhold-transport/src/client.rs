//! The dual-mode transport client.
//!
//! One [`Transport`] authenticates every request with exactly one credential:
//! an OAuth bearer token kept fresh through the PKCE flow engine, or a static
//! API key. It owns the persistent channel, the reconnect supervisor and the
//! auto-refresh timer; all three stop on [`Transport::disconnect`] or drop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use keyhold_auth::{FlowEngine, FlowOptions, UserPrompt};
use keyhold_endpoint::PinnedEndpoint;
use keyhold_vault::{ApiKeyMetadata, CredentialVault, TokenType, normalize_api_key};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::channel::{
    Channel, ChannelKind, CloseInfo, Notification, SseChannel, WsChannel, connect_websocket,
    error_message, infer_channel_kind, post_envelope,
};
use crate::config::{AuthMode, ClientConfig, ClientCredential, DEFAULT_CHANNEL_PATH};
use crate::error::{Result, TransportError};
use crate::policy::{Attempt, RefreshRetryPolicy};
use crate::token_cell::{TokenCell, TokenSnapshot, spawn_auto_refresh};

/// Capacity of the notification fan-out.
const NOTIFICATION_CAPACITY: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up; see the error returned by the next request.
    Failed,
}

/// Why the transport entered [`ConnectionState::Failed`].
#[derive(Debug, Clone)]
enum Failure {
    Auth { code: u16, reason: String },
    Unavailable { attempts: u32, reason: String },
}

impl Failure {
    fn to_error(&self) -> TransportError {
        match self {
            Self::Auth { code, reason } => TransportError::AuthRejected {
                code: *code,
                reason: reason.clone(),
            },
            Self::Unavailable { attempts, reason } => TransportError::TransportUnavailable {
                attempts: *attempts,
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Default)]
struct Tasks {
    refresh: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(task) = self.refresh.take() {
            task.abort();
        }
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}

struct Inner {
    config: ClientConfig,
    kind: ChannelKind,
    resource: PinnedEndpoint,
    channel_url: Url,
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    flow: Option<Arc<FlowEngine>>,
    tokens: Arc<TokenCell>,
    policy: RefreshRetryPolicy,
    channel: RwLock<Option<Arc<Channel>>>,
    notifications: broadcast::Sender<Notification>,
    state: watch::Sender<ConnectionState>,
    failure: Mutex<Option<Failure>>,
    tasks: Mutex<Tasks>,
    key_recorded: AtomicBool,
    next_id: AtomicU64,
}

/// Authenticated client for the keyhold resource server.
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("mode", &self.inner.policy.mode())
            .field("channel", &self.inner.kind)
            .field("resource", &self.inner.resource.base())
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    /// Validate endpoints and build the client. Nothing is sent until
    /// [`connect`](Self::connect) or the first request.
    pub fn new(
        config: ClientConfig,
        vault: Arc<CredentialVault>,
        prompt: Arc<dyn UserPrompt>,
    ) -> Result<Self> {
        let resource =
            PinnedEndpoint::new(&config.resource_url, &config.endpoint_options, &config.tls)?;
        let channel_raw = config
            .channel_url
            .clone()
            .unwrap_or_else(|| resource.join(DEFAULT_CHANNEL_PATH));
        let channel =
            PinnedEndpoint::new(&channel_raw, &config.endpoint_options, &config.tls)?;
        let channel_url = channel.url().clone();
        let kind = infer_channel_kind(&channel_url);
        let http = resource.http_client()?;

        let (flow, tokens) = match &config.credential {
            ClientCredential::OAuth(oauth) => {
                let auth = PinnedEndpoint::new(
                    &oauth.auth_base_url,
                    &config.endpoint_options,
                    &config.tls,
                )?;
                let mut options = FlowOptions::new(oauth.client_id.clone());
                if let Some(redirect) = &oauth.redirect_uri {
                    options.redirect_uri = redirect.clone();
                }
                options.scopes = oauth.scopes.clone();
                options.variant = config.flow_variant;
                options.interactive = config.interactive;

                let engine = Arc::new(FlowEngine::new(auth, options, Arc::clone(&vault), prompt)?);
                let tokens = TokenCell::oauth(engine.clone());
                (Some(engine), tokens)
            }
            ClientCredential::ApiKey(key) => (None, TokenCell::api_key(key.key.clone())),
        };

        let mode = config.mode();
        tracing::debug!(%mode, channel = %kind, resource = %resource.base(), "transport configured");

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                kind,
                resource,
                channel_url,
                http,
                vault,
                flow,
                tokens: Arc::new(tokens),
                policy: RefreshRetryPolicy::new(mode),
                channel: RwLock::new(None),
                notifications,
                state,
                failure: Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
                key_recorded: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn mode(&self) -> AuthMode {
        self.inner.policy.mode()
    }

    pub fn channel_kind(&self) -> ChannelKind {
        self.inner.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn resource(&self) -> &PinnedEndpoint {
        &self.inner.resource
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.inner.vault
    }

    /// The flow engine, in OAuth mode.
    pub fn flow(&self) -> Option<&Arc<FlowEngine>> {
        self.inner.flow.as_ref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Receive server notifications from the persistent channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// A currently valid credential, refreshing or authenticating first if
    /// needed.
    pub async fn credential(&self) -> Result<Arc<TokenSnapshot>> {
        self.inner.prime()?;
        self.inner.tokens.valid().await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load credentials, open the channel and start auto-refresh.
    ///
    /// # Errors
    ///
    /// [`TransportError::TransportUnavailable`] once the reconnect policy is
    /// exhausted; auth errors immediately.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        let inner = &self.inner;
        inner.set_state(ConnectionState::Connecting);
        inner.set_failure(None);

        let closed = match inner.prime() {
            Ok(()) => inner.establish(false).await,
            Err(e) => Err(e),
        };
        let closed = match closed {
            Ok(closed) => closed,
            Err(e) => {
                inner.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        // Connected before the supervisor starts, so an immediate close is
        // not overwritten.
        inner.set_state(ConnectionState::Connected);
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.abort_all();
            if let Some(closed) = closed {
                tasks.supervisor = Some(tokio::spawn(supervise(Arc::downgrade(inner), closed)));
            }
            tasks.refresh = spawn_auto_refresh(Arc::clone(&inner.tokens));
        }
        tracing::info!(mode = %self.mode(), channel = %inner.kind, "transport connected");
        Ok(())
    }

    /// Close the channel and cancel the refresh timer and supervisor.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.abort_all();
        }
        if let Some(channel) = inner.take_channel() {
            channel.close().await;
        }
        inner.set_failure(None);
        inner.set_state(ConnectionState::Disconnected);
        tracing::info!("transport disconnected");
    }

    /// Disconnect and forget the credential: revoke and clear OAuth tokens,
    /// or clear the stored key digest.
    pub async fn logout(&self) -> Result<()> {
        self.disconnect().await;
        match &self.inner.flow {
            Some(flow) => flow.logout().await?,
            None => self.inner.vault.clear_api_key()?,
        }
        self.inner.tokens.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Send a JSON-RPC request and return its `result`.
    ///
    /// Over a WebSocket the call goes on the socket; otherwise it is POSTed
    /// to the channel URL under the refresh-then-retry policy.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let inner = &self.inner;
        inner.check_usable()?;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = inner.config.request_timeout;

        tracing::debug!(method, id, channel = %inner.kind, "sending request");
        match inner.kind {
            ChannelKind::WebSocket => match inner.current_channel().as_deref() {
                Some(Channel::WebSocket(ws)) => ws.call(id, method, params, timeout).await,
                _ => Err(inner.unusable_error()),
            },
            ChannelKind::ServerSentEvents | ChannelKind::Http => {
                inner
                    .policy
                    .execute(&inner.tokens, |snapshot| {
                        let params = params.clone();
                        async move {
                            post_envelope(
                                &inner.http,
                                &inner.channel_url,
                                snapshot.header(),
                                id,
                                method,
                                params,
                                timeout,
                            )
                            .await
                        }
                    })
                    .await
            }
        }
    }

    /// An authenticated REST call against `{resource}{path}`.
    ///
    /// Does not require [`connect`](Self::connect). An empty response body is
    /// returned as `Value::Null`.
    pub async fn rest(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let inner = &self.inner;
        inner.prime()?;
        let url = inner.resource.join(path);
        let timeout = inner.config.request_timeout;

        inner
            .policy
            .execute(&inner.tokens, |snapshot| {
                let (name, value) = snapshot.header();
                let mut builder = inner
                    .http
                    .request(method.clone(), &url)
                    .header(name, value)
                    .timeout(timeout);
                if let Some(body) = body {
                    builder = builder.json(body);
                }
                async move { read_rest_response(builder.send().await?, path).await }
            })
            .await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.abort_all();
        }
        // Dropping the channel aborts its reader task.
        let _ = self.inner.take_channel();
    }
}

async fn read_rest_response(response: reqwest::Response, path: &str) -> Result<Attempt<Value>> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Ok(Attempt::Unauthorized);
    }
    let bytes = response.bytes().await?;
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    if !status.is_success() {
        return Err(TransportError::Status {
            path: path.to_string(),
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    Ok(Attempt::Done(body))
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "connection state transition");
        }
    }

    fn set_failure(&self, failure: Option<Failure>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    fn current_channel(&self) -> Option<Arc<Channel>> {
        self.channel.read().ok().and_then(|c| c.clone())
    }

    fn take_channel(&self) -> Option<Arc<Channel>> {
        self.channel.write().ok().and_then(|mut c| c.take())
    }

    fn put_channel(&self, channel: Channel) {
        if let Ok(mut slot) = self.channel.write() {
            *slot = Some(Arc::new(channel));
        }
    }

    /// Seed the token cell from the vault (OAuth) or record the key digest
    /// (key mode).
    fn prime(&self) -> Result<()> {
        match self.policy.mode() {
            AuthMode::OAuth => {
                if self.tokens.current().is_none()
                    && let Some(record) = self
                        .vault
                        .retrieve()?
                        .filter(|r| r.token_type == TokenType::Bearer)
                {
                    tracing::debug!(expired = record.is_expired(), "loaded cached token");
                    self.tokens.install(record);
                }
            }
            AuthMode::ApiKey => {
                if self.key_recorded.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                let ClientCredential::ApiKey(key) = &self.config.credential else {
                    return Ok(());
                };
                let digest = normalize_api_key(key.key.clone())?;
                let known = self
                    .vault
                    .retrieve_api_key()?
                    .is_some_and(|stored| stored.digest == digest);
                if !known {
                    self.vault
                        .store_api_key(key.key.clone(), ApiKeyMetadata::default())?;
                }
            }
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        match *self.state.borrow() {
            ConnectionState::Connected => Ok(()),
            _ => Err(self.unusable_error()),
        }
    }

    fn unusable_error(&self) -> TransportError {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.as_ref().map(Failure::to_error))
            .unwrap_or(TransportError::NotConnected)
    }

    /// Open the channel, retrying per the reconnect policy.
    ///
    /// The first connect makes one attempt plus `attempts` retries; a
    /// reconnect makes `attempts` tries. Every try waits `backoff` first
    /// except the very first connect attempt.
    async fn establish(&self, reconnecting: bool) -> Result<Option<oneshot::Receiver<CloseInfo>>> {
        let policy = self.config.reconnect;
        let total = if reconnecting {
            policy.attempts
        } else {
            policy.attempts + 1
        };

        let mut last_error = String::from("no attempts configured");
        for attempt in 1..=total {
            if reconnecting {
                self.set_state(ConnectionState::Reconnecting { attempt });
            }
            if reconnecting || attempt > 1 {
                tokio::time::sleep(policy.backoff).await;
            }
            match self.open_channel().await {
                Ok(closed) => return Ok(closed),
                Err(e) if e.is_auth_failure() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, of = total, error = %e, "channel connect failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(TransportError::TransportUnavailable {
            attempts: total,
            reason: last_error,
        })
    }

    /// One authenticated channel open.
    async fn open_channel(&self) -> Result<Option<oneshot::Receiver<CloseInfo>>> {
        match self.kind {
            ChannelKind::Http => {
                self.tokens.valid().await?;
                Ok(None)
            }
            ChannelKind::WebSocket => {
                let timeout = self.config.request_timeout;
                let tls = self.resource.tls_config();
                let stream = self
                    .policy
                    .execute(&self.tokens, |snapshot| {
                        let tls = Arc::clone(&tls);
                        async move {
                            connect_websocket(&self.channel_url, Some(snapshot.header()), tls, timeout)
                                .await
                        }
                    })
                    .await?;
                let (channel, closed) = WsChannel::start(stream, self.notifications.clone());
                self.put_channel(Channel::WebSocket(channel));
                Ok(Some(closed))
            }
            ChannelKind::ServerSentEvents => {
                let (channel, closed) = self
                    .policy
                    .execute(&self.tokens, |snapshot| async move {
                        SseChannel::open(
                            &self.http,
                            &self.channel_url,
                            snapshot.header(),
                            self.notifications.clone(),
                        )
                        .await
                    })
                    .await?;
                self.put_channel(Channel::Events(channel));
                Ok(Some(closed))
            }
        }
    }
}

/// Watch the channel and re-establish it after unexpected loss.
async fn supervise(inner: Weak<Inner>, mut closed: oneshot::Receiver<CloseInfo>) {
    loop {
        // A dropped sender means we closed the channel ourselves.
        let Ok(info) = (&mut closed).await else {
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        drop(inner.take_channel());

        if info.is_auth_failure() {
            let code = info.code.unwrap_or_default();
            tracing::error!(code, reason = %info.reason, "channel closed for authentication reasons; not reconnecting");
            inner.set_failure(Some(Failure::Auth {
                code,
                reason: info.reason,
            }));
            inner.set_state(ConnectionState::Failed);
            return;
        }

        tracing::warn!(code = ?info.code, reason = %info.reason, "channel lost; reconnecting");
        match inner.establish(true).await {
            Ok(Some(next)) => {
                closed = next;
                inner.set_state(ConnectionState::Connected);
                tracing::info!("channel re-established");
            }
            Ok(None) => {
                inner.set_state(ConnectionState::Connected);
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "giving up on channel");
                let failure = match e {
                    TransportError::TransportUnavailable { attempts, reason } => {
                        Failure::Unavailable { attempts, reason }
                    }
                    other => Failure::Unavailable {
                        attempts: 0,
                        reason: other.to_string(),
                    },
                };
                inner.set_failure(Some(failure));
                inner.set_state(ConnectionState::Failed);
                return;
            }
        }
    }
}
