//! Persistent channels: WebSocket, Server-Sent Events, and plain HTTP.
//!
//! Requests are JSON-RPC 2.0 envelopes with numeric ids. Over a WebSocket
//! they travel on the socket and are matched back through a pending table;
//! over SSE and plain HTTP they are POSTed to the channel URL. Messages
//! without an id are fanned out to subscribers as [`Notification`]s.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use eventsource_stream::Eventsource;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Result, TransportError};
use crate::policy::Attempt;

/// Close codes that mean the server rejected our credential.
pub const AUTH_CLOSE_CODES: [u16; 3] = [4001, 4003, 1008];

/// A client WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;
type Pending = Arc<DashMap<u64, oneshot::Sender<Value>>>;

// ---------------------------------------------------------------------------
// Kinds and messages
// ---------------------------------------------------------------------------

/// Which channel a URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    WebSocket,
    ServerSentEvents,
    Http,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::ServerSentEvents => f.write_str("sse"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// `ws`/`wss` selects a WebSocket; an http(s) path ending in `/sse` or
/// `/events` selects SSE; anything else is request/response.
pub fn infer_channel_kind(url: &Url) -> ChannelKind {
    match url.scheme() {
        "ws" | "wss" => ChannelKind::WebSocket,
        _ => {
            let path = url.path().trim_end_matches('/');
            if path.ends_with("/sse") || path.ends_with("/events") {
                ChannelKind::ServerSentEvents
            } else {
                ChannelKind::Http
            }
        }
    }
}

/// A server-initiated message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Why a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    fn without_code(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    /// Whether the close code is one of [`AUTH_CLOSE_CODES`].
    pub fn is_auth_failure(&self) -> bool {
        self.code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c))
    }
}

pub(crate) fn envelope(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Extract `result` from a JSON-RPC response, or turn `error` into
/// [`TransportError::Rpc`].
pub(crate) fn rpc_result(method: &str, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(TransportError::Rpc {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match response.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(TransportError::Protocol {
            reason: format!("response to {method} has neither result nor error"),
        }),
    }
}

/// Route one inbound JSON message to its waiter or to subscribers.
fn dispatch(text: &str, pending: &Pending, notifications: &broadcast::Sender<Notification>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring non-JSON frame");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64)
        && (value.get("result").is_some() || value.get("error").is_some())
    {
        match pending.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(value);
            }
            None => tracing::debug!(id, "response for unknown request id"),
        }
        return;
    }

    if let Some(notification) = as_notification(value) {
        let _ = notifications.send(notification);
    }
}

/// JSON-RPC notifications carry `method`; typed events carry `type`.
fn as_notification(mut value: Value) -> Option<Notification> {
    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        let params = value.get_mut("params").map(Value::take).unwrap_or(Value::Null);
        return Some(Notification { method, params });
    }
    let kind = value.get("type").and_then(Value::as_str)?.to_string();
    Some(Notification {
        method: kind,
        params: value,
    })
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Open an authenticated WebSocket.
///
/// Returns [`Attempt::Unauthorized`] when the handshake is answered with 401.
pub async fn connect_websocket(
    url: &Url,
    header: Option<(&'static str, String)>,
    tls: Arc<rustls::ClientConfig>,
    timeout: Duration,
) -> Result<Attempt<WsStream>> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    if let Some((name, value)) = header {
        let value = HeaderValue::from_str(&value).map_err(|_| {
            TransportError::config("credential contains characters not allowed in a header")
        })?;
        request.headers_mut().insert(name, value);
    }

    let connecting = tokio_tungstenite::connect_async_tls_with_config(
        request,
        None,
        false,
        Some(Connector::Rustls(tls)),
    );

    match tokio::time::timeout(timeout, connecting).await {
        Err(_) => Err(TransportError::Timeout {
            method: "websocket handshake".into(),
            timeout_secs: timeout.as_secs(),
        }),
        Ok(Err(tungstenite::Error::Http(response)))
            if response.status() == StatusCode::UNAUTHORIZED =>
        {
            Ok(Attempt::Unauthorized)
        }
        Ok(Err(e)) => Err(TransportError::WebSocket(e.to_string())),
        Ok(Ok((stream, _response))) => Ok(Attempt::Done(stream)),
    }
}

/// A connected JSON-RPC WebSocket.
pub(crate) struct WsChannel {
    sink: Mutex<WsSink>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl WsChannel {
    /// Split `stream` and start the reader task. The returned receiver
    /// resolves when the server closes the socket.
    pub fn start(
        stream: WsStream,
        notifications: broadcast::Sender<Notification>,
    ) -> (Self, oneshot::Receiver<CloseInfo>) {
        let (sink, stream) = stream.split();
        let pending: Pending = Arc::new(DashMap::new());
        let (closed_tx, closed_rx) = oneshot::channel();

        let reader = tokio::spawn(read_socket(
            stream,
            Arc::clone(&pending),
            notifications,
            closed_tx,
        ));

        (
            Self {
                sink: Mutex::new(sink),
                pending,
                reader,
            },
            closed_rx,
        )
    }

    pub async fn call(&self, id: u64, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let text = serde_json::to_string(&envelope(id, method, params))?;
        if let Err(e) = self.sink.lock().await.send(Message::Text(text.into())).await {
            self.pending.remove(&id);
            return Err(TransportError::WebSocket(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => rpc_result(method, response),
            Ok(Err(_)) => Err(TransportError::ChannelClosed {
                method: method.to_string(),
            }),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    pub async fn close(&self) {
        self.reader.abort();
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        self.pending.clear();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_socket(
    mut stream: SplitStream<WsStream>,
    pending: Pending,
    notifications: broadcast::Sender<Notification>,
    closed: oneshot::Sender<CloseInfo>,
) {
    let info = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => dispatch(text.as_str(), &pending, &notifications),
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => CloseInfo {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.as_str().to_string(),
                    },
                    None => CloseInfo::without_code("closed without a frame"),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break CloseInfo::without_code(e.to_string()),
            None => break CloseInfo::without_code("stream ended"),
        }
    };

    tracing::debug!(code = ?info.code, reason = %info.reason, "websocket closed");
    // Dropping the waiters fails their requests with ChannelClosed.
    pending.clear();
    let _ = closed.send(info);
}

// ---------------------------------------------------------------------------
// Server-Sent Events
// ---------------------------------------------------------------------------

/// A connected SSE stream. Requests go over [`post_envelope`].
pub(crate) struct SseChannel {
    reader: JoinHandle<()>,
}

impl SseChannel {
    /// Open the event stream at `url`.
    pub async fn open(
        client: &reqwest::Client,
        url: &Url,
        header: (&'static str, String),
        notifications: broadcast::Sender<Notification>,
    ) -> Result<Attempt<(Self, oneshot::Receiver<CloseInfo>)>> {
        let response = client
            .get(url.clone())
            .header(header.0, header.1)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                path: url.path().to_string(),
                status: status.as_u16(),
                message: "event stream refused".into(),
            });
        }

        let (closed_tx, closed_rx) = oneshot::channel();
        let reader = tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            let info = loop {
                match events.next().await {
                    Some(Ok(event)) => {
                        if let Some(n) = sse_notification(&event.event, &event.data) {
                            let _ = notifications.send(n);
                        }
                    }
                    Some(Err(e)) => break CloseInfo::without_code(e.to_string()),
                    None => break CloseInfo::without_code("event stream ended"),
                }
            };
            tracing::debug!(reason = %info.reason, "event stream closed");
            let _ = closed_tx.send(info);
        });

        Ok(Attempt::Done((Self { reader }, closed_rx)))
    }

    pub fn close(&self) {
        self.reader.abort();
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// JSON payloads are read as notifications; anything else is delivered
/// under the SSE event name with the raw data as a string.
fn sse_notification(event: &str, data: &str) -> Option<Notification> {
    if data.trim().is_empty() {
        return None;
    }
    let name = if event.is_empty() { "message" } else { event };
    match serde_json::from_str::<Value>(data) {
        Ok(value) => as_notification(value.clone()).or(Some(Notification {
            method: name.to_string(),
            params: value,
        })),
        Err(_) => Some(Notification {
            method: name.to_string(),
            params: Value::String(data.to_string()),
        }),
    }
}

// ---------------------------------------------------------------------------
// HTTP envelopes
// ---------------------------------------------------------------------------

/// POST one JSON-RPC envelope to `url`.
pub(crate) async fn post_envelope(
    client: &reqwest::Client,
    url: &Url,
    header: (&'static str, String),
    id: u64,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Attempt<Value>> {
    let response = client
        .post(url.clone())
        .header(header.0, header.1)
        .timeout(timeout)
        .json(&envelope(id, method, params))
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Ok(Attempt::Unauthorized);
    }
    if !status.is_success() {
        let body: Value = response.json().await.unwrap_or(Value::Null);
        return Err(TransportError::Status {
            path: url.path().to_string(),
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    let body: Value = response.json().await?;
    rpc_result(method, body).map(Attempt::Done)
}

/// `error` or `message` from a JSON error body.
pub(crate) fn error_message(body: &Value) -> String {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("no error message")
        .to_string()
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// The live persistent channel of a transport.
pub(crate) enum Channel {
    WebSocket(WsChannel),
    Events(SseChannel),
}

impl Channel {
    pub async fn close(&self) {
        match self {
            Self::WebSocket(ws) => ws.close().await,
            Self::Events(sse) => sse.close(),
        }
    }
}
