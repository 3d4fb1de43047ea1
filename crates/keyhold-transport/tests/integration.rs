//! Integration tests for the keyhold-transport crate.
//!
//! The resource and authorization servers are simulated with wiremock;
//! WebSocket channels use a local tokio-tungstenite server.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use keyhold_auth::LogPrompt;
use keyhold_endpoint::EndpointOptions;
use keyhold_transport::{
    ApiKeyCredential, ClientConfig, ClientCredential, ConnectionState, OAuthCredential,
    ReconnectPolicy, Transport, TransportError,
};
use keyhold_vault::{CredentialVault, MemoryBackend, TokenRecord};
use reqwest::Method;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zeroize::Zeroizing;

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn vault_with(record: Option<TokenRecord>) -> Arc<CredentialVault> {
    let vault = Arc::new(CredentialVault::new(Arc::new(MemoryBackend::new())));
    if let Some(record) = record {
        vault.store(&record).unwrap();
    }
    vault
}

fn oauth_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::new(
        ClientCredential::OAuth(OAuthCredential {
            client_id: "cli".into(),
            auth_base_url: server.uri(),
            redirect_uri: None,
            scopes: Vec::new(),
        }),
        server.uri(),
    );
    config.endpoint_options = EndpointOptions::insecure();
    config.reconnect = ReconnectPolicy::none();
    config.interactive = false;
    config
}

fn key_config(resource: &str) -> ClientConfig {
    let mut config = ClientConfig::new(
        ClientCredential::ApiKey(ApiKeyCredential {
            key: Zeroizing::new("kh_live_abc".into()),
            base_url: resource.to_string(),
        }),
        resource,
    );
    config.endpoint_options = EndpointOptions::insecure();
    config.reconnect = ReconnectPolicy::none();
    config
}

fn transport(config: ClientConfig, vault: Arc<CredentialVault>) -> Transport {
    Transport::new(config, vault, Arc::new(LogPrompt)).unwrap()
}

fn expired_record() -> TokenRecord {
    let mut record = TokenRecord::bearer("at-old", Some("rt-1".into()), 3600);
    record.issued_at_epoch_ms = Some(Utc::now().timestamp_millis() - 3_500_000);
    record
}

fn token_body(access: &str, refresh: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "token_type": "Bearer",
        "expires_in": 3600
    })
}

fn rpc_ok(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
}

async fn mount_refresh(server: &MockServer, delay: Duration, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("at-new", "rt-2"))
                .set_delay(delay),
        )
        .expect(expected)
        .mount(server)
        .await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// A local WebSocket server. Counts handshakes and records the `x-api-key`
/// header of each; `reject` answers every handshake with 401.
struct WsServer {
    url: String,
    accepts: Arc<AtomicUsize>,
    keys: Arc<Mutex<Vec<Option<String>>>>,
}

async fn ws_server<F, Fut>(reject: bool, handler: F) -> WsServer
where
    F: Fn(usize, WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/mcp", listener.local_addr().unwrap());
    let accepts = Arc::new(AtomicUsize::new(0));
    let keys = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    let (accepts_task, keys_task) = (Arc::clone(&accepts), Arc::clone(&keys));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let n = accepts_task.fetch_add(1, Ordering::SeqCst);
            let keys = Arc::clone(&keys_task);
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let key = req
                    .headers()
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                keys.lock().unwrap().push(key);
                if reject {
                    return Err(http::Response::builder().status(401).body(None).unwrap());
                }
                Ok(resp)
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                tokio::spawn(handler(n, ws));
            }
        }
    });

    WsServer { url, accepts, keys }
}

/// Answer every JSON-RPC request with `{"echo": <method>}`.
async fn echo(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            let request: Value = serde_json::from_str(text.as_str()).unwrap();
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": { "echo": request["method"] }
            });
            if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

async fn close_with(mut ws: WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        }))
        .await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Refresh deduplication and the 401 policy
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_401s_trigger_one_refresh() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::from_millis(200), 1).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-old"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-new"))
        .respond_with(rpc_ok(json!({ "ok": true })))
        .expect(2)
        .mount(&server)
        .await;

    let valid = TokenRecord::bearer("at-old", Some("rt-1".into()), 3600);
    let client = transport(oauth_config(&server), vault_with(Some(valid)));
    client.connect().await.unwrap();

    let (a, b) = tokio::join!(
        client.request("secrets/list", json!({})),
        client.request("secrets/list", json!({}))
    );
    assert_eq!(a.unwrap(), json!({ "ok": true }));
    assert_eq!(b.unwrap(), json!({ "ok": true }));

    let stored = client.vault().retrieve().unwrap().unwrap();
    assert_eq!(stored.access_token, "at-new");
}

#[tokio::test]
async fn concurrent_calls_with_expired_token_refresh_once() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::from_millis(200), 1).await;

    Mock::given(method("GET"))
        .and(path("/api/v1/ping"))
        .and(header("authorization", "Bearer at-new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pong": true })))
        .expect(2)
        .mount(&server)
        .await;

    let client = transport(oauth_config(&server), vault_with(Some(expired_record())));
    let (a, b) = tokio::join!(
        client.rest(Method::GET, "/api/v1/ping", None),
        client.rest(Method::GET, "/api/v1/ping", None)
    );
    assert_eq!(a.unwrap()["pong"], true);
    assert_eq!(b.unwrap()["pong"], true);
}

#[tokio::test]
async fn key_mode_401_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("x-api-key", "kh_live_abc"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = transport(key_config(&server.uri()), vault_with(None));
    client.connect().await.unwrap();

    let err = client.request("secrets/list", json!({})).await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidCredential { .. }));
    assert!(!err.to_string().contains("kh_live_abc"));
}

#[tokio::test]
async fn oauth_second_401_is_surfaced() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::ZERO, 1).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/things"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let valid = TokenRecord::bearer("at-old", Some("rt-1".into()), 3600);
    let client = transport(oauth_config(&server), vault_with(Some(valid)));
    let err = client
        .rest(Method::POST, "/api/v1/things", Some(&json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unauthorized { .. }));
}

#[tokio::test]
async fn rest_reports_status_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/mcp/access-request"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "error": "policy denies access" })))
        .mount(&server)
        .await;

    let client = transport(key_config(&server.uri()), vault_with(None));
    let err = client
        .rest(Method::POST, "/api/v1/mcp/access-request", Some(&json!({ "secrets": ["DB"] })))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert!(err.to_string().contains("policy denies access"));
}

#[tokio::test]
async fn rest_empty_body_is_null() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/mcp/revoke-session"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = transport(key_config(&server.uri()), vault_with(None));
    let body = client
        .rest(Method::POST, "/api/v1/mcp/revoke-session", Some(&json!({})))
        .await
        .unwrap();
    assert_eq!(body, Value::Null);
}

// ═══════════════════════════════════════════════════════════════════════
//  Auto-refresh
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn auto_refresh_runs_before_expiry() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::ZERO, 1).await;

    // Due one second after issue.
    let record = TokenRecord::bearer("at-old", Some("rt-1".into()), 301);
    let vault = vault_with(Some(record));
    let client = transport(oauth_config(&server), Arc::clone(&vault));
    client.connect().await.unwrap();

    wait_until(|| {
        vault
            .retrieve()
            .ok()
            .flatten()
            .is_some_and(|r| r.access_token == "at-new")
    })
    .await;
}

#[tokio::test]
async fn disconnect_cancels_auto_refresh() {
    let server = MockServer::start().await;
    mount_refresh(&server, Duration::ZERO, 0).await;

    let record = TokenRecord::bearer("at-old", Some("rt-1".into()), 301);
    let client = transport(oauth_config(&server), vault_with(Some(record)));
    client.connect().await.unwrap();
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(1500)).await;
}

// ═══════════════════════════════════════════════════════════════════════
//  WebSocket channel
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn websocket_requests_and_notifications() {
    let server = ws_server(false, |_, mut ws| async move {
        let note = json!({ "jsonrpc": "2.0", "method": "secret.rotated", "params": { "name": "DB" } });
        let _ = ws.send(Message::Text(note.to_string().into())).await;
        echo(ws).await;
    })
    .await;

    let client = transport(
        key_config("http://127.0.0.1:1").with_channel_url(server.url.clone()),
        vault_with(None),
    );
    let mut notifications = client.subscribe();
    client.connect().await.unwrap();

    let note = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.method, "secret.rotated");
    assert_eq!(note.params["name"], "DB");

    let (a, b) = tokio::join!(
        client.request("tools/list", json!({})),
        client.request("secrets/list", json!({}))
    );
    assert_eq!(a.unwrap()["echo"], "tools/list");
    assert_eq!(b.unwrap()["echo"], "secrets/list");

    assert_eq!(
        server.keys.lock().unwrap().as_slice(),
        &[Some("kh_live_abc".to_string())]
    );
    client.disconnect().await;
}

#[tokio::test]
async fn auth_close_code_skips_reconnect() {
    let server = ws_server(false, |_, ws| close_with(ws, 4001, "token revoked")).await;

    let mut config = key_config("http://127.0.0.1:1").with_channel_url(server.url.clone());
    config.reconnect = ReconnectPolicy {
        attempts: 3,
        backoff: Duration::from_millis(20),
    };
    let client = transport(config, vault_with(None));
    client.connect().await.unwrap();

    wait_until(|| client.state() == ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);

    let err = client.request("tools/list", json!({})).await.unwrap_err();
    assert!(matches!(err, TransportError::AuthRejected { code: 4001, .. }));
}

#[tokio::test]
async fn lost_channel_reconnects() {
    let server = ws_server(false, |n, ws| async move {
        if n == 0 {
            close_with(ws, 1011, "restarting").await;
        } else {
            echo(ws).await;
        }
    })
    .await;

    let mut config = key_config("http://127.0.0.1:1").with_channel_url(server.url.clone());
    config.reconnect = ReconnectPolicy {
        attempts: 3,
        backoff: Duration::from_millis(20),
    };
    let client = transport(config, vault_with(None));
    client.connect().await.unwrap();

    wait_until(|| {
        server.accepts.load(Ordering::SeqCst) == 2 && client.state() == ConnectionState::Connected
    })
    .await;
    // The new socket is installed before the state flips back.
    let reply = client.request("tools/list", json!({})).await.unwrap();
    assert_eq!(reply["echo"], "tools/list");
}

#[tokio::test]
async fn websocket_handshake_401_in_key_mode_is_final() {
    let server = ws_server(true, |_, ws| echo(ws)).await;

    let mut config = key_config("http://127.0.0.1:1").with_channel_url(server.url.clone());
    config.reconnect = ReconnectPolicy {
        attempts: 3,
        backoff: Duration::from_millis(20),
    };
    let client = transport(config, vault_with(None));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidCredential { .. }));
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn unreachable_channel_exhausts_attempts() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/mcp", listener.local_addr().unwrap());
    drop(listener);

    let mut config = key_config("http://127.0.0.1:1").with_channel_url(url);
    config.reconnect = ReconnectPolicy {
        attempts: 2,
        backoff: Duration::from_millis(10),
    };
    let client = transport(config, vault_with(None));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::TransportUnavailable { attempts: 3, .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  SSE channel
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sse_events_reach_subscribers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp/events"))
        .and(header("x-api-key", "kh_live_abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(
                    "event: secret.rotated\ndata: {\"name\":\"DB\"}\n\n\
                     data: {\"method\":\"ping\",\"params\":{}}\n\n",
                ),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp/events"))
        .respond_with(rpc_ok(json!({ "echo": "tools/list" })))
        .mount(&server)
        .await;

    let config = key_config(&server.uri()).with_channel_url(format!("{}/mcp/events", server.uri()));
    let client = transport(config, vault_with(None));
    let mut notifications = client.subscribe();
    client.connect().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.method, "secret.rotated");
    assert_eq!(first.params["name"], "DB");

    let second = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.method, "ping");

    // The stream ended and no reconnects are configured.
    wait_until(|| client.state() == ConnectionState::Failed).await;
    let err = client.request("tools/list", json!({})).await.unwrap_err();
    assert!(matches!(err, TransportError::TransportUnavailable { .. }));
}
