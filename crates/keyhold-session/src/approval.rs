//! Waiting for an approver's decision.
//!
//! A decision can arrive over the push channel (WebSocket `/mcp/events`) or
//! be observed by polling the request's status endpoint. [`ApprovalWaiter`]
//! races every configured [`ApprovalChannel`] as one future under a single
//! timeout; whichever source resolves first wins and the others are dropped,
//! which closes the socket and stops the poll loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use keyhold_transport::{Attempt, AuthMode, Transport, connect_websocket};
use reqwest::Method;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{Result, SessionError};
use crate::wire::{ApprovalStatus, EVENTS_PATH, PushMessage, StatusResponse, status_path};

/// Default status poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A source of approval decisions.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Resolve with `true` once `request_id` is approved, `false` once it is
    /// denied. Errors mean this source gave up; others may still decide.
    async fn wait_for_decision(&self, request_id: &str) -> Result<bool>;
}

/// `{resource}` with `http(s)` swapped for `ws(s)` and `/mcp/events`
/// appended to the path.
pub fn events_url(resource: &Url) -> Result<Url> {
    let scheme = match resource.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SessionError::InvalidRequest {
                reason: format!("cannot derive an events URL from scheme `{other}`"),
            });
        }
    };
    let mut url = resource.clone();
    url.set_scheme(scheme).map_err(|()| SessionError::InvalidRequest {
        reason: "cannot derive an events URL from the resource URL".into(),
    })?;
    let path = format!("{}{EVENTS_PATH}", resource.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Decisions pushed over the events WebSocket.
pub struct WebSocketApprovals {
    transport: Arc<Transport>,
    url: Url,
}

impl WebSocketApprovals {
    pub fn new(transport: Arc<Transport>, url: Url) -> Self {
        Self { transport, url }
    }

    /// Use the events URL derived from the transport's resource URL.
    pub fn for_transport(transport: Arc<Transport>) -> Result<Self> {
        let url = events_url(transport.resource().url())?;
        Ok(Self::new(transport, url))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn failed(&self, reason: impl Into<String>) -> SessionError {
        SessionError::ApprovalChannel {
            channel: self.name(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ApprovalChannel for WebSocketApprovals {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn wait_for_decision(&self, request_id: &str) -> Result<bool> {
        let snapshot = self.transport.credential().await?;
        let stream = match connect_websocket(
            &self.url,
            Some(snapshot.header()),
            self.transport.resource().tls_config(),
            self.transport.config().request_timeout,
        )
        .await?
        {
            Attempt::Done(stream) => stream,
            Attempt::Unauthorized => return Err(self.failed("handshake rejected with 401")),
        };
        let (mut sink, mut stream) = stream.split();

        let api_key =
            (snapshot.mode() == AuthMode::ApiKey).then(|| snapshot.credential().to_string());
        let subscribe = serde_json::to_string(&PushMessage::Subscribe {
            request_id: request_id.to_string(),
            api_key,
        })?;
        sink.send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| self.failed(e.to_string()))?;
        tracing::debug!(request_id, "subscribed to approval decisions");

        let outcome = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<PushMessage>(text.as_str()) {
                        Ok(PushMessage::ApprovalDecision {
                            request_id: decided,
                            approved,
                        }) if decided == request_id => break Ok(approved),
                        Ok(_) => {}
                        Err(e) => tracing::trace!(error = %e, "ignoring push frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    break Err(self.failed(format!("closed by server (code {code:?})")));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(self.failed(e.to_string())),
                None => break Err(self.failed("stream ended")),
            }
        };

        let _ = sink.send(Message::Close(None)).await;
        outcome
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// Decisions read from `GET .../access-request/{id}/status`.
pub struct PollingApprovals {
    transport: Arc<Transport>,
    interval: Duration,
}

impl PollingApprovals {
    pub fn new(transport: Arc<Transport>, interval: Duration) -> Self {
        Self {
            transport,
            interval,
        }
    }
}

#[async_trait]
impl ApprovalChannel for PollingApprovals {
    fn name(&self) -> &'static str {
        "poll"
    }

    /// Transient poll failures are logged and retried; only credential
    /// failures end the loop.
    async fn wait_for_decision(&self, request_id: &str) -> Result<bool> {
        let path = status_path(request_id)?;
        loop {
            match self.transport.rest(Method::GET, &path, None).await {
                Ok(body) => match serde_json::from_value::<StatusResponse>(body) {
                    Ok(status) => match status.status {
                        ApprovalStatus::Approved => return Ok(true),
                        ApprovalStatus::Denied | ApprovalStatus::Expired => return Ok(false),
                        ApprovalStatus::Pending => {
                            tracing::trace!(request_id, "approval still pending");
                        }
                    },
                    Err(e) => tracing::debug!(error = %e, "unreadable status response"),
                },
                Err(e) if e.is_auth_failure() => return Err(e.into()),
                Err(e) => tracing::warn!(request_id, error = %e, "approval status poll failed"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Waiter
// ---------------------------------------------------------------------------

/// Races approval channels under one timeout.
#[derive(Clone)]
pub struct ApprovalWaiter {
    channels: Vec<Arc<dyn ApprovalChannel>>,
}

impl std::fmt::Debug for ApprovalWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.channels.iter().map(|c| c.name()).collect();
        f.debug_struct("ApprovalWaiter")
            .field("channels", &names)
            .finish()
    }
}

impl ApprovalWaiter {
    pub fn new(channels: Vec<Arc<dyn ApprovalChannel>>) -> Self {
        Self { channels }
    }

    /// Push with polling as the fallback.
    pub fn push_and_poll(transport: Arc<Transport>, poll_interval: Duration) -> Result<Self> {
        let push = WebSocketApprovals::for_transport(Arc::clone(&transport))?;
        let poll = PollingApprovals::new(transport, poll_interval);
        Ok(Self::new(vec![Arc::new(push), Arc::new(poll)]))
    }

    /// `Some(approved)` from the first channel to decide, or `None` if
    /// `timeout` passes first.
    ///
    /// # Errors
    ///
    /// Only when every channel fails; the last failure is returned.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Result<Option<bool>> {
        if self.channels.is_empty() {
            return Err(SessionError::InvalidRequest {
                reason: "no approval channels configured".into(),
            });
        }

        let race = futures::future::select_ok(
            self.channels
                .iter()
                .map(|channel| channel.wait_for_decision(request_id)),
        );
        match tokio::time::timeout(timeout, race).await {
            Err(_) => {
                tracing::warn!(request_id, timeout_secs = timeout.as_secs(), "no approval decision in time");
                Ok(None)
            }
            Ok(Ok((approved, _))) => {
                tracing::info!(request_id, approved, "approval decision received");
                Ok(Some(approved))
            }
            Ok(Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Decides after `after`, or never when `decision` is `None`.
    struct Scripted {
        after: Duration,
        decision: Option<Result<bool>>,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn scripted(after_secs: u64, decision: Option<Result<bool>>) -> (Arc<dyn ApprovalChannel>, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let channel = Scripted {
            after: Duration::from_secs(after_secs),
            decision,
            dropped: Arc::clone(&dropped),
        };
        (Arc::new(channel), dropped)
    }

    #[async_trait]
    impl ApprovalChannel for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn wait_for_decision(&self, _request_id: &str) -> Result<bool> {
            let _guard = DropFlag(Arc::clone(&self.dropped));
            tokio::time::sleep(self.after).await;
            match &self.decision {
                Some(Ok(approved)) => Ok(*approved),
                Some(Err(_)) => Err(SessionError::ApprovalChannel {
                    channel: "scripted",
                    reason: "gave up".into(),
                }),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_decision_times_out_after_300s() {
        let (never, dropped) = scripted(0, None);
        let waiter = ApprovalWaiter::new(vec![never]);

        let started = tokio::time::Instant::now();
        let outcome = waiter.wait("req_1", Duration::from_secs(300)).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(started.elapsed(), Duration::from_secs(300));
        assert!(dropped.load(Ordering::SeqCst), "losing wait must be cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn first_decision_wins_and_cancels_the_rest() {
        let (push, _) = scripted(2, Some(Ok(true)));
        let (poll, poll_dropped) = scripted(0, None);
        let waiter = ApprovalWaiter::new(vec![push, poll]);

        let started = tokio::time::Instant::now();
        let outcome = waiter.wait("req_1", Duration::from_secs(300)).await.unwrap();
        assert_eq!(outcome, Some(true));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(poll_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_push_falls_back_to_poll() {
        let (push, _) = scripted(1, Some(Err(SessionError::InvalidRequest { reason: String::new() })));
        let (poll, _) = scripted(6, Some(Ok(false)));
        let waiter = ApprovalWaiter::new(vec![push, poll]);

        assert_eq!(waiter.wait("req_1", Duration::from_secs(300)).await.unwrap(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn all_channels_failing_is_an_error() {
        let (a, _) = scripted(1, Some(Err(SessionError::InvalidRequest { reason: String::new() })));
        let waiter = ApprovalWaiter::new(vec![a]);
        assert!(matches!(
            waiter.wait("req_1", Duration::from_secs(300)).await,
            Err(SessionError::ApprovalChannel { .. })
        ));
    }

    #[tokio::test]
    async fn empty_waiter_is_rejected() {
        let waiter = ApprovalWaiter::new(Vec::new());
        assert!(waiter.wait("req_1", Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn events_url_from_resource() {
        let https = Url::parse("https://api.keyhold.dev").unwrap();
        assert_eq!(events_url(&https).unwrap().as_str(), "wss://api.keyhold.dev/mcp/events");

        let http = Url::parse("http://127.0.0.1:8080/tenant").unwrap();
        assert_eq!(events_url(&http).unwrap().as_str(), "ws://127.0.0.1:8080/tenant/mcp/events");

        let ftp = Url::parse("ftp://files.keyhold.dev").unwrap();
        assert!(events_url(&ftp).is_err());
    }
}
