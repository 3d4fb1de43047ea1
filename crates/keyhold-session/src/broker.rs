//! The session broker: request, approve, activate, use, revoke.
//!
//! ```text
//! request_access ──► POST access-request ──► (pending?) ApprovalWaiter
//!                                                   │
//!                         AccessSession ◄── POST activate-access
//!                               │
//!                  cleanup() / TTL timer ──► POST revoke-token (per grant)
//!                                          ──► POST revoke-session
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use keyhold_transport::Transport;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::approval::{ApprovalWaiter, DEFAULT_POLL_INTERVAL};
use crate::error::{Result, SessionError};
use crate::session::{AccessSession, TemporarySecretGrant};
use crate::wire::{
    ACCESS_REQUEST_PATH, ACTIVATE_PATH, AccessRequestBody, AccessRequestResponse, ActivateBody,
    ActivateResponse, ApprovalStatus, REVOKE_SESSION_PATH, REVOKE_TOKEN_PATH, RevokeSessionBody,
    RevokeTokenBody,
};

/// Default lifetime requested for a session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// How long to wait for an approver before giving up.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-request options.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub require_approval: bool,
    pub ttl: Duration,
    /// Shown to the approver.
    pub reason: Option<String>,
    pub approval_timeout: Duration,
    /// Status poll period for the default approval channels.
    pub poll_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            require_approval: false,
            ttl: DEFAULT_SESSION_TTL,
            reason: None,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl BrokerOptions {
    pub fn with_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// State shared between the broker and its sessions.
pub(crate) struct BrokerCore {
    pub(crate) transport: Arc<Transport>,
    pub(crate) sessions: DashMap<String, AccessSession>,
}

impl BrokerCore {
    async fn post<B, T>(&self, path: &str, body: &B) -> keyhold_transport::Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        let value = self.transport.rest(Method::POST, path, Some(&body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) async fn revoke_grant(
        &self,
        session_id: &str,
        grant: &TemporarySecretGrant,
    ) -> Result<()> {
        let body = RevokeTokenBody {
            session_id: session_id.to_string(),
            proxy_value: grant.proxy_value().to_string(),
        };
        self.post::<_, serde_json::Value>(REVOKE_TOKEN_PATH, &body)
            .await
            .map(drop)
            .map_err(|e| SessionError::RevocationFailed {
                session_id: session_id.to_string(),
                target: format!("grant {}", grant.name()),
                reason: e.to_string(),
            })
    }

    pub(crate) async fn revoke_session(&self, session_id: &str) -> Result<()> {
        let body = RevokeSessionBody {
            session_id: session_id.to_string(),
        };
        self.post::<_, serde_json::Value>(REVOKE_SESSION_PATH, &body)
            .await
            .map(drop)
            .map_err(|e| SessionError::RevocationFailed {
                session_id: session_id.to_string(),
                target: "session".into(),
                reason: e.to_string(),
            })
    }
}

/// Hands out short-lived proxy values for named secrets.
///
/// Every session the broker activates is tracked until it is cleaned up,
/// whether by the caller, its TTL, or [`SecretBroker::shutdown`].
pub struct SecretBroker {
    core: Arc<BrokerCore>,
    approvals: Option<ApprovalWaiter>,
}

impl std::fmt::Debug for SecretBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBroker")
            .field("mode", &self.core.transport.mode())
            .field("active_sessions", &self.core.sessions.len())
            .field("approvals", &self.approvals)
            .finish()
    }
}

impl SecretBroker {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            core: Arc::new(BrokerCore {
                transport,
                sessions: DashMap::new(),
            }),
            approvals: None,
        }
    }

    /// Replace the default push-then-poll approval channels.
    pub fn with_approvals(mut self, approvals: ApprovalWaiter) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.core.transport
    }

    /// Ids of sessions not yet cleaned up.
    pub fn active_sessions(&self) -> Vec<String> {
        self.core.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn session(&self, id: &str) -> Option<AccessSession> {
        self.core.sessions.get(id).map(|e| e.value().clone())
    }

    /// Request, (optionally) await approval for, and activate access to
    /// `names`.
    ///
    /// # Errors
    ///
    /// [`SessionError::AccessDenied`] when the server refuses (403), an
    /// approver denies, or no decision arrives within
    /// `options.approval_timeout`. Transport errors propagate unchanged.
    pub async fn request_access<S: AsRef<str>>(
        &self,
        names: &[S],
        options: &BrokerOptions,
    ) -> Result<AccessSession> {
        let names = normalize_names(names)?;
        let mode = self.core.transport.mode();
        tracing::info!(
            secrets = %names.join(","),
            require_approval = options.require_approval,
            %mode,
            "requesting secret access"
        );

        let body = AccessRequestBody {
            secret_names: names.clone(),
            require_approval: options.require_approval,
            ttl_seconds: options.ttl.as_secs(),
            reason: options.reason.clone(),
        };
        let response: AccessRequestResponse =
            match self.core.post(ACCESS_REQUEST_PATH, &body).await {
                Ok(response) => response,
                Err(e) if e.status() == Some(403) => {
                    return Err(SessionError::denied(&names, mode, e.to_string()));
                }
                Err(e) => return Err(e.into()),
            };
        let request_id = response.request_id.clone();

        match response.status {
            ApprovalStatus::Denied | ApprovalStatus::Expired => {
                let reason = response
                    .message
                    .unwrap_or_else(|| format!("request {}", status_word(response.status)));
                return Err(SessionError::denied(&names, mode, reason));
            }
            _ if response.awaits_approval() => {
                tracing::info!(request_id, "awaiting approval");
                let waiter = match &self.approvals {
                    Some(waiter) => waiter.clone(),
                    None => ApprovalWaiter::push_and_poll(
                        Arc::clone(&self.core.transport),
                        options.poll_interval,
                    )?,
                };
                match waiter.wait(&request_id, options.approval_timeout).await? {
                    Some(true) => {}
                    Some(false) => {
                        return Err(SessionError::denied(&names, mode, "denied by approver"));
                    }
                    None => {
                        return Err(SessionError::denied(
                            &names,
                            mode,
                            format!(
                                "no approval decision within {} seconds",
                                options.approval_timeout.as_secs()
                            ),
                        ));
                    }
                }
            }
            _ => {}
        }

        let activation: ActivateResponse = self
            .core
            .post(ACTIVATE_PATH, &ActivateBody { request_id })
            .await?;
        let session =
            AccessSession::from_activation(Arc::clone(&self.core), activation, options.ttl);

        let missing: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|name| session.grant(name).is_none())
            .collect();
        if !missing.is_empty() {
            let reason = format!("no grant issued for {}", missing.join(", "));
            session.cleanup().await;
            return Err(SessionError::Activation { reason });
        }

        self.core
            .sessions
            .insert(session.id().to_string(), session.clone());
        session.schedule_expiry();
        tracing::info!(
            session_id = session.id(),
            grants = session.grants().len(),
            expires_at = %session.expires_at(),
            "session active"
        );
        Ok(session)
    }

    /// Run `callback` with the proxy value for `name`, then revoke the
    /// session whether the callback returns, errors or panics.
    pub async fn use_secret<F, Fut, T>(
        &self,
        name: &str,
        options: &BrokerOptions,
        callback: F,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = T>,
    {
        let session = self.request_access(&[name], options).await?;
        let Some(proxy) = session.proxy_value(name).map(str::to_string) else {
            session.cleanup().await;
            return Err(SessionError::UnknownGrant {
                session_id: session.id().to_string(),
                name: name.to_string(),
            });
        };
        run_then_cleanup(&session, async move { callback(proxy).await }).await
    }

    /// [`use_secret`](Self::use_secret) for several names at once; the
    /// callback receives a map from secret name to proxy value.
    pub async fn use_secrets<S, F, Fut, T>(
        &self,
        names: &[S],
        options: &BrokerOptions,
        callback: F,
    ) -> Result<T>
    where
        S: AsRef<str>,
        F: FnOnce(HashMap<String, String>) -> Fut,
        Fut: Future<Output = T>,
    {
        let session = self.request_access(names, options).await?;
        let proxies: HashMap<String, String> = session
            .grants()
            .iter()
            .map(|g| (g.name().to_string(), g.proxy_value().to_string()))
            .collect();
        run_then_cleanup(&session, async move { callback(proxies).await }).await
    }

    /// Clean up every open session concurrently.
    pub async fn shutdown(&self) {
        let sessions: Vec<AccessSession> = self
            .core
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "revoking open sessions");
        futures::future::join_all(sessions.iter().map(AccessSession::cleanup)).await;
    }
}

async fn run_then_cleanup<Fut, T>(session: &AccessSession, work: Fut) -> Result<T>
where
    Fut: Future<Output = T>,
{
    let outcome = AssertUnwindSafe(work).catch_unwind().await;
    session.cleanup().await;
    match outcome {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn status_word(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Denied => "denied",
        ApprovalStatus::Expired => "expired",
    }
}

/// Trim, reject blanks, and drop duplicates keeping first-seen order.
fn normalize_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Err(SessionError::InvalidRequest {
            reason: "at least one secret name is required".into(),
        });
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(SessionError::InvalidRequest {
                reason: "secret names must not be blank".into(),
            });
        }
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_deduplicated() {
        let names = normalize_names(&[" STRIPE_KEY", "DB_PASSWORD", "STRIPE_KEY "]).unwrap();
        assert_eq!(names, vec!["STRIPE_KEY", "DB_PASSWORD"]);
    }

    #[test]
    fn empty_or_blank_names_are_rejected() {
        let none: [&str; 0] = [];
        assert!(matches!(
            normalize_names(&none),
            Err(SessionError::InvalidRequest { .. })
        ));
        assert!(matches!(
            normalize_names(&["OK", "  "]),
            Err(SessionError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn default_options() {
        let options = BrokerOptions::default();
        assert!(!options.require_approval);
        assert_eq!(options.approval_timeout, Duration::from_secs(300));
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert_eq!(options.ttl, DEFAULT_SESSION_TTL);

        let options = BrokerOptions::default()
            .with_approval()
            .with_reason("deploy")
            .with_ttl(Duration::from_secs(60));
        assert!(options.require_approval);
        assert_eq!(options.reason.as_deref(), Some("deploy"));
        assert_eq!(options.ttl.as_secs(), 60);
    }
}
