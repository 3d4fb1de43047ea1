//! Activated access sessions and their grants.
//!
//! An [`AccessSession`] ends exactly once. The TTL timer and an explicit
//! [`AccessSession::cleanup`] both start the same release task: the first
//! caller spawns it, and it revokes every outstanding grant, revokes the
//! session and removes it from the broker's table. Every caller awaits that
//! one task, so cancelling a caller never abandons a revocation and no
//! caller returns before the grants are revoked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::broker::BrokerCore;
use crate::error::{Result, SessionError};
use crate::wire::ActivateResponse;

/// A revocable stand-in for one secret.
pub struct TemporarySecretGrant {
    name: String,
    proxy_value: Zeroizing<String>,
    expires_at: DateTime<Utc>,
    session_id: String,
    revoked: AtomicBool,
}

impl std::fmt::Debug for TemporarySecretGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporarySecretGrant")
            .field("name", &self.name)
            .field("expires_at", &self.expires_at)
            .field("session_id", &self.session_id)
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

impl TemporarySecretGrant {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The proxy value to use in place of the secret. Do not log.
    pub fn proxy_value(&self) -> &str {
        &self.proxy_value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// The TTL fired; cleanup is under way.
    Expired,
    /// Cleanup was requested explicitly and is under way.
    Revoked,
    /// Grants revoked (or attempted) and the session removed from the table.
    Cleaned,
}

/// Completion of the spawned release task, shared by every waiter.
type Release = Shared<BoxFuture<'static, ()>>;

struct SessionInner {
    id: String,
    grants: Vec<TemporarySecretGrant>,
    expires_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    release: Mutex<Option<Release>>,
    ttl: Mutex<Option<JoinHandle<()>>>,
    core: Arc<BrokerCore>,
}

/// A set of grants obtained by one approved access request.
#[derive(Clone)]
pub struct AccessSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for AccessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSession")
            .field("id", &self.inner.id)
            .field("grants", &self.inner.grants)
            .field("expires_at", &self.inner.expires_at)
            .field("state", &self.state())
            .finish()
    }
}

impl AccessSession {
    pub(crate) fn from_activation(
        core: Arc<BrokerCore>,
        activation: ActivateResponse,
        ttl: Duration,
    ) -> Self {
        let expires_at = activation.expires_at.unwrap_or_else(|| {
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
        });
        let grants = activation
            .grants
            .into_iter()
            .map(|g| TemporarySecretGrant {
                name: g.name,
                proxy_value: Zeroizing::new(g.proxy_value),
                expires_at: g.expires_at,
                session_id: activation.session_id.clone(),
                revoked: AtomicBool::new(false),
            })
            .collect();

        Self {
            inner: Arc::new(SessionInner {
                id: activation.session_id,
                grants,
                expires_at,
                state: Mutex::new(SessionState::Active),
                release: Mutex::new(None),
                ttl: Mutex::new(None),
                core,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn grants(&self) -> &[TemporarySecretGrant] {
        &self.inner.grants
    }

    pub fn grant(&self, name: &str) -> Option<&TemporarySecretGrant> {
        self.inner.grants.iter().find(|g| g.name == name)
    }

    /// Shorthand for `grant(name).map(proxy_value)`.
    pub fn proxy_value(&self, name: &str) -> Option<&str> {
        self.grant(name).map(TemporarySecretGrant::proxy_value)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.inner.expires_at
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Cleaned)
    }

    pub fn is_cleaned(&self) -> bool {
        self.state() == SessionState::Cleaned
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.inner.state.lock() {
            tracing::debug!(session_id = %self.inner.id, from = ?*state, to = ?next, "session state transition");
            *state = next;
        }
    }

    /// Start the timer that cleans the session up at `expires_at`.
    pub(crate) fn schedule_expiry(&self) {
        let delay = (self.inner.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let session = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((release, true)) = session.begin_release(SessionState::Expired) {
                tracing::info!(session_id = %session.inner.id, "session ttl elapsed");
                release.await;
            }
        });
        if let Ok(mut ttl) = self.inner.ttl.lock() {
            *ttl = Some(task);
        }
    }

    /// Revoke every outstanding grant and the session, then drop it from the
    /// broker. Idempotent; revocation failures are logged, never returned.
    ///
    /// Returns once the release has finished, whoever started it. Dropping
    /// this future does not stop the release.
    pub async fn cleanup(&self) {
        let Some((release, started)) = self.begin_release(SessionState::Revoked) else {
            return;
        };
        if started {
            if let Some(task) = self.inner.ttl.lock().ok().and_then(|mut t| t.take()) {
                task.abort();
            }
        } else {
            tracing::debug!(session_id = %self.inner.id, "session release already under way");
        }
        release.await;
    }

    /// The release task, spawned on first call. The flag is `true` for the
    /// caller that spawned it.
    fn begin_release(&self, cause: SessionState) -> Option<(Release, bool)> {
        let mut slot = self.inner.release.lock().ok()?;
        if let Some(release) = slot.as_ref() {
            return Some((release.clone(), false));
        }
        let session = self.clone();
        let task = tokio::spawn(async move { session.release(cause).await });
        let release: Release = task.map(drop).boxed().shared();
        *slot = Some(release.clone());
        Some((release, true))
    }

    async fn release(&self, cause: SessionState) {
        self.set_state(cause);
        let core = &self.inner.core;
        let id = &self.inner.id;

        let mut failures = 0usize;
        for grant in &self.inner.grants {
            if grant.revoked.swap(true, Ordering::AcqRel) {
                continue;
            }
            if let Err(e) = core.revoke_grant(id, grant).await {
                failures += 1;
                tracing::warn!(error = %e, "grant revocation failed");
            }
        }
        if let Err(e) = core.revoke_session(id).await {
            failures += 1;
            tracing::warn!(error = %e, "session revocation failed");
        }

        core.sessions.remove(id);
        self.set_state(SessionState::Cleaned);
        tracing::info!(session_id = %id, cause = ?cause, failures, "session cleaned up");
    }

    /// Revoke one grant now, leaving the others usable.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownGrant`] for a name not in the session;
    /// [`SessionError::RevocationFailed`] if the server call fails, in which
    /// case cleanup will try again.
    pub async fn revoke_grant(&self, name: &str) -> Result<()> {
        let grant = self.grant(name).ok_or_else(|| SessionError::UnknownGrant {
            session_id: self.inner.id.clone(),
            name: name.to_string(),
        })?;
        if grant.revoked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.inner.core.revoke_grant(&self.inner.id, grant).await {
            grant.revoked.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::info!(session_id = %self.inner.id, secret = name, "grant revoked");
        Ok(())
    }
}
