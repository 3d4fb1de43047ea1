//! The in-memory credential and its single-flight refresh.
//!
//! The transport never holds more than a transient copy of the access token:
//! the [`TokenCell`] keeps the current value behind a generation number, and
//! every refresh goes through one async gate. A caller that observed
//! generation `n` and finds the cell already past `n` when it gets the gate
//! reuses the new token; a caller that queued behind a failed attempt for
//! the same generation receives that failure instead of issuing a second
//! call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keyhold_auth::FlowEngine;
use keyhold_vault::TokenRecord;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::config::AuthMode;
use crate::error::{Result, TransportError};

/// Produces a replacement token record.
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    /// Refresh or re-authenticate, given the record currently in use.
    async fn renew(&self, current: Option<&TokenRecord>) -> keyhold_auth::Result<TokenRecord>;
}

#[async_trait]
impl TokenRenewer for FlowEngine {
    async fn renew(&self, current: Option<&TokenRecord>) -> keyhold_auth::Result<TokenRecord> {
        FlowEngine::renew(self, current).await
    }
}

// ---------------------------------------------------------------------------
// TokenSnapshot
// ---------------------------------------------------------------------------

/// One generation of the credential.
pub struct TokenSnapshot {
    credential: Zeroizing<String>,
    record: Option<TokenRecord>,
    generation: u64,
    mode: AuthMode,
}

impl std::fmt::Debug for TokenSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSnapshot")
            .field("mode", &self.mode)
            .field("generation", &self.generation)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl TokenSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// The OAuth record this snapshot came from. `None` in key mode.
    pub fn record(&self) -> Option<&TokenRecord> {
        self.record.as_ref()
    }

    /// The raw credential. Do not log.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// `(header name, header value)` for authenticating a request.
    pub fn header(&self) -> (&'static str, String) {
        (
            self.mode.header_name(),
            self.mode.header_value(&self.credential),
        )
    }

    /// Whether the OAuth record is inside the expiry lead window.
    pub fn is_expired(&self) -> bool {
        self.record.as_ref().is_some_and(TokenRecord::is_expired)
    }
}

// ---------------------------------------------------------------------------
// TokenCell
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RefreshMemo {
    finished: u64,
    failure: Option<SharedFailure>,
}

struct SharedFailure {
    generation: u64,
    finished: u64,
    reason: String,
}

/// Current credential plus the refresh gate.
pub struct TokenCell {
    mode: AuthMode,
    current: RwLock<Option<Arc<TokenSnapshot>>>,
    generation: AtomicU64,
    gate: Mutex<RefreshMemo>,
    finished: AtomicU64,
    renewer: Option<Arc<dyn TokenRenewer>>,
}

impl std::fmt::Debug for TokenCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCell")
            .field("mode", &self.mode)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl TokenCell {
    /// A cell holding a static key. It never refreshes.
    pub fn api_key(key: Zeroizing<String>) -> Self {
        let cell = Self::empty(AuthMode::ApiKey, None);
        cell.put(key, None);
        cell
    }

    /// An empty OAuth cell renewed through `renewer`.
    pub fn oauth(renewer: Arc<dyn TokenRenewer>) -> Self {
        Self::empty(AuthMode::OAuth, Some(renewer))
    }

    fn empty(mode: AuthMode, renewer: Option<Arc<dyn TokenRenewer>>) -> Self {
        Self {
            mode,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            gate: Mutex::new(RefreshMemo::default()),
            finished: AtomicU64::new(0),
            renewer,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<Arc<TokenSnapshot>> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    /// Install an OAuth record as a new generation.
    pub fn install(&self, record: TokenRecord) -> Arc<TokenSnapshot> {
        let credential = Zeroizing::new(record.access_token.clone());
        self.put(credential, Some(record))
    }

    fn put(&self, credential: Zeroizing<String>, record: Option<TokenRecord>) -> Arc<TokenSnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(TokenSnapshot {
            credential,
            record,
            generation,
            mode: self.mode,
        });
        if let Ok(mut current) = self.current.write() {
            *current = Some(Arc::clone(&snapshot));
        }
        snapshot
    }

    /// Drop the in-memory OAuth token. Key-mode cells keep their key.
    pub fn clear(&self) {
        if self.mode == AuthMode::ApiKey {
            return;
        }
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
    }

    /// The current credential, refreshed first if missing or expired.
    pub async fn valid(&self) -> Result<Arc<TokenSnapshot>> {
        match self.current() {
            Some(snapshot) if !snapshot.is_expired() => Ok(snapshot),
            Some(snapshot) => self.refresh(snapshot.generation).await,
            None => self.refresh(self.generation()).await,
        }
    }

    /// Replace generation `observed`, joining any refresh already underway.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidCredential`] in key mode; otherwise the
    /// renewer's error for the caller that made the call, and
    /// [`TransportError::RefreshFailed`] for callers that waited on it.
    pub async fn refresh(&self, observed: u64) -> Result<Arc<TokenSnapshot>> {
        let Some(renewer) = &self.renewer else {
            return Err(TransportError::InvalidCredential { mode: self.mode });
        };

        let arrived_after = self.finished.load(Ordering::Acquire);
        let mut memo = self.gate.lock().await;

        if let Some(current) = self.current()
            && current.generation > observed
        {
            tracing::debug!(
                generation = current.generation,
                "token already refreshed by a concurrent caller"
            );
            return Ok(current);
        }
        if let Some(failure) = &memo.failure
            && failure.generation == observed
            && failure.finished > arrived_after
        {
            return Err(TransportError::RefreshFailed {
                reason: failure.reason.clone(),
            });
        }

        let previous = self.current().and_then(|s| s.record.clone());
        let outcome = renewer.renew(previous.as_ref()).await;

        memo.finished += 1;
        self.finished.store(memo.finished, Ordering::Release);

        match outcome {
            Ok(record) => {
                memo.failure = None;
                let snapshot = self.install(record);
                tracing::debug!(generation = snapshot.generation, "token refreshed");
                Ok(snapshot)
            }
            Err(e) => {
                memo.failure = Some(SharedFailure {
                    generation: observed,
                    finished: memo.finished,
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Auto-refresh
// ---------------------------------------------------------------------------

/// Refresh the cell [`EXPIRY_LEAD_SECS`](keyhold_vault::EXPIRY_LEAD_SECS)
/// before each token expires.
///
/// Returns `None` when the current credential never expires. The task stops
/// on the first failed refresh or when a fresh token is already due, and is
/// aborted by the owner on disconnect.
pub(crate) fn spawn_auto_refresh(cell: Arc<TokenCell>) -> Option<JoinHandle<()>> {
    let first_due = cell
        .current()?
        .record()?
        .refresh_due_in_ms(Utc::now().timestamp_millis())?;
    tracing::debug!(due_in_ms = first_due, "scheduling token auto-refresh");

    Some(tokio::spawn(async move {
        let mut due = first_due;
        loop {
            tokio::time::sleep(Duration::from_millis(due.max(0) as u64)).await;

            let observed = cell.generation();
            let snapshot = match cell.refresh(observed).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(error = %e, "scheduled token refresh failed");
                    return;
                }
            };
            match snapshot
                .record()
                .and_then(|r| r.refresh_due_in_ms(Utc::now().timestamp_millis()))
            {
                Some(next) if next > 0 => due = next,
                _ => {
                    tracing::warn!("refreshed token is already inside the expiry window; auto-refresh stopped");
                    return;
                }
            }
        }
    }))
}
