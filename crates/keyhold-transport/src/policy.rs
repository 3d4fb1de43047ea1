//! Retry rules shared by every request path.
//!
//! [`RefreshRetryPolicy`] is the only place a rejected request is retried:
//! in OAuth mode a 401 triggers one refresh and one retry, in key mode it is
//! final. [`ReconnectPolicy`] governs channel re-establishment.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AuthMode;
use crate::error::{Result, TransportError};
use crate::token_cell::{TokenCell, TokenSnapshot};

/// Result of one authenticated attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// The server answered 401 (or the channel equivalent).
    Unauthorized,
}

/// Refresh-then-retry-once on 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRetryPolicy {
    mode: AuthMode,
}

impl RefreshRetryPolicy {
    pub fn new(mode: AuthMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Run `attempt` with a valid credential from `tokens`.
    ///
    /// # Errors
    ///
    /// - key mode, first 401: [`TransportError::InvalidCredential`]
    /// - OAuth mode, 401 after the retry: [`TransportError::Unauthorized`]
    /// - any refresh failure, or whatever `attempt` returns
    pub async fn execute<T, F, Fut>(&self, tokens: &TokenCell, mut attempt: F) -> Result<T>
    where
        F: FnMut(Arc<TokenSnapshot>) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let snapshot = tokens.valid().await?;
        let generation = snapshot.generation();

        match attempt(snapshot).await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Unauthorized => {}
        }

        if self.mode == AuthMode::ApiKey {
            tracing::warn!(mode = %self.mode, "request rejected; static keys are not retried");
            return Err(TransportError::InvalidCredential { mode: self.mode });
        }

        tracing::debug!("request rejected with 401; refreshing once before retry");
        let refreshed = tokens.refresh(generation).await?;
        match attempt(refreshed).await? {
            Attempt::Done(value) => Ok(value),
            Attempt::Unauthorized => {
                tracing::warn!(mode = %self.mode, "request rejected again after refresh");
                Err(TransportError::Unauthorized { mode: self.mode })
            }
        }
    }
}

/// Channel reconnect settings: `attempts` tries, `backoff` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    #[serde(with = "secs")]
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// No reconnection at all.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
