//! Persisted credential records.
//!
//! A [`TokenRecord`] holds either an OAuth access/refresh pair or a static
//! API key used as a bearer-equivalent. A [`StoredApiKey`] holds only the
//! SHA-256 digest of a key plus its audit metadata; the raw key is never
//! persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};

/// Seconds of remaining validity below which an OAuth token counts as
/// expired.
pub const EXPIRY_LEAD_SECS: i64 = 300;

/// Length of a normalized API key digest.
pub const DIGEST_HEX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// TokenRecord
// ---------------------------------------------------------------------------

/// How the access token in a [`TokenRecord`] is presented to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenType {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// `x-api-key: <token>`. Never expires.
    ApiKey,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer => f.write_str("bearer"),
            Self::ApiKey => f.write_str("api-key"),
        }
    }
}

/// The token state persisted after a successful authentication.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: TokenType,
    /// Lifetime from issue, in seconds. Always zero for API-key records.
    pub expires_in_seconds: i64,
    /// Issue time. A record without one is treated as expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at_epoch_ms: Option<i64>,
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("expires_in_seconds", &self.expires_in_seconds)
            .field("issued_at_epoch_ms", &self.issued_at_epoch_ms)
            .finish()
    }
}

impl TokenRecord {
    /// An OAuth bearer record issued now.
    pub fn bearer(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_seconds: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            token_type: TokenType::Bearer,
            expires_in_seconds,
            issued_at_epoch_ms: Some(Utc::now().timestamp_millis()),
        }
    }

    /// A static API-key record. Carries no expiry.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            access_token: key.into(),
            refresh_token: None,
            token_type: TokenType::ApiKey,
            expires_in_seconds: 0,
            issued_at_epoch_ms: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Restore the `api-key ⇒ expires_in_seconds = 0` invariant.
    pub(crate) fn normalized(mut self) -> Self {
        if self.token_type == TokenType::ApiKey {
            self.expires_in_seconds = 0;
            self.refresh_token = None;
        }
        self
    }

    /// Whether the record is expired as of `now_ms`.
    ///
    /// API-key records never expire. OAuth records expire once fewer than
    /// [`EXPIRY_LEAD_SECS`] seconds remain, and are always expired when the
    /// issue time is missing.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        if self.token_type == TokenType::ApiKey {
            return false;
        }
        let Some(expires_at_ms) = self.expires_at_ms() else {
            return true;
        };
        expires_at_ms.saturating_sub(now_ms) <= EXPIRY_LEAD_SECS * 1000
    }

    /// Absolute expiry in epoch milliseconds, saturating for lifetimes too
    /// large to represent. `None` without an issue time.
    pub fn expires_at_ms(&self) -> Option<i64> {
        let issued_at = self.issued_at_epoch_ms?;
        Some(issued_at.saturating_add(self.expires_in_seconds.saturating_mul(1000)))
    }

    /// [`is_expired_at`](Self::is_expired_at) against the wall clock.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    /// Milliseconds until the token hits the expiry lead window, or `None`
    /// for records that never expire.
    pub fn refresh_due_in_ms(&self, now_ms: i64) -> Option<i64> {
        if self.token_type == TokenType::ApiKey {
            return None;
        }
        let due = self.expires_at_ms()?.saturating_sub(EXPIRY_LEAD_SECS * 1000);
        Some(due.saturating_sub(now_ms).max(0))
    }
}

// ---------------------------------------------------------------------------
// StoredApiKey
// ---------------------------------------------------------------------------

/// Audit metadata stored next to an API key digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A persisted API key. `digest` is always the SHA-256 hex digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredApiKey {
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StoredApiKey {
    pub(crate) fn new(digest: String, meta: ApiKeyMetadata, created_at: DateTime<Utc>) -> Self {
        Self {
            digest,
            org_id: meta.org_id,
            user_id: meta.user_id,
            environment: meta.environment,
            created_at,
            expires_at: meta.expires_at,
            metadata: meta.metadata,
        }
    }
}

/// Whether `value` is already a SHA-256 hex digest.
pub fn is_digest(value: &str) -> bool {
    value.len() == DIGEST_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Normalize an API key to its lowercase SHA-256 hex digest.
///
/// Idempotent: a value that already looks like a digest is lowercased and
/// returned without re-hashing.
///
/// # Errors
///
/// Returns [`VaultError::InvalidApiKey`] for an empty or blank key.
pub fn normalize_api_key(raw: Zeroizing<String>) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(VaultError::InvalidApiKey {
            reason: "api key is empty".into(),
        });
    }
    if is_digest(trimmed) {
        return Ok(trimmed.to_ascii_lowercase());
    }
    Ok(crypto::sha256_hex(trimmed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_SECS: i64 = 3600;

    fn bearer_issued_secs_ago(secs: i64) -> TokenRecord {
        let now = Utc::now().timestamp_millis();
        TokenRecord {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            token_type: TokenType::Bearer,
            expires_in_seconds: HOUR_SECS,
            issued_at_epoch_ms: Some(now - secs * 1000),
        }
    }

    #[test]
    fn issued_3400s_ago_of_an_hour_is_expired() {
        assert!(bearer_issued_secs_ago(3400).is_expired());
    }

    #[test]
    fn issued_3000s_ago_of_an_hour_is_not_expired() {
        assert!(!bearer_issued_secs_ago(3000).is_expired());
    }

    #[test]
    fn missing_issue_time_fails_closed() {
        let mut record = bearer_issued_secs_ago(0);
        record.issued_at_epoch_ms = None;
        assert!(record.is_expired());
    }

    #[test]
    fn api_key_records_never_expire() {
        for issued in [None, Some(0), Some(i64::MIN / 2)] {
            for expires_in in [0, -5, 1, HOUR_SECS] {
                let record = TokenRecord {
                    access_token: "k".into(),
                    refresh_token: None,
                    token_type: TokenType::ApiKey,
                    expires_in_seconds: expires_in,
                    issued_at_epoch_ms: issued,
                };
                assert!(!record.is_expired(), "{issued:?}/{expires_in}");
            }
        }
    }

    #[test]
    fn normalized_api_key_record_drops_expiry() {
        let record = TokenRecord {
            access_token: "k".into(),
            refresh_token: Some("r".into()),
            token_type: TokenType::ApiKey,
            expires_in_seconds: 900,
            issued_at_epoch_ms: None,
        }
        .normalized();
        assert_eq!(record.expires_in_seconds, 0);
        assert!(record.refresh_token.is_none());
    }

    #[test]
    fn refresh_due_is_lead_window_before_expiry() {
        let record = TokenRecord {
            issued_at_epoch_ms: Some(1_000_000),
            ..bearer_issued_secs_ago(0)
        };
        assert_eq!(
            record.refresh_due_in_ms(1_000_000),
            Some((HOUR_SECS - EXPIRY_LEAD_SECS) * 1000)
        );
        assert_eq!(record.refresh_due_in_ms(i64::MAX / 2), Some(0));
        assert_eq!(TokenRecord::api_key("k").refresh_due_in_ms(0), None);
    }

    #[test]
    fn huge_lifetimes_saturate_instead_of_overflowing() {
        let record = TokenRecord::bearer("at", None, 10_000_000_000_000_000);
        assert!(!record.is_expired());
        assert_eq!(record.expires_at_ms(), Some(i64::MAX));
        assert!(record.refresh_due_in_ms(Utc::now().timestamp_millis()).unwrap() > 0);

        let record = TokenRecord::bearer("at", None, i64::MIN);
        assert!(record.is_expired());
        assert_eq!(record.refresh_due_in_ms(0), Some(0));
    }

    #[test]
    fn token_record_wire_shape() {
        let record = TokenRecord {
            access_token: "at".into(),
            refresh_token: None,
            token_type: TokenType::ApiKey,
            expires_in_seconds: 0,
            issued_at_epoch_ms: Some(42),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tokenType"], "api-key");
        assert_eq!(json["issuedAtEpochMs"], 42);
        assert!(json.get("refreshToken").is_none());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let rendered = format!("{:?}", TokenRecord::bearer("sk-live-123", Some("r".into()), 60));
        assert!(!rendered.contains("sk-live-123"));
    }

    #[test]
    fn normalize_hashes_plaintext() {
        let digest = normalize_api_key(Zeroizing::new("sk-test-12345".into())).unwrap();
        assert_eq!(digest.len(), DIGEST_HEX_LEN);
        assert_eq!(digest, crypto::sha256_hex(b"sk-test-12345"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_api_key(Zeroizing::new("sk-test-12345".into())).unwrap();
        let twice = normalize_api_key(Zeroizing::new(once.clone())).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_lowercases_uppercase_digest() {
        let upper = crypto::sha256_hex(b"x").to_ascii_uppercase();
        let normalized = normalize_api_key(Zeroizing::new(upper.clone())).unwrap();
        assert_eq!(normalized, upper.to_ascii_lowercase());
    }

    #[test]
    fn normalize_rejects_blank() {
        let result = normalize_api_key(Zeroizing::new("   ".into()));
        assert!(matches!(result, Err(VaultError::InvalidApiKey { .. })));
    }
}
