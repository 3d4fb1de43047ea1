//! Error types for the auth crate.
//!
//! All flow, refresh, revocation and verification operations surface errors
//! through [`AuthError`]. Variants never carry token or key values.

/// Unified error type for keyhold authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The user denied the request, the flow timed out, or the returned
    /// authorization did not check out. Fatal to the call; never retried.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// What went wrong, without credential material.
        reason: String,
    },

    /// The OAuth token expired and there is no refresh token to renew it.
    #[error("access token expired and no refresh token is available")]
    TokenExpiredNoRefresh,

    /// The token endpoint refused a code exchange or refresh.
    #[error("token endpoint refused the grant: {reason}")]
    InvalidGrant {
        /// `error_description` (or `error`) from the server.
        reason: String,
    },

    /// The authorization server answered with an unexpected status.
    #[error("authorization server returned HTTP {status} from {endpoint}")]
    UnexpectedStatus {
        /// Path of the endpoint that failed.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// No browser redirect reached the loopback listener in time.
    #[error("no authorization redirect within {timeout_secs}s")]
    CallbackTimeout { timeout_secs: u64 },

    /// Client registration or redirect settings are unusable.
    #[error("auth configuration rejected: {reason}")]
    InvalidConfig { reason: String },

    #[error("request to authorization server failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Vault(#[from] keyhold_vault::VaultError),

    #[error(transparent)]
    Endpoint(#[from] keyhold_endpoint::EndpointError),

    /// A response body was not the expected JSON.
    #[error("malformed authorization server response: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Loopback listener failure.
    #[error("callback listener i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid url: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failed_names_reason() {
        let err = AuthError::failed("user denied authorization");
        assert_eq!(
            err.to_string(),
            "authentication failed: user denied authorization"
        );
    }

    #[test]
    fn invalid_grant_names_server_reason() {
        let err = AuthError::InvalidGrant {
            reason: "refresh token revoked".into(),
        };
        assert_eq!(
            err.to_string(),
            "token endpoint refused the grant: refresh token revoked"
        );
    }

    #[test]
    fn unexpected_status_names_endpoint() {
        let err = AuthError::UnexpectedStatus {
            endpoint: "/oauth/device",
            status: 503,
        };
        assert_eq!(
            err.to_string(),
            "authorization server returned HTTP 503 from /oauth/device"
        );
    }

    #[test]
    fn vault_errors_pass_through_unchanged() {
        let err: AuthError = keyhold_vault::VaultError::NoBackend.into();
        assert_eq!(err.to_string(), "no storage backend available on this host");
    }

    #[test]
    fn crosses_task_boundaries() {
        fn send_sync<T: Send + Sync + 'static>() {}
        send_sync::<AuthError>();
    }
}
