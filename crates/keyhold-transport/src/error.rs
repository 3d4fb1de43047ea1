//! Error types for the transport crate.
//!
//! Variants name the auth mode or method involved so a failure can be acted
//! on, but never carry token or key values.

use crate::config::AuthMode;

/// Unified error type for the keyhold transport client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server rejected the static API key. Never retried.
    #[error("invalid credential: the server rejected the {mode} credential")]
    InvalidCredential {
        /// Mode the rejected credential belongs to.
        mode: AuthMode,
    },

    /// A request was still rejected after the single refresh-then-retry.
    #[error("unauthorized: {mode} request rejected after token refresh")]
    Unauthorized {
        /// Mode in effect when the request failed.
        mode: AuthMode,
    },

    /// A concurrent refresh this call was waiting on failed.
    #[error("token refresh failed: {reason}")]
    RefreshFailed {
        /// Description of the shared failure.
        reason: String,
    },

    /// The channel could not be (re-)established.
    #[error("transport unavailable after {attempts} attempt(s): {reason}")]
    TransportUnavailable {
        /// Connection attempts made before giving up.
        attempts: u32,
        /// Last failure observed.
        reason: String,
    },

    /// The server closed the channel with an authentication close code.
    #[error("channel closed by server for authentication reasons (code {code}): {reason}")]
    AuthRejected {
        /// WebSocket close code.
        code: u16,
        /// Close reason sent by the server.
        reason: String,
    },

    /// `request`/`rest` was called before `connect` or after `disconnect`.
    #[error("transport is not connected")]
    NotConnected,

    /// The channel went away while a request was in flight.
    #[error("channel closed while waiting for response to {method}")]
    ChannelClosed {
        /// JSON-RPC method of the abandoned request.
        method: String,
    },

    /// No response arrived within the request timeout.
    #[error("request {method} timed out after {timeout_secs} seconds")]
    Timeout {
        /// JSON-RPC method or REST path.
        method: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The server answered a JSON-RPC request with an error object.
    #[error("rpc error {code} from {method}: {message}")]
    Rpc {
        /// JSON-RPC method.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the server.
        message: String,
    },

    /// The resource server answered with a non-success status.
    #[error("{path} returned HTTP {status}: {message}")]
    Status {
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// `error`/`message` field from the response body, if any.
        message: String,
    },

    /// The server sent a frame or body we could not interpret.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was wrong with the message.
        reason: String,
    },

    /// Configuration is missing or contradictory.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// WebSocket handshake or I/O failure.
    #[error("websocket handshake or i/o failed: {0}")]
    WebSocket(String),

    /// An error propagated from the auth crate.
    #[error(transparent)]
    Auth(#[from] keyhold_auth::AuthError),

    /// An error propagated from the vault crate.
    #[error(transparent)]
    Vault(#[from] keyhold_vault::VaultError),

    /// An error propagated from endpoint validation.
    #[error(transparent)]
    Endpoint(#[from] keyhold_endpoint::EndpointError),

    /// An HTTP request failed below the HTTP layer.
    #[error("request to resource server failed: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON (de)serialization failed.
    #[error("malformed json from resource server: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Shorthand for [`TransportError::InvalidConfig`].
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the failure is an authentication problem that reconnecting
    /// cannot fix.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential { .. }
                | Self::Unauthorized { .. }
                | Self::AuthRejected { .. }
                | Self::RefreshFailed { .. }
                | Self::Auth(_)
        )
    }

    /// HTTP status carried by a [`TransportError::Status`].
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
