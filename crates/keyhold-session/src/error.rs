//! Session broker error types.
//!
//! Messages name the secrets and auth mode involved so a denial can be acted
//! on. They never contain proxy values, tokens or keys.

use keyhold_transport::{AuthMode, TransportError};

/// Unified error type for the keyhold session broker.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // -- Access errors ------------------------------------------------------
    /// The request was rejected, denied by an approver, or no decision
    /// arrived in time.
    #[error("access to [{secrets}] denied ({mode} mode): {reason}")]
    AccessDenied {
        /// Comma-separated secret names.
        secrets: String,
        mode: AuthMode,
        reason: String,
    },

    /// Revoking a grant or session failed. Logged by cleanup, never
    /// returned from it.
    #[error("revocation of {target} in session {session_id} failed: {reason}")]
    RevocationFailed {
        session_id: String,
        /// `grant <name>` or `session`.
        target: String,
        reason: String,
    },

    /// The caller asked for something malformed (no names, blank names).
    #[error("invalid access request: {reason}")]
    InvalidRequest { reason: String },

    /// An approval channel gave up before a decision arrived.
    #[error("approval channel `{channel}` failed: {reason}")]
    ApprovalChannel {
        channel: &'static str,
        reason: String,
    },

    /// The server's activation did not match the request.
    #[error("unexpected activation response: {reason}")]
    Activation { reason: String },

    /// The named grant does not exist in the session.
    #[error("no grant for `{name}` in session {session_id}")]
    UnknownGrant { session_id: String, name: String },

    // -- Underlying errors --------------------------------------------------
    /// An error propagated from the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A session payload could not be encoded or decoded.
    #[error("session payload encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    pub(crate) fn denied(names: &[String], mode: AuthMode, reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            secrets: names.join(", "),
            mode,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the session crate.
pub type Result<T> = std::result::Result<T, SessionError>;
