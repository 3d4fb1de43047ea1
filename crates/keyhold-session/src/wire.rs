//! JSON bodies exchanged with the resource server's session API.
//!
//! | Call | Path |
//! |------|------|
//! | request access | `POST /api/v1/mcp/access-request` |
//! | approval status | `GET /api/v1/mcp/access-request/{id}/status` |
//! | activate | `POST /api/v1/mcp/activate-access` |
//! | revoke one grant | `POST /api/v1/mcp/revoke-token` |
//! | revoke a session | `POST /api/v1/mcp/revoke-session` |
//! | push channel | WebSocket `/mcp/events` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};

pub const ACCESS_REQUEST_PATH: &str = "/api/v1/mcp/access-request";
pub const ACTIVATE_PATH: &str = "/api/v1/mcp/activate-access";
pub const REVOKE_TOKEN_PATH: &str = "/api/v1/mcp/revoke-token";
pub const REVOKE_SESSION_PATH: &str = "/api/v1/mcp/revoke-session";
pub const EVENTS_PATH: &str = "/mcp/events";

/// `{ACCESS_REQUEST_PATH}/{id}/status` with `request_id` percent-encoded as
/// a single path segment. Empty and dot-segment ids are rejected.
pub fn status_path(request_id: &str) -> Result<String> {
    let unusable = || SessionError::InvalidRequest {
        reason: format!("server returned an unusable request id {request_id:?}"),
    };
    if matches!(request_id, "" | "." | "..") {
        return Err(unusable());
    }
    let mut url = Url::parse("http://localhost")
        .and_then(|base| base.join(ACCESS_REQUEST_PATH))
        .map_err(|_| unusable())?;
    url.path_segments_mut()
        .map_err(|()| unusable())?
        .push(request_id)
        .push("status");
    Ok(url.path().to_string())
}

/// Approval state of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    /// The server gave up waiting.
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestBody {
    pub secret_names: Vec<String>,
    pub require_approval: bool,
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestResponse {
    pub request_id: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl AccessRequestResponse {
    /// Whether the broker must wait for a decision before activating.
    pub fn awaits_approval(&self) -> bool {
        self.status == ApprovalStatus::Pending
            || (self.requires_approval && self.status != ApprovalStatus::Approved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivateBody {
    pub request_id: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GrantBody {
    pub name: String,
    pub proxy_value: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for GrantBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantBody")
            .field("name", &self.name)
            .field("proxy_value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub session_id: String,
    pub grants: Vec<GrantBody>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevokeTokenBody {
    pub session_id: String,
    pub proxy_value: String,
}

impl std::fmt::Debug for RevokeTokenBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevokeTokenBody")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionBody {
    pub session_id: String,
}

/// Messages on the push channel.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Subscribe {
        #[serde(rename = "requestId")]
        request_id: String,
        /// Sent in key mode only.
        #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    ApprovalDecision {
        #[serde(rename = "requestId")]
        request_id: String,
        approved: bool,
    },
}

impl std::fmt::Debug for PushMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { request_id, .. } => f
                .debug_struct("Subscribe")
                .field("request_id", request_id)
                .finish_non_exhaustive(),
            Self::ApprovalDecision {
                request_id,
                approved,
            } => f
                .debug_struct("ApprovalDecision")
                .field("request_id", request_id)
                .field("approved", approved)
                .finish(),
        }
    }
}
