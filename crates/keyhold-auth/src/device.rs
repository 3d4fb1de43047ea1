//! Device authorization grant (RFC 8628) with a PKCE binding.
//!
//! 1. `POST {auth}/oauth/device` with the client id, scopes and S256
//!    challenge returns a `user_code` and `verification_uri`.
//! 2. The user enters the code on another device.
//! 3. The client polls `POST {auth}/oauth/token` with the device code and
//!    PKCE verifier until the user approves, denies, or the code expires.

use std::time::Duration;

use keyhold_vault::TokenRecord;
use serde::Deserialize;

use crate::error::{AuthError, Result};
use crate::prompt::DevicePrompt;
use crate::token::{TokenErrorResponse, TokenResponse};

/// Grant type for device code polling.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Seconds added to the poll interval on `slow_down`.
pub const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Response from the device authorization endpoint.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub prompt: DevicePrompt,
    pub interval_secs: u64,
}

/// Poll period when the server does not name one.
const DEFAULT_POLL_SECS: u64 = 5;

/// Wire shape of the device authorization reply.
#[derive(Deserialize)]
struct DeviceCodeReply {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: Option<String>,
    verification_uri_complete: Option<String>,
    expires_in: u64,
    interval: Option<u64>,
}

impl DeviceCodeReply {
    fn into_authorization(self) -> Result<DeviceAuthorization> {
        let verification_uri = self
            .verification_uri
            .ok_or_else(|| AuthError::failed("device code response missing verification_uri"))?;
        Ok(DeviceAuthorization {
            device_code: self.device_code,
            prompt: DevicePrompt {
                user_code: self.user_code,
                verification_uri,
                verification_uri_complete: self.verification_uri_complete,
                expires_in_secs: self.expires_in,
            },
            interval_secs: self.interval.unwrap_or(DEFAULT_POLL_SECS),
        })
    }
}

/// One step of the polling loop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Keep polling at the given interval.
    Continue(u64),
    /// Stop with this error.
    Fail(String),
}

/// Interpret a polling error code.
pub(crate) fn poll_outcome(error: &str, interval: u64) -> PollOutcome {
    match error {
        "authorization_pending" => PollOutcome::Continue(interval),
        "slow_down" => PollOutcome::Continue(interval + SLOW_DOWN_STEP_SECS),
        "access_denied" => PollOutcome::Fail("user denied authorization".into()),
        "expired_token" => PollOutcome::Fail(
            "device code expired before user completed authorization".into(),
        ),
        other => PollOutcome::Fail(format!("device code poll error: {other}")),
    }
}

/// HTTP side of the device flow.
pub(crate) struct DeviceCodeFlow<'a> {
    pub client: &'a reqwest::Client,
    pub device_url: String,
    pub token_url: String,
    pub client_id: &'a str,
    pub scopes: &'a [String],
}

impl DeviceCodeFlow<'_> {
    /// Request a device code bound to `code_challenge`.
    pub async fn request_device_code(&self, code_challenge: &str) -> Result<DeviceAuthorization> {
        let scope = self.scopes.join(" ");
        let mut params = vec![
            ("client_id", self.client_id),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        tracing::debug!(device_url = %self.device_url, "requesting device code");

        let response = self
            .client
            .post(&self.device_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::UnexpectedStatus {
                endpoint: "/oauth/device",
                status: status.as_u16(),
            });
        }

        response.json::<DeviceCodeReply>().await?.into_authorization()
    }

    /// Poll until the user completes authorization or `timeout` elapses.
    pub async fn poll_for_token(
        &self,
        device: &DeviceAuthorization,
        code_verifier: &str,
        timeout: Duration,
    ) -> Result<TokenRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = device.interval_secs;

        tracing::debug!(interval, timeout_secs = timeout.as_secs(), "polling for device token");

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;

            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::failed(format!(
                    "device authorization not completed within {} seconds",
                    timeout.as_secs()
                )));
            }

            let params = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", device.device_code.as_str()),
                ("client_id", self.client_id),
                ("code_verifier", code_verifier),
            ];

            let response = self
                .client
                .post(&self.token_url)
                .form(&params)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let token: TokenResponse = response.json().await?;
                tracing::info!("device code flow completed");
                return Ok(token.into_record(None));
            }

            let body = response.text().await.unwrap_or_default();
            let poll_error = serde_json::from_str::<TokenErrorResponse>(&body).map_err(|_| {
                AuthError::UnexpectedStatus {
                    endpoint: "/oauth/token",
                    status: status.as_u16(),
                }
            })?;

            match poll_outcome(&poll_error.error, interval) {
                PollOutcome::Continue(next) => {
                    if next != interval {
                        tracing::debug!(new_interval = next, "slow_down received");
                    } else {
                        tracing::trace!("authorization pending, will retry");
                    }
                    interval = next;
                }
                PollOutcome::Fail(reason) => return Err(AuthError::failed(reason)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_keeps_interval() {
        assert_eq!(poll_outcome("authorization_pending", 5), PollOutcome::Continue(5));
    }

    #[test]
    fn slow_down_adds_five_seconds() {
        assert_eq!(poll_outcome("slow_down", 5), PollOutcome::Continue(10));
        assert_eq!(poll_outcome("slow_down", 10), PollOutcome::Continue(15));
    }

    #[test]
    fn denial_and_expiry_stop_polling() {
        assert!(matches!(poll_outcome("access_denied", 5), PollOutcome::Fail(r) if r.contains("denied")));
        assert!(matches!(poll_outcome("expired_token", 5), PollOutcome::Fail(r) if r.contains("expired")));
        assert!(matches!(poll_outcome("server_error", 5), PollOutcome::Fail(_)));
    }

    #[test]
    fn reply_accepts_verification_url_and_defaults_interval() {
        let reply: DeviceCodeReply = serde_json::from_str(
            r#"{"device_code":"d","user_code":"U","verification_url":"https://x/device","expires_in":600}"#,
        )
        .unwrap();
        let device = reply.into_authorization().unwrap();
        assert_eq!(device.prompt.verification_uri, "https://x/device");
        assert_eq!(device.interval_secs, DEFAULT_POLL_SECS);
    }

    #[test]
    fn reply_without_verification_uri_is_rejected() {
        let reply: DeviceCodeReply = serde_json::from_str(
            r#"{"device_code":"d","user_code":"U","expires_in":600,"interval":3}"#,
        )
        .unwrap();
        assert!(matches!(
            reply.into_authorization(),
            Err(AuthError::AuthenticationFailed { .. })
        ));
    }
}
