//! Server-side credential validation.
//!
//! - `POST {auth}/v1/auth/verify-api-key`
//! - `POST {auth}/v1/auth/verify-token`
//! - `POST {auth}/oauth/introspect` (RFC 7662)
//!
//! A 401 or 403 from the verify endpoints means "not valid" and is returned
//! as a result, not an error.

use chrono::{DateTime, Utc};
use keyhold_endpoint::PinnedEndpoint;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

/// Outcome of `verify_api_key`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyVerification {
    pub valid: bool,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of `verify_token`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenVerification {
    pub valid: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// RFC 7662 introspection response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Introspection {
    pub active: bool,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Expiry as epoch seconds.
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Client for the credential validation endpoints.
pub struct CredentialVerifier {
    endpoint: PinnedEndpoint,
    client: reqwest::Client,
    client_id: Option<String>,
}

impl CredentialVerifier {
    pub fn new(endpoint: PinnedEndpoint) -> Result<Self> {
        let client = endpoint.http_client()?;
        Ok(Self {
            endpoint,
            client,
            client_id: None,
        })
    }

    /// Send `client_id` with introspection requests.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Ask the server whether `api_key` is valid.
    pub async fn verify_api_key(&self, api_key: &str) -> Result<ApiKeyVerification> {
        let response = self
            .client
            .post(self.endpoint.join("/v1/auth/verify-api-key"))
            .header("x-api-key", api_key)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        read_verdict(response, "/v1/auth/verify-api-key").await
    }

    /// Ask the server whether bearer `token` is valid.
    pub async fn verify_token(&self, token: &str) -> Result<TokenVerification> {
        let response = self
            .client
            .post(self.endpoint.join("/v1/auth/verify-token"))
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        read_verdict(response, "/v1/auth/verify-token").await
    }

    /// RFC 7662 introspection of `token`.
    pub async fn introspect(&self, token: &str) -> Result<Introspection> {
        let mut params = vec![("token", token)];
        if let Some(client_id) = &self.client_id {
            params.push(("client_id", client_id.as_str()));
        }
        let response = self
            .client
            .post(self.endpoint.join("/oauth/introspect"))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::UnexpectedStatus {
                endpoint: "/oauth/introspect",
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

async fn read_verdict<T>(response: reqwest::Response, endpoint: &'static str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::debug!(endpoint, status = status.as_u16(), "credential rejected");
        return Ok(T::default());
    }
    if !status.is_success() {
        return Err(AuthError::UnexpectedStatus {
            endpoint,
            status: status.as_u16(),
        });
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_verification_wire_shape() {
        let v: ApiKeyVerification = serde_json::from_str(
            r#"{"valid":true,"orgId":"org_1","environment":"production","scopes":["secrets:read"]}"#,
        )
        .unwrap();
        assert!(v.valid);
        assert_eq!(v.org_id.as_deref(), Some("org_1"));
        assert_eq!(v.scopes, vec!["secrets:read"]);
    }

    #[test]
    fn introspection_inactive_minimal() {
        let i: Introspection = serde_json::from_str(r#"{"active":false}"#).unwrap();
        assert!(!i.active);
        assert!(i.exp.is_none());
    }
}
