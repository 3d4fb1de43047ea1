//! Token endpoint responses.

use keyhold_vault::TokenRecord;
use serde::Deserialize;

use crate::error::{AuthError, Result};

/// Lifetime assumed when the server omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Raw token response from the authorization server.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Convert into a bearer [`TokenRecord`] issued now.
    ///
    /// `previous_refresh` is kept when the server does not rotate the
    /// refresh token.
    pub fn into_record(self, previous_refresh: Option<&str>) -> TokenRecord {
        let refresh = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string));
        TokenRecord::bearer(
            self.access_token,
            refresh,
            self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        )
    }
}

/// Raw error response from the token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Parse a token endpoint response into a record.
pub(crate) async fn parse_token_response(
    response: reqwest::Response,
    previous_refresh: Option<&str>,
) -> Result<TokenRecord> {
    let status = response.status();

    if status.is_success() {
        let token: TokenResponse = response.json().await?;
        tracing::debug!("token exchange successful");
        return Ok(token.into_record(previous_refresh));
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<TokenErrorResponse>(&body) {
        Ok(error_response) => Err(AuthError::InvalidGrant {
            reason: error_response
                .error_description
                .unwrap_or(error_response.error),
        }),
        Err(_) => Err(AuthError::InvalidGrant {
            reason: format!("HTTP {status}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use keyhold_vault::TokenType;

    use super::*;

    #[test]
    fn response_without_rotation_keeps_refresh_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":60}"#).unwrap();
        let record = response.into_record(Some("rt-old"));
        assert_eq!(record.refresh_token.as_deref(), Some("rt-old"));
        assert_eq!(record.expires_in_seconds, 60);
        assert_eq!(record.token_type, TokenType::Bearer);
        assert!(record.issued_at_epoch_ms.is_some());
    }

    #[test]
    fn rotated_refresh_token_wins() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","refresh_token":"rt-new"}"#).unwrap();
        let record = response.into_record(Some("rt-old"));
        assert_eq!(record.refresh_token.as_deref(), Some("rt-new"));
        assert_eq!(record.expires_in_seconds, DEFAULT_EXPIRES_IN_SECS);
    }
}
