//! A validated endpoint bundled with its TLS trust settings.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use url::Url;

use crate::error::Result;
use crate::normalize::{EndpointOptions, base_string, normalize_endpoint};
use crate::tls::{TlsOptions, resolve_tls_options};

/// User agent sent on every request built from a [`PinnedEndpoint`].
pub const USER_AGENT: &str = concat!("keyhold/", env!("CARGO_PKG_VERSION"));

/// Default timeout for a single HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A normalized base URL plus the TLS configuration used to reach it.
///
/// Computed once per configured endpoint and cloned cheaply afterwards.
#[derive(Clone)]
pub struct PinnedEndpoint {
    url: Url,
    base: String,
    tls: Arc<ClientConfig>,
    pinned: bool,
}

impl std::fmt::Debug for PinnedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedEndpoint")
            .field("base", &self.base)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl PinnedEndpoint {
    /// Validate `raw` and resolve its TLS settings.
    pub fn new(raw: &str, options: &EndpointOptions, tls: &TlsOptions) -> Result<Self> {
        let url = normalize_endpoint(raw, options)?;
        let tls_config = resolve_tls_options(tls)?;
        let base = base_string(&url);
        tracing::debug!(endpoint = %base, pinned = !tls.pins.is_empty(), "endpoint resolved");
        Ok(Self {
            url,
            base,
            tls: tls_config,
            pinned: !tls.pins.is_empty(),
        })
    }

    /// Validate `raw` with default options and bundled roots.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::new(raw, &EndpointOptions::default(), &TlsOptions::default())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The base URL without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `base` joined with `path`. `path` should start with `/`.
    pub fn join(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base)
        } else {
            format!("{}/{path}", self.base)
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls)
    }

    /// A reqwest client that enforces this endpoint's trust settings.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls((*self.tls).clone())
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EndpointError;

    #[test]
    fn join_handles_leading_slash() {
        let ep = PinnedEndpoint::parse("https://auth.example.com/base/").unwrap();
        assert_eq!(ep.base(), "https://auth.example.com/base");
        assert_eq!(ep.join("/oauth/token"), "https://auth.example.com/base/oauth/token");
        assert_eq!(ep.join("oauth/token"), "https://auth.example.com/base/oauth/token");
    }

    #[test]
    fn pins_are_validated_up_front() {
        let tls = TlsOptions {
            pins: vec!["garbage".into()],
            ..Default::default()
        };
        let err = PinnedEndpoint::new("https://host", &EndpointOptions::default(), &tls)
            .unwrap_err();
        assert!(matches!(err, EndpointError::InvalidPin { .. }));
    }

    #[test]
    fn debug_omits_tls_internals() {
        let ep = PinnedEndpoint::parse("https://host").unwrap();
        assert_eq!(
            format!("{ep:?}"),
            "PinnedEndpoint { base: \"https://host\", pinned: false }"
        );
    }

    #[tokio::test]
    async fn http_client_builds() {
        let ep = PinnedEndpoint::new(
            "http://127.0.0.1:9",
            &EndpointOptions::insecure(),
            &TlsOptions::default(),
        )
        .unwrap();
        assert!(ep.http_client().is_ok());
    }
}
