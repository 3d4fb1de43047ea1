//! Error types for endpoint validation and TLS configuration.

/// Unified error type for the keyhold endpoint crate.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The endpoint is not a parseable absolute URL.
    #[error("invalid endpoint url: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The URL embeds a username or password.
    #[error("endpoint url must not embed credentials")]
    EmbeddedCredentials,

    /// The URL carries a `#fragment`.
    #[error("endpoint url must not contain a fragment")]
    FragmentNotAllowed,

    /// The URL carries a `?query`.
    #[error("endpoint url must not contain a query string")]
    QueryNotAllowed,

    /// Plain-text scheme used without opting in.
    #[error("insecure scheme `{scheme}` requires allow_insecure_http")]
    InsecureScheme { scheme: String },

    /// Scheme is neither HTTP(S) nor WS(S).
    #[error("unsupported endpoint scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    /// The URL has no host component.
    #[error("endpoint url has no host")]
    MissingHost,

    /// The host is not on the configured allowlist.
    #[error("host `{host}` is not in the allowed host list")]
    HostNotAllowed { host: String },

    /// A configured SPKI pin could not be decoded.
    #[error("invalid spki pin `{pin}`: {reason}")]
    InvalidPin { pin: String, reason: String },

    /// A custom CA bundle could not be loaded.
    #[error("cannot load CA certificates: {reason}")]
    CaLoad { reason: String },

    /// The TLS client configuration could not be assembled.
    #[error("tls configuration failed: {reason}")]
    Tls { reason: String },

    /// The HTTP client could not be built.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, EndpointError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_host_not_allowed() {
        let err = EndpointError::HostNotAllowed {
            host: "evil.com".into(),
        };
        assert_eq!(
            err.to_string(),
            "host `evil.com` is not in the allowed host list"
        );
    }

    #[test]
    fn display_insecure_scheme() {
        let err = EndpointError::InsecureScheme {
            scheme: "http".into(),
        };
        assert!(err.to_string().contains("allow_insecure_http"));
    }

    #[test]
    fn from_url_parse_error() {
        let err: EndpointError = url::Url::parse("::").unwrap_err().into();
        assert!(matches!(err, EndpointError::UrlParse(_)));
    }
}
