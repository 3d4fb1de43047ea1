//! Endpoint URL validation.

use url::Url;

use crate::error::{EndpointError, Result};

/// Rules applied by [`normalize_endpoint`].
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    /// Accept `http://` and `ws://`. Off by default.
    pub allow_insecure_http: bool,
    /// When non-empty, the only hosts accepted. Entries are `host` or
    /// `host:port`; IPv6 literals are written bracketed (`[::1]`).
    pub allowed_hosts: Vec<String>,
}

impl EndpointOptions {
    /// Options for local development against a plain-HTTP server.
    pub fn insecure() -> Self {
        Self {
            allow_insecure_http: true,
            ..Default::default()
        }
    }
}

/// Validate `raw` and return it in canonical form.
///
/// Rejects embedded credentials, fragments, query strings, plain-text
/// schemes (unless allowed) and hosts outside the allowlist. A trailing
/// slash is stripped from the path.
///
/// # Errors
///
/// Returns the [`EndpointError`] variant naming the first rule violated.
pub fn normalize_endpoint(raw: &str, options: &EndpointOptions) -> Result<Url> {
    let mut url = Url::parse(raw.trim())?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(EndpointError::EmbeddedCredentials);
    }
    if url.fragment().is_some() {
        return Err(EndpointError::FragmentNotAllowed);
    }
    if url.query().is_some() {
        return Err(EndpointError::QueryNotAllowed);
    }

    match url.scheme() {
        "https" | "wss" => {}
        "http" | "ws" if options.allow_insecure_http => {
            tracing::warn!(endpoint = %url, "using an unencrypted endpoint");
        }
        scheme @ ("http" | "ws") => {
            return Err(EndpointError::InsecureScheme {
                scheme: scheme.to_string(),
            });
        }
        scheme => {
            return Err(EndpointError::UnsupportedScheme {
                scheme: scheme.to_string(),
            });
        }
    }

    let host = url.host_str().ok_or(EndpointError::MissingHost)?.to_ascii_lowercase();
    let port = url.port_or_known_default();
    if !options.allowed_hosts.is_empty() && !host_allowed(&host, port, &options.allowed_hosts) {
        return Err(EndpointError::HostNotAllowed { host });
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);

    Ok(url)
}

/// `host` is already lowercase and bracketed for IPv6.
fn host_allowed(host: &str, port: Option<u16>, allowed: &[String]) -> bool {
    let with_port = port.map(|p| format!("{host}:{p}"));
    allowed.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        entry == host || with_port.as_deref() == Some(entry.as_str())
    })
}

/// The URL as a base string without a trailing slash, ready for
/// `format!("{base}/path")`.
pub fn base_string(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(hosts: &[&str]) -> EndpointOptions {
        EndpointOptions {
            allowed_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn plain_http_rejected_by_default() {
        let err = normalize_endpoint("http://host", &EndpointOptions::default()).unwrap_err();
        assert!(matches!(err, EndpointError::InsecureScheme { .. }));
    }

    #[test]
    fn plain_http_allowed_when_opted_in() {
        let url = normalize_endpoint("http://host", &EndpointOptions::insecure()).unwrap();
        assert_eq!(url.host_str(), Some("host"));
    }

    #[test]
    fn host_outside_allowlist_rejected() {
        let err = normalize_endpoint("https://evil.com", &allow(&["good.com"])).unwrap_err();
        assert!(matches!(err, EndpointError::HostNotAllowed { host } if host == "evil.com"));
    }

    #[test]
    fn allowlist_is_case_insensitive() {
        assert!(normalize_endpoint("https://API.Good.com/v1", &allow(&["api.GOOD.com"])).is_ok());
    }

    #[test]
    fn allowlist_matches_host_and_port() {
        let opts = allow(&["good.com:8443"]);
        assert!(normalize_endpoint("https://good.com:8443", &opts).is_ok());
        assert!(normalize_endpoint("https://good.com:9443", &opts).is_err());
        assert!(normalize_endpoint("https://good.com:8443", &allow(&["good.com"])).is_ok());
    }

    #[test]
    fn allowlist_port_matches_scheme_default() {
        let opts = allow(&["good.com:443"]);
        assert!(normalize_endpoint("https://good.com:443", &opts).is_ok());
        assert!(normalize_endpoint("https://good.com", &opts).is_ok());
        assert!(normalize_endpoint("https://good.com:8443", &opts).is_err());
    }

    #[test]
    fn allowlist_matches_bracketed_ipv6() {
        let opts = EndpointOptions {
            allow_insecure_http: true,
            allowed_hosts: vec!["[::1]".into()],
        };
        assert!(normalize_endpoint("http://[::1]:8080/api", &opts).is_ok());
        assert!(normalize_endpoint("http://[::2]:8080/api", &opts).is_err());
    }

    #[test]
    fn credentials_fragment_and_query_rejected() {
        let opts = EndpointOptions::default();
        assert!(matches!(
            normalize_endpoint("https://user:pw@host", &opts),
            Err(EndpointError::EmbeddedCredentials)
        ));
        assert!(matches!(
            normalize_endpoint("https://user@host", &opts),
            Err(EndpointError::EmbeddedCredentials)
        ));
        assert!(matches!(
            normalize_endpoint("https://host/#frag", &opts),
            Err(EndpointError::FragmentNotAllowed)
        ));
        assert!(matches!(
            normalize_endpoint("https://host/?a=1", &opts),
            Err(EndpointError::QueryNotAllowed)
        ));
    }

    #[test]
    fn unsupported_scheme_rejected() {
        assert!(matches!(
            normalize_endpoint("ftp://host", &EndpointOptions::insecure()),
            Err(EndpointError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn trailing_slash_stripped() {
        let url = normalize_endpoint("https://host/api/v1/", &EndpointOptions::default()).unwrap();
        assert_eq!(url.path(), "/api/v1");
        assert_eq!(base_string(&url), "https://host/api/v1");

        let root = normalize_endpoint("https://host/", &EndpointOptions::default()).unwrap();
        assert_eq!(base_string(&root), "https://host");
    }

    #[test]
    fn websocket_schemes_follow_same_rules() {
        assert!(normalize_endpoint("wss://host/mcp/events", &EndpointOptions::default()).is_ok());
        assert!(matches!(
            normalize_endpoint("ws://host/mcp/events", &EndpointOptions::default()),
            Err(EndpointError::InsecureScheme { .. })
        ));
    }
}
