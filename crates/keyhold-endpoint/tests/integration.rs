//! Integration tests for the keyhold-endpoint crate.

use std::path::Path;

use keyhold_endpoint::{
    EndpointError, EndpointOptions, PinnedEndpoint, TlsOptions, normalize_endpoint,
};

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[test]
fn pinned_endpoint_with_custom_ca_and_hex_pin() {
    let tls = TlsOptions {
        ca_file: Some(fixture("ca.pem")),
        ca: None,
        pins: vec!["b51524c29e07b24874212c4a0cdbbc9e54e8a3e00bf013070f69f9aeb8b370e0".into()],
    };
    let options = EndpointOptions {
        allowed_hosts: vec!["localhost:8443".into()],
        ..Default::default()
    };

    let ep = PinnedEndpoint::new("https://LOCALHOST:8443/api/", &options, &tls).unwrap();
    assert!(ep.is_pinned());
    assert_eq!(ep.base(), "https://localhost:8443/api");
    assert!(ep.http_client().is_ok());
}

#[test]
fn missing_ca_file_is_reported() {
    let tls = TlsOptions {
        ca_file: Some(fixture("does-not-exist.pem")),
        ..Default::default()
    };
    let err = PinnedEndpoint::new("https://host", &EndpointOptions::default(), &tls).unwrap_err();
    assert!(matches!(err, EndpointError::CaLoad { .. }));
}

#[test]
fn allowlist_rejects_before_tls_is_resolved() {
    let options = EndpointOptions {
        allowed_hosts: vec!["good.com".into()],
        ..Default::default()
    };
    let tls = TlsOptions {
        pins: vec!["garbage".into()],
        ..Default::default()
    };
    let err = PinnedEndpoint::new("https://evil.com", &options, &tls).unwrap_err();
    assert!(matches!(err, EndpointError::HostNotAllowed { .. }));
}

#[test]
fn normalized_urls_are_stable() {
    let opts = EndpointOptions::default();
    let once = normalize_endpoint("https://Auth.Example.com/v1/", &opts).unwrap();
    let twice = normalize_endpoint(once.as_str(), &opts).unwrap();
    assert_eq!(once, twice);
}
