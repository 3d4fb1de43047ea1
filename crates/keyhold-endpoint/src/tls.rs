//! TLS client configuration with optional SPKI pinning.
//!
//! [`resolve_tls_options`] builds a rustls [`ClientConfig`] trusting either
//! the bundled Mozilla roots or a custom CA bundle. When pins are
//! configured, the default chain and hostname check runs first and the
//! SHA-256 of the leaf certificate's SubjectPublicKeyInfo must then match
//! one of the pins.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::digest;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{EndpointError, Result};

/// A SHA-256 SPKI digest.
pub type SpkiPin = [u8; 32];

/// Trust settings for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM file of CA certificates to trust instead of the bundled roots.
    pub ca_file: Option<PathBuf>,
    /// Inline PEM CA certificates. Combined with `ca_file` when both are set.
    pub ca: Option<String>,
    /// SPKI pins: `sha256/<base64>`, bare base64, or 64 hex characters.
    pub pins: Vec<String>,
}

/// Build the rustls client configuration for `options`.
///
/// # Errors
///
/// Fails on an unreadable CA bundle, a bundle with no certificates, or a
/// malformed pin.
pub fn resolve_tls_options(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = Arc::new(root_store(options)?);
    let pins = options
        .pins
        .iter()
        .map(|p| parse_pin(p))
        .collect::<Result<Vec<_>>>()?;

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| EndpointError::Tls {
            reason: e.to_string(),
        })?;

    let config = if pins.is_empty() {
        builder
            .with_root_certificates(Arc::clone(&roots))
            .with_no_client_auth()
    } else {
        let verifier = SpkiPinVerifier::new(roots, provider, pins)?;
        tracing::debug!(pins = verifier.pins.len(), "spki pinning enabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore> {
    if options.ca_file.is_none() && options.ca.is_none() {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    }

    let mut certs: Vec<CertificateDer<'static>> = Vec::new();
    if let Some(path) = &options.ca_file {
        let iter = CertificateDer::pem_file_iter(path).map_err(|e| EndpointError::CaLoad {
            reason: format!("{}: {e}", path.display()),
        })?;
        for cert in iter {
            certs.push(cert.map_err(|e| EndpointError::CaLoad {
                reason: format!("{}: {e}", path.display()),
            })?);
        }
    }
    if let Some(pem) = &options.ca {
        for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
            certs.push(cert.map_err(|e| EndpointError::CaLoad {
                reason: e.to_string(),
            })?);
        }
    }

    if certs.is_empty() {
        return Err(EndpointError::CaLoad {
            reason: "no certificates found in CA bundle".into(),
        });
    }

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(EndpointError::CaLoad {
            reason: format!("none of {ignored} CA certificates could be parsed"),
        });
    }
    tracing::debug!(added, ignored, "loaded custom CA certificates");
    Ok(store)
}

/// Decode one configured pin.
///
/// # Errors
///
/// Returns [`EndpointError::InvalidPin`] unless the pin decodes to exactly
/// 32 bytes.
pub fn parse_pin(raw: &str) -> Result<SpkiPin> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix("sha256/").unwrap_or(trimmed);

    let bytes = if body.len() == 64 && body.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(body).map_err(|e| invalid_pin(raw, e))?
    } else {
        STANDARD.decode(body).map_err(|e| invalid_pin(raw, e))?
    };

    bytes
        .try_into()
        .map_err(|v: Vec<u8>| invalid_pin(raw, format!("expected 32 bytes, got {}", v.len())))
}

fn invalid_pin(raw: &str, reason: impl std::fmt::Display) -> EndpointError {
    EndpointError::InvalidPin {
        pin: raw.to_string(),
        reason: reason.to_string(),
    }
}

/// SHA-256 of the DER SubjectPublicKeyInfo in `cert`.
pub fn spki_sha256(cert: &CertificateDer<'_>) -> std::result::Result<SpkiPin, String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| format!("cannot parse server certificate: {e}"))?;
    let hash = digest::digest(&digest::SHA256, parsed.tbs_certificate.subject_pki.raw);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_ref());
    Ok(out)
}

// ---------------------------------------------------------------------------
// Pinning verifier
// ---------------------------------------------------------------------------

/// Default WebPKI verification followed by an SPKI pin check on the leaf.
#[derive(Debug)]
pub struct SpkiPinVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: Vec<SpkiPin>,
}

impl SpkiPinVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        pins: Vec<SpkiPin>,
    ) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| EndpointError::Tls {
                reason: e.to_string(),
            })?;
        Ok(Self { inner, pins })
    }
}

impl ServerCertVerifier for SpkiPinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        let actual = spki_sha256(end_entity).map_err(rustls::Error::General)?;
        if self.pins.iter().any(|pin| *pin == actual) {
            Ok(verified)
        } else {
            tracing::warn!(
                server = ?server_name,
                spki = %STANDARD.encode(actual),
                "server public key matches no configured pin"
            );
            Err(rustls::Error::General(
                "server certificate public key matches no configured pin".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
