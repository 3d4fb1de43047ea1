//! Endpoint hardening for keyhold.
//!
//! Every network-facing keyhold component reaches its collaborators through
//! a [`PinnedEndpoint`]: a base URL that passed [`normalize_endpoint`] and a
//! rustls configuration from [`resolve_tls_options`], optionally pinning
//! the server's public key.

pub mod endpoint;
pub mod error;
pub mod normalize;
pub mod tls;

pub use endpoint::{PinnedEndpoint, USER_AGENT};
pub use error::{EndpointError, Result};
pub use normalize::{EndpointOptions, normalize_endpoint};
pub use tls::{SpkiPin, SpkiPinVerifier, TlsOptions, parse_pin, resolve_tls_options, spki_sha256};
