//! Proof Key for Code Exchange (RFC 7636), S256 only.
//!
//! Every flow invocation builds its own [`PkcePair`]; the verifier is wiped
//! when the pair drops.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{AuthError, Result};

/// Random bytes behind a verifier; 43 characters once encoded.
const VERIFIER_ENTROPY: usize = 32;

/// A verifier and its S256 challenge.
pub struct PkcePair {
    verifier: Zeroizing<String>,
    challenge: String,
}

impl PkcePair {
    pub fn generate() -> Result<Self> {
        let verifier = generate_pkce_verifier()?;
        let challenge = pkce_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

/// A fresh base64url verifier.
///
/// # Errors
///
/// [`AuthError::AuthenticationFailed`] when the system CSPRNG fails.
pub fn generate_pkce_verifier() -> Result<Zeroizing<String>> {
    let mut entropy = Zeroizing::new([0u8; VERIFIER_ENTROPY]);
    SystemRandom::new()
        .fill(&mut entropy[..])
        .map_err(|_| AuthError::failed("system random source failed while building PKCE"))?;
    Ok(Zeroizing::new(URL_SAFE_NO_PAD.encode(&entropy[..])))
}

/// `BASE64URL(SHA256(verifier))`, unpadded.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest::digest(&digest::SHA256, verifier.as_bytes()))
}
