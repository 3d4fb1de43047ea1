//! Envelope encryption for vault backends that cannot rely on the OS.
//!
//! Every write derives a fresh AES-256-GCM key from the backend passphrase
//! with PBKDF2-HMAC-SHA256 and a random salt, then seals the payload under a
//! random 96-bit nonce. The salt and nonce travel in the envelope header so
//! a reader only needs the passphrase.
//!
//! # Envelope layout
//!
//! ```text
//! [4 bytes: magic "KHV\0"]
//! [1 byte:  version (1)]
//! [16 bytes: PBKDF2 salt, random per write]
//! [12 bytes: AES-256-GCM nonce, random per write]
//! [remaining: ciphertext + 16-byte authentication tag]
//! ```
//!
//! API key digests (SHA-256, lowercase hex) live here too.

use std::num::NonZeroU32;

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, pbkdf2};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// PBKDF2 iteration count. Never lower than 100,000.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Per-write PBKDF2 salt size.
pub const SALT_LEN: usize = 16;

const DERIVED_KEY_LEN: usize = 32;
const GCM_TAG_LEN: usize = 16;
const MAGIC: [u8; 4] = *b"KHV\0";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// Borrowed view of a parsed envelope.
struct Envelope<'a> {
    salt: &'a [u8],
    nonce: [u8; NONCE_LEN],
    sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(bytes: &'a [u8], slot: &'static str) -> Result<Self> {
        let corrupt = |reason: String| VaultError::CorruptEntry { slot, reason };

        if bytes.len() < HEADER_LEN + GCM_TAG_LEN {
            return Err(corrupt(format!("envelope is {} bytes, too small", bytes.len())));
        }
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad envelope magic".into()));
        }
        let version = bytes[MAGIC.len()];
        if version != VERSION {
            return Err(corrupt(format!("unsupported envelope version {version}")));
        }

        let (salt, rest) = bytes[MAGIC.len() + 1..].split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let nonce = nonce
            .try_into()
            .map_err(|_| corrupt("truncated nonce".into()))?;
        Ok(Self {
            salt,
            nonce,
            sealed,
        })
    }
}

/// AES-256-GCM key derived from `passphrase` and `salt`.
fn envelope_key(passphrase: &[u8], salt: &[u8]) -> Result<LessSafeKey> {
    let derived = derive_key(passphrase, salt);
    let unbound = UnboundKey::new(&AES_256_GCM, &derived[..]).map_err(|_| {
        VaultError::KeyDerivationFailed {
            reason: "derived key rejected by AES-256-GCM".into(),
        }
    })?;
    Ok(LessSafeKey::new(unbound))
}

/// PBKDF2-HMAC-SHA256 over `passphrase` and `salt`, 256-bit output.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    let rounds = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        salt,
        passphrase,
        &mut out[..],
    );
    out
}

/// Seal `plaintext` under `passphrase` into a self-describing envelope.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] when the CSPRNG or `ring`
/// fails.
pub fn seal_envelope(plaintext: &[u8], passphrase: &[u8]) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_LEN + plaintext.len() + GCM_TAG_LEN);
    header.extend_from_slice(&MAGIC);
    header.push(VERSION);

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let rng = SystemRandom::new();
    rng.fill(&mut salt)
        .and_then(|()| rng.fill(&mut nonce))
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "system random source failed".into(),
        })?;
    header.extend_from_slice(&salt);
    header.extend_from_slice(&nonce);

    let key = envelope_key(passphrase, &salt)?;
    let mut body = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "AES-256-GCM seal failed".into(),
        })?;

    tracing::trace!(plaintext_len = plaintext.len(), sealed_len = body.len(), "sealed envelope");
    header.extend_from_slice(&body);
    Ok(header)
}

/// Open an envelope produced by [`seal_envelope`]. `slot` only labels
/// errors.
///
/// # Errors
///
/// [`VaultError::CorruptEntry`] for a malformed envelope,
/// [`VaultError::DecryptionFailed`] for a wrong passphrase or tampered
/// ciphertext.
pub fn open_envelope(envelope: &[u8], passphrase: &[u8], slot: &'static str) -> Result<Vec<u8>> {
    let parsed = Envelope::parse(envelope, slot)?;
    let key = envelope_key(passphrase, parsed.salt)?;

    let mut buf = parsed.sealed.to_vec();
    let opened = key
        .open_in_place(Nonce::assume_unique_for_key(parsed.nonce), Aad::empty(), &mut buf)
        .map_err(|_| VaultError::DecryptionFailed {
            reason: format!("slot `{slot}`: wrong passphrase or tampered data"),
        })?;
    Ok(opened.to_vec())
}

/// Lowercase hex SHA-256 of `input`.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, input))
}

/// `len` bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| VaultError::Internal("system random source failed".into()))?;
    Ok(out)
}
