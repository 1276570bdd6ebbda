//! API-key codec: generation, format parsing, fingerprinting, and slow
//! hashing.
//!
//! A raw key is `prefix ++ secret`: a 12-character clear-text prefix
//! (3-char scheme marker such as `ak_` plus 9 random alphanumerics) used
//! for store lookup, followed by 64 lowercase hex characters of entropy.
//! The stored hash is bcrypt over the SHA-256 hex digest of the whole raw
//! key — bcrypt truncates input at 72 bytes, and the raw key is 76
//! characters, so hashing the digest keeps all entropy in play.

use rand::RngExt;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};

/// Clear-text prefix length: 3-char scheme marker + 9 random characters.
pub const PREFIX_LEN: usize = 12;
/// Hex-encoded secret length.
pub const SECRET_LEN: usize = 64;
/// Scheme marker length inside the prefix.
pub const SCHEME_LEN: usize = 3;

pub const DEFAULT_SCHEME: &str = "ak_";
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// A freshly generated key. The raw form is shown to the owner exactly
/// once; only the prefix and hash are persisted.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub raw: String,
    pub prefix: String,
    pub hash: String,
}

/// Generate a new raw key under `scheme` (e.g. `ak_`) and hash it with
/// the given bcrypt cost.
pub fn generate(scheme: &str, cost: u32) -> Result<GeneratedKey, bcrypt::BcryptError> {
    debug_assert_eq!(scheme.len(), SCHEME_LEN);
    let mut rng = rand::rng();

    let tail: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(PREFIX_LEN - SCHEME_LEN)
        .map(char::from)
        .collect();
    let prefix = format!("{scheme}{tail}");

    let mut entropy = [0u8; SECRET_LEN / 2];
    rng.fill(&mut entropy[..]);
    let secret = hex_encode(&entropy);

    let raw = format!("{prefix}{secret}");
    let hash = hash_key(&raw, cost)?;

    Ok(GeneratedKey { raw, prefix, hash })
}

/// Validate the raw key's shape and return its lookup prefix.
///
/// The format check is deliberately a single pass/fail: callers must not
/// learn whether the scheme marker or the length was the problem.
pub fn parse<'a>(raw: &'a str, scheme: &str) -> Option<&'a str> {
    if !raw.starts_with(scheme) || raw.len() != PREFIX_LEN + SECRET_LEN {
        return None;
    }
    if !raw.is_ascii() {
        return None;
    }
    Some(&raw[..PREFIX_LEN])
}

/// SHA-256 hex fingerprint of a raw key. Used as the validation-cache
/// lookup key and as the bcrypt input.
pub fn fingerprint(raw: &str) -> String {
    hex_encode(&Sha256::digest(raw.as_bytes()))
}

/// Slow hash of a raw key for persistence.
pub fn hash_key(raw: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(fingerprint(raw), cost)
}

/// Constant-time verification of a raw key against a stored hash.
pub fn verify_key(raw: &str, stored_hash: &str) -> bool {
    bcrypt::verify(fingerprint(raw), stored_hash).unwrap_or(false)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
