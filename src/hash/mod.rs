//! Versioned one-way hashing for token secrets.
//!
//! Stored format is `$<version>:<base64 salt>:<base64 digest>`. Verification
//! dispatches on the embedded version so tokens hashed under an older scheme
//! keep validating after the default changes. A stored value without the
//! leading `$` is a legacy plaintext secret from before hashing was enabled;
//! it is compared in constant time and rehashed by the token manager on the
//! next successful verification.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use subtle::ConstantTimeEq;

use crate::errors::AuthError;

const SALT_LEN: usize = 8;

/// Hash scheme identifiers embedded in the stored format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashVersion {
    /// SHA-256 over `salt || secret`.
    V1,
    /// SHA3-256 over `salt || secret`.
    V2,
}

impl HashVersion {
    fn tag(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    fn digest(self, salt: &[u8], secret: &str) -> Vec<u8> {
        match self {
            Self::V1 => {
                let mut hasher = Sha256::new();
                hasher.update(salt);
                hasher.update(secret.as_bytes());
                hasher.finalize().to_vec()
            }
            Self::V2 => {
                let mut hasher = Sha3_256::new();
                hasher.update(salt);
                hasher.update(secret.as_bytes());
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Hash `secret` under the given scheme with a fresh random salt.
pub fn hash_secret_with(version: HashVersion, secret: &str) -> Result<String, AuthError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|err| AuthError::server(anyhow::anyhow!("salt generation failed: {err}")))?;
    let digest = version.digest(&salt, secret);
    Ok(format!(
        "${}:{}:{}",
        version.tag(),
        STANDARD.encode(salt),
        STANDARD.encode(digest)
    ))
}

/// Hash `secret` under the current default scheme.
pub fn hash_secret(secret: &str) -> Result<String, AuthError> {
    hash_secret_with(HashVersion::V1, secret)
}

/// True when `stored` predates hashing and holds the raw secret.
#[must_use]
pub fn is_legacy_plaintext(stored: &str) -> bool {
    !stored.starts_with('$')
}

/// Verify `candidate` against a stored hash string.
///
/// An unknown or malformed version prefix is `InvalidFormat`, never treated
/// as a match. Legacy plaintext values compare in constant time.
pub fn verify_secret(stored: &str, candidate: &str) -> Result<(), AuthError> {
    if is_legacy_plaintext(stored) {
        if stored.as_bytes().ct_eq(candidate.as_bytes()).into() {
            return Ok(());
        }
        return Err(AuthError::SecretMismatch);
    }

    let mut parts = stored[1..].splitn(3, ':');
    let (version, salt, digest) = match (parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(s), Some(d)) => (v, s, d),
        _ => return Err(AuthError::InvalidFormat("hashed secret".into())),
    };
    let version = match version {
        "1" => HashVersion::V1,
        "2" => HashVersion::V2,
        other => {
            return Err(AuthError::InvalidFormat(format!(
                "unknown hash version {other:?}"
            )))
        }
    };
    let salt = STANDARD
        .decode(salt)
        .map_err(|_| AuthError::InvalidFormat("hash salt".into()))?;
    if salt.len() < SALT_LEN {
        return Err(AuthError::InvalidFormat("hash salt".into()));
    }
    let expected = STANDARD
        .decode(digest)
        .map_err(|_| AuthError::InvalidFormat("hash digest".into()))?;

    let actual = version.digest(&salt, candidate);
    if actual.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(AuthError::SecretMismatch)
    }
}

/// Burn roughly the same work as a real verification.
///
/// Used on the unknown-token path so a prober cannot cheaply separate
/// "unknown name" from "wrong secret" by response time.
pub fn dummy_verify(candidate: &str) {
    let salt = [0u8; SALT_LEN];
    let digest = HashVersion::V1.digest(&salt, candidate);
    // Compare against itself so the comparison cost is also paid.
    let _: bool = digest.ct_eq(&digest).into();
}
