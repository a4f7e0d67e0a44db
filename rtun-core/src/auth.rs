//! Authentication for tunnel connections.
//!
//! Both sides share a secret string. Only its SHA-256 digest ever crosses the
//! wire, and the server keeps nothing but the digest after startup.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Size of a token digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token digest mismatch")]
    DigestMismatch,
    #[error("Empty token")]
    EmptyToken,
}

/// One-way digest of the shared secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenDigest(pub [u8; DIGEST_LEN]);

impl TokenDigest {
    /// Digest a secret string.
    pub fn of(secret: &str) -> Self {
        digest(secret)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Short hex prefix, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenDigest({}..)", self.fingerprint())
    }
}

/// Compute the digest of a shared secret.
pub fn digest(secret: &str) -> TokenDigest {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    TokenDigest(hasher.finalize().into())
}

/// Token validator for the server.
#[derive(Clone)]
pub struct TokenValidator {
    expected: TokenDigest,
}

impl TokenValidator {
    /// Create a validator for the given secret.
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(Self {
            expected: digest(secret),
        })
    }

    /// Create a validator from an already computed digest.
    pub fn from_digest(expected: TokenDigest) -> Self {
        Self { expected }
    }

    /// Validate a digest received from a peer.
    pub fn verify(&self, presented: &TokenDigest) -> Result<(), AuthError> {
        if bool::from(self.expected.0[..].ct_eq(&presented.0[..])) {
            Ok(())
        } else {
            Err(AuthError::DigestMismatch)
        }
    }

    pub fn fingerprint(&self) -> String {
        self.expected.fingerprint()
    }
}
