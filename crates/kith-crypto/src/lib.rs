//! # kith-crypto
//!
//! Cryptographic primitives for the kith identity service.
//!
//! The suite is fixed: secp256k1 ECDSA for every signing key, BLAKE3 for
//! hashing and key derivation, ChaCha20-Poly1305 for the join handshake.
//!
//! ## Modules
//!
//! - [`blake3`] - Domain-separated BLAKE3 hashing and the registered contexts
//! - [`secp256k1`] - Identity, node and sign keys; addresses; node ids
//! - [`derive`] - Publicly verifiable child keys (sign keys, op keys)
//! - [`chacha20`] - ChaCha20-Poly1305 AEAD encryption (RFC 8439)

pub mod blake3;
pub mod chacha20;
pub mod derive;
pub mod secp256k1;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// ECDSA signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Bytes do not encode a valid key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Compare two secrets without leaking the position of the first mismatch.
///
/// Lengths are public; contents are compared through BLAKE3 digests whose
/// equality check is constant-time.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    ::blake3::hash(a) == ::blake3::hash(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"validate", b"validate"));
        assert!(!ct_eq(b"validate", b"validatf"));
        assert!(!ct_eq(b"short", b"longer"));
        assert!(ct_eq(b"", b""));
    }
}
