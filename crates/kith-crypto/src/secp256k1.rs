//! secp256k1 ECDSA keys.
//!
//! Every signing key in kith is a secp256k1 key: the identity key, the
//! per-device node key, the rotating sign keys derived from them, and op keys.
//! Public keys travel in compressed SEC1 form (33 bytes), signatures in
//! compact `r || s` form (64 bytes).
//!
//! Identifiers derived from public keys:
//! - address: `derive_key(KEY_ADDRESS, pk)[..20]`, the first 20 bytes of an identity id
//! - node id: `derive_key(NODE_ID, pk)`
//! - raft id: big-endian `derive_key(RAFT_ID, node_id)[..8]`, never zero

use k256::ecdsa::signature::{Signer, Verifier};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::blake3::{self, contexts};
use crate::{CryptoError, Result};

/// Private key size in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Compressed public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;
/// Compact signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;
/// Address size in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// 20-byte key address.
pub type Address = [u8; ADDRESS_SIZE];

/// A secp256k1 private key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    bytes: [u8; PRIVATE_KEY_SIZE],
}

/// A compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    bytes: [u8; PUBLIC_KEY_SIZE],
}

/// A compact ECDSA signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; SIGNATURE_SIZE],
}

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        let secret = k256::SecretKey::random(&mut rand::rngs::OsRng);
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        bytes.copy_from_slice(&secret.to_bytes());
        Self { bytes }
    }

    /// Create a private key from raw scalar bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        k256::SecretKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let mut out = [0u8; PRIVATE_KEY_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    /// Parse a hex-encoded private key. Surrounding whitespace is ignored.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Hex encoding of the raw scalar.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Raw scalar bytes.
    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.bytes
    }

    pub(crate) fn secret(&self) -> Result<k256::SecretKey> {
        k256::SecretKey::from_slice(&self.bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> Result<PublicKey> {
        let secret = self.secret()?;
        PublicKey::from_bytes(secret.public_key().to_encoded_point(true).as_bytes())
    }

    /// Sign a message (SHA-256 prehash, RFC 6979 nonces).
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signer = k256::ecdsa::SigningKey::from_slice(&self.bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig: k256::ecdsa::Signature = signer.sign(message);
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(&sig.to_bytes());
        Ok(Signature { bytes })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PublicKey {
    /// Parse a compressed or uncompressed SEC1 public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = k256::PublicKey::from_sec1_bytes(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let point = key.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        if point.as_bytes().len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: point.as_bytes().len(),
            });
        }
        out.copy_from_slice(point.as_bytes());
        Ok(Self { bytes: out })
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        Self::from_bytes(&raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Compressed SEC1 bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.bytes
    }

    pub(crate) fn point(&self) -> Result<k256::PublicKey> {
        k256::PublicKey::from_sec1_bytes(&self.bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let verifier = k256::ecdsa::VerifyingKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = k256::ecdsa::Signature::from_slice(&signature.bytes)
            .map_err(|_| CryptoError::SignatureVerification)?;
        verifier
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }

    /// 20-byte address of this key.
    pub fn address(&self) -> Address {
        let digest = blake3::derive_key(contexts::KEY_ADDRESS, &self.bytes);
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&digest[..ADDRESS_SIZE]);
        out
    }

    /// 32-byte node id of a device key.
    pub fn node_id(&self) -> [u8; 32] {
        blake3::derive_key(contexts::NODE_ID, &self.bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl Signature {
    /// Create a signature from compact bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SIGNATURE_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: SIGNATURE_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.bytes))
    }
}

/// Raft id of a node: the first eight bytes of its raft-id derivation.
///
/// Zero is reserved by the consensus layer for "no node", so a zero
/// derivation maps to 1.
pub fn raft_id(node_id: &[u8; 32]) -> u64 {
    let digest = blake3::derive_key(contexts::RAFT_ID, node_id);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(head) {
        0 => 1,
        id => id,
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.bytes))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate();
        let public = key.public_key().expect("public");
        let sig = key.sign(b"create me").expect("sign");
        public.verify(b"create me", &sig).expect("verify");
    }

    #[test]
    fn test_wrong_message_fails() {
        let key = PrivateKey::generate();
        let public = key.public_key().expect("public");
        let sig = key.sign(b"message 1").expect("sign");
        assert!(public.verify(b"message 2", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = PrivateKey::generate();
        let key2 = PrivateKey::generate();
        let sig = key1.sign(b"test").expect("sign");
        assert!(key2.public_key().expect("public").verify(b"test", &sig).is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_hex(&format!("{}\n", key.to_hex())).expect("from hex");
        assert_eq!(key.as_bytes(), restored.as_bytes());
        assert_eq!(
            key.public_key().expect("public"),
            restored.public_key().expect("public")
        );
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(PrivateKey::from_bytes(&[0u8; 32]).is_err());
        assert!(matches!(
            PrivateKey::from_bytes(&[1u8; 31]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 31 })
        ));
        assert!(PrivateKey::from_hex("not hex").is_err());
    }

    #[test]
    fn test_public_key_is_compressed() {
        let public = PrivateKey::generate().public_key().expect("public");
        assert_eq!(public.as_bytes().len(), PUBLIC_KEY_SIZE);
        assert!(matches!(public.as_bytes()[0], 0x02 | 0x03));
    }

    #[test]
    fn test_address_and_node_id_are_stable() {
        let key = PrivateKey::generate();
        let public = key.public_key().expect("public");
        assert_eq!(public.address(), public.address());
        assert_eq!(&public.node_id()[..], &public.node_id()[..]);
        assert_ne!(&public.address()[..], &public.node_id()[..ADDRESS_SIZE]);
    }

    #[test]
    fn test_raft_id_nonzero() {
        for i in 0..32u8 {
            assert_ne!(raft_id(&[i; 32]), 0);
        }
        assert_eq!(raft_id(&[7u8; 32]), raft_id(&[7u8; 32]));
    }

    #[test]
    fn test_serde_hex() {
        let key = PrivateKey::generate();
        let public = key.public_key().expect("public");
        let sig = key.sign(b"x").expect("sign");
        let json = serde_json::to_string(&(public, sig)).expect("serialize");
        let (p2, s2): (PublicKey, Signature) = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(public, p2);
        assert_eq!(sig, s2);
    }
}
