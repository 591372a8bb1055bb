//! Rotating sign keys and the signature records attached to oplogs.
//!
//! A sign key is a child of the identity key (identity sign key) or of the
//! device node key (node sign key). It is rotated after [`SIGN_KEY_MAX_USES`]
//! signatures. Each [`SignInfo`] carries the derivation record, so a
//! verifier holding only the parent public key can check that the signing key
//! belongs to it.

use kith_crypto::derive::{derive_child, KeyDerivation, KeyInfo};
use kith_crypto::secp256k1::{PrivateKey, PublicKey, Signature};
use kith_types::Id;
use serde::{Deserialize, Serialize};

use crate::{OplogError, Result};

/// Signatures issued before a sign key is rotated.
pub const SIGN_KEY_MAX_USES: u32 = 100;

/// A signature by a child key of `derivation.parent`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInfo {
    /// Identity id for identity signatures, node id for master signatures.
    pub signer: Id,
    pub key: PublicKey,
    pub derivation: KeyDerivation,
    pub sig: Signature,
}

impl SignInfo {
    /// Verify the signature over `digest` and that the key was derived from `parent`.
    pub fn verify(&self, parent: &PublicKey, digest: &[u8]) -> Result<()> {
        if self.derivation.parent != *parent {
            return Err(OplogError::InvalidSignature(format!(
                "sign key of {} is not derived from the expected parent",
                self.signer
            )));
        }
        self.verify_self_contained(digest)
    }

    /// Verify the signature and the derivation record without an external parent.
    pub fn verify_self_contained(&self, digest: &[u8]) -> Result<()> {
        if !self.derivation.verify(&self.key) {
            return Err(OplogError::InvalidSignature(format!(
                "derivation record does not match the sign key of {}",
                self.signer
            )));
        }
        self.key
            .verify(digest, &self.sig)
            .map_err(|_| OplogError::InvalidSignature(format!("bad signature by {}", self.signer)))
    }
}

/// A child signing key with a use counter.
pub struct SignKey {
    key: PrivateKey,
    public: PublicKey,
    derivation: KeyDerivation,
    uses: u32,
}

impl std::fmt::Debug for SignKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignKey")
            .field("public", &self.public)
            .field("index", &self.derivation.index)
            .field("uses", &self.uses)
            .finish()
    }
}

impl SignKey {
    /// Derive a fresh sign key from `parent` at `index`.
    pub fn derive(parent: &PrivateKey, index: u32) -> Result<Self> {
        let (key, derivation) = derive_child(parent, index)?;
        let public = key.public_key()?;
        Ok(Self {
            key,
            public,
            derivation,
            uses: 0,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn derivation(&self) -> &KeyDerivation {
        &self.derivation
    }

    pub fn index(&self) -> u32 {
        self.derivation.index
    }

    pub fn uses(&self) -> u32 {
        self.uses
    }

    pub fn info(&self) -> KeyInfo {
        KeyInfo::new(self.public, &self.derivation, self.uses)
    }

    /// Whether the key reached its use limit and must be rotated.
    pub fn is_exhausted(&self) -> bool {
        self.uses >= SIGN_KEY_MAX_USES
    }

    /// Sign `digest` on behalf of `signer`.
    pub fn sign(&mut self, signer: Id, digest: &[u8]) -> Result<SignInfo> {
        let sig = self.key.sign(digest)?;
        self.uses += 1;
        Ok(SignInfo {
            signer,
            key: self.public,
            derivation: self.derivation.clone(),
            sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let parent = PrivateKey::generate();
        let mut key = SignKey::derive(&parent, 0).expect("derive");
        let info = key.sign(Id::random(), b"digest").expect("sign");
        info.verify(&parent.public_key().expect("pk"), b"digest").expect("verify");
        assert_eq!(key.uses(), 1);
    }

    #[test]
    fn test_wrong_parent_rejected() {
        let parent = PrivateKey::generate();
        let other = PrivateKey::generate();
        let mut key = SignKey::derive(&parent, 3).expect("derive");
        let info = key.sign(Id::random(), b"digest").expect("sign");
        assert!(info.verify(&other.public_key().expect("pk"), b"digest").is_err());
    }

    #[test]
    fn test_tampered_digest_rejected() {
        let parent = PrivateKey::generate();
        let mut key = SignKey::derive(&parent, 0).expect("derive");
        let info = key.sign(Id::random(), b"digest").expect("sign");
        assert!(info.verify_self_contained(b"other").is_err());
    }

    #[test]
    fn test_exhaustion() {
        let parent = PrivateKey::generate();
        let mut key = SignKey::derive(&parent, 0).expect("derive");
        for _ in 0..SIGN_KEY_MAX_USES {
            assert!(!key.is_exhausted());
            key.sign(Id::ZERO, b"x").expect("sign");
        }
        assert!(key.is_exhausted());
    }

    #[test]
    fn test_info_tracks_uses() {
        let parent = PrivateKey::generate();
        let mut key = SignKey::derive(&parent, 3).expect("derive");
        key.sign(Id::ZERO, b"x").expect("sign");
        let info = key.info();
        assert_eq!(info.public_key, key.public_key());
        assert_eq!(info.index, 3);
        assert_eq!(info.uses, 1);
    }
}
