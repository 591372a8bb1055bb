//! Publicly verifiable child keys.
//!
//! Sign keys and op keys are children of an identity or node key:
//!
//! ```text
//! t          = derive_key(CHILD_KEY, parent_pk || salt || index_be)
//! child_sk   = parent_sk + t   (mod n)
//! child_pk   = parent_pk + t·G
//! ```
//!
//! Anyone holding the parent public key and the [`KeyDerivation`] record can
//! recompute `child_pk`, so a signature by a child key can be traced back to
//! the identity (or device) that issued it without revealing the parent secret.

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{FieldBytes, NonZeroScalar, ProjectivePoint, Scalar, U256};
use serde::{Deserialize, Serialize};

use crate::blake3::{self, contexts};
use crate::secp256k1::{PrivateKey, PublicKey};
use crate::{CryptoError, Result};

/// Salt size for child derivations.
pub const SALT_SIZE: usize = 32;

/// The public record needed to re-derive a child public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivation {
    /// Parent public key.
    pub parent: PublicKey,
    /// Random salt chosen at derivation time, hex encoded.
    #[serde(with = "hex_salt")]
    pub salt: [u8; SALT_SIZE],
    /// Derivation index.
    pub index: u32,
}

impl KeyDerivation {
    /// A new derivation record with a random salt.
    pub fn random(parent: PublicKey, index: u32) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
        Self { parent, salt, index }
    }

    /// Recompute the child public key described by this record.
    pub fn child_public(&self) -> Result<PublicKey> {
        derive_public(&self.parent, &self.salt, self.index)
    }

    /// Check that `child` is the key described by this record.
    pub fn verify(&self, child: &PublicKey) -> bool {
        matches!(self.child_public(), Ok(expected) if expected == *child)
    }
}

fn tweak(parent: &PublicKey, salt: &[u8; SALT_SIZE], index: u32) -> Scalar {
    let mut material = Vec::with_capacity(33 + SALT_SIZE + 4);
    material.extend_from_slice(parent.as_bytes());
    material.extend_from_slice(salt);
    material.extend_from_slice(&index.to_be_bytes());
    let digest = blake3::derive_key(contexts::CHILD_KEY, &material);
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::clone_from_slice(&digest))
}

/// Derive a child private key.
pub fn derive_private(parent: &PrivateKey, salt: &[u8; SALT_SIZE], index: u32) -> Result<PrivateKey> {
    let parent_public = parent.public_key()?;
    let t = tweak(&parent_public, salt, index);
    let secret = parent.secret()?;
    let child = *secret.to_nonzero_scalar() + t;
    let child: Option<NonZeroScalar> = NonZeroScalar::new(child).into();
    let child = child.ok_or_else(|| CryptoError::KeyDerivation("child scalar is zero".into()))?;
    let child = k256::SecretKey::from(child);
    PrivateKey::from_bytes(&child.to_bytes())
}

/// Derive a child public key.
pub fn derive_public(parent: &PublicKey, salt: &[u8; SALT_SIZE], index: u32) -> Result<PublicKey> {
    let t = tweak(parent, salt, index);
    let point = parent.point()?.to_projective() + ProjectivePoint::GENERATOR * t;
    let child = k256::PublicKey::from_affine(point.to_affine())
        .map_err(|_| CryptoError::KeyDerivation("child point is the identity".into()))?;
    PublicKey::from_bytes(child.to_encoded_point(true).as_bytes())
}

/// Derive a fresh child key pair with a random salt.
pub fn derive_child(parent: &PrivateKey, index: u32) -> Result<(PrivateKey, KeyDerivation)> {
    let record = KeyDerivation::random(parent.public_key()?, index);
    let child = derive_private(parent, &record.salt, index)?;
    Ok((child, record))
}

/// Displayable description of a derived key. Carries no secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub public_key: PublicKey,
    /// Hex of the key address.
    pub address: String,
    pub parent: PublicKey,
    pub index: u32,
    /// Signatures made so far.
    #[serde(default)]
    pub uses: u32,
}

impl KeyInfo {
    pub fn new(public_key: PublicKey, derivation: &KeyDerivation, uses: u32) -> Self {
        Self {
            address: hex::encode(public_key.address()),
            public_key,
            parent: derivation.parent,
            index: derivation.index,
            uses,
        }
    }
}

mod hex_salt {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SALT_SIZE;

    pub fn serialize<S: Serializer>(salt: &[u8; SALT_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(salt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; SALT_SIZE], D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("salt must be 32 bytes"))
    }
}
