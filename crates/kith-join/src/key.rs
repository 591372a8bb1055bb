//! Rotating join keys.
//!
//! A join key is a random 32-byte secret. Its 20-byte hash names it on the
//! wire; the handshake cipher key is derived from the secret, so only holders
//! of the URL can seal or open the handshake.

use std::collections::VecDeque;

use kith_crypto::blake3::{self, contexts};
use kith_types::{time, Timestamp};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keys kept per channel: the current one plus two predecessors still
/// accepted for in-flight handshakes.
pub const JOIN_KEY_RING_SIZE: usize = 3;

pub type KeyHash = [u8; 20];

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct JoinKey {
    secret: [u8; 32],
    #[zeroize(skip)]
    hash: KeyHash,
    #[zeroize(skip)]
    create_ts: Timestamp,
}

impl std::fmt::Debug for JoinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinKey")
            .field("hash", &hex::encode(self.hash))
            .field("create_ts", &self.create_ts)
            .finish()
    }
}

pub fn key_hash(secret: &[u8; 32]) -> KeyHash {
    let full = blake3::derive_key(contexts::JOIN_KEY_HASH, secret);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&full[..20]);
    hash
}

impl JoinKey {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::from_secret(secret, time::now())
    }

    pub fn from_secret(secret: [u8; 32], create_ts: Timestamp) -> Self {
        Self {
            hash: key_hash(&secret),
            secret,
            create_ts,
        }
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn hash(&self) -> KeyHash {
        self.hash
    }

    pub fn create_ts(&self) -> Timestamp {
        self.create_ts
    }

    /// ChaCha20-Poly1305 key protecting the handshake.
    pub fn cipher_key(&self) -> [u8; 32] {
        blake3::derive_key(contexts::JOIN_CIPHER_KEY, &self.secret)
    }

    pub fn info(&self) -> JoinKeyInfo {
        JoinKeyInfo {
            hash: self.hash,
            create_ts: self.create_ts,
        }
    }
}

/// Public view of a join key.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKeyInfo {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: KeyHash,
    pub create_ts: Timestamp,
}

/// The newest join keys of one channel, oldest first.
#[derive(Debug, Default)]
pub struct JoinKeyRing {
    keys: VecDeque<JoinKey>,
}

impl JoinKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key`; returns the key that fell off the ring, if any.
    pub fn insert(&mut self, key: JoinKey) -> Option<JoinKey> {
        let evicted = if self.keys.len() >= JOIN_KEY_RING_SIZE {
            self.keys.pop_front()
        } else {
            None
        };
        self.keys.push_back(key);
        evicted
    }

    /// Generate and insert a fresh key.
    pub fn rotate(&mut self) -> (JoinKey, Option<JoinKey>) {
        let key = JoinKey::generate();
        let evicted = self.insert(key.clone());
        (key, evicted)
    }

    /// The newest key.
    pub fn current(&self) -> Option<&JoinKey> {
        self.keys.back()
    }

    pub fn find(&self, hash: &KeyHash) -> Option<&JoinKey> {
        self.keys.iter().find(|k| kith_crypto::ct_eq(&k.hash, hash))
    }

    pub fn infos(&self) -> Vec<JoinKeyInfo> {
        self.keys.iter().map(JoinKey::info).collect()
    }

    pub fn hashes(&self) -> Vec<KeyHash> {
        self.keys.iter().map(JoinKey::hash).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop every key, returning them.
    pub fn clear(&mut self) -> Vec<JoinKey> {
        self.keys.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_three() {
        let mut ring = JoinKeyRing::new();
        let mut hashes = Vec::new();
        for _ in 0..3 {
            let (key, evicted) = ring.rotate();
            assert!(evicted.is_none());
            hashes.push(key.hash());
        }
        let (fourth, evicted) = ring.rotate();
        assert_eq!(evicted.expect("evicted").hash(), hashes[0]);
        assert_eq!(ring.len(), JOIN_KEY_RING_SIZE);
        assert!(ring.find(&hashes[0]).is_none());
        assert!(ring.find(&hashes[1]).is_some());
        assert_eq!(ring.current().expect("current").hash(), fourth.hash());
    }

    #[test]
    fn test_hash_and_cipher_key_are_distinct() {
        let key = JoinKey::from_secret([7u8; 32], 1);
        assert_eq!(key.hash(), key_hash(&[7u8; 32]));
        assert_ne!(&key.cipher_key()[..20], &key.hash()[..]);
        assert!(!format!("{key:?}").contains(&hex::encode([7u8; 32])));
    }
}
