//! 32-byte identifiers.
//!
//! Identity ids are `address(identity pubkey) || postfix`. Node ids are the
//! BLAKE3 node-id derivation of a device key. Node sign ids reuse the first
//! 20 bytes of the node id with the identity postfix. Master log ids encode
//! the raft index so that byte order equals index order:
//!
//! ```text
//! master log id = 0x00 * 12 || raft index (u64 BE) || identity id[..12]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{TypeError, ADDRESS_SIZE, ID_SIZE, POSTFIX_SIZE};

/// A 32-byte identifier, hex encoded in text form.
#[serde_as]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(#[serde_as(as = "serde_with::hex::Hex")] pub [u8; ID_SIZE]);

/// Identity (and generic entity) id.
pub type EntityId = Id;
/// Oplog id.
pub type LogId = Id;
/// Device node id.
pub type NodeId = Id;
/// Device sign id.
pub type NodeSignId = Id;

const MASTER_ZERO_PREFIX: usize = 12;

impl Id {
    pub const ZERO: Id = Id([0u8; ID_SIZE]);

    /// A random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let bytes: [u8; ID_SIZE] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: ID_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }

    /// Identity id from a key address and a postfix.
    pub fn from_parts(address: &[u8; ADDRESS_SIZE], postfix: &[u8; POSTFIX_SIZE]) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        bytes[..ADDRESS_SIZE].copy_from_slice(address);
        bytes[ADDRESS_SIZE..].copy_from_slice(postfix);
        Self(bytes)
    }

    pub fn address(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&self.0[..ADDRESS_SIZE]);
        out
    }

    pub fn postfix(&self) -> [u8; POSTFIX_SIZE] {
        let mut out = [0u8; POSTFIX_SIZE];
        out.copy_from_slice(&self.0[ADDRESS_SIZE..]);
        out
    }

    /// Sign id of a device for the identity with `postfix`.
    pub fn node_sign_id(node_id: &NodeId, postfix: &[u8; POSTFIX_SIZE]) -> Self {
        let mut address = [0u8; ADDRESS_SIZE];
        address.copy_from_slice(&node_id.0[..ADDRESS_SIZE]);
        Self::from_parts(&address, postfix)
    }

    /// Master log id for the entry committed at raft `index`.
    pub fn master_log_id(index: u64, entity: &EntityId) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        bytes[MASTER_ZERO_PREFIX..MASTER_ZERO_PREFIX + 8].copy_from_slice(&index.to_be_bytes());
        bytes[MASTER_ZERO_PREFIX + 8..].copy_from_slice(&entity.0[..ID_SIZE - MASTER_ZERO_PREFIX - 8]);
        Self(bytes)
    }

    /// Raft index encoded in a master log id.
    pub fn master_index(&self) -> Option<u64> {
        if self.0[..MASTER_ZERO_PREFIX].iter().any(|b| *b != 0) {
            return None;
        }
        let mut index = [0u8; 8];
        index.copy_from_slice(&self.0[MASTER_ZERO_PREFIX..MASTER_ZERO_PREFIX + 8]);
        Some(u64::from_be_bytes(index))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts() {
        let id = Id::from_parts(&[1u8; 20], &[2u8; 12]);
        assert_eq!(id.address(), [1u8; 20]);
        assert_eq!(id.postfix(), [2u8; 12]);
    }

    #[test]
    fn test_master_log_id_orders_by_index() {
        let entity = Id::random();
        let a = Id::master_log_id(2, &entity);
        let b = Id::master_log_id(10, &entity);
        assert!(a < b);
        assert_eq!(a.master_index(), Some(2));
        assert_eq!(b.master_index(), Some(10));
        assert_eq!(&a.0[20..], &entity.0[..12]);
    }

    #[test]
    fn test_random_id_is_not_master() {
        let mut id = Id::random();
        id.0[0] = 0xff;
        assert_eq!(id.master_index(), None);
    }

    #[test]
    fn test_node_sign_id() {
        let node = Id([5u8; 32]);
        let sign = Id::node_sign_id(&node, &[6u8; 12]);
        assert_eq!(&sign.0[..20], &[5u8; 20]);
        assert_eq!(sign.postfix(), [6u8; 12]);
    }

    #[test]
    fn test_hex_serde() {
        let id = Id::random();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let restored: Id = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, id);
        assert_eq!(Id::from_hex(&id.to_hex()).expect("from hex"), id);
    }

    #[test]
    fn test_invalid_length() {
        assert!(matches!(
            Id::from_slice(&[0u8; 31]),
            Err(TypeError::InvalidLength { expected: 32, actual: 31 })
        ));
    }
}
