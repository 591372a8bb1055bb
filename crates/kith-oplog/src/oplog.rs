//! The signed oplog record.

use std::fmt::Debug;

use kith_crypto::blake3::{self, contexts};
use kith_crypto::secp256k1::PublicKey;
use kith_types::{EntityId, Id, LogId, Status, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::sign::{SignInfo, SignKey};
use crate::{OplogError, Result};

/// Storage layout of one oplog family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Family {
    pub name: &'static str,
    /// Prefix of alive logs.
    pub log: &'static [u8],
    /// Prefix of pending and internal-pending logs.
    pub pending: &'static [u8],
    /// Prefix of the Merkle tree, when the family keeps one.
    pub merkle: Option<&'static [u8]>,
}

/// Op codes of one oplog family.
pub trait OpKind: Copy + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const FAMILY: Family;

    /// Stable code mixed into the digest.
    fn code(self) -> u8;

    /// Whether the op needs a master log reference to become alive.
    fn needs_master(self) -> bool;
}

/// One signed event.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oplog<O> {
    pub id: LogId,
    pub obj_id: EntityId,
    pub op: O,
    pub ts: Timestamp,
    pub creator_id: EntityId,
    #[serde_as(as = "serde_with::hex::Hex")]
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub sign: Option<SignInfo>,
    #[serde(default)]
    pub master_signs: Vec<SignInfo>,
    #[serde(default)]
    pub master_log_id: Option<LogId>,
    #[serde(default)]
    pub master_weight: u64,
    #[serde(default)]
    pub status: Status,
    /// Known to be held by the peers it was exchanged with.
    #[serde(default)]
    pub is_sync: bool,
}

impl<O: OpKind> Oplog<O> {
    pub fn new(id: LogId, obj_id: EntityId, op: O, ts: Timestamp, creator_id: EntityId, data: Vec<u8>) -> Self {
        Self {
            id,
            obj_id,
            op,
            ts,
            creator_id,
            data,
            sign: None,
            master_signs: Vec::new(),
            master_log_id: None,
            master_weight: 0,
            status: Status::Invalid,
            is_sync: false,
        }
    }

    /// A log with a fresh random id carrying `data` as JSON.
    pub fn with_data<T: Serialize>(obj_id: EntityId, op: O, ts: Timestamp, creator_id: EntityId, data: &T) -> Result<Self> {
        let raw = serde_json::to_vec(data).map_err(|e| OplogError::Serialization(e.to_string()))?;
        Ok(Self::new(Id::random(), obj_id, op, ts, creator_id, raw))
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| OplogError::InvalidData(e.to_string()))
    }

    /// Content digest covering everything except signatures and local state.
    pub fn digest(&self) -> [u8; 32] {
        blake3::derive_multi(
            contexts::OPLOG_DIGEST,
            &[
                self.id.as_bytes(),
                self.obj_id.as_bytes(),
                &[self.op.code()],
                &self.ts.to_be_bytes(),
                self.creator_id.as_bytes(),
                &self.data,
            ],
        )
    }

    /// Identity signature by `key` on behalf of the creator.
    pub fn sign_with(&mut self, key: &mut SignKey) -> Result<()> {
        let digest = self.digest();
        self.sign = Some(key.sign(self.creator_id, &digest)?);
        Ok(())
    }

    /// Check the identity signature against the identity public key.
    pub fn verify_sign(&self, identity: &PublicKey) -> Result<()> {
        let sign = self
            .sign
            .as_ref()
            .ok_or_else(|| OplogError::InvalidSignature(format!("log {} is not signed", self.id)))?;
        if sign.signer != self.creator_id {
            return Err(OplogError::InvalidSignature(format!(
                "log {} signed by {} instead of its creator",
                self.id, sign.signer
            )));
        }
        sign.verify(identity, &self.digest())
    }

    pub fn has_master_sign(&self, node_id: &Id) -> bool {
        self.master_signs.iter().any(|s| s.signer == *node_id)
    }

    /// Add a master signature by the device `node_id`. Refuses a second one.
    pub fn add_master_sign(&mut self, node_id: Id, key: &mut SignKey) -> Result<()> {
        if self.has_master_sign(&node_id) {
            return Err(OplogError::InvalidData(format!(
                "log {} already master-signed by {node_id}",
                self.id
            )));
        }
        let digest = self.digest();
        self.master_signs.push(key.sign(node_id, &digest)?);
        Ok(())
    }

    /// Verify every master signature; each key must descend from the key of
    /// the node it names.
    pub fn verify_master_signs(&self) -> Result<()> {
        let digest = self.digest();
        for sign in &self.master_signs {
            if Id(sign.derivation.parent.node_id()) != sign.signer {
                return Err(OplogError::InvalidSignature(format!(
                    "master sign of {} does not come from that node",
                    sign.signer
                )));
            }
            sign.verify_self_contained(&digest)?;
        }
        Ok(())
    }

    /// Union of master signatures with another copy of the same log.
    pub fn merge_master_signs(&mut self, other: &Oplog<O>) -> bool {
        let mut changed = false;
        for sign in &other.master_signs {
            if !self.has_master_sign(&sign.signer) {
                self.master_signs.push(sign.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn master_signers(&self) -> impl Iterator<Item = &Id> {
        self.master_signs.iter().map(|s| &s.signer)
    }

    pub fn is_alive(&self) -> bool {
        self.status == Status::Alive
    }
}
