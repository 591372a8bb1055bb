//! Op keys: child keys of the identity key handed to devices for dialing.
//!
//! ```text
//! .okdb || identity id || index (u32 BE)   op key record
//! .oklg / .okig                            OpKeyOplog, alive / pending
//! ```
//!
//! Each creation or revocation writes an OpKeyOplog signed and co-signed
//! like a MeOplog. The private half travels only inside a sealed join
//! approval.

use std::collections::BTreeMap;

use kith_crypto::derive::{self, KeyDerivation, KeyInfo};
use kith_crypto::secp256k1::{PrivateKey, PublicKey};
use kith_db::Store;
use kith_oplog::{Family, OpKind, Oplog};
use kith_transport::messages::{MSG_ADD_OP_KEY_OPLOG, MSG_ADD_PENDING_OP_KEY_OPLOG};
use kith_types::{EntityId, ListOrder, LogId, NodeId, Status, Timestamp};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::db::{self, PREFIX_OP_KEY};
use crate::manager::Me;
use crate::me_oplog::Accepted;
use crate::protocol::OplogMsg;
use crate::sync::{lock, read, write};
use crate::{MeError, Result};

/// Address of an op key public key.
pub type OpKeyHash = [u8; 20];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKeyOp {
    CreateOpKey,
    RevokeOpKey,
}

impl OpKind for OpKeyOp {
    const FAMILY: Family = Family {
        name: "op_key",
        log: b".oklg",
        pending: b".okig",
        merkle: None,
    };

    fn code(self) -> u8 {
        match self {
            OpKeyOp::CreateOpKey => 1,
            OpKeyOp::RevokeOpKey => 2,
        }
    }

    fn needs_master(self) -> bool {
        true
    }
}

pub type OpKeyOplog = Oplog<OpKeyOp>;

/// Public part of an op key, as carried by its logs.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKeyData {
    pub index: u32,
    pub public_key: PublicKey,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: OpKeyHash,
}

/// An op key held by this device.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKey {
    pub index: u32,
    /// Private key, hex.
    key: String,
    pub public_key: PublicKey,
    pub derivation: KeyDerivation,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: OpKeyHash,
    pub create_ts: Timestamp,
    pub status: Status,
    #[serde(default)]
    pub log_id: Option<LogId>,
}

impl std::fmt::Debug for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpKey")
            .field("index", &self.index)
            .field("hash", &hex::encode(self.hash))
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl OpKey {
    /// Derive op key `index` from the identity key.
    pub fn derive(identity: &PrivateKey, index: u32) -> Result<Self> {
        let (child, derivation) = derive::derive_child(identity, index)?;
        let public_key = child.public_key()?;
        Ok(Self {
            index,
            key: child.to_hex(),
            public_key,
            derivation,
            hash: public_key.address(),
            create_ts: kith_types::time::now(),
            status: Status::Alive,
            log_id: None,
        })
    }

    pub fn private_key(&self) -> Result<PrivateKey> {
        let raw = Zeroizing::new(self.key.clone());
        Ok(PrivateKey::from_hex(&raw)?)
    }

    /// Check that the key descends from the identity `id`.
    pub fn verify_for(&self, id: &EntityId) -> Result<()> {
        if self.derivation.parent.address() != id.address() {
            return Err(MeError::InvalidData(format!("op key {} is not a key of {id}", self.index)));
        }
        if !self.derivation.verify(&self.public_key) || self.private_key()?.public_key()? != self.public_key {
            return Err(MeError::InvalidData(format!("op key {} does not match its derivation", self.index)));
        }
        if self.public_key.address() != self.hash {
            return Err(MeError::InvalidData(format!("op key {} hash mismatch", self.index)));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Alive
    }

    pub fn data(&self) -> OpKeyData {
        OpKeyData {
            index: self.index,
            public_key: self.public_key,
            hash: self.hash,
        }
    }

    pub fn info(&self) -> OpKeyInfo {
        OpKeyInfo {
            key: KeyInfo::new(self.public_key, &self.derivation, 0),
            hash: hex::encode(self.hash),
            create_ts: self.create_ts,
            status: self.status,
            log_id: self.log_id,
        }
    }

    pub(crate) fn save(&self, store: &Store, id: &EntityId) -> Result<()> {
        store.put_json(&op_key_key(id, self.index), self)?;
        Ok(())
    }

    /// Keep a key of `id` handed over by the device that approved this one.
    ///
    /// The identity is not running here yet; opening it loads the key.
    pub(crate) fn install(&self, store: &Store, id: &EntityId) -> Result<()> {
        self.verify_for(id)?;
        self.save(store, id)?;
        debug!(id = %id, index = self.index, "op key installed");
        Ok(())
    }
}

/// Displayable op key. Carries no secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKeyInfo {
    pub key: KeyInfo,
    pub hash: String,
    pub create_ts: Timestamp,
    pub status: Status,
    pub log_id: Option<LogId>,
}

fn op_key_key(id: &EntityId, index: u32) -> Vec<u8> {
    db::key(PREFIX_OP_KEY, &[id.as_bytes(), &index.to_be_bytes()])
}

fn load_all(store: &Store, id: &EntityId) -> Result<Vec<OpKey>> {
    let prefix = db::key(PREFIX_OP_KEY, &[id.as_bytes()]);
    let mut keys = Vec::new();
    for (_, value) in store.scan_prefix(&prefix)? {
        match serde_json::from_slice::<OpKey>(&value) {
            Ok(key) => keys.push(key),
            Err(e) => warn!(id = %id, error = %e, "skipping undecodable op key"),
        }
    }
    Ok(keys)
}

/// The op keys of one identity on this device, by index.
#[derive(Debug, Default)]
pub struct OpKeyRing {
    keys: BTreeMap<u32, OpKey>,
}

impl OpKeyRing {
    pub fn load(store: &Store, id: &EntityId) -> Result<Self> {
        let keys = load_all(store, id)?.into_iter().map(|k| (k.index, k)).collect();
        Ok(Self { keys })
    }

    pub fn insert(&mut self, key: OpKey) -> Option<OpKey> {
        self.keys.insert(key.index, key)
    }

    pub fn next_index(&self) -> u32 {
        self.keys.keys().next_back().map_or(0, |i| i.wrapping_add(1))
    }

    pub fn find(&self, hash: &OpKeyHash) -> Option<&OpKey> {
        self.keys.values().find(|k| k.hash == *hash)
    }

    /// Mark the key `hash` revoked. Returns the updated key.
    pub fn revoke(&mut self, hash: &OpKeyHash) -> Option<&OpKey> {
        let key = self.keys.values_mut().find(|k| k.hash == *hash)?;
        key.status = Status::Revoked;
        Some(key)
    }

    /// Hash of the oldest active key.
    pub fn oldest_hash(&self) -> Option<OpKeyHash> {
        self.keys.values().find(|k| k.is_active()).map(|k| k.hash)
    }

    /// The oldest active key, with its secret.
    pub fn oldest(&self) -> Option<&OpKey> {
        self.keys.values().find(|k| k.is_active())
    }

    pub fn infos(&self) -> Vec<OpKeyInfo> {
        self.keys.values().map(OpKey::info).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Me {
    /// Derive the next op key, record it and write its CreateOpKey log.
    pub(crate) fn create_op_key(&self) -> Result<OpKeyInfo> {
        let mut key = {
            let keys = lock(&self.keys);
            let index = read(&self.op_keys).next_index();
            OpKey::derive(keys.identity()?, index)?
        };
        let log = self.create_op_key_oplog(OpKeyOp::CreateOpKey, &key.data())?;
        key.log_id = Some(log.id);
        key.save(&self.db().signkey, &self.id)?;
        let info = key.info();
        write(&self.op_keys).insert(key);
        info!(id = %self.id, index = info.key.index, hash = %info.hash, "op key created");
        Ok(info)
    }

    /// Revoke the op key with address `hash`.
    pub fn revoke_op_key(&self, hash: &OpKeyHash) -> Result<()> {
        let data = read(&self.op_keys)
            .find(hash)
            .filter(|k| k.is_active())
            .map(OpKey::data)
            .ok_or_else(|| MeError::NotFound(format!("op key {}", hex::encode(hash))))?;
        self.create_op_key_oplog(OpKeyOp::RevokeOpKey, &data)?;
        self.mark_op_key_revoked(hash)
    }

    fn mark_op_key_revoked(&self, hash: &OpKeyHash) -> Result<()> {
        let mut ring = write(&self.op_keys);
        if let Some(key) = ring.revoke(hash) {
            key.save(&self.db().signkey, &self.id)?;
            info!(id = %self.id, index = key.index, "op key revoked");
        }
        Ok(())
    }

    pub(crate) fn oldest_op_key(&self) -> Option<OpKey> {
        read(&self.op_keys).oldest().cloned()
    }

    pub(crate) fn oldest_op_key_hash(&self) -> Option<OpKeyHash> {
        read(&self.op_keys).oldest_hash()
    }

    pub fn get_op_key_infos(&self) -> Vec<OpKeyInfo> {
        read(&self.op_keys).infos()
    }

    /// Op keys as persisted, bypassing the in-memory ring.
    pub fn get_op_key_infos_from_db(&self) -> Result<Vec<OpKeyInfo>> {
        Ok(load_all(&self.db().signkey, &self.id)?.iter().map(OpKey::info).collect())
    }

    fn create_op_key_oplog(&self, op: OpKeyOp, data: &OpKeyData) -> Result<OpKeyOplog> {
        let log = {
            let _family = lock(&self.op_key_lock);
            let log = Oplog::with_data(self.id, op, kith_types::time::now(), self.id, data)?;
            self.sign_new_oplog(&self.op_key_oplogs, log)?
        };
        debug!(id = %self.id, log = %log.id, op = ?op, status = %log.status, "op key oplog written");
        self.broadcast_op_key_oplog(&log);
        Ok(log)
    }

    pub(crate) fn broadcast_op_key_oplog(&self, log: &OpKeyOplog) {
        let code = if log.is_alive() { MSG_ADD_OP_KEY_OPLOG } else { MSG_ADD_PENDING_OP_KEY_OPLOG };
        self.broadcast(code, &OplogMsg { oplog: log.clone() });
    }

    pub(crate) fn receive_op_key_oplog(&self, from: &NodeId, log: OpKeyOplog) -> Result<()> {
        let id = log.id;
        let accepted = self.accept_oplog(&self.op_key_oplogs, &self.op_key_lock, log)?;
        debug!(id = %self.id, from = %from, log = %id, "op key oplog received");
        match accepted {
            Accepted::Known => Ok(()),
            Accepted::Pending { log, cosigned } => {
                if cosigned {
                    self.broadcast_op_key_oplog(&log);
                }
                Ok(())
            }
            Accepted::Alive { log, new, cosigned } => {
                if cosigned {
                    self.broadcast_op_key_oplog(&log);
                }
                if new && log.op == OpKeyOp::RevokeOpKey {
                    let data: OpKeyData = log.data_as()?;
                    self.mark_op_key_revoked(&data.hash)?;
                }
                Ok(())
            }
        }
    }

    pub fn op_key_oplog_list(&self, start: Option<&LogId>, limit: usize, order: ListOrder) -> Result<Vec<OpKeyOplog>> {
        Ok(self.op_key_oplogs.list(&self.id, start, limit, order)?)
    }

    pub fn pending_op_key_oplog_list(
        &self,
        status: Status,
        start: Option<&LogId>,
        limit: usize,
        order: ListOrder,
    ) -> Result<Vec<OpKeyOplog>> {
        Ok(self.op_key_oplogs.list_pending(&self.id, Some(status), start, limit, order)?)
    }
}

#[cfg(test)]
mod tests {
    use kith_types::Id;

    use super::*;
    use crate::manager::tests::fixture;

    #[test]
    fn test_op_key_derives_from_identity() {
        let fx = fixture(Status::Alive);
        let key = OpKey::derive(&fx.identity.key, 0).expect("derive");
        key.verify_for(&fx.identity.id).expect("descends");
        assert!(matches!(key.verify_for(&Id::random()), Err(MeError::InvalidData(_))));

        let mut forged = key.clone();
        forged.hash = [7u8; 20];
        assert!(forged.verify_for(&fx.identity.id).is_err());
        assert!(!format!("{key:?}").contains(&key.key));
    }

    #[test]
    fn test_ring_orders_and_revokes() {
        let identity = PrivateKey::generate();
        let mut ring = OpKeyRing::default();
        assert_eq!(ring.next_index(), 0);
        let a = OpKey::derive(&identity, ring.next_index()).expect("a");
        ring.insert(a.clone());
        let b = OpKey::derive(&identity, ring.next_index()).expect("b");
        assert_eq!(b.index, 1);
        ring.insert(b.clone());

        assert_eq!(ring.oldest_hash(), Some(a.hash));
        assert_eq!(ring.revoke(&a.hash).map(|k| k.status), Some(Status::Revoked));
        assert_eq!(ring.oldest_hash(), Some(b.hash));
        assert!(ring.revoke(&[0u8; 20]).is_none());
        assert_eq!(ring.infos().len(), 2);
    }

    #[test]
    fn test_create_and_revoke_persist() {
        let fx = fixture(Status::Alive);
        let info = fx.me.create_op_key().expect("create");
        assert_eq!(info.key.index, 0);
        assert!(info.log_id.is_some());
        assert_eq!(fx.me.get_op_key_infos_from_db().expect("db").len(), 1);
        // No master log yet, so the log waits.
        assert_eq!(
            fx.me
                .pending_op_key_oplog_list(Status::InternalPending, None, 0, ListOrder::Asc)
                .expect("pending")
                .len(),
            1
        );

        let hash = fx.me.oldest_op_key_hash().expect("hash");
        fx.me.revoke_op_key(&hash).expect("revoke");
        assert!(fx.me.oldest_op_key_hash().is_none());
        let stored = fx.me.get_op_key_infos_from_db().expect("db");
        assert_eq!(stored[0].status, Status::Revoked);
        assert!(matches!(fx.me.revoke_op_key(&hash), Err(MeError::NotFound(_))));

        let reloaded = OpKeyRing::load(&fx.me.db().signkey, &fx.me.id).expect("load");
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_install_refuses_foreign_key() {
        let fx = fixture(Status::Alive);
        let store = &fx.me.db().signkey;
        let before = OpKeyRing::load(store, &fx.me.id).expect("ring").len();
        let foreign = OpKey::derive(&PrivateKey::generate(), 0).expect("derive");
        assert!(matches!(foreign.install(store, &fx.me.id), Err(MeError::InvalidData(_))));
        assert_eq!(OpKeyRing::load(store, &fx.me.id).expect("ring").len(), before);

        let own = OpKey::derive(&fx.identity.key, 3).expect("derive");
        own.install(store, &fx.me.id).expect("install");
        let ring = OpKeyRing::load(store, &fx.me.id).expect("ring");
        assert_eq!(ring.len(), before + 1);
        assert!(ring.find(&own.hash).is_some());
    }
}
