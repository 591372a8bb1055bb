//! The identity record and its in-memory keys.

use kith_crypto::secp256k1::PrivateKey;
use kith_db::Store;
use kith_oplog::SignKey;
use kith_types::{EntityId, LogId, Status, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{self, PREFIX_ME, PREFIX_SIGN_KEY};
use crate::{MeError, Result};

pub const MY_INFO_VERSION: u32 = 1;

/// Persistent state of one identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyInfo {
    pub id: EntityId,
    #[serde(default)]
    pub version: u32,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    pub status: Status,
    #[serde(default)]
    pub profile_id: Option<EntityId>,
    #[serde(default)]
    pub board_id: Option<EntityId>,
    /// Identities this one migrated into.
    #[serde(default)]
    pub owner_ids: Vec<EntityId>,
    /// Id of the CreateMe log.
    #[serde(default)]
    pub log_id: Option<LogId>,
}

fn info_key(id: &EntityId) -> Vec<u8> {
    db::key(PREFIX_ME, &[id.as_bytes()])
}

impl MyInfo {
    pub fn new(id: EntityId, status: Status) -> Self {
        let ts = kith_types::time::now();
        Self {
            id,
            version: MY_INFO_VERSION,
            create_ts: ts,
            update_ts: ts,
            status,
            profile_id: None,
            board_id: None,
            owner_ids: Vec::new(),
            log_id: None,
        }
    }

    /// Move to `status` unless that would regress. Returns whether it changed.
    pub fn set_status(&mut self, status: Status) -> bool {
        let next = self.status.advance(status);
        if next == self.status {
            return false;
        }
        debug!(id = %self.id, from = %self.status, to = %next, "identity status");
        self.status = next;
        self.update_ts = kith_types::time::now();
        true
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.put_json(&info_key(&self.id), self)?;
        Ok(())
    }

    pub fn load(store: &Store, id: &EntityId) -> Result<Option<MyInfo>> {
        Ok(store.get_json_opt(&info_key(id))?)
    }

    /// Every identity known to this backend.
    pub fn list(store: &Store) -> Result<Vec<MyInfo>> {
        store
            .scan_prefix(PREFIX_ME)?
            .iter()
            .map(|(_, v)| serde_json::from_slice(v).map_err(MeError::from))
            .collect()
    }

    pub fn delete(store: &Store, id: &EntityId) -> Result<()> {
        store.delete(&info_key(id))?;
        Ok(())
    }
}

/// Rotation counters of the two sign keys of an identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignKeyIndex {
    pub identity: u32,
    pub node: u32,
}

impl SignKeyIndex {
    fn key(id: &EntityId) -> Vec<u8> {
        db::key(PREFIX_SIGN_KEY, &[id.as_bytes()])
    }

    pub fn load(store: &Store, id: &EntityId) -> Result<Self> {
        Ok(store.get_json_opt(&Self::key(id))?.unwrap_or_default())
    }

    pub fn save(&self, store: &Store, id: &EntityId) -> Result<()> {
        store.put_json(&Self::key(id), self)?;
        Ok(())
    }
}

/// Private keys of one identity on this device.
///
/// A device that joined an identity has no identity key until init-me-info
/// delivers it.
pub struct MyKeys {
    pub identity: Option<PrivateKey>,
    pub node: PrivateKey,
    pub sign: Option<SignKey>,
    pub node_sign: SignKey,
    pub index: SignKeyIndex,
}

impl std::fmt::Debug for MyKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MyKeys")
            .field("has_identity", &self.identity.is_some())
            .field("sign", &self.sign)
            .field("node_sign", &self.node_sign)
            .finish()
    }
}

impl MyKeys {
    pub fn new(identity: Option<PrivateKey>, node: PrivateKey, index: SignKeyIndex) -> Result<Self> {
        let sign = identity.as_ref().map(|k| SignKey::derive(k, index.identity)).transpose()?;
        let node_sign = SignKey::derive(&node, index.node)?;
        Ok(Self {
            identity,
            node,
            sign,
            node_sign,
            index,
        })
    }

    /// Install the identity key delivered to a joining device.
    pub fn set_identity(&mut self, key: PrivateKey) -> Result<()> {
        self.sign = Some(SignKey::derive(&key, self.index.identity)?);
        self.identity = Some(key);
        Ok(())
    }

    pub fn identity(&self) -> Result<&PrivateKey> {
        self.identity
            .as_ref()
            .ok_or_else(|| MeError::InvalidMe("identity key is not on this device".into()))
    }

    pub fn sign_key(&mut self) -> Result<&mut SignKey> {
        self.sign
            .as_mut()
            .ok_or_else(|| MeError::InvalidMe("identity key is not on this device".into()))
    }

    /// Derive the next identity sign key.
    pub fn refresh_sign(&mut self) -> Result<()> {
        let next = self.index.identity.wrapping_add(1);
        self.sign = Some(SignKey::derive(self.identity()?, next)?);
        self.index.identity = next;
        Ok(())
    }

    /// Derive the next node sign key.
    pub fn refresh_node_sign(&mut self) -> Result<()> {
        let next = self.index.node.wrapping_add(1);
        self.node_sign = SignKey::derive(&self.node, next)?;
        self.index.node = next;
        Ok(())
    }

    /// Rotate whichever sign key reached its use limit. Returns whether any did.
    pub fn rotate_exhausted(&mut self) -> Result<bool> {
        let mut rotated = false;
        if self.sign.as_ref().is_some_and(|k| k.is_exhausted()) {
            self.refresh_sign()?;
            rotated = true;
        }
        if self.node_sign.is_exhausted() {
            self.refresh_node_sign()?;
            rotated = true;
        }
        Ok(rotated)
    }
}

#[cfg(test)]
mod tests {
    use kith_types::Id;

    use super::*;

    #[test]
    fn test_status_never_regresses() {
        let mut info = MyInfo::new(Id::random(), Status::Init);
        assert!(info.set_status(Status::Sync));
        assert!(!info.set_status(Status::InternalPending));
        assert_eq!(info.status, Status::Sync);
        assert!(info.set_status(Status::Alive));
    }

    #[test]
    fn test_save_load_list() {
        let store = kith_db::open_memory().expect("db");
        let a = MyInfo::new(Id::random(), Status::Alive);
        let b = MyInfo::new(Id::random(), Status::Init);
        a.save(&store).expect("save");
        b.save(&store).expect("save");
        assert_eq!(MyInfo::load(&store, &a.id).expect("load"), Some(a.clone()));
        assert_eq!(MyInfo::list(&store).expect("list").len(), 2);
        MyInfo::delete(&store, &b.id).expect("delete");
        assert!(MyInfo::load(&store, &b.id).expect("load").is_none());
    }

    #[test]
    fn test_keys_rotate() {
        let mut keys = MyKeys::new(
            Some(PrivateKey::generate()),
            PrivateKey::generate(),
            SignKeyIndex::default(),
        )
        .expect("keys");
        let first = keys.sign_key().expect("sign").public_key();
        keys.refresh_sign().expect("refresh");
        assert_ne!(keys.sign_key().expect("sign").public_key(), first);
        assert_eq!(keys.index.identity, 1);
        assert!(!keys.rotate_exhausted().expect("rotate"));

        for _ in 0..kith_oplog::sign::SIGN_KEY_MAX_USES {
            keys.node_sign.sign(Id::random(), b"d").expect("sign");
        }
        assert!(keys.rotate_exhausted().expect("rotate"));
        assert_eq!(keys.index.node, 1);
    }

    #[test]
    fn test_keys_without_identity() {
        let mut keys = MyKeys::new(None, PrivateKey::generate(), SignKeyIndex::default()).expect("keys");
        assert!(keys.sign_key().is_err());
        keys.set_identity(PrivateKey::generate()).expect("set");
        assert!(keys.sign_key().is_ok());
    }
}
