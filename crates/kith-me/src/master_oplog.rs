//! The master oplog: one entry per applied raft membership change.
//!
//! ```text
//! id = 12 zero bytes || raft index (u64 BE) || identity id[..12]
//! ```
//!
//! Entries are written by every device as it applies the conf change and
//! are alive on write; ids sort by raft index. Each copy is signed with the
//! node sign key of the device that wrote it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use kith_db::Store;
use kith_oplog::{Family, OpKind, Oplog, OplogStore, SignKey};
use kith_types::{EntityId, Id, ListOrder, LogId, NodeId, Status};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{self, MeDb, PREFIX_RAFT_LAST_MASTER};
use crate::sync::{read, write};
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterOp {
    AddMaster,
    RevokeMaster,
}

impl OpKind for MasterOp {
    const FAMILY: Family = Family {
        name: "master",
        log: b".malg",
        pending: b".maig",
        merkle: None,
    };

    fn code(self) -> u8 {
        match self {
            MasterOp::AddMaster => 1,
            MasterOp::RevokeMaster => 2,
        }
    }

    fn needs_master(self) -> bool {
        false
    }
}

/// Membership after the change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterData {
    /// Device added, re-weighted or removed.
    pub node_id: NodeId,
    pub raft_id: u64,
    /// Device that wrote this copy.
    pub issuer: NodeId,
    /// Raft id to weight.
    pub masters: BTreeMap<u64, u32>,
    pub total_weight: u64,
}

pub type MasterOplog = Oplog<MasterOp>;

/// Master oplogs of one identity.
pub struct MasterOplogs {
    entity: EntityId,
    store: OplogStore<MasterOp>,
    meta: Arc<Store>,
    newest: RwLock<u64>,
}

impl std::fmt::Debug for MasterOplogs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterOplogs")
            .field("entity", &self.entity)
            .field("newest", &self.newest_index())
            .finish()
    }
}

impl MasterOplogs {
    pub fn open(entity: EntityId, db: &MeDb) -> Result<Self> {
        let meta = db.memeta.clone();
        let newest = meta
            .get_json_opt::<u64>(&Self::newest_key(&entity))?
            .unwrap_or_default();
        Ok(Self {
            entity,
            store: OplogStore::new(db.oplog.clone()),
            meta,
            newest: RwLock::new(newest),
        })
    }

    fn newest_key(entity: &EntityId) -> Vec<u8> {
        db::key(PREFIX_RAFT_LAST_MASTER, &[entity.as_bytes()])
    }

    /// Raft index of the newest entry, 0 when none.
    pub fn newest_index(&self) -> u64 {
        *read(&self.newest)
    }

    pub fn newest_id(&self) -> Option<LogId> {
        match self.newest_index() {
            0 => None,
            index => Some(Id::master_log_id(index, &self.entity)),
        }
    }

    /// Whether the entry `id` has been written here.
    pub fn contains(&self, id: &LogId) -> Result<bool> {
        Ok(self.store.contains(&self.entity, id)?)
    }

    /// Record the change applied at raft `index`. Replays return the stored entry.
    pub fn write(
        &self,
        index: u64,
        op: MasterOp,
        data: &MasterData,
        node_id: NodeId,
        node_sign: &mut SignKey,
    ) -> Result<MasterOplog> {
        let id = Id::master_log_id(index, &self.entity);
        if let Some(existing) = self.store.get(&self.entity, &id)? {
            return Ok(existing);
        }
        let raw = serde_json::to_vec(data)?;
        let mut log = Oplog::new(id, self.entity, op, kith_types::time::now(), self.entity, raw);
        log.add_master_sign(node_id, node_sign)?;
        log.master_log_id = Some(id);
        log.master_weight = data.total_weight;
        log.status = Status::Alive;
        self.store.save_alive(&log)?;

        let mut newest = write(&self.newest);
        if index > *newest {
            self.meta.put_json(&Self::newest_key(&self.entity), &index)?;
            *newest = index;
        }
        debug!(entity = %self.entity, index, op = ?op, total_weight = data.total_weight, "master oplog written");
        Ok(log)
    }

    pub fn get(&self, index: u64) -> Result<Option<MasterOplog>> {
        Ok(self.store.get(&self.entity, &Id::master_log_id(index, &self.entity))?)
    }

    /// Entries from raft index `start` (inclusive).
    pub fn list(&self, start: Option<u64>, limit: usize, order: ListOrder) -> Result<Vec<MasterOplog>> {
        let start = start.map(|index| Id::master_log_id(index, &self.entity));
        Ok(self.store.list(&self.entity, start.as_ref(), limit, order)?)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.delete_all(&self.entity)?;
        self.meta.delete(&Self::newest_key(&self.entity))?;
        *write(&self.newest) = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kith_crypto::secp256k1::PrivateKey;

    use super::*;

    fn data(node_id: NodeId, total: u64) -> MasterData {
        MasterData {
            node_id,
            raft_id: 7,
            issuer: node_id,
            masters: BTreeMap::from([(7, total as u32)]),
            total_weight: total,
        }
    }

    #[test]
    fn test_write_tracks_newest() {
        let db = MeDb::open_memory().expect("db");
        let entity = Id::random();
        let masters = MasterOplogs::open(entity, &db).expect("open");
        assert!(masters.newest_id().is_none());

        let node_key = PrivateKey::generate();
        let node_id = Id(node_key.public_key().expect("pk").node_id());
        let mut sign = SignKey::derive(&node_key, 0).expect("sign key");

        let first = masters
            .write(1, MasterOp::AddMaster, &data(node_id, 2_000), node_id, &mut sign)
            .expect("write");
        assert!(first.is_alive());
        first.verify_master_signs().expect("signed by the node");
        masters
            .write(2, MasterOp::AddMaster, &data(node_id, 2_001), node_id, &mut sign)
            .expect("write");

        assert_eq!(masters.newest_index(), 2);
        assert_eq!(masters.newest_id().and_then(|id| id.master_index()), Some(2));
        let desc = masters.list(None, 0, ListOrder::Desc).expect("list");
        assert_eq!(desc.len(), 2);
        assert_eq!(desc[0].id.master_index(), Some(2));

        // A fresh view over the same spaces sees the same newest entry.
        let reopened = MasterOplogs::open(entity, &db).expect("open");
        assert_eq!(reopened.newest_index(), 2);
    }

    #[test]
    fn test_replay_keeps_first_copy() {
        let db = MeDb::open_memory().expect("db");
        let masters = MasterOplogs::open(Id::random(), &db).expect("open");
        let node_key = PrivateKey::generate();
        let node_id = Id(node_key.public_key().expect("pk").node_id());
        let mut sign = SignKey::derive(&node_key, 0).expect("sign key");

        let a = masters
            .write(1, MasterOp::AddMaster, &data(node_id, 2), node_id, &mut sign)
            .expect("write");
        let b = masters
            .write(1, MasterOp::RevokeMaster, &data(node_id, 0), node_id, &mut sign)
            .expect("replay");
        assert_eq!(a.id, b.id);
        assert_eq!(b.op, MasterOp::AddMaster);
        assert_eq!(a.status, Status::Alive);
        assert_eq!(b.status, a.status);
        assert_eq!(masters.list(Some(1), 0, ListOrder::Asc).expect("list").len(), 1);

        masters.clear().expect("clear");
        assert!(masters.get(1).expect("get").is_none());
        assert_eq!(masters.newest_index(), 0);
    }
}
