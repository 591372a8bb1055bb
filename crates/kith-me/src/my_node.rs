//! The devices of an identity.
//!
//! ```text
//! key = .mndb || identity id || node id
//! ```
//!
//! A device is recorded when its add-node is proposed or applied and
//! soft-deleted (status `Deleted`) when its removal commits. Only devices
//! with a positive weight count toward the raft quorum.

use std::collections::BTreeMap;

use kith_crypto::secp256k1::raft_id;
use kith_db::{Batch, Store};
use kith_types::{EntityId, Id, LogId, NodeId, NodeSignId, NodeType, Status, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{self, PREFIX_MY_NODE};
use crate::{MeError, Result};

/// The node name a device settled on, with what decides between rivals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNodeNameInfo {
    pub log_id: LogId,
    pub name: String,
    pub ts: Timestamp,
    pub status: Status,
}

impl SyncNodeNameInfo {
    /// Higher status wins, then the newer ts, then the greater log id.
    pub fn supersedes(&self, other: &SyncNodeNameInfo) -> bool {
        (self.status, self.ts, self.log_id) > (other.status, other.ts, other.log_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyNode {
    pub entity_id: EntityId,
    pub node_id: NodeId,
    pub raft_id: u64,
    pub node_sign_id: NodeSignId,
    pub status: Status,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub last_seen: Timestamp,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub name_log_id: Option<LogId>,
    #[serde(default)]
    pub sync_name: Option<SyncNodeNameInfo>,
    /// Raft index of the master log that introduced the device.
    #[serde(default)]
    pub master_index: u64,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
}

fn node_key(entity: &EntityId, node: &NodeId) -> Vec<u8> {
    db::key(PREFIX_MY_NODE, &[entity.as_bytes(), node.as_bytes()])
}

impl MyNode {
    pub fn new(entity_id: EntityId, node_id: NodeId, node_type: NodeType, weight: u32, status: Status) -> Self {
        let ts = kith_types::time::now();
        Self {
            entity_id,
            raft_id: raft_id(node_id.as_bytes()),
            node_sign_id: Id::node_sign_id(&node_id, &entity_id.postfix()),
            node_id,
            status,
            node_type,
            weight,
            last_seen: ts,
            name: String::new(),
            name_log_id: None,
            sync_name: None,
            master_index: 0,
            create_ts: ts,
            update_ts: ts,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == Status::Deleted
    }

    /// Move to `status` unless that would regress. Returns whether it changed.
    pub fn set_status(&mut self, status: Status) -> bool {
        let next = self.status.advance(status);
        if next == self.status {
            return false;
        }
        self.status = next;
        self.update_ts = kith_types::time::now();
        true
    }

    /// Adopt `info` when it supersedes the current name. Returns whether it did.
    pub fn merge_node_name(&mut self, info: SyncNodeNameInfo) -> bool {
        if self.sync_name.as_ref().is_some_and(|current| !info.supersedes(current)) {
            return false;
        }
        self.name = info.name.clone();
        self.name_log_id = Some(info.log_id);
        self.sync_name = Some(info);
        self.update_ts = kith_types::time::now();
        true
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.put_json(&node_key(&self.entity_id, &self.node_id), self)?;
        Ok(())
    }

    pub fn delete(store: &Store, entity: &EntityId, node: &NodeId) -> Result<()> {
        store.delete(&node_key(entity, node))?;
        Ok(())
    }

    /// The record of `node`. A deleted device is an error unless `allow_deleted`.
    pub fn get(store: &Store, entity: &EntityId, node: &NodeId, allow_deleted: bool) -> Result<MyNode> {
        let my_node: MyNode = store
            .get_json_opt(&node_key(entity, node))?
            .ok_or_else(|| MeError::InvalidNode(format!("{node} is not a device of {entity}")))?;
        if my_node.is_deleted() && !allow_deleted {
            return Err(MeError::InvalidNode(format!("{node} was removed from {entity}")));
        }
        Ok(my_node)
    }

    /// Every record of `entity`, skipping undecodable ones.
    pub fn iterate(store: &Store, entity: &EntityId) -> Result<Vec<MyNode>> {
        let prefix = db::key(PREFIX_MY_NODE, &[entity.as_bytes()]);
        Ok(store
            .scan_prefix(&prefix)?
            .iter()
            .filter_map(|(_, v)| serde_json::from_slice(v).ok())
            .collect())
    }
}

/// In-memory view of the devices of one identity, keyed by raft id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MyNodes {
    nodes: BTreeMap<u64, MyNode>,
    total_weight: u64,
}

impl MyNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, raft_id: u64) -> Option<&MyNode> {
        self.nodes.get(&raft_id)
    }

    pub fn get_mut(&mut self, raft_id: u64) -> Option<&mut MyNode> {
        self.nodes.get_mut(&raft_id)
    }

    pub fn get_by_node(&self, node_id: &NodeId) -> Option<&MyNode> {
        self.nodes.get(&raft_id(node_id.as_bytes()))
    }

    pub fn get_by_node_mut(&mut self, node_id: &NodeId) -> Option<&mut MyNode> {
        self.nodes.get_mut(&raft_id(node_id.as_bytes()))
    }

    pub fn insert(&mut self, node: MyNode) -> Option<MyNode> {
        self.nodes.insert(node.raft_id, node)
    }

    pub fn remove(&mut self, raft_id: u64) -> Option<MyNode> {
        self.nodes.remove(&raft_id)
    }

    pub fn values(&self) -> impl Iterator<Item = &MyNode> {
        self.nodes.values()
    }

    /// Devices that are not deleted.
    pub fn live(&self) -> impl Iterator<Item = &MyNode> {
        self.nodes.values().filter(|n| !n.is_deleted())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Set from the raft conf state on every applied change.
    pub fn set_total_weight(&mut self, total: u64) {
        self.total_weight = total;
    }

    /// Sum of the weights of live devices, used before raft reports one.
    pub fn live_weight(&self) -> u64 {
        self.live().map(|n| u64::from(n.weight)).sum()
    }

    /// Weight of the live device `node_id`, zero when unknown.
    pub fn weight_of(&self, node_id: &NodeId) -> u64 {
        self.get_by_node(node_id)
            .filter(|n| !n.is_deleted())
            .map_or(0, |n| u64::from(n.weight))
    }

    /// Devices other than `me` that take part in consensus traffic.
    pub fn synced_peers(&self, me: &NodeId) -> Vec<MyNode> {
        self.nodes
            .values()
            .filter(|n| n.node_id != *me && n.status.is_synced())
            .cloned()
            .collect()
    }
}

/// Load the devices of `entity`.
///
/// Records that do not decode or belong to another identity are deleted.
/// The device `me` must be among them.
pub fn load_my_nodes(store: &Store, entity: &EntityId, me: &NodeId) -> Result<MyNodes> {
    let prefix = db::key(PREFIX_MY_NODE, &[entity.as_bytes()]);
    let mut nodes = MyNodes::new();
    let mut stale = Batch::new();
    for (key, value) in store.scan_prefix(&prefix)? {
        match serde_json::from_slice::<MyNode>(&value) {
            Ok(node) if node.entity_id == *entity => {
                nodes.insert(node);
            }
            Ok(node) => {
                warn!(entity = %entity, other = %node.entity_id, "dropping device record of another identity");
                stale.delete(key);
            }
            Err(e) => {
                warn!(entity = %entity, error = %e, "dropping undecodable device record");
                stale.delete(key);
            }
        }
    }
    if !stale.is_empty() {
        store.write(stale)?;
    }
    if nodes.get_by_node(me).is_none() {
        return Err(MeError::InvalidMe(format!("this device is not a device of {entity}")));
    }
    let weight = nodes.live_weight();
    nodes.set_total_weight(weight);
    debug!(entity = %entity, devices = nodes.len(), total_weight = weight, "loaded devices");
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(entity: EntityId, weight: u32, status: Status) -> MyNode {
        MyNode::new(entity, Id::random(), NodeType::Desktop, weight, status)
    }

    #[test]
    fn test_json_keeps_every_field() {
        let mut n = node(Id::random(), 2, Status::Sync);
        n.name = "phone".into();
        n.name_log_id = Some(Id([3; 32]));
        n.master_index = 4;
        n.last_seen = 99;
        n.sync_name = Some(SyncNodeNameInfo {
            log_id: Id([3; 32]),
            name: "phone".into(),
            ts: 98,
            status: Status::Alive,
        });
        let raw = serde_json::to_vec(&n).expect("encode");
        let back: MyNode = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(back, n);
    }

    #[test]
    fn test_new_derives_ids() {
        let entity = Id::random();
        let n = node(entity, 2_000, Status::Init);
        assert_eq!(n.raft_id, raft_id(n.node_id.as_bytes()));
        assert_eq!(n.node_sign_id.postfix(), entity.postfix());
        assert_eq!(&n.node_sign_id.0[..20], &n.node_id.0[..20]);
    }

    #[test]
    fn test_node_name_precedence() {
        let mut n = node(Id::random(), 2, Status::Alive);
        let pending = SyncNodeNameInfo {
            log_id: Id([1; 32]),
            name: "pending".into(),
            ts: 100,
            status: Status::Pending,
        };
        let alive_old = SyncNodeNameInfo {
            log_id: Id([2; 32]),
            name: "alive".into(),
            ts: 10,
            status: Status::Alive,
        };
        assert!(n.merge_node_name(pending.clone()));
        assert!(n.merge_node_name(alive_old.clone()));
        // A newer ts does not beat a higher status.
        assert!(!n.merge_node_name(pending));
        let tie = SyncNodeNameInfo {
            log_id: Id([3; 32]),
            name: "tie".into(),
            ..alive_old.clone()
        };
        assert!(n.merge_node_name(tie));
        assert_eq!(n.name, "tie");
        assert!(!n.merge_node_name(alive_old));
    }

    #[test]
    fn test_get_deleted() {
        let store = kith_db::open_memory().expect("db");
        let entity = Id::random();
        let mut n = node(entity, 2, Status::Alive);
        n.save(&store).expect("save");
        assert!(MyNode::get(&store, &entity, &n.node_id, false).is_ok());
        n.set_status(Status::Deleted);
        n.save(&store).expect("save");
        assert!(matches!(
            MyNode::get(&store, &entity, &n.node_id, false),
            Err(MeError::InvalidNode(_))
        ));
        assert!(MyNode::get(&store, &entity, &n.node_id, true).is_ok());
        assert_eq!(MyNode::iterate(&store, &entity).expect("iterate").len(), 1);
    }

    #[test]
    fn test_load_my_nodes() {
        let store = kith_db::open_memory().expect("db");
        let entity = Id::random();
        let me = node(entity, 2_000, Status::Alive);
        let other = node(entity, 2, Status::Sync);
        me.save(&store).expect("save");
        other.save(&store).expect("save");
        // Garbage and a record filed under the wrong identity.
        store
            .put(&db::key(PREFIX_MY_NODE, &[entity.as_bytes(), &[9u8; 32]]), b"not json")
            .expect("put");
        let foreign = node(Id::random(), 2, Status::Alive);
        store
            .put_json(&node_key(&entity, &foreign.node_id), &foreign)
            .expect("put");

        let nodes = load_my_nodes(&store, &entity, &me.node_id).expect("load");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.total_weight(), 2_002);
        assert_eq!(nodes.synced_peers(&me.node_id).len(), 1);
        assert_eq!(MyNode::iterate(&store, &entity).expect("iterate").len(), 2);

        assert!(matches!(
            load_my_nodes(&store, &entity, &Id::random()),
            Err(MeError::InvalidMe(_))
        ));
    }
}
