//! Time-bucketed Merkle tree over alive oplogs.
//!
//! Leaves sit at [`MerkleLevel::Now`], one per alive log, keyed by
//! `ts || log id` and addressed by the log digest. Each hour, day, month and
//! year bucket holds a node aggregating its children. Two replicas with equal
//! roots hold the same set of alive logs; when roots differ, peers descend
//! level by level comparing children until they reach the differing leaves.
//!
//! ```text
//! key = prefix || entity id || level || ts (u64 BE) [|| log id]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use kith_crypto::blake3::{self, contexts};
use kith_db::{Batch, Store};
use kith_types::time::{self, NANOS_PER_DAY, NANOS_PER_HOUR};
use kith_types::{EntityId, LogId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{OplogError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerkleLevel {
    /// Leaves.
    Now,
    Hour,
    Day,
    Month,
    Year,
}

impl MerkleLevel {
    fn byte(self) -> u8 {
        match self {
            MerkleLevel::Now => 0,
            MerkleLevel::Hour => 1,
            MerkleLevel::Day => 2,
            MerkleLevel::Month => 3,
            MerkleLevel::Year => 4,
        }
    }

    pub fn parent(self) -> Option<MerkleLevel> {
        match self {
            MerkleLevel::Now => Some(MerkleLevel::Hour),
            MerkleLevel::Hour => Some(MerkleLevel::Day),
            MerkleLevel::Day => Some(MerkleLevel::Month),
            MerkleLevel::Month => Some(MerkleLevel::Year),
            MerkleLevel::Year => None,
        }
    }

    pub fn child(self) -> Option<MerkleLevel> {
        match self {
            MerkleLevel::Now => None,
            MerkleLevel::Hour => Some(MerkleLevel::Now),
            MerkleLevel::Day => Some(MerkleLevel::Hour),
            MerkleLevel::Month => Some(MerkleLevel::Day),
            MerkleLevel::Year => Some(MerkleLevel::Month),
        }
    }

    /// Start of the bucket of this level containing `ts`.
    pub fn bucket(self, ts: Timestamp) -> Timestamp {
        match self {
            MerkleLevel::Now => ts,
            MerkleLevel::Hour => time::hour_start(ts),
            MerkleLevel::Day => time::day_start(ts),
            MerkleLevel::Month => time::month_start(ts),
            MerkleLevel::Year => time::year_start(ts),
        }
    }

    /// Start of the bucket following the one starting at `start`.
    fn bucket_end(self, start: Timestamp) -> Timestamp {
        match self {
            MerkleLevel::Now => start + 1,
            MerkleLevel::Hour => start + NANOS_PER_HOUR,
            MerkleLevel::Day => start + NANOS_PER_DAY,
            MerkleLevel::Month => time::month_start(start + 32 * NANOS_PER_DAY),
            MerkleLevel::Year => time::year_start(start + 366 * NANOS_PER_DAY),
        }
    }
}

/// One tree node. Leaves carry the id of their log.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub level: MerkleLevel,
    pub ts: Timestamp,
    pub count: u64,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub address: [u8; 32],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LogId>,
}

impl MerkleNode {
    fn slot(&self) -> (MerkleLevel, Timestamp, Option<LogId>) {
        (self.level, self.ts, self.id)
    }
}

/// Address and leaf count of a node with `children`.
pub fn aggregate(children: &[MerkleNode]) -> ([u8; 32], u64) {
    let fields: Vec<&[u8]> = children.iter().map(|c| c.address.as_slice()).collect();
    let count = children.iter().map(|c| c.count).sum();
    (blake3::derive_multi(contexts::MERKLE_NODE, &fields), count)
}

/// Outcome of comparing one level of two trees.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MerkleDiff {
    /// Remote nodes missing locally or with a different address.
    pub differ: Vec<MerkleNode>,
    /// Local nodes the remote side does not have.
    pub local_only: Vec<MerkleNode>,
}

impl MerkleDiff {
    pub fn is_empty(&self) -> bool {
        self.differ.is_empty() && self.local_only.is_empty()
    }
}

/// Compare sibling nodes from two replicas.
pub fn diff(local: &[MerkleNode], remote: &[MerkleNode]) -> MerkleDiff {
    let by_slot: HashMap<_, _> = local.iter().map(|n| (n.slot(), n)).collect();
    let remote_slots: HashMap<_, _> = remote.iter().map(|n| (n.slot(), n)).collect();
    let differ = remote
        .iter()
        .filter(|n| by_slot.get(&n.slot()).map_or(true, |l| l.address != n.address))
        .cloned()
        .collect();
    let local_only = local
        .iter()
        .filter(|n| !remote_slots.contains_key(&n.slot()))
        .cloned()
        .collect();
    MerkleDiff { differ, local_only }
}

fn ts_key(ts: Timestamp) -> [u8; 8] {
    (ts.max(0) as u64).to_be_bytes()
}

/// The tree of one oplog family.
#[derive(Clone, Debug)]
pub struct Merkle {
    db: Arc<Store>,
    prefix: &'static [u8],
}

impl Merkle {
    pub fn new(db: Arc<Store>, prefix: &'static [u8]) -> Self {
        Self { db, prefix }
    }

    fn level_prefix(&self, entity: &EntityId, level: MerkleLevel) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 33);
        key.extend_from_slice(self.prefix);
        key.extend_from_slice(entity.as_bytes());
        key.push(level.byte());
        key
    }

    fn key(&self, entity: &EntityId, level: MerkleLevel, ts: Timestamp, id: Option<&LogId>) -> Vec<u8> {
        let mut key = self.level_prefix(entity, level);
        key.extend_from_slice(&ts_key(ts));
        if let Some(id) = id {
            key.extend_from_slice(id.as_bytes());
        }
        key
    }

    fn decode(raw: &[u8]) -> Result<MerkleNode> {
        serde_json::from_slice(raw).map_err(|e| OplogError::Serialization(e.to_string()))
    }

    /// Add a leaf and refresh its ancestors. Returns false when already present.
    pub fn insert(&self, entity: &EntityId, ts: Timestamp, id: &LogId, address: [u8; 32]) -> Result<bool> {
        let key = self.key(entity, MerkleLevel::Now, ts, Some(id));
        if self.db.contains(&key)? {
            return Ok(false);
        }
        let leaf = MerkleNode {
            level: MerkleLevel::Now,
            ts,
            count: 1,
            address,
            id: Some(*id),
        };
        self.db.put_json(&key, &leaf)?;
        self.refresh(entity, ts)?;
        Ok(true)
    }

    /// Remove a leaf and refresh its ancestors.
    pub fn remove(&self, entity: &EntityId, ts: Timestamp, id: &LogId) -> Result<()> {
        self.db.delete(&self.key(entity, MerkleLevel::Now, ts, Some(id)))?;
        self.refresh(entity, ts)
    }

    fn refresh(&self, entity: &EntityId, ts: Timestamp) -> Result<()> {
        let mut level = MerkleLevel::Hour;
        loop {
            let start = level.bucket(ts);
            let children = self.children(entity, level, start)?;
            let key = self.key(entity, level, start, None);
            let mut batch = Batch::new();
            if children.is_empty() {
                batch.delete(key);
            } else {
                let (address, count) = aggregate(&children);
                let node = MerkleNode {
                    level,
                    ts: start,
                    count,
                    address,
                    id: None,
                };
                batch.put_json(key, &node)?;
            }
            self.db.write(batch)?;
            match level.parent() {
                Some(parent) => level = parent,
                None => return Ok(()),
            }
        }
    }

    /// Children of the node at `level` whose bucket contains `ts`.
    pub fn children(&self, entity: &EntityId, level: MerkleLevel, ts: Timestamp) -> Result<Vec<MerkleNode>> {
        let Some(child) = level.child() else {
            return Ok(Vec::new());
        };
        let start = level.bucket(ts);
        let end = level.bucket_end(start);
        let lo = self.key(entity, child, start, None);
        let hi = self.key(entity, child, end, None);
        self.db
            .range(&lo, &hi)?
            .iter()
            .map(|(_, v)| Self::decode(v))
            .collect()
    }

    /// Leaves below the node at `level` whose bucket contains `ts`.
    pub fn leaves_under(&self, entity: &EntityId, level: MerkleLevel, ts: Timestamp) -> Result<Vec<MerkleNode>> {
        let start = level.bucket(ts);
        let end = level.bucket_end(start);
        let lo = self.key(entity, MerkleLevel::Now, start, None);
        let hi = self.key(entity, MerkleLevel::Now, end, None);
        self.db
            .range(&lo, &hi)?
            .iter()
            .map(|(_, v)| Self::decode(v))
            .collect()
    }

    /// Every node of one level.
    pub fn nodes(&self, entity: &EntityId, level: MerkleLevel) -> Result<Vec<MerkleNode>> {
        self.db
            .scan_prefix(&self.level_prefix(entity, level))?
            .iter()
            .map(|(_, v)| Self::decode(v))
            .collect()
    }

    /// The year nodes, exchanged as the tree digest.
    pub fn top(&self, entity: &EntityId) -> Result<Vec<MerkleNode>> {
        self.nodes(entity, MerkleLevel::Year)
    }

    /// Hash of all year nodes; zero for an empty tree.
    pub fn root(&self, entity: &EntityId) -> Result<[u8; 32]> {
        let top = self.top(entity)?;
        if top.is_empty() {
            return Ok([0u8; 32]);
        }
        Ok(aggregate(&top).0)
    }

    /// Drop the whole tree of `entity`.
    pub fn clear(&self, entity: &EntityId) -> Result<()> {
        let mut prefix = self.prefix.to_vec();
        prefix.extend_from_slice(entity.as_bytes());
        self.db.delete_prefix(&prefix)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kith_types::Id;

    use super::*;

    const PREFIX: &[u8] = b".tsmk";
    const JAN_2024: Timestamp = 1_704_067_200 * 1_000_000_000;

    fn tree() -> Merkle {
        Merkle::new(Arc::new(kith_db::open_memory().expect("db")), PREFIX)
    }

    fn leaf(n: u8) -> (LogId, [u8; 32]) {
        (Id([n; 32]), [n; 32])
    }

    #[test]
    fn test_levels() {
        assert_eq!(MerkleLevel::Now.parent(), Some(MerkleLevel::Hour));
        assert_eq!(MerkleLevel::Year.parent(), None);
        assert_eq!(MerkleLevel::Hour.child(), Some(MerkleLevel::Now));
        let ts = JAN_2024 + 40 * NANOS_PER_DAY + 5;
        assert_eq!(MerkleLevel::Year.bucket(ts), JAN_2024);
        assert_eq!(MerkleLevel::Month.bucket(ts), JAN_2024 + 31 * NANOS_PER_DAY);
        assert_eq!(MerkleLevel::Month.bucket_end(JAN_2024), JAN_2024 + 31 * NANOS_PER_DAY);
    }

    #[test]
    fn test_insert_builds_ancestors() {
        let t = tree();
        let e = Id::random();
        let (id, addr) = leaf(1);
        assert!(t.insert(&e, JAN_2024 + 10, &id, addr).expect("insert"));
        assert!(!t.insert(&e, JAN_2024 + 10, &id, addr).expect("insert"));
        for level in [MerkleLevel::Hour, MerkleLevel::Day, MerkleLevel::Month, MerkleLevel::Year] {
            let nodes = t.nodes(&e, level).expect("nodes");
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].count, 1);
        }
        assert_ne!(t.root(&e).expect("root"), [0u8; 32]);
    }

    #[test]
    fn test_root_independent_of_insert_order() {
        let a = tree();
        let b = tree();
        let e = Id::random();
        let entries: Vec<_> = (1..=5u8)
            .map(|n| (JAN_2024 + i64::from(n) * 7 * NANOS_PER_DAY, leaf(n)))
            .collect();
        for (ts, (id, addr)) in &entries {
            a.insert(&e, *ts, id, *addr).expect("insert");
        }
        for (ts, (id, addr)) in entries.iter().rev() {
            b.insert(&e, *ts, id, *addr).expect("insert");
        }
        assert_eq!(a.root(&e).expect("root"), b.root(&e).expect("root"));
        assert_eq!(a.top(&e).expect("top")[0].count, 5);
    }

    #[test]
    fn test_diff_descends_to_missing_leaf() {
        let a = tree();
        let b = tree();
        let e = Id::random();
        let (id1, addr1) = leaf(1);
        let (id2, addr2) = leaf(2);
        a.insert(&e, JAN_2024, &id1, addr1).expect("insert");
        b.insert(&e, JAN_2024, &id1, addr1).expect("insert");
        b.insert(&e, JAN_2024 + 3 * NANOS_PER_HOUR, &id2, addr2).expect("insert");

        let top = diff(&a.top(&e).expect("top"), &b.top(&e).expect("top"));
        assert_eq!(top.differ.len(), 1);
        let mut node = top.differ[0].clone();
        while node.level.child().is_some() {
            let d = diff(
                &a.children(&e, node.level, node.ts).expect("children"),
                &b.children(&e, node.level, node.ts).expect("children"),
            );
            assert_eq!(d.differ.len(), 1);
            node = d.differ[0].clone();
        }
        assert_eq!(node.id, Some(id2));
    }

    #[test]
    fn test_diff_reports_local_only() {
        let local = vec![MerkleNode {
            level: MerkleLevel::Year,
            ts: JAN_2024,
            count: 1,
            address: [1; 32],
            id: None,
        }];
        let d = diff(&local, &[]);
        assert!(d.differ.is_empty());
        assert_eq!(d.local_only.len(), 1);
        assert!(diff(&local, &local).is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_buckets() {
        let t = tree();
        let e = Id::random();
        let (id, addr) = leaf(3);
        t.insert(&e, JAN_2024, &id, addr).expect("insert");
        t.remove(&e, JAN_2024, &id).expect("remove");
        assert!(t.top(&e).expect("top").is_empty());
        assert_eq!(t.root(&e).expect("root"), [0u8; 32]);
    }

    #[test]
    fn test_leaves_under() {
        let t = tree();
        let e = Id::random();
        for n in 1..=3u8 {
            let (id, addr) = leaf(n);
            t.insert(&e, JAN_2024 + i64::from(n) * NANOS_PER_DAY, &id, addr).expect("insert");
        }
        let leaves = t.leaves_under(&e, MerkleLevel::Month, JAN_2024).expect("leaves");
        assert_eq!(leaves.len(), 3);
        let leaves = t.leaves_under(&e, MerkleLevel::Day, JAN_2024 + NANOS_PER_DAY).expect("leaves");
        assert_eq!(leaves.len(), 1);
    }
}
