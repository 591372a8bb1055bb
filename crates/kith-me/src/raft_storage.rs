//! Durable raft log of one identity.
//!
//! ```text
//! .rfdb || id || index (u64 BE)  -> entry
//! .rfhs || id                    -> hard state
//! .rfsn || id                    -> last snapshot
//! .rfcs || id                    -> conf state
//! ```
//!
//! The entry at the compaction point is kept as a dummy so that
//! `term(first_index - 1)` stays answerable.

use std::sync::{Arc, RwLock};

use kith_db::{Batch, Direction, Store};
use kith_raft::storage::{limit_size, StorageResult};
use kith_raft::{ConfState, Entry, HardState, RaftState, Snapshot, Storage, StorageError};
use kith_types::EntityId;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::db::{self, PREFIX_RAFT_CONF_STATE, PREFIX_RAFT_ENTRY, PREFIX_RAFT_HARD_STATE, PREFIX_RAFT_SNAPSHOT};
use crate::sync::{read, write};

#[derive(Debug, Default)]
struct Core {
    /// Index of the dummy entry.
    offset: u64,
    last: u64,
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
}

#[derive(Clone, Debug)]
pub struct RaftStorage {
    db: Arc<Store>,
    id: EntityId,
    core: Arc<RwLock<Core>>,
}

fn other<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Other(e.to_string())
}

impl RaftStorage {
    fn empty(db: Arc<Store>, id: EntityId) -> Self {
        Self {
            db,
            id,
            core: Arc::new(RwLock::new(Core::default())),
        }
    }

    fn entry_prefix(&self) -> Vec<u8> {
        db::key(PREFIX_RAFT_ENTRY, &[self.id.as_bytes()])
    }

    fn entry_key(&self, index: u64) -> Vec<u8> {
        db::key(PREFIX_RAFT_ENTRY, &[self.id.as_bytes(), &index.to_be_bytes()])
    }

    fn meta_key(&self, prefix: &[u8]) -> Vec<u8> {
        db::key(prefix, &[self.id.as_bytes()])
    }

    fn get_json<T: DeserializeOwned + Default>(&self, prefix: &[u8]) -> StorageResult<T> {
        Ok(self.db.get_json_opt(&self.meta_key(prefix)).map_err(other)?.unwrap_or_default())
    }

    /// Wipe any previous log and start from a dummy entry at index 0.
    pub fn clean(db: Arc<Store>, id: EntityId) -> StorageResult<Self> {
        let storage = Self::empty(db, id);
        let mut batch = Batch::new();
        batch
            .delete_prefix(storage.entry_prefix())
            .delete(storage.meta_key(PREFIX_RAFT_HARD_STATE))
            .delete(storage.meta_key(PREFIX_RAFT_SNAPSHOT))
            .delete(storage.meta_key(PREFIX_RAFT_CONF_STATE));
        batch
            .put_json(storage.entry_key(0), &Entry::default())
            .map_err(other)?;
        storage.db.write(batch).map_err(other)?;
        info!(entity = %id, "raft storage cleaned");
        Ok(storage)
    }

    /// Recover the log persisted by a previous run.
    pub fn resume(db: Arc<Store>, id: EntityId) -> StorageResult<Self> {
        let storage = Self::empty(db, id);
        let prefix = storage.entry_prefix();
        let index_of = |key: &[u8]| -> StorageResult<u64> {
            let raw: [u8; 8] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StorageError::Other("malformed raft entry key".into()))?;
            Ok(u64::from_be_bytes(raw))
        };
        let first = storage.db.first(&prefix).map_err(other)?;
        let last = storage.db.last(&prefix).map_err(other)?;
        let (offset, last) = match (first, last) {
            (Some((first, _)), Some((last, _))) => (index_of(&first)?, index_of(&last)?),
            _ => return Self::clean(storage.db, id),
        };
        {
            let mut core = write(&storage.core);
            core.offset = offset;
            core.last = last;
            core.hard_state = storage.get_json(PREFIX_RAFT_HARD_STATE)?;
            core.conf_state = storage.get_json(PREFIX_RAFT_CONF_STATE)?;
            core.snapshot = storage.get_json(PREFIX_RAFT_SNAPSHOT)?;
            info!(
                entity = %id,
                first = offset + 1,
                last,
                commit = core.hard_state.commit,
                "raft storage resumed"
            );
        }
        Ok(storage)
    }

    fn read_entry(&self, index: u64) -> StorageResult<Entry> {
        self.db
            .get_json_opt(&self.entry_key(index))
            .map_err(other)?
            .ok_or(StorageError::Unavailable)
    }

    pub fn hard_state(&self) -> HardState {
        read(&self.core).hard_state
    }

    pub fn conf_state(&self) -> ConfState {
        read(&self.core).conf_state.clone()
    }

    pub fn set_hard_state(&self, hs: HardState) -> StorageResult<()> {
        let mut core = write(&self.core);
        self.db
            .put_json(&self.meta_key(PREFIX_RAFT_HARD_STATE), &hs)
            .map_err(other)?;
        core.hard_state = hs;
        Ok(())
    }

    pub fn set_conf_state(&self, cs: ConfState) -> StorageResult<()> {
        let mut core = write(&self.core);
        self.db
            .put_json(&self.meta_key(PREFIX_RAFT_CONF_STATE), &cs)
            .map_err(other)?;
        core.conf_state = cs;
        Ok(())
    }

    /// Append entries, skipping those before the first index and replacing
    /// any conflicting tail.
    pub fn append(&self, entries: &[Entry]) -> StorageResult<()> {
        let Some(first_new) = entries.first().map(|e| e.index) else {
            return Ok(());
        };
        let mut core = write(&self.core);
        let first = core.offset + 1;
        let skip = first.saturating_sub(first_new) as usize;
        if skip >= entries.len() {
            return Ok(());
        }
        let entries = &entries[skip..];
        let start = entries[0].index;
        if start > core.last + 1 {
            return Err(StorageError::Other(format!(
                "missing log entry [last: {}, append at: {start}]",
                core.last
            )));
        }
        let end = start + entries.len() as u64 - 1;
        let mut batch = Batch::new();
        for e in entries {
            batch.put_json(self.entry_key(e.index), e).map_err(other)?;
        }
        if end < core.last {
            for stale in end + 1..=core.last {
                batch.delete(self.entry_key(stale));
            }
        }
        self.db.write(batch).map_err(other)?;
        core.last = end;
        Ok(())
    }

    /// Drop entries before `index`; the entry at `index` becomes the dummy.
    pub fn compact(&self, index: u64) -> StorageResult<()> {
        let mut core = write(&self.core);
        if index <= core.offset {
            return Err(StorageError::Compacted);
        }
        if index > core.last {
            return Err(StorageError::Unavailable);
        }
        let removed = self
            .db
            .delete_range(&self.entry_key(core.offset), &self.entry_key(index))
            .map_err(other)?;
        core.offset = index;
        debug!(entity = %self.id, index, removed, "raft log compacted");
        Ok(())
    }

    /// Replace the log with `snapshot`. Refuses snapshots not newer than the current one.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> StorageResult<()> {
        let mut core = write(&self.core);
        let meta = &snapshot.metadata;
        if core.snapshot.metadata.index >= meta.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        let dummy = Entry {
            term: meta.term,
            index: meta.index,
            ..Default::default()
        };
        let mut hs = core.hard_state;
        hs.commit = hs.commit.max(meta.index);
        hs.term = hs.term.max(meta.term);
        let mut batch = Batch::new();
        batch
            .delete_prefix(self.entry_prefix())
            .put_json(self.entry_key(meta.index), &dummy)
            .map_err(other)?
            .put_json(self.meta_key(PREFIX_RAFT_SNAPSHOT), &snapshot)
            .map_err(other)?
            .put_json(self.meta_key(PREFIX_RAFT_CONF_STATE), &meta.conf_state)
            .map_err(other)?
            .put_json(self.meta_key(PREFIX_RAFT_HARD_STATE), &hs)
            .map_err(other)?;
        self.db.write(batch).map_err(other)?;
        core.offset = meta.index;
        core.last = meta.index;
        core.hard_state = hs;
        core.conf_state = meta.conf_state.clone();
        info!(entity = %self.id, index = meta.index, term = meta.term, "raft snapshot applied");
        core.snapshot = snapshot;
        Ok(())
    }

    /// Record a snapshot at `index`, which must still be in the log.
    pub fn create_snapshot(&self, index: u64, cs: Option<ConfState>, data: Vec<u8>) -> StorageResult<Snapshot> {
        let mut core = write(&self.core);
        if index <= core.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        if index > core.last || index < core.offset {
            return Err(StorageError::Unavailable);
        }
        let term = self.read_entry(index)?.term;
        let snapshot = Snapshot {
            data,
            metadata: kith_raft::SnapshotMetadata {
                conf_state: cs.unwrap_or_else(|| core.conf_state.clone()),
                index,
                term,
            },
        };
        self.db
            .put_json(&self.meta_key(PREFIX_RAFT_SNAPSHOT), &snapshot)
            .map_err(other)?;
        core.snapshot = snapshot.clone();
        Ok(snapshot)
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> StorageResult<RaftState> {
        let core = read(&self.core);
        Ok(RaftState {
            hard_state: core.hard_state,
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(&self, low: u64, high: u64, max_size: Option<u64>) -> StorageResult<Vec<Entry>> {
        let core = read(&self.core);
        if low <= core.offset {
            return Err(StorageError::Compacted);
        }
        if high > core.last + 1 {
            return Err(StorageError::Unavailable);
        }
        if low >= high {
            return Ok(Vec::new());
        }
        let pairs = self
            .db
            .scan(
                &self.entry_prefix(),
                Some(&self.entry_key(low)),
                (high - low) as usize,
                Direction::Forward,
            )
            .map_err(other)?;
        let mut entries = pairs
            .iter()
            .map(|(_, v)| serde_json::from_slice::<Entry>(v).map_err(other))
            .collect::<StorageResult<Vec<_>>>()?;
        if entries.len() as u64 != high - low {
            return Err(StorageError::Unavailable);
        }
        limit_size(&mut entries, max_size);
        Ok(entries)
    }

    fn term(&self, idx: u64) -> StorageResult<u64> {
        let core = read(&self.core);
        if idx < core.offset {
            return Err(StorageError::Compacted);
        }
        if idx > core.last {
            return Err(StorageError::Unavailable);
        }
        if idx == core.snapshot.metadata.index && idx != 0 {
            return Ok(core.snapshot.metadata.term);
        }
        Ok(self.read_entry(idx)?.term)
    }

    fn first_index(&self) -> StorageResult<u64> {
        Ok(read(&self.core).offset + 1)
    }

    fn last_index(&self) -> StorageResult<u64> {
        Ok(read(&self.core).last)
    }

    fn snapshot(&self, request_index: u64) -> StorageResult<Snapshot> {
        let core = read(&self.core);
        if core.snapshot.metadata.index < request_index {
            return Err(StorageError::SnapshotTemporarilyUnavailable);
        }
        Ok(core.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use kith_types::Id;

    use super::*;

    fn ents(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range
            .map(|index| Entry {
                term,
                index,
                data: vec![index as u8],
                ..Default::default()
            })
            .collect()
    }

    fn storage() -> (Arc<Store>, EntityId, RaftStorage) {
        let db = Arc::new(kith_db::open_memory().expect("db"));
        let id = Id::random();
        let s = RaftStorage::clean(db.clone(), id).expect("clean");
        (db, id, s)
    }

    #[test]
    fn test_clean_storage() {
        let (_, _, s) = storage();
        assert_eq!(s.first_index().expect("first"), 1);
        assert_eq!(s.last_index().expect("last"), 0);
        assert_eq!(s.term(0).expect("term"), 0);
        assert!(s.entries(1, 1, None).expect("entries").is_empty());
    }

    #[test]
    fn test_append_overwrites_tail() {
        let (_, _, s) = storage();
        s.append(&ents(1..=5, 1)).expect("append");
        s.append(&ents(3..=4, 2)).expect("overwrite");
        assert_eq!(s.last_index().expect("last"), 4);
        assert_eq!(s.term(3).expect("term"), 2);
        assert_eq!(s.term(2).expect("term"), 1);
        assert!(matches!(s.term(5), Err(StorageError::Unavailable)));
        // A gap is refused.
        assert!(s.append(&ents(7..=8, 2)).is_err());
    }

    #[test]
    fn test_entries_and_limit() {
        let (_, _, s) = storage();
        s.append(&ents(1..=5, 1)).expect("append");
        let got = s.entries(2, 5, None).expect("entries");
        assert_eq!(got.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3, 4]);
        let one = s.entries(2, 5, Some(1)).expect("entries");
        assert_eq!(one.len(), 1);
        assert!(matches!(s.entries(0, 2, None), Err(StorageError::Compacted)));
        assert!(matches!(s.entries(2, 7, None), Err(StorageError::Unavailable)));
    }

    #[test]
    fn test_compact() {
        let (_, _, s) = storage();
        s.append(&ents(1..=5, 1)).expect("append");
        s.compact(3).expect("compact");
        assert_eq!(s.first_index().expect("first"), 4);
        assert_eq!(s.term(3).expect("term"), 1);
        assert!(matches!(s.term(2), Err(StorageError::Compacted)));
        assert!(matches!(s.compact(3), Err(StorageError::Compacted)));
        assert!(matches!(s.compact(9), Err(StorageError::Unavailable)));
        // Appending below the first index skips the compacted part.
        s.append(&ents(2..=6, 1)).expect("append");
        assert_eq!(s.last_index().expect("last"), 6);
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let (_, _, s) = storage();
        s.append(&ents(1..=5, 2)).expect("append");
        let snap = s.create_snapshot(4, None, b"state".to_vec()).expect("snapshot");
        assert_eq!(snap.metadata.term, 2);
        assert!(matches!(
            s.create_snapshot(3, None, Vec::new()),
            Err(StorageError::SnapshotOutOfDate)
        ));
        assert_eq!(s.snapshot(4).expect("snap").data, b"state".to_vec());
        assert!(matches!(
            s.snapshot(5),
            Err(StorageError::SnapshotTemporarilyUnavailable)
        ));

        let mut newer = Snapshot::default();
        newer.metadata.index = 10;
        newer.metadata.term = 3;
        newer.metadata.conf_state.voters.insert(7, 2_000);
        s.apply_snapshot(newer.clone()).expect("apply");
        assert_eq!(s.first_index().expect("first"), 11);
        assert_eq!(s.last_index().expect("last"), 10);
        assert_eq!(s.term(10).expect("term"), 3);
        assert_eq!(s.hard_state().commit, 10);
        assert_eq!(s.conf_state().total_weight(), 2_000);
        assert!(matches!(s.apply_snapshot(newer), Err(StorageError::SnapshotOutOfDate)));
    }

    #[test]
    fn test_resume() {
        let (db, id, s) = storage();
        s.append(&ents(1..=4, 1)).expect("append");
        s.set_hard_state(HardState { term: 1, vote: 9, commit: 3 }).expect("hs");
        let mut cs = ConfState::default();
        cs.voters.insert(9, 2);
        s.set_conf_state(cs.clone()).expect("cs");
        s.compact(2).expect("compact");

        let resumed = RaftStorage::resume(db.clone(), id).expect("resume");
        assert_eq!(resumed.first_index().expect("first"), 3);
        assert_eq!(resumed.last_index().expect("last"), 4);
        let state = resumed.initial_state().expect("state");
        assert_eq!(state.hard_state.vote, 9);
        assert_eq!(state.conf_state, cs);

        // Resuming an identity without a log starts clean.
        let fresh = RaftStorage::resume(db, Id::random()).expect("resume");
        assert_eq!(fresh.last_index().expect("last"), 0);
    }
}
