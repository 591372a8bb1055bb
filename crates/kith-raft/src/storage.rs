//! Log storage.
//!
//! The stable part of the log lives behind [`Storage`]. Implementations keep
//! a dummy entry at the compaction point: `first_index` is one past it and
//! `term(first_index - 1)` is still answerable.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message::{ConfState, Entry, HardState, Snapshot};
use crate::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// State recovered when a node restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaftState {
    pub hard_state: HardState,
    pub conf_state: ConfState,
}

/// Read access to the stable log.
pub trait Storage {
    fn initial_state(&self) -> StorageResult<RaftState>;

    /// Entries in `[low, high)`, trimmed to `max_size` bytes (at least one entry).
    fn entries(&self, low: u64, high: u64, max_size: Option<u64>) -> StorageResult<Vec<Entry>>;

    /// Term of the entry at `idx`; `first_index - 1` is allowed.
    fn term(&self, idx: u64) -> StorageResult<u64>;

    fn first_index(&self) -> StorageResult<u64>;

    fn last_index(&self) -> StorageResult<u64>;

    /// Most recent snapshot covering at least `request_index` when possible.
    fn snapshot(&self, request_index: u64) -> StorageResult<Snapshot>;
}

/// Keep a prefix of `entries` whose total size stays within `max_size`.
pub fn limit_size(entries: &mut Vec<Entry>, max_size: Option<u64>) {
    let Some(max) = max_size else {
        return;
    };
    if entries.len() <= 1 {
        return;
    }
    let mut size = 0u64;
    let keep = entries
        .iter()
        .take_while(|e| {
            if size == 0 {
                size += e.size();
                return true;
            }
            size += e.size();
            size <= max
        })
        .count();
    entries.truncate(keep);
}

/// The in-memory log behind a [`MemStorage`].
#[derive(Debug)]
pub struct MemStorageCore {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    // entries[0] is the dummy entry at the compaction point.
    entries: Vec<Entry>,
}

impl Default for MemStorageCore {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            conf_state: ConfState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
        }
    }
}

impl MemStorageCore {
    fn offset(&self) -> u64 {
        self.entries.first().map(|e| e.index).unwrap_or_default()
    }

    fn last(&self) -> u64 {
        self.offset() + self.entries.len() as u64 - 1
    }

    pub fn set_hard_state(&mut self, hs: HardState) {
        self.hard_state = hs;
    }

    pub fn set_conf_state(&mut self, cs: ConfState) {
        self.conf_state = cs;
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state
    }

    /// Replace the log with `snapshot`. Refuses older snapshots.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> StorageResult<()> {
        if self.snapshot.metadata.index >= snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        let meta = &snapshot.metadata;
        self.entries = vec![Entry {
            term: meta.term,
            index: meta.index,
            ..Default::default()
        }];
        self.hard_state.commit = self.hard_state.commit.max(meta.index);
        self.hard_state.term = self.hard_state.term.max(meta.term);
        self.conf_state = meta.conf_state.clone();
        self.snapshot = snapshot;
        Ok(())
    }

    /// Record a snapshot at `index` (which must be in the log).
    pub fn create_snapshot(&mut self, index: u64, cs: Option<ConfState>, data: Vec<u8>) -> StorageResult<Snapshot> {
        if index <= self.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        if index > self.last() {
            return Err(StorageError::Unavailable);
        }
        let term = self.entries[(index - self.offset()) as usize].term;
        self.snapshot = Snapshot {
            data,
            metadata: crate::SnapshotMetadata {
                conf_state: cs.unwrap_or_else(|| self.conf_state.clone()),
                index,
                term,
            },
        };
        Ok(self.snapshot.clone())
    }

    /// Discard entries before `compact_index`.
    pub fn compact(&mut self, compact_index: u64) -> StorageResult<()> {
        let offset = self.offset();
        if compact_index <= offset {
            return Err(StorageError::Compacted);
        }
        if compact_index > self.last() {
            return Err(StorageError::Unavailable);
        }
        let i = (compact_index - offset) as usize;
        let dummy = Entry {
            term: self.entries[i].term,
            index: self.entries[i].index,
            ..Default::default()
        };
        let mut rest = self.entries.split_off(i + 1);
        self.entries = Vec::with_capacity(rest.len() + 1);
        self.entries.push(dummy);
        self.entries.append(&mut rest);
        Ok(())
    }

    /// Append entries, overwriting any conflicting tail.
    pub fn append(&mut self, entries: &[Entry]) -> StorageResult<()> {
        let Some(first_new) = entries.first().map(|e| e.index) else {
            return Ok(());
        };
        let first = self.offset() + 1;
        let last_new = first_new + entries.len() as u64 - 1;
        if last_new < first {
            return Ok(());
        }
        let entries = if first > first_new {
            &entries[(first - first_new) as usize..]
        } else {
            entries
        };
        let Some(start) = entries.first().map(|e| e.index) else {
            return Ok(());
        };
        let offset = start - self.offset();
        if (self.entries.len() as u64) > offset {
            self.entries.truncate(offset as usize);
            self.entries.extend_from_slice(entries);
        } else if self.entries.len() as u64 == offset {
            self.entries.extend_from_slice(entries);
        } else {
            return Err(StorageError::Other(format!(
                "missing log entry [last: {}, append at: {}]",
                self.last(),
                start
            )));
        }
        Ok(())
    }
}

/// Thread-safe in-memory [`Storage`]. Cloning shares the log.
#[derive(Clone, Debug, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose conf state already lists `voters`, as left by a snapshot.
    pub fn new_with_conf_state(cs: ConfState) -> Self {
        let store = Self::new();
        if let Ok(mut core) = store.core.write() {
            core.conf_state = cs;
        }
        store
    }

    pub fn rl(&self) -> StorageResult<RwLockReadGuard<'_, MemStorageCore>> {
        self.core
            .read()
            .map_err(|_| StorageError::Other("storage lock poisoned".into()))
    }

    pub fn wl(&self) -> StorageResult<RwLockWriteGuard<'_, MemStorageCore>> {
        self.core
            .write()
            .map_err(|_| StorageError::Other("storage lock poisoned".into()))
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> StorageResult<RaftState> {
        let core = self.rl()?;
        Ok(RaftState {
            hard_state: core.hard_state,
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(&self, low: u64, high: u64, max_size: Option<u64>) -> StorageResult<Vec<Entry>> {
        let core = self.rl()?;
        let offset = core.offset();
        if low <= offset {
            return Err(StorageError::Compacted);
        }
        if high > core.last() + 1 {
            return Err(StorageError::Unavailable);
        }
        let mut ents = core.entries[(low - offset) as usize..(high - offset) as usize].to_vec();
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    fn term(&self, idx: u64) -> StorageResult<u64> {
        let core = self.rl()?;
        let offset = core.offset();
        if idx < offset {
            return Err(StorageError::Compacted);
        }
        if idx > core.last() {
            return Err(StorageError::Unavailable);
        }
        Ok(core.entries[(idx - offset) as usize].term)
    }

    fn first_index(&self) -> StorageResult<u64> {
        Ok(self.rl()?.offset() + 1)
    }

    fn last_index(&self) -> StorageResult<u64> {
        Ok(self.rl()?.last())
    }

    fn snapshot(&self, _request_index: u64) -> StorageResult<Snapshot> {
        Ok(self.rl()?.snapshot.clone())
    }
}
