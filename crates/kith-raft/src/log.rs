//! The replicated log: stable entries in [`Storage`] followed by entries
//! (and possibly a snapshot) not yet persisted.

use crate::message::{Entry, Snapshot};
use crate::storage::{limit_size, Storage};
use crate::{RaftError, Result, StorageError};

/// Entries and snapshot received but not yet handed to storage.
#[derive(Debug, Default)]
pub struct Unstable {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<Entry>,
    /// Index of `entries[0]`.
    pub offset: u64,
}

impl Unstable {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }

    fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.metadata.index + 1)
    }

    fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.metadata.index)
    }

    fn maybe_term(&self, idx: u64) -> Option<u64> {
        if idx < self.offset {
            let snapshot = self.snapshot.as_ref()?;
            return (snapshot.metadata.index == idx).then_some(snapshot.metadata.term);
        }
        let last = self.maybe_last_index()?;
        if idx > last {
            return None;
        }
        self.entries.get((idx - self.offset) as usize).map(|e| e.term)
    }

    fn stable_to(&mut self, idx: u64, term: u64) {
        let Some(t) = self.maybe_term(idx) else {
            return;
        };
        if t == term && idx >= self.offset {
            let n = (idx + 1 - self.offset) as usize;
            self.entries.drain(..n.min(self.entries.len()));
            self.offset = idx + 1;
        }
    }

    fn stable_snap_to(&mut self, idx: u64) {
        if matches!(&self.snapshot, Some(s) if s.metadata.index == idx) {
            self.snapshot = None;
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.entries.clear();
        self.offset = snapshot.metadata.index + 1;
        self.snapshot = Some(snapshot);
    }

    fn truncate_and_append(&mut self, ents: &[Entry]) {
        let Some(after) = ents.first().map(|e| e.index) else {
            return;
        };
        if after == self.offset + self.entries.len() as u64 {
            self.entries.extend_from_slice(ents);
        } else if after <= self.offset {
            self.offset = after;
            self.entries = ents.to_vec();
        } else {
            self.entries.truncate((after - self.offset) as usize);
            self.entries.extend_from_slice(ents);
        }
    }

    fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        let lo = (lo - self.offset) as usize;
        let hi = ((hi - self.offset) as usize).min(self.entries.len());
        &self.entries[lo.min(hi)..hi]
    }
}

/// The log of one raft node.
pub struct RaftLog<S: Storage> {
    pub store: S,
    pub unstable: Unstable,
    /// Highest index known to be committed.
    pub committed: u64,
    /// Highest index handed to the application.
    pub applied: u64,
}

impl<S: Storage> RaftLog<S> {
    pub fn new(store: S) -> Result<Self> {
        let first = store.first_index()?;
        let last = store.last_index()?;
        Ok(Self {
            store,
            unstable: Unstable::new(last + 1),
            committed: first - 1,
            applied: first - 1,
        })
    }

    pub fn first_index(&self) -> Result<u64> {
        match self.unstable.maybe_first_index() {
            Some(idx) => Ok(idx),
            None => Ok(self.store.first_index()?),
        }
    }

    pub fn last_index(&self) -> Result<u64> {
        match self.unstable.maybe_last_index() {
            Some(idx) => Ok(idx),
            None => Ok(self.store.last_index()?),
        }
    }

    pub fn term(&self, idx: u64) -> Result<u64> {
        let dummy = self.first_index()? - 1;
        if idx < dummy || idx > self.last_index()? {
            return Ok(0);
        }
        if let Some(term) = self.unstable.maybe_term(idx) {
            return Ok(term);
        }
        match self.store.term(idx) {
            Ok(term) => Ok(term),
            Err(StorageError::Compacted) | Err(StorageError::Unavailable) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn last_term(&self) -> Result<u64> {
        self.term(self.last_index()?)
    }

    pub fn match_term(&self, idx: u64, term: u64) -> bool {
        matches!(self.term(idx), Ok(t) if t == term)
    }

    /// Whether a candidate log ending at `(last_index, term)` is at least as
    /// up to date as ours.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> Result<bool> {
        let our_term = self.last_term()?;
        Ok(term > our_term || (term == our_term && last_index >= self.last_index()?))
    }

    /// Index of the first entry in `ents` that conflicts with the log, or 0.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        ents.iter()
            .find(|e| !self.match_term(e.index, e.term))
            .map(|e| e.index)
            .unwrap_or(0)
    }

    /// Append leader entries after `(idx, term)`. Returns the new last index
    /// when the log matched, `None` when the leader must back off.
    pub fn maybe_append(&mut self, idx: u64, term: u64, committed: u64, ents: &[Entry]) -> Result<Option<u64>> {
        if !self.match_term(idx, term) {
            return Ok(None);
        }
        let last_new = idx + ents.len() as u64;
        let conflict = self.find_conflict(ents);
        if conflict != 0 {
            if conflict <= self.committed {
                return Err(RaftError::Corrupted(format!(
                    "entry {conflict} conflicts with committed entry [committed({})]",
                    self.committed
                )));
            }
            let start = (conflict - (idx + 1)) as usize;
            self.append(&ents[start..])?;
        }
        self.commit_to(committed.min(last_new))?;
        Ok(Some(last_new))
    }

    /// Append to the unstable tail. Returns the new last index.
    pub fn append(&mut self, ents: &[Entry]) -> Result<u64> {
        let Some(first) = ents.first() else {
            return self.last_index();
        };
        let after = first.index - 1;
        if after < self.committed {
            return Err(RaftError::Corrupted(format!(
                "append after {after} is below committed({})",
                self.committed
            )));
        }
        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    pub fn commit_to(&mut self, to_commit: u64) -> Result<()> {
        if self.committed < to_commit {
            let last = self.last_index()?;
            if last < to_commit {
                return Err(RaftError::Corrupted(format!(
                    "commit({to_commit}) is out of range [last_index({last})]"
                )));
            }
            self.committed = to_commit;
        }
        Ok(())
    }

    pub fn applied_to(&mut self, idx: u64) {
        if idx == 0 || idx < self.applied {
            return;
        }
        self.applied = idx.min(self.committed);
    }

    pub fn stable_to(&mut self, idx: u64, term: u64) {
        self.unstable.stable_to(idx, term);
    }

    pub fn stable_snap_to(&mut self, idx: u64) {
        self.unstable.stable_snap_to(idx);
    }

    /// Advance the commit index to `max_index` if it belongs to `term`.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> Result<bool> {
        if max_index > self.committed && self.term(max_index)? == term {
            self.commit_to(max_index)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.committed = snapshot.metadata.index;
        self.unstable.restore(snapshot);
    }

    pub fn unstable_entries(&self) -> &[Entry] {
        &self.unstable.entries
    }

    pub fn has_next_committed_entries(&self) -> bool {
        let first = self.first_index().unwrap_or(1);
        self.committed > self.applied.max(first.saturating_sub(1))
    }

    /// Committed entries not yet applied.
    pub fn next_committed_entries(&self, max_size: Option<u64>) -> Result<Vec<Entry>> {
        let lo = (self.applied + 1).max(self.first_index()?);
        if self.committed + 1 > lo {
            return self.slice(lo, self.committed + 1, max_size);
        }
        Ok(Vec::new())
    }

    /// Entries from `idx` to the end of the log.
    pub fn entries(&self, idx: u64, max_size: Option<u64>) -> Result<Vec<Entry>> {
        let last = self.last_index()?;
        if idx > last {
            return Ok(Vec::new());
        }
        self.slice(idx, last + 1, max_size)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        if let Some(snapshot) = &self.unstable.snapshot {
            return Ok(snapshot.clone());
        }
        Ok(self.store.snapshot(self.applied)?)
    }

    /// Entries in `[lo, hi)`.
    pub fn slice(&self, lo: u64, hi: u64, max_size: Option<u64>) -> Result<Vec<Entry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let first = self.first_index()?;
        if lo < first {
            return Err(StorageError::Compacted.into());
        }
        let last = self.last_index()?;
        if hi > last + 1 {
            return Err(StorageError::Unavailable.into());
        }
        let mut ents = Vec::new();
        if lo < self.unstable.offset {
            let stored = self.store.entries(lo, hi.min(self.unstable.offset), max_size)?;
            let complete = stored.len() as u64 == hi.min(self.unstable.offset) - lo;
            ents = stored;
            if !complete {
                return Ok(ents);
            }
        }
        if hi > self.unstable.offset {
            let from = lo.max(self.unstable.offset);
            ents.extend_from_slice(self.unstable.slice(from, hi));
        }
        limit_size(&mut ents, max_size);
        Ok(ents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn ent(index: u64, term: u64) -> Entry {
        Entry {
            index,
            term,
            ..Default::default()
        }
    }

    fn log_with(entries: &[Entry]) -> RaftLog<MemStorage> {
        let store = MemStorage::new();
        store.wl().expect("lock").append(entries).expect("append");
        RaftLog::new(store).expect("log")
    }

    #[test]
    fn test_new_log_bounds() {
        let log = log_with(&[ent(1, 1), ent(2, 1)]);
        assert_eq!(log.first_index().expect("first"), 1);
        assert_eq!(log.last_index().expect("last"), 2);
        assert_eq!(log.committed, 0);
        assert_eq!(log.unstable.offset, 3);
    }

    #[test]
    fn test_append_and_stable() {
        let mut log = log_with(&[ent(1, 1)]);
        assert_eq!(log.append(&[ent(2, 2), ent(3, 2)]).expect("append"), 3);
        assert_eq!(log.unstable_entries().len(), 2);
        log.stable_to(3, 2);
        assert!(log.unstable_entries().is_empty());
        assert_eq!(log.unstable.offset, 4);
    }

    #[test]
    fn test_maybe_append_rejects_mismatch() {
        let mut log = log_with(&[ent(1, 1), ent(2, 1)]);
        assert_eq!(log.maybe_append(2, 2, 0, &[ent(3, 2)]).expect("append"), None);
        assert_eq!(log.maybe_append(2, 1, 3, &[ent(3, 2)]).expect("append"), Some(3));
        assert_eq!(log.committed, 3);
    }

    #[test]
    fn test_conflict_truncates_unstable() {
        let mut log = log_with(&[ent(1, 1)]);
        log.append(&[ent(2, 1), ent(3, 1)]).expect("append");
        assert_eq!(log.maybe_append(1, 1, 0, &[ent(2, 2)]).expect("append"), Some(2));
        assert_eq!(log.last_index().expect("last"), 2);
        assert_eq!(log.term(2).expect("term"), 2);
    }

    #[test]
    fn test_conflict_with_committed_is_corruption() {
        let mut log = log_with(&[ent(1, 1), ent(2, 1)]);
        log.commit_to(2).expect("commit");
        assert!(log.maybe_append(1, 1, 2, &[ent(2, 3)]).is_err());
    }

    #[test]
    fn test_next_committed_entries() {
        let mut log = log_with(&[ent(1, 1), ent(2, 1)]);
        log.append(&[ent(3, 1)]).expect("append");
        log.commit_to(3).expect("commit");
        let ents = log.next_committed_entries(None).expect("entries");
        assert_eq!(ents.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        log.applied_to(2);
        assert_eq!(log.next_committed_entries(None).expect("entries").len(), 1);
        assert!(log.has_next_committed_entries());
        log.applied_to(3);
        assert!(!log.has_next_committed_entries());
    }

    #[test]
    fn test_up_to_date() {
        let log = log_with(&[ent(1, 1), ent(2, 2)]);
        assert!(log.is_up_to_date(2, 2).expect("check"));
        assert!(log.is_up_to_date(1, 3).expect("check"));
        assert!(!log.is_up_to_date(1, 2).expect("check"));
        assert!(!log.is_up_to_date(5, 1).expect("check"));
    }

    #[test]
    fn test_commit_out_of_range() {
        let mut log = log_with(&[ent(1, 1)]);
        assert!(log.commit_to(5).is_err());
    }

    #[test]
    fn test_restore_snapshot() {
        let mut log = log_with(&[ent(1, 1)]);
        let mut snap = Snapshot::default();
        snap.metadata.index = 10;
        snap.metadata.term = 3;
        log.restore(snap);
        assert_eq!(log.committed, 10);
        assert_eq!(log.first_index().expect("first"), 11);
        assert_eq!(log.last_index().expect("last"), 10);
        assert_eq!(log.term(10).expect("term"), 3);
    }
}
