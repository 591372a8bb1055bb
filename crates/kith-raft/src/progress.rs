//! Replication progress of each peer and weighted tallies.

use std::collections::{BTreeMap, VecDeque};

use crate::message::ConfState;
use crate::quorum;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressState {
    /// Send one append at a time until the match point is found.
    #[default]
    Probe,
    /// Stream appends optimistically.
    Replicate,
    /// A snapshot is in flight.
    Snapshot,
}

/// Sliding window of in-flight append messages, by last index.
#[derive(Clone, Debug)]
pub struct Inflights {
    cap: usize,
    buffer: VecDeque<u64>,
}

impl Inflights {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buffer: VecDeque::with_capacity(cap),
        }
    }

    pub fn full(&self) -> bool {
        self.buffer.len() >= self.cap
    }

    pub fn add(&mut self, last: u64) {
        self.buffer.push_back(last);
    }

    /// Release every in-flight message up to `to`.
    pub fn free_to(&mut self, to: u64) {
        while matches!(self.buffer.front(), Some(idx) if *idx <= to) {
            self.buffer.pop_front();
        }
    }

    pub fn free_first_one(&mut self) {
        self.buffer.pop_front();
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn count(&self) -> usize {
        self.buffer.len()
    }
}

/// What the leader knows about one follower.
#[derive(Clone, Debug)]
pub struct Progress {
    pub matched: u64,
    pub next_idx: u64,
    pub state: ProgressState,
    /// In probe state, an append is outstanding.
    pub paused: bool,
    pub pending_snapshot: u64,
    /// Heard from since the last quorum check.
    pub recent_active: bool,
    pub ins: Inflights,
}

impl Progress {
    pub fn new(next_idx: u64, ins_size: usize) -> Self {
        Self {
            matched: 0,
            next_idx,
            state: ProgressState::Probe,
            paused: false,
            pending_snapshot: 0,
            recent_active: false,
            ins: Inflights::new(ins_size),
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.paused = false;
        self.pending_snapshot = 0;
        self.state = state;
        self.ins.reset();
    }

    pub fn become_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            let pending = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next_idx = (self.matched + 1).max(pending + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next_idx = self.matched + 1;
        }
    }

    pub fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next_idx = self.matched + 1;
    }

    pub fn become_snapshot(&mut self, snapshot_idx: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_idx;
    }

    /// Record an acknowledged index. Returns whether `matched` moved.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        let updated = self.matched < n;
        if updated {
            self.matched = n;
            self.resume();
        }
        self.next_idx = self.next_idx.max(n + 1);
        updated
    }

    pub fn optimistic_update(&mut self, n: u64) {
        self.next_idx = n + 1;
    }

    /// Back off after a rejected append at `rejected`.
    pub fn maybe_decr_to(&mut self, rejected: u64, match_hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            if rejected <= self.matched {
                return false;
            }
            self.next_idx = self.matched + 1;
            return true;
        }
        if self.next_idx == 0 || self.next_idx - 1 != rejected {
            return false;
        }
        self.next_idx = rejected.min(match_hint + 1).max(1);
        self.resume();
        true
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => self.ins.full(),
            ProgressState::Snapshot => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteResult {
    Pending,
    Lost,
    Won,
}

/// Voters with their weights, progress of every peer and the current tally.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    voters: BTreeMap<u64, u32>,
    progress: BTreeMap<u64, Progress>,
    votes: BTreeMap<u64, bool>,
    max_inflight: usize,
}

impl ProgressTracker {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            voters: BTreeMap::new(),
            progress: BTreeMap::new(),
            votes: BTreeMap::new(),
            max_inflight,
        }
    }

    pub fn conf_state(&self) -> ConfState {
        ConfState {
            voters: self.voters.clone(),
        }
    }

    pub fn voters(&self) -> &BTreeMap<u64, u32> {
        &self.voters
    }

    pub fn weight(&self, id: u64) -> Option<u32> {
        self.voters.get(&id).copied()
    }

    pub fn total_weight(&self) -> u64 {
        self.voters.values().map(|w| u64::from(*w)).sum()
    }

    pub fn quorum(&self) -> u64 {
        quorum(self.total_weight())
    }

    pub fn get(&self, id: u64) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.progress.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Progress)> {
        self.progress.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut Progress)> {
        self.progress.iter_mut()
    }

    /// Add a voter, or change its weight if present.
    pub fn upsert(&mut self, id: u64, weight: u32, next_idx: u64) {
        self.voters.insert(id, weight);
        let max_inflight = self.max_inflight;
        self.progress.entry(id).or_insert_with(|| {
            let mut pr = Progress::new(next_idx, max_inflight);
            pr.recent_active = true;
            pr
        });
    }

    pub fn remove(&mut self, id: u64) {
        self.voters.remove(&id);
        self.progress.remove(&id);
        self.votes.remove(&id);
    }

    /// Replace the configuration, keeping progress of surviving peers.
    pub fn apply_conf(&mut self, cs: &ConfState, next_idx: u64) {
        self.progress.retain(|id, _| cs.voters.contains_key(id));
        self.votes.retain(|id, _| cs.voters.contains_key(id));
        self.voters.clear();
        for (id, weight) in &cs.voters {
            self.upsert(*id, *weight, next_idx);
        }
    }

    /// Highest index replicated on voters holding a quorum of weight.
    pub fn committed(&self) -> u64 {
        let total = self.total_weight();
        if total == 0 {
            return 0;
        }
        let need = quorum(total);
        let mut matched: Vec<(u64, u64)> = self
            .voters
            .iter()
            .filter(|(_, w)| **w > 0)
            .map(|(id, w)| (self.progress.get(id).map(|p| p.matched).unwrap_or(0), u64::from(*w)))
            .collect();
        matched.sort_by(|a, b| b.0.cmp(&a.0));
        let mut acc = 0u64;
        for (idx, weight) in matched {
            acc += weight;
            if acc >= need {
                return idx;
            }
        }
        0
    }

    pub fn reset_votes(&mut self) {
        self.votes.clear();
    }

    pub fn record_vote(&mut self, id: u64, granted: bool) {
        self.votes.entry(id).or_insert(granted);
    }

    /// Granted and rejected weight so far.
    pub fn tally_votes(&self) -> (u64, u64) {
        let mut granted = 0u64;
        let mut rejected = 0u64;
        for (id, vote) in &self.votes {
            let Some(weight) = self.voters.get(id) else {
                continue;
            };
            if *vote {
                granted += u64::from(*weight);
            } else {
                rejected += u64::from(*weight);
            }
        }
        (granted, rejected)
    }

    pub fn vote_result(&self) -> VoteResult {
        let total = self.total_weight();
        if total == 0 {
            return VoteResult::Lost;
        }
        let need = quorum(total);
        let (granted, rejected) = self.tally_votes();
        if granted >= need {
            VoteResult::Won
        } else if total - rejected < need {
            VoteResult::Lost
        } else {
            VoteResult::Pending
        }
    }

    /// Whether voters heard from recently hold a quorum. `self_id` counts as active.
    pub fn quorum_active(&self, self_id: u64) -> bool {
        let active: u64 = self
            .voters
            .iter()
            .filter(|(id, _)| **id == self_id || self.progress.get(id).map(|p| p.recent_active).unwrap_or(false))
            .map(|(_, w)| u64::from(*w))
            .sum();
        active >= self.quorum()
    }
}
