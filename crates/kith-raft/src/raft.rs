//! The raft role state machine.
//!
//! [`Raft`] consumes messages through [`Raft::step`] and time through
//! [`Raft::tick`]; outgoing messages accumulate in `msgs`. Votes and commits
//! are tallied by weight through the [`ProgressTracker`].

use rand::Rng;
use tracing::{debug, info, warn};

use crate::log::RaftLog;
use crate::message::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType, Snapshot,
    CAMPAIGN_TRANSFER,
};
use crate::progress::{ProgressState, ProgressTracker, VoteResult};
use crate::storage::Storage;
use crate::{Config, RaftError, Result, StorageError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StateRole {
    #[default]
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

/// Volatile state worth reporting to the application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftState {
    pub lead: u64,
    pub raft_state: StateRole,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CampaignType {
    PreElection,
    Election,
    Transfer,
}

pub struct Raft<S: Storage> {
    pub id: u64,
    pub term: u64,
    pub vote: u64,
    pub raft_log: RaftLog<S>,
    pub state: StateRole,
    /// Known leader, 0 when none.
    pub lead: u64,
    /// Outgoing messages, drained by the driver.
    pub msgs: Vec<Message>,
    pub lead_transferee: Option<u64>,
    /// Index of the latest conf change proposed by this leader.
    pub pending_conf_index: u64,
    prs: ProgressTracker,
    election_elapsed: usize,
    heartbeat_elapsed: usize,
    election_timeout: usize,
    heartbeat_timeout: usize,
    randomized_election_timeout: usize,
    check_quorum: bool,
    pre_vote: bool,
    max_msg_size: u64,
    max_inflight: usize,
}

impl<S: Storage> Raft<S> {
    pub fn new(config: &Config, store: S) -> Result<Self> {
        config.validate()?;
        let rs = store.initial_state()?;
        let raft_log = RaftLog::new(store)?;
        let mut prs = ProgressTracker::new(config.max_inflight_msgs);
        let next_idx = raft_log.last_index()? + 1;
        prs.apply_conf(&rs.conf_state, next_idx);

        let mut r = Raft {
            id: config.id,
            term: 0,
            vote: 0,
            raft_log,
            state: StateRole::Follower,
            lead: 0,
            msgs: Vec::new(),
            lead_transferee: None,
            pending_conf_index: 0,
            prs,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_timeout: config.election_tick,
            heartbeat_timeout: config.heartbeat_tick,
            randomized_election_timeout: 0,
            check_quorum: config.check_quorum,
            pre_vote: config.pre_vote,
            max_msg_size: config.max_size_per_msg,
            max_inflight: config.max_inflight_msgs,
        };
        if !rs.hard_state.is_empty() {
            r.load_state(&rs.hard_state)?;
        }
        if config.applied > 0 {
            if config.applied > r.raft_log.committed {
                return Err(RaftError::ConfigInvalid(format!(
                    "applied {} is out of range [0, {}]",
                    config.applied, r.raft_log.committed
                )));
            }
            r.raft_log.applied_to(config.applied);
        }
        let term = r.term;
        r.become_follower(term, 0);
        info!(
            raft_id = r.id,
            term = r.term,
            commit = r.raft_log.committed,
            applied = r.raft_log.applied,
            total_weight = r.prs.total_weight(),
            "raft node created"
        );
        Ok(r)
    }

    fn load_state(&mut self, hs: &HardState) -> Result<()> {
        let last = self.raft_log.last_index()?;
        if hs.commit < self.raft_log.committed || hs.commit > last {
            return Err(RaftError::Corrupted(format!(
                "hard state commit {} is out of range [{}, {}]",
                hs.commit, self.raft_log.committed, last
            )));
        }
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
        Ok(())
    }

    pub fn prs(&self) -> &ProgressTracker {
        &self.prs
    }

    pub fn soft_state(&self) -> SoftState {
        SoftState {
            lead: self.lead,
            raft_state: self.state,
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
        }
    }

    /// Whether this node may campaign: it must be a voter with weight.
    pub fn promotable(&self) -> bool {
        self.prs.weight(self.id).is_some_and(|w| w > 0)
    }

    /// Seed an empty log with a membership of `peers` at term 1.
    pub fn bootstrap(&mut self, peers: &[ConfChange]) -> Result<()> {
        if peers.is_empty() {
            return Err(RaftError::ConfigInvalid("must provide at least one peer".into()));
        }
        if self.raft_log.last_index()? != 0 {
            return Err(RaftError::ConfigInvalid("can't bootstrap a nonempty log".into()));
        }
        self.become_follower(1, 0);
        let mut ents = Vec::with_capacity(peers.len());
        for (i, cc) in peers.iter().enumerate() {
            if cc.change_type != ConfChangeType::AddNode {
                return Err(RaftError::ConfigInvalid("bootstrap peers must be added".into()));
            }
            let mut e = Entry::conf_change(cc)?;
            e.term = 1;
            e.index = i as u64 + 1;
            ents.push(e);
        }
        self.raft_log.append(&ents)?;
        self.raft_log.committed = ents.len() as u64;
        let next_idx = self.raft_log.last_index()? + 1;
        for cc in peers {
            self.prs.upsert(cc.node_id, cc.weight, next_idx);
        }
        info!(raft_id = self.id, peers = peers.len(), "raft log bootstrapped");
        Ok(())
    }

    // ---- roles -------------------------------------------------------------

    fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = 0;
        }
        self.lead = 0;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.abort_leader_transfer();
        self.prs.reset_votes();
        self.pending_conf_index = 0;

        let last = self.raft_log.last_index().unwrap_or(0);
        let self_id = self.id;
        let max_inflight = self.max_inflight;
        for (id, pr) in self.prs.iter_mut() {
            *pr = crate::progress::Progress::new(last + 1, max_inflight);
            if *id == self_id {
                pr.matched = last;
            }
        }
    }

    fn reset_randomized_election_timeout(&mut self) {
        let lo = self.election_timeout;
        self.randomized_election_timeout = rand::thread_rng().gen_range(lo..2 * lo);
    }

    pub fn become_follower(&mut self, term: u64, lead: u64) {
        self.reset(term);
        self.lead = lead;
        self.state = StateRole::Follower;
        debug!(raft_id = self.id, term, lead, "became follower");
    }

    fn become_pre_candidate(&mut self) {
        // Neither term nor vote change until the pre-vote is won.
        self.state = StateRole::PreCandidate;
        self.prs.reset_votes();
        self.lead = 0;
        info!(raft_id = self.id, term = self.term, "became pre-candidate");
    }

    fn become_candidate(&mut self) {
        let term = self.term + 1;
        self.reset(term);
        self.vote = self.id;
        self.state = StateRole::Candidate;
        info!(raft_id = self.id, term, "became candidate");
    }

    fn become_leader(&mut self) -> Result<()> {
        let term = self.term;
        self.reset(term);
        self.lead = self.id;
        self.state = StateRole::Leader;
        let last = self.raft_log.last_index()?;
        if let Some(pr) = self.prs.get_mut(self.id) {
            pr.become_replicate();
        }
        self.pending_conf_index = last;
        // A fully committed log needs no entry from the new term.
        if self.raft_log.committed < last {
            self.append_entry(&mut [Entry::default()])?;
        }
        info!(raft_id = self.id, term, "became leader");
        Ok(())
    }

    // ---- ticks -------------------------------------------------------------

    pub fn tick(&mut self) -> Result<()> {
        match self.state {
            StateRole::Leader => self.tick_heartbeat(),
            _ => self.tick_election(),
        }
    }

    fn tick_election(&mut self) -> Result<()> {
        self.election_elapsed += 1;
        if self.promotable() && self.election_elapsed >= self.randomized_election_timeout {
            self.election_elapsed = 0;
            return self.step(Message::new(MessageType::Hup, 0, self.id));
        }
        Ok(())
    }

    fn tick_heartbeat(&mut self) -> Result<()> {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                self.step(Message::new(MessageType::CheckQuorum, 0, self.id))?;
            }
            if self.state == StateRole::Leader && self.lead_transferee.is_some() {
                self.abort_leader_transfer();
            }
        }
        if self.state != StateRole::Leader {
            return Ok(());
        }
        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            self.step(Message::new(MessageType::Beat, 0, self.id))?;
        }
        Ok(())
    }

    // ---- elections ---------------------------------------------------------

    fn has_unapplied_conf_changes(&self) -> Result<bool> {
        if self.raft_log.applied >= self.raft_log.committed {
            return Ok(false);
        }
        let ents = self
            .raft_log
            .slice(self.raft_log.applied + 1, self.raft_log.committed + 1, None)?;
        Ok(ents.iter().any(|e| e.entry_type == EntryType::ConfChange))
    }

    /// Whether a `Hup` would start an election now.
    ///
    /// False until every committed conf change was handed out as applied.
    pub fn can_campaign(&self) -> Result<bool> {
        Ok(self.state != StateRole::Leader && self.promotable() && !self.has_unapplied_conf_changes()?)
    }

    fn hup(&mut self, transfer: bool) -> Result<()> {
        if self.state == StateRole::Leader {
            debug!(raft_id = self.id, "ignoring hup, already leader");
            return Ok(());
        }
        if !self.promotable() {
            warn!(raft_id = self.id, "not promotable, cannot campaign");
            return Ok(());
        }
        if self.has_unapplied_conf_changes()? {
            warn!(
                raft_id = self.id,
                term = self.term,
                "cannot campaign, pending configuration changes to apply"
            );
            return Ok(());
        }
        info!(raft_id = self.id, term = self.term, "starting a new election");
        if transfer {
            self.campaign(CampaignType::Transfer)
        } else if self.pre_vote {
            self.campaign(CampaignType::PreElection)
        } else {
            self.campaign(CampaignType::Election)
        }
    }

    fn campaign(&mut self, t: CampaignType) -> Result<()> {
        let (vote_msg, term) = if t == CampaignType::PreElection {
            self.become_pre_candidate();
            (MessageType::RequestPreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::RequestVote, self.term)
        };
        let self_id = self.id;
        if self.poll(self_id, true) == VoteResult::Won {
            // Single voter holding a quorum on its own.
            return if t == CampaignType::PreElection {
                self.campaign(CampaignType::Election)
            } else {
                self.become_leader()?;
                self.bcast_append()
            };
        }
        let last_index = self.raft_log.last_index()?;
        let last_term = self.raft_log.last_term()?;
        let voters: Vec<u64> = self.prs.voters().keys().copied().filter(|id| *id != self_id).collect();
        for id in voters {
            info!(
                raft_id = self_id,
                to = id,
                term,
                msg = ?vote_msg,
                "sent vote request"
            );
            let mut m = Message::new(vote_msg, id, self_id);
            m.term = term;
            m.index = last_index;
            m.log_term = last_term;
            if t == CampaignType::Transfer {
                m.context = CAMPAIGN_TRANSFER.to_vec();
            }
            self.send(m);
        }
        Ok(())
    }

    fn poll(&mut self, id: u64, granted: bool) -> VoteResult {
        self.prs.record_vote(id, granted);
        self.prs.vote_result()
    }

    // ---- step --------------------------------------------------------------

    pub fn step(&mut self, m: Message) -> Result<()> {
        if m.term == 0 {
            // local message
        } else if m.term > self.term {
            if matches!(m.msg_type, MessageType::RequestVote | MessageType::RequestPreVote) {
                let force = m.context == CAMPAIGN_TRANSFER;
                let in_lease = self.check_quorum && self.lead != 0 && self.election_elapsed < self.election_timeout;
                if !force && in_lease {
                    info!(
                        raft_id = self.id,
                        from = m.from,
                        term = self.term,
                        msg_term = m.term,
                        "ignored vote request within lease"
                    );
                    return Ok(());
                }
            }
            match m.msg_type {
                MessageType::RequestPreVote => {}
                MessageType::RequestPreVoteResponse if !m.reject => {}
                MessageType::Append | MessageType::Heartbeat | MessageType::Snapshot => {
                    self.become_follower(m.term, m.from);
                }
                _ => self.become_follower(m.term, 0),
            }
        } else if m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && matches!(m.msg_type, MessageType::Heartbeat | MessageType::Append)
            {
                // Let a partitioned old leader learn the newer term.
                self.send(Message::new(MessageType::AppendResponse, m.from, self.id));
            } else if m.msg_type == MessageType::RequestPreVote {
                let mut resp = Message::new(MessageType::RequestPreVoteResponse, m.from, self.id);
                resp.term = self.term;
                resp.reject = true;
                self.send(resp);
            } else {
                debug!(
                    raft_id = self.id,
                    from = m.from,
                    msg = ?m.msg_type,
                    msg_term = m.term,
                    term = self.term,
                    "ignored message with lower term"
                );
            }
            return Ok(());
        }

        match m.msg_type {
            MessageType::Hup => self.hup(false),
            MessageType::RequestVote | MessageType::RequestPreVote => self.handle_vote_request(m),
            _ => match self.state {
                StateRole::Leader => self.step_leader(m),
                StateRole::Candidate | StateRole::PreCandidate => self.step_candidate(m),
                StateRole::Follower => self.step_follower(m),
            },
        }
    }

    fn handle_vote_request(&mut self, m: Message) -> Result<()> {
        let can_vote = self.vote == m.from
            || (self.vote == 0 && self.lead == 0)
            || (m.msg_type == MessageType::RequestPreVote && m.term > self.term);
        let mut resp = Message::new(m.msg_type.vote_response(), m.from, self.id);
        if can_vote && self.raft_log.is_up_to_date(m.index, m.log_term)? {
            info!(raft_id = self.id, to = m.from, term = m.term, msg = ?m.msg_type, "cast vote");
            resp.term = m.term;
            self.send(resp);
            if m.msg_type == MessageType::RequestVote {
                self.election_elapsed = 0;
                self.vote = m.from;
            }
        } else {
            info!(raft_id = self.id, to = m.from, term = m.term, msg = ?m.msg_type, "rejected vote");
            resp.term = self.term;
            resp.reject = true;
            self.send(resp);
        }
        Ok(())
    }

    fn step_leader(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::Beat => return self.bcast_heartbeat(),
            MessageType::CheckQuorum => {
                if !self.prs.quorum_active(self.id) {
                    warn!(raft_id = self.id, term = self.term, "stepped down, quorum is not active");
                    let term = self.term;
                    self.become_follower(term, 0);
                }
                let self_id = self.id;
                for (id, pr) in self.prs.iter_mut() {
                    if *id != self_id {
                        pr.recent_active = false;
                    }
                }
                return Ok(());
            }
            MessageType::Propose => return self.handle_propose(m),
            _ => {}
        }

        let Some(pr) = self.prs.get_mut(m.from) else {
            debug!(raft_id = self.id, from = m.from, "no progress available");
            return Ok(());
        };
        match m.msg_type {
            MessageType::AppendResponse => {
                pr.recent_active = true;
                if m.reject {
                    debug!(
                        raft_id = self.id,
                        from = m.from,
                        index = m.index,
                        hint = m.reject_hint,
                        "received append rejection"
                    );
                    if pr.maybe_decr_to(m.index, m.reject_hint) {
                        if pr.state == ProgressState::Replicate {
                            pr.become_probe();
                        }
                        self.send_append(m.from)?;
                    }
                    return Ok(());
                }
                let old_paused = pr.is_paused();
                let updated = pr.maybe_update(m.index);
                match pr.state {
                    ProgressState::Probe => pr.become_replicate(),
                    ProgressState::Snapshot if pr.matched >= pr.pending_snapshot => {
                        pr.become_probe();
                        pr.become_replicate();
                    }
                    ProgressState::Replicate => pr.ins.free_to(m.index),
                    ProgressState::Snapshot => {}
                }
                let matched = pr.matched;
                if updated && self.maybe_commit()? {
                    self.bcast_append()?;
                } else if old_paused {
                    self.send_append(m.from)?;
                }
                while self.maybe_send_append(m.from, false)? {}
                if self.lead_transferee == Some(m.from) && matched == self.raft_log.last_index()? {
                    info!(raft_id = self.id, to = m.from, "sent timeout now after log caught up");
                    self.send_timeout_now(m.from);
                }
            }
            MessageType::HeartbeatResponse => {
                pr.recent_active = true;
                pr.resume();
                if pr.state == ProgressState::Replicate && pr.ins.full() {
                    pr.ins.free_first_one();
                }
                let matched = pr.matched;
                if matched < self.raft_log.last_index()? {
                    self.send_append(m.from)?;
                }
            }
            MessageType::SnapStatus => {
                if pr.state != ProgressState::Snapshot {
                    return Ok(());
                }
                if m.reject {
                    pr.pending_snapshot = 0;
                }
                pr.become_probe();
                // Wait for a heartbeat response before probing again.
                pr.pause();
            }
            MessageType::Unreachable => {
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
            }
            MessageType::TransferLeader => self.handle_transfer_leader(m.from)?,
            _ => {}
        }
        Ok(())
    }

    fn handle_propose(&mut self, mut m: Message) -> Result<()> {
        if m.entries.is_empty() {
            return Err(RaftError::ProposalDropped);
        }
        if self.prs.get(self.id).is_none() {
            // Removed from the configuration.
            return Err(RaftError::ProposalDropped);
        }
        if let Some(transferee) = self.lead_transferee {
            debug!(raft_id = self.id, transferee, "dropped proposal during leader transfer");
            return Err(RaftError::ProposalDropped);
        }
        let conf_changes = m
            .entries
            .iter()
            .filter(|e| e.entry_type == EntryType::ConfChange)
            .count();
        if conf_changes > 0 {
            if conf_changes > 1 || self.pending_conf_index > self.raft_log.applied {
                info!(
                    raft_id = self.id,
                    pending = self.pending_conf_index,
                    applied = self.raft_log.applied,
                    "dropped conf change, one is already pending"
                );
                return Err(RaftError::ProposalDropped);
            }
            let last = self.raft_log.last_index()?;
            if let Some(pos) = m.entries.iter().position(|e| e.entry_type == EntryType::ConfChange) {
                self.pending_conf_index = last + pos as u64 + 1;
            }
        }
        self.append_entry(&mut m.entries)?;
        self.bcast_append()
    }

    fn handle_transfer_leader(&mut self, transferee: u64) -> Result<()> {
        if let Some(current) = self.lead_transferee {
            if current == transferee {
                info!(raft_id = self.id, transferee, "leader transfer already in progress");
                return Ok(());
            }
            self.abort_leader_transfer();
        }
        if transferee == self.id {
            debug!(raft_id = self.id, "already leader, ignored transfer");
            return Ok(());
        }
        if !self.prs.weight(transferee).is_some_and(|w| w > 0) {
            debug!(raft_id = self.id, transferee, "ignored transfer to a voter without weight");
            return Ok(());
        }
        info!(raft_id = self.id, term = self.term, transferee, "starting leader transfer");
        self.election_elapsed = 0;
        self.lead_transferee = Some(transferee);
        let matched = self.prs.get(transferee).map(|pr| pr.matched).unwrap_or(0);
        if matched == self.raft_log.last_index()? {
            self.send_timeout_now(transferee);
        } else {
            self.send_append(transferee)?;
        }
        Ok(())
    }

    fn step_candidate(&mut self, m: Message) -> Result<()> {
        let my_vote_resp = if self.state == StateRole::PreCandidate {
            MessageType::RequestPreVoteResponse
        } else {
            MessageType::RequestVoteResponse
        };
        match m.msg_type {
            MessageType::Propose => {
                info!(raft_id = self.id, term = self.term, "no leader, dropping proposal");
                return Err(RaftError::ProposalDropped);
            }
            MessageType::Append => {
                self.become_follower(m.term, m.from);
                self.handle_append(m)?;
            }
            MessageType::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m)?;
            }
            MessageType::Snapshot => {
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m)?;
            }
            t if t == my_vote_resp => {
                let result = self.poll(m.from, !m.reject);
                let (granted, rejected) = self.prs.tally_votes();
                info!(
                    raft_id = self.id,
                    from = m.from,
                    granted,
                    rejected,
                    quorum = self.prs.quorum(),
                    "received vote response"
                );
                match result {
                    VoteResult::Won => {
                        if self.state == StateRole::PreCandidate {
                            self.campaign(CampaignType::Election)?;
                        } else {
                            self.become_leader()?;
                            self.bcast_append()?;
                        }
                    }
                    VoteResult::Lost => {
                        let term = self.term;
                        self.become_follower(term, 0);
                    }
                    VoteResult::Pending => {}
                }
            }
            MessageType::TimeoutNow => {
                debug!(raft_id = self.id, from = m.from, "ignored timeout now as candidate");
            }
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, mut m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::Propose => {
                if self.lead == 0 {
                    info!(raft_id = self.id, term = self.term, "no leader, dropping proposal");
                    return Err(RaftError::ProposalDropped);
                }
                m.to = self.lead;
                self.send(m);
            }
            MessageType::Append => {
                self.election_elapsed = 0;
                self.lead = m.from;
                self.handle_append(m)?;
            }
            MessageType::Heartbeat => {
                self.election_elapsed = 0;
                self.lead = m.from;
                self.handle_heartbeat(m)?;
            }
            MessageType::Snapshot => {
                self.election_elapsed = 0;
                self.lead = m.from;
                self.handle_snapshot(m)?;
            }
            MessageType::TransferLeader => {
                if self.lead == 0 {
                    info!(raft_id = self.id, "no leader, dropping leader transfer");
                    return Ok(());
                }
                m.to = self.lead;
                self.send(m);
            }
            MessageType::TimeoutNow => {
                info!(raft_id = self.id, from = m.from, term = self.term, "received timeout now, campaigning");
                self.hup(true)?;
            }
            _ => {}
        }
        Ok(())
    }

    // ---- replication -------------------------------------------------------

    fn handle_append(&mut self, m: Message) -> Result<()> {
        let mut resp = Message::new(MessageType::AppendResponse, m.from, self.id);
        if m.index < self.raft_log.committed {
            resp.index = self.raft_log.committed;
            self.send(resp);
            return Ok(());
        }
        match self.raft_log.maybe_append(m.index, m.log_term, m.commit, &m.entries)? {
            Some(last) => resp.index = last,
            None => {
                let last = self.raft_log.last_index()?;
                debug!(
                    raft_id = self.id,
                    index = m.index,
                    log_term = m.log_term,
                    last,
                    "rejected append"
                );
                resp.index = m.index;
                resp.reject = true;
                resp.reject_hint = m.index.min(last);
            }
        }
        self.send(resp);
        Ok(())
    }

    fn handle_heartbeat(&mut self, m: Message) -> Result<()> {
        self.raft_log.commit_to(m.commit)?;
        let mut resp = Message::new(MessageType::HeartbeatResponse, m.from, self.id);
        resp.context = m.context;
        self.send(resp);
        Ok(())
    }

    fn handle_snapshot(&mut self, mut m: Message) -> Result<()> {
        let Some(snapshot) = m.snapshot.take() else {
            return Ok(());
        };
        let (index, term) = (snapshot.metadata.index, snapshot.metadata.term);
        let mut resp = Message::new(MessageType::AppendResponse, m.from, self.id);
        if self.restore(snapshot)? {
            info!(raft_id = self.id, index, term, "restored snapshot");
            resp.index = self.raft_log.last_index()?;
        } else {
            info!(raft_id = self.id, index, term, "ignored snapshot");
            resp.index = self.raft_log.committed;
        }
        self.send(resp);
        Ok(())
    }

    /// Install `snapshot` unless the log already covers it.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<bool> {
        let meta = &snapshot.metadata;
        if meta.index <= self.raft_log.committed {
            return Ok(false);
        }
        if self.raft_log.match_term(meta.index, meta.term) {
            self.raft_log.commit_to(meta.index)?;
            return Ok(false);
        }
        let cs = meta.conf_state.clone();
        let index = meta.index;
        self.raft_log.restore(snapshot);
        self.prs.apply_conf(&cs, index + 1);
        if let Some(pr) = self.prs.get_mut(self.id) {
            pr.maybe_update(index);
        }
        Ok(true)
    }

    fn send(&mut self, mut m: Message) {
        if m.from == 0 {
            m.from = self.id;
        }
        match m.msg_type {
            MessageType::RequestVote
            | MessageType::RequestPreVote
            | MessageType::RequestVoteResponse
            | MessageType::RequestPreVoteResponse => {}
            MessageType::Propose => m.term = 0,
            _ => m.term = self.term,
        }
        self.msgs.push(m);
    }

    fn send_append(&mut self, to: u64) -> Result<()> {
        self.maybe_send_append(to, true).map(|_| ())
    }

    /// Send entries from the peer's next index, or a snapshot when those are compacted.
    fn maybe_send_append(&mut self, to: u64, send_if_empty: bool) -> Result<bool> {
        let (next_idx, recent_active) = match self.prs.get(to) {
            Some(pr) if !pr.is_paused() => (pr.next_idx, pr.recent_active),
            _ => return Ok(false),
        };
        let mut m = Message::new(MessageType::Append, to, self.id);
        let term = self.raft_log.term(next_idx - 1);
        let ents = self.raft_log.entries(next_idx, Some(self.max_msg_size));
        match (term, ents) {
            (Ok(term), Ok(ents)) => {
                if ents.is_empty() && !send_if_empty {
                    return Ok(false);
                }
                m.index = next_idx - 1;
                m.log_term = term;
                m.commit = self.raft_log.committed;
                let last = ents.last().map(|e| e.index);
                m.entries = ents;
                if let Some(pr) = self.prs.get_mut(to) {
                    match pr.state {
                        ProgressState::Replicate => {
                            if let Some(last) = last {
                                pr.optimistic_update(last);
                                pr.ins.add(last);
                            }
                        }
                        ProgressState::Probe => pr.pause(),
                        ProgressState::Snapshot => {}
                    }
                }
            }
            _ => {
                if !recent_active {
                    debug!(raft_id = self.id, to, "skipped snapshot to inactive peer");
                    return Ok(false);
                }
                let snapshot = match self.raft_log.snapshot() {
                    Ok(s) => s,
                    Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable)) => {
                        debug!(raft_id = self.id, to, "snapshot temporarily unavailable");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                };
                if snapshot.is_empty() {
                    return Err(RaftError::Corrupted("need non-empty snapshot".into()));
                }
                let index = snapshot.metadata.index;
                info!(raft_id = self.id, to, index, "sending snapshot");
                if let Some(pr) = self.prs.get_mut(to) {
                    pr.become_snapshot(index);
                }
                m.msg_type = MessageType::Snapshot;
                m.snapshot = Some(snapshot);
            }
        }
        self.send(m);
        Ok(true)
    }

    fn bcast_append(&mut self) -> Result<()> {
        let self_id = self.id;
        for id in self.prs.ids() {
            if id != self_id {
                self.send_append(id)?;
            }
        }
        Ok(())
    }

    fn bcast_heartbeat(&mut self) -> Result<()> {
        let self_id = self.id;
        let committed = self.raft_log.committed;
        let targets: Vec<(u64, u64)> = self
            .prs
            .iter()
            .filter(|(id, _)| **id != self_id)
            .map(|(id, pr)| (*id, pr.matched.min(committed)))
            .collect();
        for (to, commit) in targets {
            let mut m = Message::new(MessageType::Heartbeat, to, self_id);
            m.commit = commit;
            self.send(m);
        }
        Ok(())
    }

    fn send_timeout_now(&mut self, to: u64) {
        self.send(Message::new(MessageType::TimeoutNow, to, self.id));
    }

    pub fn abort_leader_transfer(&mut self) {
        self.lead_transferee = None;
    }

    fn maybe_commit(&mut self) -> Result<bool> {
        let mci = self.prs.committed();
        self.raft_log.maybe_commit(mci, self.term)
    }

    fn append_entry(&mut self, ents: &mut [Entry]) -> Result<()> {
        let last = self.raft_log.last_index()?;
        for (i, e) in ents.iter_mut().enumerate() {
            e.term = self.term;
            e.index = last + 1 + i as u64;
        }
        let last = self.raft_log.append(ents)?;
        if let Some(pr) = self.prs.get_mut(self.id) {
            pr.maybe_update(last);
        }
        self.maybe_commit()?;
        Ok(())
    }

    // ---- membership --------------------------------------------------------

    /// Apply a committed conf change to the tracker.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<ConfState> {
        match cc.change_type {
            ConfChangeType::AddNode => {
                let next_idx = self.raft_log.last_index()? + 1;
                self.prs.upsert(cc.node_id, cc.weight, next_idx);
                info!(raft_id = self.id, node = cc.node_id, weight = cc.weight, "applied add node");
            }
            ConfChangeType::RemoveNode => {
                if self.state == StateRole::Leader && cc.node_id != self.id {
                    // Let the removed peer learn the commit of its own removal.
                    if let Some(pr) = self.prs.get_mut(cc.node_id) {
                        pr.become_probe();
                    }
                    self.send_append(cc.node_id)?;
                }
                self.prs.remove(cc.node_id);
                if self.lead_transferee == Some(cc.node_id) {
                    self.abort_leader_transfer();
                }
                info!(raft_id = self.id, node = cc.node_id, "applied remove node");
            }
        }
        if self.state == StateRole::Leader {
            if !self.promotable() {
                info!(raft_id = self.id, term = self.term, "removed from voters, stepping down");
                let term = self.term;
                self.become_follower(term, 0);
            } else if self.maybe_commit()? {
                self.bcast_append()?;
            }
        }
        Ok(self.prs.conf_state())
    }

    /// Append `cc` to the local log and commit it without a leader.
    ///
    /// Only allowed while no leader is known; used to shrink a membership
    /// that lost its quorum.
    pub fn force_propose_conf_change(&mut self, cc: &ConfChange) -> Result<()> {
        if self.lead != 0 {
            return Err(RaftError::WithLead(self.lead));
        }
        let last = self.raft_log.last_index()?;
        let mut e = Entry::conf_change(cc)?;
        e.term = self.term;
        e.index = last + 1;
        let last = self.raft_log.append(&[e])?;
        self.raft_log.commit_to(last)?;
        if let Some(pr) = self.prs.get_mut(self.id) {
            pr.maybe_update(last);
        }
        warn!(
            raft_id = self.id,
            node = cc.node_id,
            change = ?cc.change_type,
            index = last,
            "forced conf change into the log"
        );
        Ok(())
    }
}
