//! Application-facing driver around [`Raft`].

use std::collections::BTreeMap;

use crate::message::{ConfChange, ConfState, Entry, HardState, Message, MessageType, Snapshot};
use crate::progress::Progress;
use crate::raft::{Raft, SoftState, StateRole};
use crate::storage::Storage;
use crate::{Config, RaftError, Result};

/// Work produced by the state machine.
///
/// Persist `hard_state`, `entries` and `snapshot`, send `messages`, apply
/// `committed_entries`, then call [`RawNode::advance`].
#[derive(Debug, Default)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct ReadyRecord {
    last_entry: Option<(u64, u64)>,
    snapshot_index: Option<u64>,
    applied: Option<u64>,
}

/// Point-in-time view of a node.
#[derive(Clone, Debug, Default)]
pub struct Status {
    pub id: u64,
    pub hs: HardState,
    pub ss: SoftState,
    pub applied: u64,
    pub voters: BTreeMap<u64, u32>,
    /// Replication progress, only reported by the leader.
    pub progress: BTreeMap<u64, Progress>,
}

pub struct RawNode<S: Storage> {
    pub raft: Raft<S>,
    prev_ss: SoftState,
    prev_hs: HardState,
    pending: Option<ReadyRecord>,
}

impl<S: Storage> RawNode<S> {
    pub fn new(config: &Config, store: S) -> Result<Self> {
        let raft = Raft::new(config, store)?;
        let prev_ss = raft.soft_state();
        let prev_hs = raft.hard_state();
        Ok(Self {
            raft,
            prev_ss,
            prev_hs,
            pending: None,
        })
    }

    /// Seed an empty log with one committed `AddNode` per initial voter.
    pub fn bootstrap(&mut self, peers: &[ConfChange]) -> Result<()> {
        self.raft.bootstrap(peers)
    }

    pub fn tick(&mut self) -> Result<()> {
        self.raft.tick()
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raft.step(Message::new(MessageType::Hup, 0, self.raft.id))
    }

    /// See [`Raft::can_campaign`].
    pub fn can_campaign(&self) -> Result<bool> {
        self.raft.can_campaign()
    }

    pub fn propose(&mut self, data: Vec<u8>) -> Result<()> {
        let mut m = Message::new(MessageType::Propose, 0, self.raft.id);
        m.entries = vec![Entry {
            data,
            ..Default::default()
        }];
        self.raft.step(m)
    }

    pub fn propose_conf_change(&mut self, cc: &ConfChange) -> Result<()> {
        let mut m = Message::new(MessageType::Propose, 0, self.raft.id);
        m.entries = vec![Entry::conf_change(cc)?];
        self.raft.step(m)
    }

    /// See [`Raft::force_propose_conf_change`].
    pub fn force_propose_conf_change(&mut self, cc: &ConfChange) -> Result<()> {
        self.raft.force_propose_conf_change(cc)
    }

    pub fn transfer_leader(&mut self, transferee: u64) -> Result<()> {
        self.raft
            .step(Message::new(MessageType::TransferLeader, self.raft.id, transferee))
    }

    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<ConfState> {
        self.raft.apply_conf_change(cc)
    }

    /// Step a message received from a peer.
    pub fn step(&mut self, m: Message) -> Result<()> {
        if m.msg_type.is_local() {
            return Err(RaftError::StepLocalMsg);
        }
        if self.raft.prs().get(m.from).is_some() || !m.msg_type.is_response() {
            return self.raft.step(m);
        }
        Err(RaftError::StepPeerNotFound)
    }

    pub fn has_ready(&self) -> bool {
        let raft = &self.raft;
        if raft.soft_state() != self.prev_ss {
            return true;
        }
        let hs = raft.hard_state();
        if !hs.is_empty() && hs != self.prev_hs {
            return true;
        }
        !raft.msgs.is_empty()
            || !raft.raft_log.unstable_entries().is_empty()
            || raft.raft_log.unstable.snapshot.is_some()
            || raft.raft_log.has_next_committed_entries()
    }

    pub fn ready(&mut self) -> Result<Ready> {
        let mut rd = Ready::default();
        let ss = self.raft.soft_state();
        if ss != self.prev_ss {
            rd.soft_state = Some(ss);
            self.prev_ss = ss;
        }
        let hs = self.raft.hard_state();
        if !hs.is_empty() && hs != self.prev_hs {
            rd.hard_state = Some(hs);
            self.prev_hs = hs;
        }
        rd.entries = self.raft.raft_log.unstable_entries().to_vec();
        rd.snapshot = self.raft.raft_log.unstable.snapshot.clone();
        rd.committed_entries = self.raft.raft_log.next_committed_entries(None)?;
        rd.messages = std::mem::take(&mut self.raft.msgs);

        self.pending = Some(ReadyRecord {
            last_entry: rd.entries.last().map(|e| (e.index, e.term)),
            snapshot_index: rd.snapshot.as_ref().map(|s| s.metadata.index),
            applied: rd.committed_entries.last().map(|e| e.index),
        });
        Ok(rd)
    }

    /// Mark the last [`Ready`] as persisted and applied.
    pub fn advance(&mut self) {
        let Some(rec) = self.pending.take() else {
            return;
        };
        if let Some((index, term)) = rec.last_entry {
            self.raft.raft_log.stable_to(index, term);
        }
        if let Some(index) = rec.snapshot_index {
            self.raft.raft_log.stable_snap_to(index);
        }
        if let Some(index) = rec.applied {
            self.raft.raft_log.applied_to(index);
        }
    }

    pub fn status(&self) -> Status {
        let raft = &self.raft;
        let progress = if raft.state == StateRole::Leader {
            raft.prs().iter().map(|(id, pr)| (*id, pr.clone())).collect()
        } else {
            BTreeMap::new()
        };
        Status {
            id: raft.id,
            hs: raft.hard_state(),
            ss: raft.soft_state(),
            applied: raft.raft_log.applied,
            voters: raft.prs().voters().clone(),
            progress,
        }
    }

    pub fn report_unreachable(&mut self, id: u64) -> Result<()> {
        self.raft.step(Message::new(MessageType::Unreachable, 0, id))
    }

    pub fn report_snapshot(&mut self, id: u64, success: bool) -> Result<()> {
        let mut m = Message::new(MessageType::SnapStatus, 0, id);
        m.reject = !success;
        self.raft.step(m)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use super::*;
    use crate::message::{ConfChangeType, EntryType};
    use crate::storage::MemStorage;

    struct Network {
        peers: BTreeMap<u64, RawNode<MemStorage>>,
        stores: BTreeMap<u64, MemStorage>,
        applied: BTreeMap<u64, Vec<Entry>>,
        isolated: HashSet<u64>,
    }

    fn config(id: u64) -> Config {
        Config {
            election_tick: 10,
            heartbeat_tick: 1,
            ..Config::new(id)
        }
    }

    impl Network {
        fn new(weights: &[(u64, u32)]) -> Self {
            let mut cs = ConfState::default();
            for (id, w) in weights {
                cs.voters.insert(*id, *w);
            }
            let mut nt = Network {
                peers: BTreeMap::new(),
                stores: BTreeMap::new(),
                applied: BTreeMap::new(),
                isolated: HashSet::new(),
            };
            for (id, _) in weights {
                let store = MemStorage::new_with_conf_state(cs.clone());
                let node = RawNode::new(&config(*id), store.clone()).expect("raw node");
                nt.peers.insert(*id, node);
                nt.stores.insert(*id, store);
                nt.applied.insert(*id, Vec::new());
            }
            nt
        }

        fn node(&mut self, id: u64) -> &mut RawNode<MemStorage> {
            self.peers.get_mut(&id).expect("peer")
        }

        fn handle_ready(&mut self, id: u64) -> Vec<Message> {
            let mut out = Vec::new();
            loop {
                let node = self.peers.get_mut(&id).expect("peer");
                if !node.has_ready() {
                    return out;
                }
                let rd = node.ready().expect("ready");
                let store = &self.stores[&id];
                {
                    let mut core = store.wl().expect("lock");
                    if let Some(hs) = rd.hard_state {
                        core.set_hard_state(hs);
                    }
                    core.append(&rd.entries).expect("append");
                }
                for e in &rd.committed_entries {
                    if e.entry_type == EntryType::ConfChange {
                        let cc = ConfChange::decode(&e.data).expect("cc");
                        let cs = node.apply_conf_change(&cc).expect("apply");
                        store.wl().expect("lock").set_conf_state(cs);
                    }
                }
                self.applied.get_mut(&id).expect("applied").extend(rd.committed_entries);
                out.extend(rd.messages);
                node.advance();
            }
        }

        /// Deliver messages until the network is quiet.
        fn settle(&mut self) {
            loop {
                let ids: Vec<u64> = self.peers.keys().copied().collect();
                let mut msgs = Vec::new();
                for id in ids {
                    msgs.extend(self.handle_ready(id));
                }
                if msgs.is_empty() {
                    return;
                }
                for m in msgs {
                    if self.isolated.contains(&m.from) || self.isolated.contains(&m.to) {
                        continue;
                    }
                    if let Some(peer) = self.peers.get_mut(&m.to) {
                        let _ = peer.step(m);
                    }
                }
            }
        }

        fn elect(&mut self, id: u64) {
            self.node(id).campaign().expect("campaign");
            self.settle();
        }

        fn tick_all(&mut self, n: usize) {
            for _ in 0..n {
                for node in self.peers.values_mut() {
                    node.tick().expect("tick");
                }
                self.settle();
            }
        }

        fn data_applied(&self, id: u64) -> Vec<Vec<u8>> {
            self.applied[&id]
                .iter()
                .filter(|e| e.entry_type == EntryType::Normal && !e.data.is_empty())
                .map(|e| e.data.clone())
                .collect()
        }
    }

    #[test]
    fn test_single_node_bootstrap_and_propose() {
        let store = MemStorage::new();
        let mut node = RawNode::new(&config(1), store.clone()).expect("raw node");
        node.bootstrap(&[ConfChange::add_node(1, 2_000, Vec::new())]).expect("bootstrap");
        let mut nt = Network {
            peers: BTreeMap::from([(1, node)]),
            stores: BTreeMap::from([(1, store)]),
            applied: BTreeMap::from([(1, Vec::new())]),
            isolated: HashSet::new(),
        };
        nt.settle();
        assert_eq!(nt.applied[&1].len(), 1);

        nt.elect(1);
        assert_eq!(nt.node(1).raft.state, StateRole::Leader);
        // The bootstrap entry is committed, so no new-term entry is needed.
        assert_eq!(nt.node(1).raft.raft_log.last_index().expect("last"), 1);

        nt.node(1).propose(b"hello".to_vec()).expect("propose");
        nt.settle();
        assert_eq!(nt.data_applied(1), vec![b"hello".to_vec()]);
        assert_eq!(nt.node(1).raft.raft_log.last_index().expect("last"), 2);
    }

    #[test]
    fn test_campaign_waits_for_bootstrap_ready() {
        let store = MemStorage::new();
        let mut node = RawNode::new(&config(1), store.clone()).expect("raw node");
        node.bootstrap(&[ConfChange::add_node(1, 2_000, Vec::new())]).expect("bootstrap");
        assert!(!node.can_campaign().expect("can campaign"));
        node.campaign().expect("hup");
        assert_eq!(node.raft.state, StateRole::Follower);

        let rd = node.ready().expect("ready");
        assert_eq!(rd.committed_entries.len(), 1);
        store.wl().expect("lock").append(&rd.entries).expect("append");
        node.advance();
        assert!(node.can_campaign().expect("can campaign"));
        node.campaign().expect("hup");
        assert_eq!(node.raft.state, StateRole::Leader);
        assert_eq!(node.raft.soft_state().lead, 1);
        assert!(!node.can_campaign().expect("can campaign"));
    }

    #[test]
    fn test_bootstrap_refuses_nonempty_log() {
        let mut node = RawNode::new(&config(1), MemStorage::new()).expect("raw node");
        node.bootstrap(&[ConfChange::add_node(1, 2, Vec::new())]).expect("bootstrap");
        assert!(node.bootstrap(&[ConfChange::add_node(1, 2, Vec::new())]).is_err());
        assert!(RawNode::new(&config(1), MemStorage::new())
            .expect("raw node")
            .bootstrap(&[])
            .is_err());
    }

    #[test]
    fn test_replication_and_commit() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000), (3, 2)]);
        nt.elect(1);
        assert_eq!(nt.node(1).raft.state, StateRole::Leader);
        assert_eq!(nt.node(2).raft.lead, 1);

        nt.node(1).propose(b"a".to_vec()).expect("propose");
        nt.settle();
        for id in 1..=3 {
            assert_eq!(nt.data_applied(id), vec![b"a".to_vec()]);
        }
    }

    #[test]
    fn test_weighted_commit_requires_heavy_voters() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000), (3, 2_000), (4, 2)]);
        nt.elect(1);
        nt.isolated.insert(2);
        nt.isolated.insert(3);
        nt.node(1).propose(b"x".to_vec()).expect("propose");
        nt.settle();
        // 2_002 of 6_002 is not a quorum.
        assert!(nt.data_applied(1).is_empty());
        assert!(nt.data_applied(4).is_empty());

        nt.isolated.clear();
        nt.tick_all(2);
        assert_eq!(nt.data_applied(1), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_light_voters_cannot_win() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2), (3, 2)]);
        nt.isolated.insert(1);
        nt.elect(2);
        assert_ne!(nt.node(2).raft.state, StateRole::Leader);
    }

    #[test]
    fn test_zero_weight_voter_does_not_campaign() {
        let mut nt = Network::new(&[(1, 2_000), (2, 0)]);
        nt.elect(2);
        assert_eq!(nt.node(2).raft.state, StateRole::Follower);
        assert_eq!(nt.node(2).raft.term, 0);
    }

    #[test]
    fn test_follower_forwards_proposal() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        nt.node(2).propose(b"from-2".to_vec()).expect("propose");
        nt.settle();
        assert_eq!(nt.data_applied(1), vec![b"from-2".to_vec()]);
        assert_eq!(nt.data_applied(2), vec![b"from-2".to_vec()]);
    }

    #[test]
    fn test_leader_transfer() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000), (3, 2_000)]);
        nt.elect(1);
        nt.node(1).transfer_leader(2).expect("transfer");
        nt.settle();
        assert_eq!(nt.node(2).raft.state, StateRole::Leader);
        assert_eq!(nt.node(1).raft.lead, 2);
    }

    #[test]
    fn test_transfer_requested_by_follower() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        nt.node(2).transfer_leader(2).expect("transfer");
        nt.settle();
        assert_eq!(nt.node(2).raft.state, StateRole::Leader);
    }

    #[test]
    fn test_add_node_reweights() {
        let mut nt = Network::new(&[(1, 2_000), (2, 0)]);
        nt.elect(1);
        nt.node(1)
            .propose_conf_change(&ConfChange::add_node(2, 2_000, Vec::new()))
            .expect("propose");
        nt.settle();
        assert_eq!(nt.node(1).raft.prs().weight(2), Some(2_000));
        assert_eq!(nt.node(2).raft.prs().weight(2), Some(2_000));
        assert_eq!(nt.node(1).raft.prs().quorum(), 2_001);
    }

    #[test]
    fn test_single_pending_conf_change() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        nt.isolated.insert(2);
        nt.node(1)
            .propose_conf_change(&ConfChange::add_node(3, 2, Vec::new()))
            .expect("propose");
        let second = nt
            .node(1)
            .propose_conf_change(&ConfChange::add_node(4, 2, Vec::new()));
        assert!(matches!(second, Err(RaftError::ProposalDropped)));
    }

    #[test]
    fn test_remove_sends_final_append() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000), (3, 2_000)]);
        nt.elect(1);
        nt.node(1).propose(b"p".to_vec()).expect("propose");
        nt.settle();
        let committed = nt.node(1).raft.raft_log.committed;

        nt.node(1)
            .apply_conf_change(&ConfChange::remove_node(3, Vec::new()))
            .expect("apply");
        let leader = nt.node(1);
        let final_append = leader
            .raft
            .msgs
            .iter()
            .find(|m| m.to == 3 && m.msg_type == MessageType::Append)
            .expect("final append");
        assert_eq!(final_append.commit, committed);
        assert!(leader.raft.prs().get(3).is_none());
    }

    #[test]
    fn test_leader_removing_itself_steps_down() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        nt.node(1)
            .apply_conf_change(&ConfChange::remove_node(1, Vec::new()))
            .expect("apply");
        assert_eq!(nt.node(1).raft.state, StateRole::Follower);
    }

    #[test]
    fn test_force_conf_change_refused_with_lead() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        let res = nt
            .node(2)
            .force_propose_conf_change(&ConfChange::remove_node(1, Vec::new()));
        assert!(matches!(res, Err(RaftError::WithLead(1))));
    }

    #[test]
    fn test_force_remove_after_partition() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        nt.isolated.insert(1);
        // Node 2 times out and becomes a pre-candidate, forgetting the leader.
        nt.tick_all(25);
        assert_eq!(nt.node(2).raft.lead, 0);
        assert_ne!(nt.node(2).raft.state, StateRole::Leader);

        nt.node(2)
            .force_propose_conf_change(&ConfChange::remove_node(1, Vec::new()))
            .expect("force");
        nt.settle();
        let removed = nt.applied[&2]
            .iter()
            .filter(|e| e.entry_type == EntryType::ConfChange)
            .filter_map(|e| ConfChange::decode(&e.data).ok())
            .any(|cc| cc.change_type == ConfChangeType::RemoveNode && cc.node_id == 1);
        assert!(removed);
        assert_eq!(nt.node(2).raft.prs().total_weight(), 2_000);

        nt.tick_all(25);
        assert_eq!(nt.node(2).raft.state, StateRole::Leader);
    }

    #[test]
    fn test_check_quorum_steps_down() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000)]);
        nt.elect(1);
        nt.isolated.insert(2);
        nt.tick_all(25);
        assert_ne!(nt.node(1).raft.state, StateRole::Leader);
    }

    #[test]
    fn test_pre_vote_keeps_term_of_isolated_node() {
        let mut nt = Network::new(&[(1, 2_000), (2, 2_000), (3, 2_000)]);
        nt.elect(1);
        let term = nt.node(1).raft.term;
        nt.isolated.insert(3);
        nt.tick_all(40);
        // Losing pre-votes never bumps the term.
        assert_eq!(nt.node(3).raft.term, term);
        nt.isolated.clear();
        nt.tick_all(3);
        assert_eq!(nt.node(1).raft.state, StateRole::Leader);
        assert_eq!(nt.node(3).raft.lead, 1);
    }

    #[test]
    fn test_step_rejects_local_messages() {
        let mut nt = Network::new(&[(1, 2_000)]);
        let res = nt.node(1).step(Message::new(MessageType::Hup, 1, 1));
        assert!(matches!(res, Err(RaftError::StepLocalMsg)));
        let res = nt
            .node(1)
            .step(Message::new(MessageType::AppendResponse, 1, 9));
        assert!(matches!(res, Err(RaftError::StepPeerNotFound)));
    }

    #[test]
    fn test_follower_catches_up_from_empty_log() {
        // A joining node starts with no membership and learns it from the leader.
        let leader_store = MemStorage::new();
        let mut leader = RawNode::new(&config(1), leader_store.clone()).expect("raw node");
        leader.bootstrap(&[ConfChange::add_node(1, 2_000, Vec::new())]).expect("bootstrap");
        let joiner_store = MemStorage::new();
        let joiner = RawNode::new(&config(2), joiner_store.clone()).expect("raw node");
        let mut nt = Network {
            peers: BTreeMap::from([(1, leader), (2, joiner)]),
            stores: BTreeMap::from([(1, leader_store), (2, joiner_store)]),
            applied: BTreeMap::from([(1, Vec::new()), (2, Vec::new())]),
            isolated: HashSet::new(),
        };
        nt.settle();
        nt.elect(1);
        nt.node(1)
            .propose_conf_change(&ConfChange::add_node(2, 0, Vec::new()))
            .expect("propose");
        nt.settle();
        nt.tick_all(2);
        assert_eq!(nt.node(1).raft.raft_log.last_index().expect("last"), 2);
        assert_eq!(nt.node(2).raft.raft_log.committed, 2);
        assert_eq!(nt.node(2).raft.prs().weight(1), Some(2_000));
        assert_eq!(nt.node(2).raft.prs().weight(2), Some(0));
    }
}
