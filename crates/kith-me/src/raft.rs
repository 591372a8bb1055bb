//! Raft engine of one identity.
//!
//! Three tasks drive a [`RawNode`] over [`RaftStorage`]:
//!
//! - the tick loop ticks the node, persists every [`Ready`](kith_raft::Ready),
//!   sends its messages grouped by device and hands committed entries over;
//! - the proposal loop feeds the propose, conf change and forced conf change
//!   channels into the node;
//! - the apply loop turns committed conf changes into device records and
//!   master oplogs.
//!
//! A conf change carries `node id || node sign id` as its context so that
//! every device can record the member without asking anyone.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kith_crypto::secp256k1::raft_id;
use kith_db::Store;
use kith_raft::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot, SoftState, StateRole,
};
use kith_transport::messages::{MSG_REQUEST_RAFT_LEAD, MSG_SEND_RAFT_MSGS};
use kith_types::{EntityId, Id, NodeId, NodeSignId, NodeType, Status};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{self, PREFIX_RAFT_APPLIED, PREFIX_RAFT_LEAD, PREFIX_RAFT_SNAPSHOT_INDEX};
use crate::events;
use crate::manager::{Me, Signal};
use crate::master_oplog::{MasterData, MasterOp};
use crate::my_node::MyNode;
use crate::protocol::{RequestRaftLead, SendRaftMsgs};
use crate::raft_storage::RaftStorage;
use crate::sync::{lock, read, write};
use crate::{MeError, Result};

const CONTEXT_SIZE: usize = 64;

/// Context of a conf change naming `node_id`.
pub(crate) fn conf_context(node_id: &NodeId, node_sign_id: &NodeSignId) -> Vec<u8> {
    let mut context = Vec::with_capacity(CONTEXT_SIZE);
    context.extend_from_slice(node_id.as_bytes());
    context.extend_from_slice(node_sign_id.as_bytes());
    context
}

fn parse_context(context: &[u8]) -> Result<(NodeId, NodeSignId)> {
    if context.len() != CONTEXT_SIZE {
        return Err(MeError::InvalidEntry(format!(
            "conf change context has {} bytes",
            context.len()
        )));
    }
    Ok((Id::from_slice(&context[..32])?, Id::from_slice(&context[32..])?))
}

/// Best guess of the device type behind a weight seen in a conf change.
fn node_type_for(weight: u32) -> NodeType {
    if weight >= NodeType::Server.weight() {
        NodeType::Server
    } else if weight >= NodeType::Desktop.weight() {
        NodeType::Desktop
    } else {
        NodeType::Mobile
    }
}

fn meta_key(prefix: &[u8], entity: &EntityId) -> Vec<u8> {
    db::key(prefix, &[entity.as_bytes()])
}

type Reply = oneshot::Sender<Result<()>>;

/// Receiving ends of the proposal channels.
pub(crate) struct Proposals {
    propose: mpsc::UnboundedReceiver<(Vec<u8>, Reply)>,
    conf_change: mpsc::UnboundedReceiver<(ConfChange, Reply)>,
    force: mpsc::UnboundedReceiver<(ConfChange, Reply)>,
}

/// Consensus state reported to the application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: u64,
    pub lead: u64,
    pub role: String,
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
    pub applied: u64,
    pub voters: BTreeMap<u64, u32>,
    pub total_weight: u64,
    pub snapshot_index: u64,
}

pub struct RaftEngine {
    entity: EntityId,
    raft_id: u64,
    node: Mutex<RawNode<RaftStorage>>,
    storage: RaftStorage,
    meta: Arc<Store>,
    wake: Notify,
    propose_tx: mpsc::UnboundedSender<(Vec<u8>, Reply)>,
    conf_tx: mpsc::UnboundedSender<(ConfChange, Reply)>,
    force_tx: mpsc::UnboundedSender<(ConfChange, Reply)>,
    lead: AtomicU64,
    applied: AtomicU64,
    snapshot_index: AtomicU64,
    /// Campaign as soon as the node may stand.
    kick: AtomicBool,
}

impl std::fmt::Debug for RaftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftEngine")
            .field("entity", &self.entity)
            .field("raft_id", &self.raft_id)
            .field("lead", &self.lead())
            .field("applied", &self.applied())
            .finish_non_exhaustive()
    }
}

impl RaftEngine {
    fn new(
        entity: EntityId,
        raft_id: u64,
        storage: RaftStorage,
        meta: Arc<Store>,
        applied: u64,
    ) -> Result<(Arc<Self>, Proposals)> {
        let applied = applied.min(storage.hard_state().commit);
        let config = Config {
            id: raft_id,
            applied,
            ..Config::default()
        };
        let node = RawNode::new(&config, storage.clone())?;
        let snapshot_index = meta
            .get_json_opt::<u64>(&meta_key(PREFIX_RAFT_SNAPSHOT_INDEX, &entity))?
            .unwrap_or_default();
        let (propose_tx, propose) = mpsc::unbounded_channel();
        let (conf_tx, conf_change) = mpsc::unbounded_channel();
        let (force_tx, force) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            entity,
            raft_id,
            node: Mutex::new(node),
            storage,
            meta,
            wake: Notify::new(),
            propose_tx,
            conf_tx,
            force_tx,
            lead: AtomicU64::new(0),
            applied: AtomicU64::new(applied),
            snapshot_index: AtomicU64::new(snapshot_index),
            kick: AtomicBool::new(false),
        });
        Ok((
            engine,
            Proposals {
                propose,
                conf_change,
                force,
            },
        ))
    }

    fn with_node<T>(&self, f: impl FnOnce(&mut RawNode<RaftStorage>) -> kith_raft::Result<T>) -> Result<T> {
        let out = f(&mut lock(&self.node))?;
        Ok(out)
    }

    pub fn raft_id(&self) -> u64 {
        self.raft_id
    }

    /// Raft id of the leader, 0 when none is known.
    pub fn lead(&self) -> u64 {
        self.lead.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.lead() == self.raft_id
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index.load(Ordering::SeqCst)
    }

    pub fn conf_state(&self) -> ConfState {
        self.storage.conf_state()
    }

    fn set_applied(&self, index: u64) -> Result<()> {
        self.meta.put_json(&meta_key(PREFIX_RAFT_APPLIED, &self.entity), &index)?;
        self.applied.fetch_max(index, Ordering::SeqCst);
        Ok(())
    }

    fn set_snapshot_index(&self, index: u64) -> Result<()> {
        self.meta
            .put_json(&meta_key(PREFIX_RAFT_SNAPSHOT_INDEX, &self.entity), &index)?;
        self.snapshot_index.store(index, Ordering::SeqCst);
        Ok(())
    }

    pub fn status(&self) -> RaftStatus {
        let status = lock(&self.node).status();
        RaftStatus {
            id: status.id,
            lead: status.ss.lead,
            role: format!("{:?}", status.ss.raft_state),
            term: status.hs.term,
            vote: status.hs.vote,
            commit: status.hs.commit,
            applied: self.applied(),
            total_weight: status.voters.values().map(|w| u64::from(*w)).sum(),
            voters: status.voters,
            snapshot_index: self.snapshot_index(),
        }
    }

    fn tick(&self) -> Result<()> {
        self.with_node(|n| n.tick())
    }

    /// Step messages from a peer; rejected ones are logged.
    pub(crate) fn step(&self, msgs: Vec<Message>) {
        {
            let mut node = lock(&self.node);
            for m in msgs {
                let (from, kind) = (m.from, m.msg_type);
                if let Err(e) = node.step(m) {
                    debug!(entity = %self.entity, from, msg = ?kind, error = %e, "raft message rejected");
                }
            }
        }
        self.wake.notify_one();
    }

    /// Ask the tick loop to campaign once the committed conf changes are
    /// handed out, which for a sole voter makes it leader at once.
    pub(crate) fn request_campaign(&self) {
        self.kick.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Campaign if one was requested and the node may stand now.
    fn kick_campaign(&self) -> Result<Option<SoftState>> {
        if !self.kick.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let ss = {
            let mut node = lock(&self.node);
            if node.raft.state == StateRole::Leader {
                self.kick.store(false, Ordering::SeqCst);
                return Ok(None);
            }
            if !node.can_campaign()? {
                return Ok(None);
            }
            self.kick.store(false, Ordering::SeqCst);
            node.campaign()?;
            node.raft.soft_state()
        };
        self.wake.notify_one();
        Ok(Some(ss))
    }

    pub(crate) fn transfer_leader(&self, to: u64) -> Result<()> {
        self.with_node(|n| n.transfer_leader(to))?;
        self.wake.notify_one();
        Ok(())
    }

    async fn submit<T>(&self, tx: &mpsc::UnboundedSender<(T, Reply)>, item: T) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        tx.send((item, reply))
            .map_err(|_| MeError::RaftStopped(self.entity))?;
        rx.await.map_err(|_| MeError::RaftStopped(self.entity))?
    }

    pub async fn propose(&self, data: Vec<u8>) -> Result<()> {
        self.submit(&self.propose_tx, data).await
    }

    pub async fn propose_conf_change(&self, cc: ConfChange) -> Result<()> {
        self.submit(&self.conf_tx, cc).await
    }

    /// Commit `cc` locally. Fails with [`MeError::WithLead`] while a leader is known.
    pub async fn force_propose_conf_change(&self, cc: ConfChange) -> Result<()> {
        self.submit(&self.force_tx, cc).await
    }

    fn apply_conf_change(&self, cc: &ConfChange) -> Result<ConfState> {
        let cs = self.with_node(|n| n.apply_conf_change(cc))?;
        self.storage.set_conf_state(cs.clone())?;
        self.wake.notify_one();
        Ok(cs)
    }

    /// Persist the next batch of work and mark it handled.
    fn take_ready(&self) -> Result<Option<kith_raft::Ready>> {
        let mut node = lock(&self.node);
        if !node.has_ready() {
            return Ok(None);
        }
        let ready = node.ready()?;
        if let Some(snapshot) = &ready.snapshot {
            self.storage.apply_snapshot(snapshot.clone())?;
        }
        self.storage.append(&ready.entries)?;
        if let Some(hs) = ready.hard_state {
            self.storage.set_hard_state(hs)?;
        }
        node.advance();
        Ok(Some(ready))
    }
}

impl Me {
    pub(crate) fn raft_engine(&self) -> Result<Arc<RaftEngine>> {
        read(&self.raft).clone().ok_or(MeError::RaftStopped(self.id))
    }

    /// Start consensus according to the identity status.
    ///
    /// `Pending` bootstraps a one-member group, `Sync` starts empty and
    /// learns the log from the leader, `Alive` resumes.
    pub(crate) fn start_raft(self: &Arc<Self>) -> Result<()> {
        let status = self.status();
        let db = self.db().raft.clone();
        let (storage, applied, peers) = match status {
            Status::Pending => {
                let weight = self
                    .self_node()
                    .map_or_else(|| self.config().node_type.weight(), |n| n.weight);
                let context = conf_context(&self.node_id, &self.node_sign_id);
                let peers = vec![ConfChange::add_node(self.raft_id, weight, context)];
                (RaftStorage::clean(db, self.id)?, 0, peers)
            }
            Status::Sync => (RaftStorage::clean(db, self.id)?, 0, Vec::new()),
            Status::Alive => {
                let applied = self
                    .db()
                    .memeta
                    .get_json_opt::<u64>(&meta_key(PREFIX_RAFT_APPLIED, &self.id))?
                    .unwrap_or_default();
                (RaftStorage::resume(db, self.id)?, applied, Vec::new())
            }
            _ => {
                debug!(id = %self.id, status = %status, "raft not started for this status");
                return Ok(());
            }
        };
        if applied == 0 {
            self.db()
                .memeta
                .put_json(&meta_key(PREFIX_RAFT_APPLIED, &self.id), &0u64)?;
        }
        let total = storage.conf_state().total_weight();
        let solo = match status {
            Status::Pending => true,
            _ => {
                let voters = storage.conf_state().voters;
                voters.len() == 1 && voters.contains_key(&self.raft_id)
            }
        };
        let (engine, proposals) = RaftEngine::new(self.id, self.raft_id, storage, self.db().memeta.clone(), applied)?;
        if !peers.is_empty() {
            engine.with_node(|n| n.bootstrap(&peers))?;
        }
        if total > 0 {
            write(&self.my_nodes).set_total_weight(total);
        }
        if solo {
            engine.request_campaign();
        }
        *write(&self.raft) = Some(engine.clone());

        let (commits_tx, commits_rx) = mpsc::unbounded_channel();
        self.spawn(self.clone().raft_tick_loop(engine.clone(), commits_tx, self.quit_rx()));
        self.spawn(self.clone().raft_proposal_loop(engine.clone(), proposals));
        self.spawn(self.clone().raft_apply_loop(engine.clone(), commits_rx));
        info!(id = %self.id, raft_id = self.raft_id, status = %status, applied, solo, "raft started");
        Ok(())
    }

    async fn raft_tick_loop(
        self: Arc<Self>,
        engine: Arc<RaftEngine>,
        commits: mpsc::UnboundedSender<Vec<Entry>>,
        mut quit: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config().raft_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = engine.tick() {
                        warn!(id = %self.id, error = %e, "raft tick failed");
                    }
                }
                _ = engine.wake.notified() => {}
            }
            if let Err(e) = self.handle_ready(&engine, &commits) {
                if e.is_fatal() {
                    error!(id = %self.id, error = %e, "raft stopped on fatal error");
                    self.signal(Signal::Fatal(e.to_string()));
                    break;
                }
                warn!(id = %self.id, error = %e, "raft ready failed");
            }
        }
        debug!(id = %self.id, "raft tick loop stopped");
    }

    async fn raft_proposal_loop(self: Arc<Self>, engine: Arc<RaftEngine>, mut proposals: Proposals) {
        loop {
            tokio::select! {
                Some((data, reply)) = proposals.propose.recv() => {
                    let _ = reply.send(engine.with_node(|n| n.propose(data)));
                }
                Some((cc, reply)) = proposals.conf_change.recv() => {
                    debug!(id = %self.id, node = cc.node_id, change = ?cc.change_type, "proposing conf change");
                    let _ = reply.send(engine.with_node(|n| n.propose_conf_change(&cc)));
                }
                Some((cc, reply)) = proposals.force.recv() => {
                    warn!(id = %self.id, node = cc.node_id, change = ?cc.change_type, "forcing conf change");
                    let _ = reply.send(engine.with_node(|n| n.force_propose_conf_change(&cc)));
                }
                else => break,
            }
            engine.wake.notify_one();
        }
        debug!(id = %self.id, "raft proposal loop stopped");
    }

    async fn raft_apply_loop(self: Arc<Self>, engine: Arc<RaftEngine>, mut commits: mpsc::UnboundedReceiver<Vec<Entry>>) {
        while let Some(entries) = commits.recv().await {
            for entry in &entries {
                if let Err(e) = self.apply_entry(&engine, entry) {
                    if e.is_fatal() {
                        error!(id = %self.id, index = entry.index, error = %e, "raft apply failed fatally");
                        self.signal(Signal::Fatal(e.to_string()));
                        return;
                    }
                    error!(id = %self.id, index = entry.index, error = %e, "raft entry not applied");
                }
            }
            if let Err(e) = self.maybe_trigger_raft_snapshot(&engine) {
                warn!(id = %self.id, error = %e, "raft snapshot failed");
            }
        }
        debug!(id = %self.id, "raft apply loop stopped");
    }

    fn handle_ready(&self, engine: &RaftEngine, commits: &mpsc::UnboundedSender<Vec<Entry>>) -> Result<()> {
        let ready = engine.take_ready()?;
        // Lead before the entries of this ready reach the apply loop.
        let campaigned = engine.kick_campaign()?;
        if let Some(ss) = campaigned.or_else(|| ready.as_ref().and_then(|r| r.soft_state)) {
            self.on_soft_state(engine, ss.lead, ss.raft_state)?;
        }
        let Some(ready) = ready else {
            return Ok(());
        };
        if let Some(snapshot) = &ready.snapshot {
            if let Err(e) = self.publish_raft_snapshot(engine, snapshot) {
                warn!(id = %self.id, error = %e, "raft snapshot not published");
            }
        }
        self.send_raft_messages(engine, ready.messages);
        if !ready.committed_entries.is_empty() && commits.send(ready.committed_entries).is_err() {
            return Err(MeError::RaftStopped(self.id));
        }
        Ok(())
    }

    fn on_soft_state(&self, engine: &RaftEngine, lead: u64, role: StateRole) -> Result<()> {
        let previous = engine.lead.swap(lead, Ordering::SeqCst);
        if previous == lead {
            return Ok(());
        }
        info!(id = %self.id, raft_id = self.raft_id, lead, role = ?role, "raft leader changed");
        self.db().memeta.put_json(&meta_key(PREFIX_RAFT_LEAD, &self.id), &lead)?;
        self.emit(
            events::RAFT_LEADER_CHANGED,
            serde_json::json!({ "lead": lead, "previous": previous, "role": format!("{role:?}") }),
        );
        Ok(())
    }

    /// Deliver `messages` to devices that take part in consensus.
    fn send_raft_messages(&self, engine: &RaftEngine, messages: Vec<Message>) {
        let mut by_node: BTreeMap<u64, Vec<Message>> = BTreeMap::new();
        for m in messages {
            if m.to == self.raft_id || m.to == 0 {
                continue;
            }
            by_node.entry(m.to).or_default().push(m);
        }
        for (to, msgs) in by_node {
            let target = read(&self.my_nodes).get(to).cloned();
            let node = match target {
                Some(node) if node.status >= Status::Sync => node,
                Some(node) => {
                    debug!(id = %self.id, to, status = %node.status, "raft messages held back");
                    continue;
                }
                None => {
                    debug!(id = %self.id, to, "raft messages for unknown device dropped");
                    continue;
                }
            };
            if let Err(e) = self.send(&node.node_id, MSG_SEND_RAFT_MSGS, &SendRaftMsgs { msgs }) {
                debug!(id = %self.id, to, error = %e, "raft messages not sent");
                if let Err(e) = engine.with_node(|n| n.report_unreachable(to)) {
                    debug!(id = %self.id, to, error = %e, "unable to report unreachable device");
                }
            }
        }
    }

    fn apply_entry(&self, engine: &RaftEngine, entry: &Entry) -> Result<()> {
        if entry.index <= engine.applied() {
            debug!(id = %self.id, index = entry.index, "raft entry already applied");
            return Ok(());
        }
        let outcome = match entry.entry_type {
            EntryType::Normal => {
                if !entry.data.is_empty() {
                    warn!(id = %self.id, index = entry.index, "ignoring normal raft entry");
                }
                Ok(())
            }
            EntryType::ConfChange => self.apply_conf_change_entry(engine, entry),
        };
        engine.set_applied(entry.index)?;
        outcome
    }

    fn apply_conf_change_entry(&self, engine: &RaftEngine, entry: &Entry) -> Result<()> {
        let cc = ConfChange::decode(&entry.data)?;
        let (node_id, node_sign_id) = parse_context(&cc.context)?;
        if raft_id(node_id.as_bytes()) != cc.node_id {
            return Err(MeError::InvalidEntry(format!(
                "raft id {} does not belong to node {node_id}",
                cc.node_id
            )));
        }
        if node_sign_id != Id::node_sign_id(&node_id, &self.id.postfix()) {
            return Err(MeError::InvalidEntry(format!("node sign id of {node_id} does not match")));
        }
        let cs = engine.apply_conf_change(&cc)?;
        if cs.voters.len() == 1 && cs.voters.contains_key(&self.raft_id) && !engine.is_leader() {
            engine.request_campaign();
        }
        debug!(
            id = %self.id,
            index = entry.index,
            node = cc.node_id,
            change = ?cc.change_type,
            total_weight = cs.total_weight(),
            "applied conf change"
        );
        match cc.change_type {
            ConfChangeType::AddNode => self.apply_add_node(entry.index, &cc, node_id, &cs),
            ConfChangeType::RemoveNode => self.apply_remove_node(entry.index, &cc, node_id, &cs),
        }
    }

    fn apply_add_node(&self, index: u64, cc: &ConfChange, node_id: NodeId, cs: &ConfState) -> Result<()> {
        {
            let mut nodes = write(&self.my_nodes);
            let node = match nodes.get_mut(cc.node_id) {
                Some(node) => {
                    node.weight = cc.weight;
                    node.master_index = index;
                    node.update_ts = kith_types::time::now();
                    node.clone()
                }
                None => {
                    let mut node = MyNode::new(self.id, node_id, node_type_for(cc.weight), cc.weight, Status::Init);
                    node.master_index = index;
                    nodes.insert(node.clone());
                    node
                }
            };
            node.save(&self.db().mynodes)?;
            nodes.set_total_weight(cs.total_weight());
        }
        self.write_master_oplog(index, MasterOp::AddMaster, node_id, cc.node_id, cs)?;

        if node_id == self.node_id {
            match self.status() {
                Status::Pending => self.create_full_me()?,
                Status::Sync => self.internal_sync_to_alive()?,
                _ => {}
            }
        } else if let Err(e) = self.transport().dial(&node_id, self.oldest_op_key_hash()) {
            debug!(id = %self.id, node = %node_id, error = %e, "unable to dial new device");
        }
        self.emit(
            events::MY_NODE_ADDED,
            serde_json::json!({
                "node_id": node_id.to_hex(),
                "raft_id": cc.node_id,
                "weight": cc.weight,
                "index": index,
            }),
        );
        Ok(())
    }

    fn apply_remove_node(&self, index: u64, cc: &ConfChange, node_id: NodeId, cs: &ConfState) -> Result<()> {
        {
            let mut nodes = write(&self.my_nodes);
            if let Some(node) = nodes.get_mut(cc.node_id) {
                if node.set_status(Status::Deleted) {
                    node.save(&self.db().mynodes)?;
                }
            }
            nodes.set_total_weight(cs.total_weight());
        }
        self.write_master_oplog(index, MasterOp::RevokeMaster, node_id, cc.node_id, cs)?;
        if node_id == self.node_id {
            self.handle_revoke_my_node()
        } else {
            self.handle_revoke_other_node(&node_id)
        }
    }

    fn write_master_oplog(&self, index: u64, op: MasterOp, node_id: NodeId, raft_id: u64, cs: &ConfState) -> Result<()> {
        let data = MasterData {
            node_id,
            raft_id,
            issuer: self.node_id,
            masters: cs.voters.clone(),
            total_weight: cs.total_weight(),
        };
        let mut keys = lock(&self.keys);
        self.master.write(index, op, &data, self.node_id, &mut keys.node_sign)?;
        self.rotate_sign_keys(&mut keys)
    }

    /// Adopt a snapshot received from the leader.
    pub(crate) fn publish_raft_snapshot(&self, engine: &RaftEngine, snapshot: &Snapshot) -> Result<()> {
        let index = snapshot.metadata.index;
        let applied = engine.applied();
        if index <= applied {
            return Err(MeError::InvalidRaftIndex { index, applied });
        }
        let total = snapshot.metadata.conf_state.total_weight();
        write(&self.my_nodes).set_total_weight(total);
        engine.set_applied(index)?;
        info!(id = %self.id, index, total_weight = total, "raft snapshot published");
        Ok(())
    }

    /// Snapshot and compact once `snapshot_gap` entries were applied since the last one.
    pub(crate) fn maybe_trigger_raft_snapshot(&self, engine: &RaftEngine) -> Result<()> {
        let gap = self.config().snapshot_gap;
        if gap == 0 {
            return Ok(());
        }
        let applied = engine.applied();
        if applied < engine.snapshot_index().saturating_add(gap) {
            return Ok(());
        }
        let cs = engine.conf_state();
        let data = serde_json::to_vec(&cs.voters)?;
        engine.storage.create_snapshot(applied, Some(cs), data)?;
        engine.storage.compact(applied)?;
        engine.set_snapshot_index(applied)?;
        info!(id = %self.id, index = applied, "raft snapshot taken");
        Ok(())
    }

    /// Step raft messages; those not sent under the sender's own raft id are dropped.
    pub(crate) fn handle_send_raft_msgs(&self, from: &NodeId, msgs: Vec<Message>) {
        let sender = raft_id(from.as_bytes());
        let (msgs, forged): (Vec<Message>, Vec<Message>) = msgs.into_iter().partition(|m| m.from == sender);
        if !forged.is_empty() {
            debug!(id = %self.id, from = %from, count = forged.len(), "raft messages with a foreign sender dropped");
        }
        if msgs.is_empty() {
            return;
        }
        match self.raft_engine() {
            Ok(engine) => engine.step(msgs),
            Err(_) => debug!(id = %self.id, count = msgs.len(), "raft messages for a stopped raft"),
        }
    }

    /// A device asks this leader to hand leadership over.
    pub(crate) fn handle_request_raft_lead(&self, from: &NodeId, request: RequestRaftLead) -> Result<()> {
        let engine = self.raft_engine()?;
        if !engine.is_leader() {
            debug!(id = %self.id, from = %from, "lead requested from a follower");
            return Ok(());
        }
        let known = read(&self.my_nodes)
            .get(request.raft_id)
            .is_some_and(|n| n.node_id == *from && n.status.is_synced());
        if !known {
            return Err(MeError::InvalidNode(format!("{from} may not lead {}", self.id)));
        }
        info!(id = %self.id, to = request.raft_id, "transferring raft leadership");
        engine.transfer_leader(request.raft_id)
    }

    /// Become leader, asking the current one to step aside when needed.
    pub async fn ensure_raft_lead(&self) -> Result<()> {
        let engine = self.raft_engine()?;
        let attempts = self.config().lead_attempts;
        for attempt in 0..=attempts {
            let lead = engine.lead();
            if lead == self.raft_id {
                return Ok(());
            }
            if attempt == attempts {
                break;
            }
            let leader = read(&self.my_nodes).get(lead).cloned();
            if let Some(leader) = leader {
                let request = RequestRaftLead { raft_id: self.raft_id };
                if let Err(e) = self.send(&leader.node_id, MSG_REQUEST_RAFT_LEAD, &request) {
                    debug!(id = %self.id, lead, error = %e, "lead request not sent");
                }
            }
            debug!(id = %self.id, attempt, lead, "waiting for raft leadership");
            tokio::time::sleep(self.config().lead_retry()).await;
        }
        Err(MeError::UnableToBeLead)
    }

    pub(crate) async fn propose_add_node(&self, node: &MyNode, weight: u32) -> Result<()> {
        let engine = self.raft_engine()?;
        let cc = ConfChange::add_node(node.raft_id, weight, conf_context(&node.node_id, &node.node_sign_id));
        engine.propose_conf_change(cc).await
    }

    /// Remove a device through the leader.
    pub async fn remove_node(&self, node_id: &NodeId) -> Result<()> {
        let node = self
            .my_node(node_id)
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| MeError::InvalidNode(format!("{node_id} is not a device of {}", self.id)))?;
        self.ensure_raft_lead().await?;
        let engine = self.raft_engine()?;
        info!(id = %self.id, node = %node_id, "proposing device removal");
        engine
            .propose_conf_change(ConfChange::remove_node(
                node.raft_id,
                conf_context(&node.node_id, &node.node_sign_id),
            ))
            .await
    }

    /// Remove a device without a leader, for a group that lost its quorum.
    pub async fn force_propose_raft_remove_node(&self, node_id: &NodeId) -> Result<()> {
        let node = self
            .my_node(node_id)
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| MeError::InvalidNode(format!("{node_id} is not a device of {}", self.id)))?;
        let engine = self.raft_engine()?;
        let lead = engine.lead();
        if lead != 0 {
            return Err(MeError::WithLead(lead));
        }
        engine
            .force_propose_conf_change(ConfChange::remove_node(
                node.raft_id,
                conf_context(&node.node_id, &node.node_sign_id),
            ))
            .await
    }

    pub fn raft_status(&self) -> Result<RaftStatus> {
        Ok(self.raft_engine()?.status())
    }
}
