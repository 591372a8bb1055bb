//! Anti-entropy of MeOplogs and the pending co-sign exchange.
//!
//! ```text
//! A                                         B
//! SyncMeOplog{top}                 ->
//!                                  <-       SyncMeOplogAck            (equal)
//!                                  <-       InvalidSyncMeOplog{top}   (differ)
//! ForceSyncMeOplogByMerkle{lvl,ts} ->
//!                                  <-       ...ByMerkleAck{children}
//!   (repeat down to the leaves)
//! ForceSyncMeOplog{ids}            ->
//!                                  <-       ForceSyncMeOplogByOplogAck{oplogs}
//! SyncMeOplogNewOplogs{oplogs}     ->
//!                                  <-       SyncMeOplogNewOplogsAck{ids}
//! ```

use std::sync::{Arc, Mutex};

use kith_oplog::merkle::{self, MerkleLevel, MerkleNode};
use kith_oplog::{OpKind, Oplog, OplogStore};
use kith_transport::messages::{
    MSG_ADD_ME_OPLOGS, MSG_ADD_PENDING_ME_OPLOGS, MSG_FORCE_SYNC_ME_OPLOG, MSG_FORCE_SYNC_ME_OPLOG_ACK,
    MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE, MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE_ACK, MSG_FORCE_SYNC_ME_OPLOG_BY_OPLOG_ACK,
    MSG_INVALID_SYNC_ME_OPLOG, MSG_SYNC_ME_OPLOG, MSG_SYNC_ME_OPLOG_ACK, MSG_SYNC_ME_OPLOG_NEW_OPLOGS,
    MSG_SYNC_ME_OPLOG_NEW_OPLOGS_ACK, MSG_SYNC_PENDING_ME_OPLOG, MSG_SYNC_PENDING_ME_OPLOG_ACK,
};
use kith_types::{ListOrder, LogId, NodeId, Status};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::manager::Me;
use crate::me_oplog::{MeOp, MeOplog};
use crate::protocol::{
    ForceSyncMeOplog, ForceSyncMeOplogAck, ForceSyncMeOplogByMerkle, ForceSyncMeOplogByMerkleAck,
    ForceSyncMeOplogByOplogAck, InvalidSyncMeOplog, OplogsMsg, SyncMeOplog, SyncMeOplogAck, SyncMeOplogNewOplogs,
    SyncMeOplogNewOplogsAck, SyncPendingMeOplog, SyncPendingMeOplogAck,
};
use crate::sync::lock;
use crate::{MeError, Result};

impl Me {
    fn merkle(&self) -> Result<&kith_oplog::Merkle> {
        self.me_oplogs
            .merkle()
            .ok_or_else(|| MeError::InvalidData("me oplogs keep no merkle tree".into()))
    }

    /// Year nodes of the local tree.
    pub fn me_oplog_merkle_top(&self) -> Result<Vec<MerkleNode>> {
        Ok(self.merkle()?.top(&self.id)?)
    }

    /// Every node of one level of the local tree.
    pub fn me_oplog_merkle_nodes(&self, level: MerkleLevel) -> Result<Vec<MerkleNode>> {
        Ok(self.merkle()?.nodes(&self.id, level)?)
    }

    pub(crate) async fn me_oplog_sync_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config().oplog_sync_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    if self.status() == Status::Alive {
                        self.sync_me_oplog_now();
                    }
                }
            }
        }
        debug!(id = %self.id, "me oplog sync loop stopped");
    }

    /// Offer the local digest to every synced device.
    pub(crate) fn sync_me_oplog_now(&self) {
        let nodes = match self.me_oplog_merkle_top() {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(id = %self.id, error = %e, "unable to read merkle digest");
                return;
            }
        };
        self.broadcast(
            MSG_SYNC_ME_OPLOG,
            &SyncMeOplog {
                ts: kith_types::time::now(),
                nodes,
            },
        );
    }

    /// Ask every synced device for its digest and reconcile against it.
    pub fn force_sync_me_merkle(&self) {
        self.broadcast(MSG_FORCE_SYNC_ME_OPLOG, &ForceSyncMeOplog::default());
    }

    pub(crate) fn handle_sync_me_oplog(&self, from: &NodeId, msg: SyncMeOplog) -> Result<()> {
        let local = self.me_oplog_merkle_top()?;
        if merkle::diff(&local, &msg.nodes).is_empty() {
            return self.send(from, MSG_SYNC_ME_OPLOG_ACK, &SyncMeOplogAck { ts: msg.ts });
        }
        debug!(id = %self.id, from = %from, "merkle digests differ");
        self.send(from, MSG_INVALID_SYNC_ME_OPLOG, &InvalidSyncMeOplog { nodes: local })
    }

    pub(crate) fn handle_sync_me_oplog_ack(&self, from: &NodeId, ack: SyncMeOplogAck) {
        debug!(id = %self.id, from = %from, ts = ack.ts, "merkle digests agree");
    }

    /// Reconcile the year level against a remote digest.
    pub(crate) fn reconcile_top(&self, from: &NodeId, remote: &[MerkleNode]) -> Result<()> {
        let local = self.me_oplog_merkle_top()?;
        let diff = merkle::diff(&local, remote);
        for node in &diff.differ {
            self.send(
                from,
                MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE,
                &ForceSyncMeOplogByMerkle {
                    level: node.level,
                    ts: node.ts,
                },
            )?;
        }
        for node in &diff.local_only {
            let leaves = self.merkle()?.leaves_under(&self.id, node.level, node.ts)?;
            self.push_leaves(from, &leaves)?;
        }
        Ok(())
    }

    pub(crate) fn handle_by_merkle(&self, from: &NodeId, msg: ForceSyncMeOplogByMerkle) -> Result<()> {
        let children = self.merkle()?.children(&self.id, msg.level, msg.ts)?;
        self.send(
            from,
            MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE_ACK,
            &ForceSyncMeOplogByMerkleAck {
                level: msg.level,
                ts: msg.ts,
                children,
            },
        )
    }

    pub(crate) fn handle_by_merkle_ack(&self, from: &NodeId, ack: ForceSyncMeOplogByMerkleAck) -> Result<()> {
        let Some(child) = ack.level.child() else {
            return Ok(());
        };
        let local = self.merkle()?.children(&self.id, ack.level, ack.ts)?;
        let diff = merkle::diff(&local, &ack.children);
        if child == MerkleLevel::Now {
            let ids: Vec<LogId> = diff.differ.iter().filter_map(|n| n.id).collect();
            if !ids.is_empty() {
                debug!(id = %self.id, from = %from, count = ids.len(), "requesting missing me oplogs");
                self.send(from, MSG_FORCE_SYNC_ME_OPLOG, &ForceSyncMeOplog { ids })?;
            }
            return self.push_leaves(from, &diff.local_only);
        }
        for node in &diff.differ {
            self.send(
                from,
                MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE,
                &ForceSyncMeOplogByMerkle {
                    level: child,
                    ts: node.ts,
                },
            )?;
        }
        for node in &diff.local_only {
            let leaves = self.merkle()?.leaves_under(&self.id, node.level, node.ts)?;
            self.push_leaves(from, &leaves)?;
        }
        Ok(())
    }

    /// Send the alive logs behind `leaves`.
    fn push_leaves(&self, to: &NodeId, leaves: &[MerkleNode]) -> Result<()> {
        let oplogs = self.alive_me_oplogs(leaves.iter().filter_map(|n| n.id))?;
        if oplogs.is_empty() {
            return Ok(());
        }
        debug!(id = %self.id, to = %to, count = oplogs.len(), "pushing me oplogs");
        self.send(to, MSG_SYNC_ME_OPLOG_NEW_OPLOGS, &SyncMeOplogNewOplogs { oplogs })
    }

    fn alive_me_oplogs(&self, ids: impl IntoIterator<Item = LogId>) -> Result<Vec<MeOplog>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(log) = self.me_oplogs.get(&self.id, &id)? {
                out.push(log);
            }
        }
        Ok(out)
    }

    pub(crate) fn handle_force_sync_me_oplog(&self, from: &NodeId, msg: ForceSyncMeOplog) -> Result<()> {
        if msg.ids.is_empty() {
            let nodes = self.me_oplog_merkle_top()?;
            return self.send(from, MSG_FORCE_SYNC_ME_OPLOG_ACK, &ForceSyncMeOplogAck { nodes });
        }
        let oplogs = self.alive_me_oplogs(msg.ids)?;
        self.send(from, MSG_FORCE_SYNC_ME_OPLOG_BY_OPLOG_ACK, &ForceSyncMeOplogByOplogAck { oplogs })
    }

    pub(crate) fn handle_force_sync_me_oplog_ack(&self, from: &NodeId, ack: ForceSyncMeOplogAck) -> Result<()> {
        self.reconcile_top(from, &ack.nodes)
    }

    pub(crate) fn handle_by_oplog_ack(&self, from: &NodeId, ack: ForceSyncMeOplogByOplogAck<MeOp>) {
        self.receive_me_oplogs(from, ack.oplogs);
    }

    pub(crate) fn handle_new_oplogs(&self, from: &NodeId, msg: SyncMeOplogNewOplogs<MeOp>) -> Result<()> {
        let ids = self.receive_me_oplogs(from, msg.oplogs);
        self.send(from, MSG_SYNC_ME_OPLOG_NEW_OPLOGS_ACK, &SyncMeOplogNewOplogsAck { ids })
    }

    pub(crate) fn handle_new_oplogs_ack(&self, ack: SyncMeOplogNewOplogsAck) -> Result<()> {
        for id in &ack.ids {
            self.me_oplogs.mark_sync(&self.id, id)?;
        }
        Ok(())
    }

    pub(crate) fn handle_sync_pending(&self, from: &NodeId, msg: SyncPendingMeOplog) -> Result<()> {
        let mut oplogs = Vec::new();
        for id in &msg.ids {
            if let Some(log) = self.me_oplogs.get_any(&self.id, id)? {
                oplogs.push(log);
            }
        }
        if oplogs.is_empty() {
            return Ok(());
        }
        self.send(from, MSG_SYNC_PENDING_ME_OPLOG_ACK, &SyncPendingMeOplogAck { oplogs })
    }

    pub(crate) fn handle_sync_pending_ack(&self, from: &NodeId, ack: SyncPendingMeOplogAck<MeOp>) {
        self.receive_me_oplogs(from, ack.oplogs);
    }

    // ---- pending logs ------------------------------------------------------

    pub(crate) async fn pending_oplog_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config().pending_sync_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    if self.status().is_synced() {
                        if let Err(e) = self.sync_pending_oplogs() {
                            warn!(id = %self.id, error = %e, "pending oplog sync failed");
                        }
                    }
                }
            }
        }
        debug!(id = %self.id, "pending oplog loop stopped");
    }

    /// Settle pending logs again and ask the other devices to co-sign the rest.
    pub(crate) fn sync_pending_oplogs(&self) -> Result<()> {
        let (alive, pending) = self.resettle(&self.me_oplogs, &self.me_oplog_lock)?;
        for log in &alive {
            let origin = log.master_signers().next().copied().filter(|o| *o != self.node_id);
            if let Some(origin) = origin {
                if let Err(e) = self.process_me_oplog(&origin, log) {
                    warn!(id = %self.id, log = %log.id, error = %e, "unable to process settled me oplog");
                }
            }
            if self.is_stopped() {
                return Ok(());
            }
        }
        if !alive.is_empty() {
            self.broadcast(MSG_ADD_ME_OPLOGS, &OplogsMsg { oplogs: alive });
        }
        if !pending.is_empty() {
            let ids = pending.iter().map(|l| l.id).collect();
            self.broadcast(MSG_ADD_PENDING_ME_OPLOGS, &OplogsMsg { oplogs: pending });
            self.broadcast(MSG_SYNC_PENDING_ME_OPLOG, &SyncPendingMeOplog { ids });
        }

        let (alive, pending) = self.resettle(&self.op_key_oplogs, &self.op_key_lock)?;
        for log in alive.iter().chain(pending.iter()) {
            self.broadcast_op_key_oplog(log);
        }
        Ok(())
    }

    /// Re-run the sign policy over every pending log of one family.
    ///
    /// Returns the logs that turned alive and those still pending.
    fn resettle<O: OpKind>(&self, store: &OplogStore<O>, family_lock: &Mutex<()>) -> Result<(Vec<Oplog<O>>, Vec<Oplog<O>>)> {
        let _family = lock(family_lock);
        let mut alive = Vec::new();
        let mut pending = Vec::new();
        for mut log in store.list_pending(&self.id, None, None, 0, ListOrder::Asc)? {
            if let Some(master_id) = log.master_log_id {
                if !self.master.contains(&master_id)? {
                    pending.push(log);
                    continue;
                }
            }
            if !log.has_master_sign(&self.node_id) && self.can_cosign() {
                self.master_sign(&mut log)?;
            }
            let (log, new) = self.settle(store, log)?;
            if log.is_alive() {
                if new {
                    alive.push(log);
                }
            } else {
                pending.push(log);
            }
        }
        Ok((alive, pending))
    }
}
