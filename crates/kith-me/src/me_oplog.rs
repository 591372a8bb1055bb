//! MeOplog: the event log of an identity.
//!
//! ```text
//! .melg || identity id || log id   alive logs
//! .meig || identity id || log id   pending and internal-pending logs
//! .memk || ...                     Merkle tree over alive logs
//! ```
//!
//! A log is signed by the identity sign key, then co-signed by the node
//! sign key of every device that sees it. Once the weight of the co-signers
//! reaches the raft quorum the log turns `Alive` and is stamped with the
//! newest master log id. The same policy drives the op key logs.

use std::sync::Mutex;

use kith_oplog::{Family, OpKind, Oplog, OplogStore};
use kith_raft::quorum;
use kith_transport::messages::{
    MSG_ADD_ME_OPLOG, MSG_ADD_PENDING_ME_OPLOG, MSG_INTERNAL_SYNC_BOARD, MSG_INTERNAL_SYNC_BOARD_ACK,
    MSG_INTERNAL_SYNC_FRIEND, MSG_INTERNAL_SYNC_FRIEND_ACK,
};
use kith_types::{EntityId, ListOrder, LogId, NodeId, Status};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events;
use crate::manager::Me;
use crate::my_node::SyncNodeNameInfo;
use crate::protocol::{InternalSync, InternalSyncAck, OplogMsg};
use crate::services::EntityKind;
use crate::sync::{lock, read, write};
use crate::{MeError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeOp {
    CreateMe,
    SetNodeName,
    CreateBoard,
    JoinBoard,
    CreateFriend,
    JoinFriend,
    MigrateMe,
    DeleteMe,
}

impl OpKind for MeOp {
    const FAMILY: Family = Family {
        name: "me",
        log: b".melg",
        pending: b".meig",
        merkle: Some(b".memk"),
    };

    fn code(self) -> u8 {
        match self {
            MeOp::CreateMe => 1,
            MeOp::SetNodeName => 2,
            MeOp::CreateBoard => 3,
            MeOp::JoinBoard => 4,
            MeOp::CreateFriend => 5,
            MeOp::JoinFriend => 6,
            MeOp::MigrateMe => 7,
            MeOp::DeleteMe => 8,
        }
    }

    fn needs_master(self) -> bool {
        self != MeOp::CreateMe
    }
}

impl MeOp {
    /// Collaborator owning the entity a board or friend log introduces.
    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            MeOp::CreateBoard | MeOp::JoinBoard => Some(EntityKind::Board),
            MeOp::CreateFriend | MeOp::JoinFriend => Some(EntityKind::Friend),
            _ => None,
        }
    }

    fn internal_sync_codes(kind: EntityKind) -> (u16, u16) {
        match kind {
            EntityKind::Friend => (MSG_INTERNAL_SYNC_FRIEND, MSG_INTERNAL_SYNC_FRIEND_ACK),
            _ => (MSG_INTERNAL_SYNC_BOARD, MSG_INTERNAL_SYNC_BOARD_ACK),
        }
    }
}

pub type MeOplog = Oplog<MeOp>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMeData {
    pub profile_id: EntityId,
    pub board_id: EntityId,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNameData {
    pub node_id: NodeId,
    pub name: String,
}

/// Board or friendship introduced by a log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityData {
    pub entity_id: EntityId,
    #[serde(default)]
    pub peer_id: Option<EntityId>,
    #[serde(default)]
    pub peer_node_id: Option<NodeId>,
    #[serde(default)]
    pub name: String,
}

/// Payload of MigrateMe and DeleteMe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateData {
    #[serde(default)]
    pub new_id: Option<EntityId>,
}

/// Outcome of handing a received log to the sign policy.
#[derive(Debug)]
pub(crate) enum Accepted<O> {
    /// Already alive here; flagged as synced.
    Known,
    Alive { log: Oplog<O>, new: bool, cosigned: bool },
    Pending { log: Oplog<O>, cosigned: bool },
}

impl Me {
    // ---- sign policy, shared by every signed family ------------------------

    pub(crate) fn identity_sign<O: OpKind>(&self, log: &mut Oplog<O>) -> Result<()> {
        let mut keys = lock(&self.keys);
        log.sign_with(keys.sign_key()?)?;
        self.rotate_sign_keys(&mut keys)
    }

    /// Add this device's master signature. Refuses a second one.
    pub(crate) fn master_sign<O: OpKind>(&self, log: &mut Oplog<O>) -> Result<()> {
        if log.has_master_sign(&self.node_id) {
            return Err(MeError::InvalidData(format!("log {} already signed by this device", log.id)));
        }
        let mut keys = lock(&self.keys);
        log.add_master_sign(self.node_id, &mut keys.node_sign)?;
        self.rotate_sign_keys(&mut keys)
    }

    /// Weight of the devices that master-signed `log`, and the total weight.
    pub(crate) fn signed_weight<O: OpKind>(&self, log: &Oplog<O>) -> (u64, u64) {
        let nodes = read(&self.my_nodes);
        let weight = log.master_signers().map(|s| nodes.weight_of(s)).sum();
        (weight, nodes.total_weight())
    }

    /// Store `log` as alive when its signers reach the quorum, else as pending.
    ///
    /// Without any master log the log stays internal-pending. Returns the
    /// stored copy and whether it turned alive with this call.
    pub(crate) fn settle<O: OpKind>(&self, store: &OplogStore<O>, mut log: Oplog<O>) -> Result<(Oplog<O>, bool)> {
        let Some(newest) = self.master.newest_id() else {
            log.status = Status::InternalPending;
            store.save_pending(&log)?;
            return Ok((log, false));
        };
        let (weight, total) = self.signed_weight(&log);
        if total > 0 && weight >= quorum(total) {
            let keep = log.is_alive() && log.master_log_id.is_some();
            if !keep {
                log.master_log_id = Some(newest);
            }
            log.master_weight = weight;
            log.status = Status::Alive;
            let new = store.save_alive(&log)?;
            return Ok((log, new));
        }
        log.status = Status::Pending;
        log.master_weight = weight;
        store.save_pending(&log)?;
        Ok((log, false))
    }

    /// Sign a log written on this device and store it.
    pub(crate) fn sign_new_oplog<O: OpKind>(&self, store: &OplogStore<O>, mut log: Oplog<O>) -> Result<Oplog<O>> {
        self.identity_sign(&mut log)?;
        if log.op.needs_master() {
            log.master_log_id = self.master.newest_id();
            log.master_weight = 1;
        }
        self.master_sign(&mut log)?;
        let (log, _) = self.settle(store, log)?;
        Ok(log)
    }

    /// Signatures of a log received from another device.
    pub(crate) fn verify_received<O: OpKind>(&self, log: &Oplog<O>) -> Result<()> {
        if log.creator_id != self.id {
            return Err(MeError::InvalidEntity(format!("log {} belongs to {}", log.id, log.creator_id)));
        }
        let sign = log
            .sign
            .as_ref()
            .ok_or_else(|| MeError::InvalidSignature(format!("log {} is not signed", log.id)))?;
        if sign.derivation.parent.address() != self.id.address() {
            return Err(MeError::InvalidSignature(format!(
                "log {} is not signed by the identity key",
                log.id
            )));
        }
        log.verify_sign(&sign.derivation.parent)?;
        log.verify_master_signs()?;
        Ok(())
    }

    /// Whether this device may co-sign logs of the identity.
    pub(crate) fn can_cosign(&self) -> bool {
        self.status() == Status::Alive && read(&self.my_nodes).weight_of(&self.node_id) > 0
    }

    /// Merge a received log into `store`, co-signing it when possible.
    pub(crate) fn accept_oplog<O: OpKind>(
        &self,
        store: &OplogStore<O>,
        family_lock: &Mutex<()>,
        log: Oplog<O>,
    ) -> Result<Accepted<O>> {
        self.verify_received(&log)?;
        let _family = lock(family_lock);
        if store.contains(&self.id, &log.id)? {
            store.mark_sync(&self.id, &log.id)?;
            return Ok(Accepted::Known);
        }
        let received_alive = log.is_alive();
        let mut local = match store.get_pending(&self.id, &log.id)? {
            Some(mut pending) => {
                pending.merge_master_signs(&log);
                if received_alive {
                    pending.master_log_id = log.master_log_id;
                    pending.status = Status::Alive;
                }
                pending
            }
            None => log,
        };
        if let Some(master_id) = local.master_log_id {
            if !self.master.contains(&master_id)? {
                debug!(id = %self.id, log = %local.id, master = %master_id, "log waits for its master log");
                local.status = local.status.min(Status::Pending);
                store.save_pending(&local)?;
                return Ok(Accepted::Pending { log: local, cosigned: false });
            }
        }
        let cosigned = !local.has_master_sign(&self.node_id) && self.can_cosign();
        if cosigned {
            self.master_sign(&mut local)?;
        }
        let (mut local, new) = self.settle(store, local)?;
        if local.is_alive() {
            if received_alive {
                store.mark_sync(&self.id, &local.id)?;
                local.is_sync = true;
            }
            Ok(Accepted::Alive { log: local, new, cosigned })
        } else {
            Ok(Accepted::Pending { log: local, cosigned })
        }
    }

    // ---- MeOplog -----------------------------------------------------------

    /// Write, sign and broadcast a log of this identity.
    pub(crate) fn create_me_oplog<T: Serialize>(&self, obj_id: EntityId, op: MeOp, data: &T) -> Result<MeOplog> {
        let log = {
            let _family = lock(&self.me_oplog_lock);
            let log = Oplog::with_data(obj_id, op, kith_types::time::now(), self.id, data)?;
            self.sign_new_oplog(&self.me_oplogs, log)?
        };
        info!(id = %self.id, log = %log.id, op = ?op, status = %log.status, "me oplog written");
        if log.is_alive() {
            self.emit_me_oplog_alive(&log);
        }
        self.broadcast_me_oplog(&log);
        Ok(log)
    }

    pub(crate) fn broadcast_me_oplog(&self, log: &MeOplog) {
        let code = if log.is_alive() { MSG_ADD_ME_OPLOG } else { MSG_ADD_PENDING_ME_OPLOG };
        self.broadcast(code, &OplogMsg { oplog: log.clone() });
    }

    fn emit_me_oplog_alive(&self, log: &MeOplog) {
        self.emit(
            events::ME_OPLOG_ALIVE,
            serde_json::json!({ "log_id": log.id.to_hex(), "op": log.op, "master_weight": log.master_weight }),
        );
    }

    /// Take in logs another device sent. Failures of single logs are logged.
    pub(crate) fn receive_me_oplogs(&self, from: &NodeId, logs: Vec<MeOplog>) -> Vec<LogId> {
        let mut accepted = Vec::with_capacity(logs.len());
        for log in logs {
            let id = log.id;
            match self.receive_me_oplog(from, log) {
                Ok(()) => accepted.push(id),
                Err(e) => warn!(id = %self.id, from = %from, log = %id, error = %e, "me oplog refused"),
            }
            if self.is_stopped() {
                break;
            }
        }
        accepted
    }

    fn receive_me_oplog(&self, from: &NodeId, log: MeOplog) -> Result<()> {
        match self.accept_oplog(&self.me_oplogs, &self.me_oplog_lock, log)? {
            Accepted::Known => Ok(()),
            Accepted::Pending { log, cosigned } => {
                if cosigned {
                    self.broadcast_me_oplog(&log);
                }
                Ok(())
            }
            Accepted::Alive { log, new, cosigned } => {
                if cosigned {
                    self.broadcast_me_oplog(&log);
                }
                if new {
                    self.emit_me_oplog_alive(&log);
                    self.process_me_oplog(from, &log)?;
                }
                Ok(())
            }
        }
    }

    /// Apply an alive log written on another device.
    pub(crate) fn process_me_oplog(&self, from: &NodeId, log: &MeOplog) -> Result<()> {
        debug!(id = %self.id, log = %log.id, op = ?log.op, "processing me oplog");
        match log.op {
            MeOp::CreateMe => {
                let data: CreateMeData = log.data_as()?;
                let mut info = lock(&self.info);
                info.profile_id.get_or_insert(data.profile_id);
                info.board_id.get_or_insert(data.board_id);
                info.log_id.get_or_insert(log.id);
                info.save(&self.db().me)?;
                Ok(())
            }
            MeOp::SetNodeName => self.merge_node_name(log),
            MeOp::CreateBoard | MeOp::JoinBoard | MeOp::CreateFriend | MeOp::JoinFriend => {
                self.process_entity_oplog(from, log)
            }
            MeOp::MigrateMe => self.run_delete_pipeline(Status::Migrated),
            MeOp::DeleteMe => self.run_delete_pipeline(Status::Deleted),
        }
    }

    fn merge_node_name(&self, log: &MeOplog) -> Result<()> {
        let data: NodeNameData = log.data_as()?;
        let mut nodes = write(&self.my_nodes);
        let Some(node) = nodes.get_by_node_mut(&data.node_id) else {
            debug!(id = %self.id, node = %data.node_id, "node name for unknown device");
            return Ok(());
        };
        let merged = node.merge_node_name(SyncNodeNameInfo {
            log_id: log.id,
            name: data.name,
            ts: log.ts,
            status: log.status,
        });
        if merged {
            node.save(&self.db().mynodes)?;
        }
        Ok(())
    }

    /// Rename this device through a log every device merges.
    pub fn set_my_node_name(&self, name: &str) -> Result<MeOplog> {
        let data = NodeNameData {
            node_id: self.node_id,
            name: name.to_string(),
        };
        let log = self.create_me_oplog(self.id, MeOp::SetNodeName, &data)?;
        self.merge_node_name(&log)?;
        Ok(log)
    }

    /// Record a board or friendship introduced by `log`, fetching it from
    /// the device that wrote the log when it is not here yet.
    fn process_entity_oplog(&self, from: &NodeId, log: &MeOplog) -> Result<()> {
        let Some(kind) = log.op.entity_kind() else {
            return Ok(());
        };
        let data: EntityData = log.data_as()?;
        match self.services().get_entity(kind, &data.entity_id)? {
            Some(local) if local.log_id == Some(log.id) => {
                self.me_oplogs.mark_sync(&self.id, &log.id)?;
            }
            Some(local) if local.create_ts >= log.ts => {
                self.services().set_entity_log(kind, &data.entity_id, log.id, log.ts)?;
                self.me_oplogs.mark_sync(&self.id, &log.id)?;
            }
            _ => {
                let origin = log.master_signers().next().copied().unwrap_or(*from);
                let target = if origin == self.node_id { *from } else { origin };
                let (code, _) = MeOp::internal_sync_codes(kind);
                debug!(id = %self.id, entity = %data.entity_id, kind = ?kind, to = %target, "requesting entity");
                self.send(
                    &target,
                    code,
                    &InternalSync {
                        entity_id: data.entity_id,
                        log_id: log.id,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Another device asks for an entity it saw a log of.
    pub(crate) fn handle_internal_sync(&self, from: &NodeId, kind: EntityKind, request: InternalSync) -> Result<()> {
        let snapshot = self
            .services()
            .get_entity(kind, &request.entity_id)?
            .filter(|e| e.owner_id == self.id);
        let (_, ack) = MeOp::internal_sync_codes(kind);
        self.send(
            from,
            ack,
            &InternalSyncAck {
                entity_id: request.entity_id,
                log_id: request.log_id,
                snapshot,
            },
        )
    }

    pub(crate) fn handle_internal_sync_ack(&self, kind: EntityKind, ack: InternalSyncAck) -> Result<()> {
        let Some(snapshot) = ack.snapshot else {
            debug!(id = %self.id, entity = %ack.entity_id, "peer does not hold the entity");
            return Ok(());
        };
        let log = self
            .me_oplogs
            .get(&self.id, &ack.log_id)?
            .ok_or_else(|| MeError::NotFound(format!("me oplog {}", ack.log_id)))?;
        let data: EntityData = log.data_as()?;
        if data.entity_id != ack.entity_id || snapshot.entity_id != ack.entity_id || snapshot.owner_id != self.id {
            return Err(MeError::InvalidData(format!("entity {} does not match log {}", ack.entity_id, log.id)));
        }
        self.services().restore_entity(kind, snapshot)?;
        self.services().set_entity_log(kind, &ack.entity_id, log.id, log.ts)?;
        self.me_oplogs.mark_sync(&self.id, &log.id)?;
        info!(id = %self.id, entity = %ack.entity_id, kind = ?kind, "entity restored from peer");
        Ok(())
    }

    pub fn get_me_oplog(&self, log_id: &LogId) -> Result<Option<MeOplog>> {
        Ok(self.me_oplogs.get_any(&self.id, log_id)?)
    }

    pub fn me_oplog_list(&self, start: Option<&LogId>, limit: usize, order: ListOrder) -> Result<Vec<MeOplog>> {
        Ok(self.me_oplogs.list(&self.id, start, limit, order)?)
    }

    /// Pending logs in `status` (`Pending` or `InternalPending`).
    pub fn pending_me_oplog_list(&self, status: Status, start: Option<&LogId>, limit: usize, order: ListOrder) -> Result<Vec<MeOplog>> {
        Ok(self.me_oplogs.list_pending(&self.id, Some(status), start, limit, order)?)
    }
}
