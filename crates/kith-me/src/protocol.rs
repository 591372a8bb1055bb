//! Payloads of the Me protocol.
//!
//! Every message travels as JSON inside an [`Envelope`](kith_transport::Envelope)
//! whose `entity_id` names the identity it concerns. Codes live in
//! [`kith_transport::messages`].

use kith_oplog::{MerkleLevel, MerkleNode, Oplog};
use kith_raft::Message;
use kith_types::{EntityId, LogId, Status, Timestamp};
use serde::{Deserialize, Serialize};

use crate::my_info::MyInfo;
use crate::my_node::MyNode;
use crate::op_key::OpKey;
use crate::services::EntitySnapshot;

/// What a host device hands the device it approved into the identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApproveMe {
    pub op_key: Option<OpKey>,
    pub info: MyInfo,
    pub host: MyNode,
}

impl std::fmt::Debug for ApproveMe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApproveMe")
            .field("id", &self.info.id)
            .field("host", &self.host.node_id)
            .finish_non_exhaustive()
    }
}

/// A friendship joined on one device, replayed on its siblings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinFriendMsg {
    pub friend: EntitySnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OplogMsg<O> {
    pub oplog: Oplog<O>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OplogsMsg<O> {
    pub oplogs: Vec<Oplog<O>>,
}

/// Opens a Merkle sync with the sender's top-level nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncMeOplog {
    pub ts: Timestamp,
    pub nodes: Vec<MerkleNode>,
}

/// Both trees agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncMeOplogAck {
    pub ts: Timestamp,
}

/// The trees differ; carries the responder's top-level nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidSyncMeOplog {
    pub nodes: Vec<MerkleNode>,
}

/// Ask for specific logs; empty asks for the responder's tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ForceSyncMeOplog {
    #[serde(default)]
    pub ids: Vec<LogId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceSyncMeOplogAck {
    pub nodes: Vec<MerkleNode>,
}

/// Ask for the children of one tree node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceSyncMeOplogByMerkle {
    pub level: MerkleLevel,
    pub ts: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceSyncMeOplogByMerkleAck {
    pub level: MerkleLevel,
    pub ts: Timestamp,
    pub children: Vec<MerkleNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceSyncMeOplogByOplogAck<O> {
    pub oplogs: Vec<Oplog<O>>,
}

/// Logs the sender holds and the receiver lacks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncMeOplogNewOplogs<O> {
    pub oplogs: Vec<Oplog<O>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncMeOplogNewOplogsAck {
    pub ids: Vec<LogId>,
}

/// Pending logs the sender wants co-signed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPendingMeOplog {
    pub ids: Vec<LogId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPendingMeOplogAck<O> {
    pub oplogs: Vec<Oplog<O>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendRaftMsgs {
    pub msgs: Vec<Message>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RequestRaftLead {
    pub raft_id: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InitMeInfo {
    pub status: Status,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InitMeInfoAck {
    pub status: Status,
}

/// Everything a newly joined device needs to become a full member.
#[derive(Clone, Serialize, Deserialize)]
pub struct InitMeInfoSync<O> {
    /// Identity private key, hex.
    pub key: String,
    /// Identity postfix, hex.
    pub postfix: String,
    /// The CreateMe log.
    pub oplog0: Option<Oplog<O>>,
    #[serde(default)]
    pub profile: Option<EntitySnapshot>,
    #[serde(default)]
    pub board: Option<EntitySnapshot>,
}

impl<O> std::fmt::Debug for InitMeInfoSync<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitMeInfoSync")
            .field("postfix", &self.postfix)
            .field("has_oplog0", &self.oplog0.is_some())
            .field("has_profile", &self.profile.is_some())
            .field("has_board", &self.board.is_some())
            .finish_non_exhaustive()
    }
}

/// Ask a sibling for the state of a board or friendship.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InternalSync {
    pub entity_id: EntityId,
    pub log_id: LogId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InternalSyncAck {
    pub entity_id: EntityId,
    pub log_id: LogId,
    pub snapshot: Option<EntitySnapshot>,
}
