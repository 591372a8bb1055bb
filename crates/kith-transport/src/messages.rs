//! Message type registry.
//!
//! Service-level join codes come first; the Me protocol codes are packed
//! sequentially from [`ME_PROTOCOL_BASE`].

// -- Service level --

/// Guest to host: sealed join request.
pub const MSG_JOIN_ENTITY: u16 = 0x0010;
/// Host to guest: sealed approval.
pub const MSG_APPROVE_JOIN: u16 = 0x0011;

// -- Me protocol --

pub const ME_PROTOCOL_BASE: u16 = 0x0100;

pub const MSG_JOIN_FRIEND: u16 = ME_PROTOCOL_BASE;
pub const MSG_ADD_ME_OPLOG: u16 = ME_PROTOCOL_BASE + 1;
pub const MSG_ADD_ME_OPLOGS: u16 = ME_PROTOCOL_BASE + 2;
pub const MSG_ADD_PENDING_ME_OPLOG: u16 = ME_PROTOCOL_BASE + 3;
pub const MSG_ADD_PENDING_ME_OPLOGS: u16 = ME_PROTOCOL_BASE + 4;
pub const MSG_SYNC_ME_OPLOG: u16 = ME_PROTOCOL_BASE + 5;
pub const MSG_SYNC_ME_OPLOG_ACK: u16 = ME_PROTOCOL_BASE + 6;
pub const MSG_SYNC_ME_OPLOG_NEW_OPLOGS: u16 = ME_PROTOCOL_BASE + 7;
pub const MSG_SYNC_ME_OPLOG_NEW_OPLOGS_ACK: u16 = ME_PROTOCOL_BASE + 8;
pub const MSG_INVALID_SYNC_ME_OPLOG: u16 = ME_PROTOCOL_BASE + 9;
pub const MSG_FORCE_SYNC_ME_OPLOG: u16 = ME_PROTOCOL_BASE + 10;
pub const MSG_FORCE_SYNC_ME_OPLOG_ACK: u16 = ME_PROTOCOL_BASE + 11;
pub const MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE: u16 = ME_PROTOCOL_BASE + 12;
pub const MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE_ACK: u16 = ME_PROTOCOL_BASE + 13;
pub const MSG_FORCE_SYNC_ME_OPLOG_BY_OPLOG_ACK: u16 = ME_PROTOCOL_BASE + 14;
pub const MSG_SYNC_PENDING_ME_OPLOG: u16 = ME_PROTOCOL_BASE + 15;
pub const MSG_SYNC_PENDING_ME_OPLOG_ACK: u16 = ME_PROTOCOL_BASE + 16;
pub const MSG_SEND_RAFT_MSGS: u16 = ME_PROTOCOL_BASE + 17;
pub const MSG_REQUEST_RAFT_LEAD: u16 = ME_PROTOCOL_BASE + 18;
pub const MSG_INIT_ME_INFO: u16 = ME_PROTOCOL_BASE + 19;
pub const MSG_INIT_ME_INFO_ACK: u16 = ME_PROTOCOL_BASE + 20;
pub const MSG_INIT_ME_INFO_SYNC: u16 = ME_PROTOCOL_BASE + 21;
pub const MSG_INTERNAL_SYNC_BOARD: u16 = ME_PROTOCOL_BASE + 22;
pub const MSG_INTERNAL_SYNC_BOARD_ACK: u16 = ME_PROTOCOL_BASE + 23;
pub const MSG_INTERNAL_SYNC_FRIEND: u16 = ME_PROTOCOL_BASE + 24;
pub const MSG_INTERNAL_SYNC_FRIEND_ACK: u16 = ME_PROTOCOL_BASE + 25;
pub const MSG_ADD_OP_KEY_OPLOG: u16 = ME_PROTOCOL_BASE + 26;
pub const MSG_ADD_PENDING_OP_KEY_OPLOG: u16 = ME_PROTOCOL_BASE + 27;

/// Last code of the Me protocol.
pub const ME_PROTOCOL_END: u16 = MSG_ADD_PENDING_OP_KEY_OPLOG;

pub fn is_me_protocol(code: u16) -> bool {
    (ME_PROTOCOL_BASE..=ME_PROTOCOL_END).contains(&code)
}

/// Human-readable name for logs.
pub fn name(code: u16) -> &'static str {
    match code {
        MSG_JOIN_ENTITY => "JoinEntity",
        MSG_APPROVE_JOIN => "ApproveJoin",
        MSG_JOIN_FRIEND => "JoinFriendMsg",
        MSG_ADD_ME_OPLOG => "AddMeOplog",
        MSG_ADD_ME_OPLOGS => "AddMeOplogs",
        MSG_ADD_PENDING_ME_OPLOG => "AddPendingMeOplog",
        MSG_ADD_PENDING_ME_OPLOGS => "AddPendingMeOplogs",
        MSG_SYNC_ME_OPLOG => "SyncMeOplog",
        MSG_SYNC_ME_OPLOG_ACK => "SyncMeOplogAck",
        MSG_SYNC_ME_OPLOG_NEW_OPLOGS => "SyncMeOplogNewOplogs",
        MSG_SYNC_ME_OPLOG_NEW_OPLOGS_ACK => "SyncMeOplogNewOplogsAck",
        MSG_INVALID_SYNC_ME_OPLOG => "InvalidSyncMeOplog",
        MSG_FORCE_SYNC_ME_OPLOG => "ForceSyncMeOplog",
        MSG_FORCE_SYNC_ME_OPLOG_ACK => "ForceSyncMeOplogAck",
        MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE => "ForceSyncMeOplogByMerkle",
        MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE_ACK => "ForceSyncMeOplogByMerkleAck",
        MSG_FORCE_SYNC_ME_OPLOG_BY_OPLOG_ACK => "ForceSyncMeOplogByOplogAck",
        MSG_SYNC_PENDING_ME_OPLOG => "SyncPendingMeOplog",
        MSG_SYNC_PENDING_ME_OPLOG_ACK => "SyncPendingMeOplogAck",
        MSG_SEND_RAFT_MSGS => "SendRaftMsgs",
        MSG_REQUEST_RAFT_LEAD => "RequestRaftLead",
        MSG_INIT_ME_INFO => "InitMeInfo",
        MSG_INIT_ME_INFO_ACK => "InitMeInfoAck",
        MSG_INIT_ME_INFO_SYNC => "InitMeInfoSync",
        MSG_INTERNAL_SYNC_BOARD => "InternalSyncBoard",
        MSG_INTERNAL_SYNC_BOARD_ACK => "InternalSyncBoardAck",
        MSG_INTERNAL_SYNC_FRIEND => "InternalSyncFriend",
        MSG_INTERNAL_SYNC_FRIEND_ACK => "InternalSyncFriendAck",
        MSG_ADD_OP_KEY_OPLOG => "AddOpKeyOplog",
        MSG_ADD_PENDING_OP_KEY_OPLOG => "AddPendingOpKeyOplog",
        _ => "Unknown",
    }
}
