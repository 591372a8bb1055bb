//! # kith-raft
//!
//! Weighted Raft consensus.
//!
//! Every voter carries an integer weight. A quorum is any set of voters whose
//! weights sum to at least `total / 2 + 1`; voters with weight 0 replicate the
//! log but never count toward a quorum and never campaign. Membership changes
//! are single-step [`ConfChange`]s (add, re-weight, remove) and, when no
//! leader can be reached, may be forced into the local log with
//! [`RawNode::force_propose_conf_change`].
//!
//! The core is I/O free. The application calls `tick`, `step` and
//! `propose*` on [`RawNode`] and drains [`Ready`] batches, persisting and
//! sending them before calling `advance`.
//!
//! ## Modules
//!
//! - [`message`] - entries, conf changes, hard state, snapshots, messages
//! - [`storage`] - the [`Storage`] trait and the in-memory [`MemStorage`]
//! - [`log`] - the replicated log (stable + unstable parts)
//! - [`progress`] - per-follower replication progress and weighted tallies
//! - [`raft`] - the role state machine
//! - [`raw_node`] - the application-facing driver

pub mod log;
pub mod message;
pub mod progress;
pub mod raft;
pub mod raw_node;
pub mod storage;

pub use message::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType, Snapshot,
    SnapshotMetadata,
};
pub use raft::{Raft, SoftState, StateRole};
pub use raw_node::{RawNode, Ready, Status};
pub use storage::{MemStorage, RaftState, Storage};

/// Election timeout in ticks.
pub const DEFAULT_ELECTION_TICK: usize = 50;
/// Heartbeat interval in ticks.
pub const DEFAULT_HEARTBEAT_TICK: usize = 5;
/// Maximum in-flight append messages per follower.
pub const DEFAULT_MAX_INFLIGHT: usize = 16;
/// Maximum bytes of entries per append message.
pub const DEFAULT_MAX_MSG_SIZE: u64 = 1024 * 1024;

/// Errors reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    #[error("requested entry at index is unavailable")]
    Unavailable,

    #[error("requested snapshot is older than the existing snapshot")]
    SnapshotOutOfDate,

    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,

    #[error("storage failure: {0}")]
    Other(String),
}

/// Error types for consensus operations.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Store(#[from] StorageError),

    #[error("proposal dropped")]
    ProposalDropped,

    #[error("cannot step raft local message")]
    StepLocalMsg,

    #[error("cannot step as peer not found")]
    StepPeerNotFound,

    #[error("a leader is known: {0}")]
    WithLead(u64),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("log corrupted: {0}")]
    Corrupted(String),

    #[error("codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;

/// Parameters of one raft node.
#[derive(Clone, Debug)]
pub struct Config {
    /// Raft id of this node; must not be 0.
    pub id: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    /// Last applied index when restarting.
    pub applied: u64,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub check_quorum: bool,
    pub pre_vote: bool,
}

impl Config {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(RaftError::ConfigInvalid("cannot use 0 as id".into()));
        }
        if self.heartbeat_tick == 0 {
            return Err(RaftError::ConfigInvalid("heartbeat tick must be greater than 0".into()));
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(RaftError::ConfigInvalid(
                "election tick must be greater than heartbeat tick".into(),
            ));
        }
        if self.max_inflight_msgs == 0 {
            return Err(RaftError::ConfigInvalid("max inflight messages must be greater than 0".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: 0,
            election_tick: DEFAULT_ELECTION_TICK,
            heartbeat_tick: DEFAULT_HEARTBEAT_TICK,
            applied: 0,
            max_size_per_msg: DEFAULT_MAX_MSG_SIZE,
            max_inflight_msgs: DEFAULT_MAX_INFLIGHT,
            check_quorum: true,
            pre_vote: true,
        }
    }
}

/// Weight needed for a quorum out of `total`.
pub fn quorum(total: u64) -> u64 {
    total / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(2_000), 1_001);
        assert_eq!(quorum(4_000), 2_001);
        assert_eq!(quorum(2_002), 1_002);
        assert_eq!(quorum(1), 1);
    }

    #[test]
    fn test_config_validate() {
        assert!(Config::default().validate().is_err());
        assert!(Config::new(1).validate().is_ok());
        let mut c = Config::new(1);
        c.election_tick = c.heartbeat_tick;
        assert!(c.validate().is_err());
    }
}
