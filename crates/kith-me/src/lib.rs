//! # kith-me
//!
//! The "Me" subsystem: one user identity spread over several devices.
//!
//! Devices of an identity agree on membership with weighted Raft; every
//! committed membership change is recorded as a signed MasterOplog. User
//! level changes (identity creation, friendships, boards, device names,
//! migration and deletion) travel as MeOplogs that become `Alive` once
//! devices holding a quorum of weight co-sign them, and are reconciled
//! between devices by Merkle anti-entropy.
//!
//! ## Modules
//!
//! - [`backend`] - process-wide façade, message routing, the client operations
//! - [`manager`] - one running identity ([`Me`]) and its shared context
//! - [`keystore`] - identity and node key files
//! - [`my_info`], [`my_node`] - identity record, device registry, sign keys
//! - [`raft`], [`raft_storage`] - the consensus engine and its persistence
//! - [`master_oplog`] - signed records of committed membership changes
//! - [`me_oplog`], [`me_oplog_sync`] - user-level logs and their anti-entropy
//! - [`op_key`] - operation keys and their oplog family
//! - [`join`] - me / friend / board join channels
//! - [`init_me_info`] - bringing a joined device up to `Sync`
//! - [`lifecycle`] - creating, promoting, migrating and deleting identities
//! - [`dispatch`] - routing of protocol messages to handlers
//! - [`services`] - profile, board and friend collaborators
//!
//! ## Lifecycle
//!
//! The first device of an identity moves `Pending -> Alive` when its
//! single-node raft commits the bootstrap entry. A joining device moves
//! `Init -> InternalPending -> Sync -> Alive`: approval, identity material,
//! then its own add-node entry applying.

pub mod backend;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod init_me_info;
pub mod join;
pub mod keystore;
pub mod lifecycle;
pub mod manager;
pub mod master_oplog;
pub mod me_oplog;
pub mod me_oplog_sync;
pub mod my_info;
pub mod my_node;
pub mod op_key;
pub mod protocol;
pub mod raft;
pub mod raft_storage;
pub mod services;
mod sync;

pub use backend::Backend;
pub use config::MeConfig;
pub use error::{MeError, Result};
pub use events::{Event, EventBus};
pub use keystore::{IdentityKey, KeyStore};
pub use manager::{Me, Signal};
pub use me_oplog::{MeOp, MeOplog};
pub use my_info::MyInfo;
pub use my_node::MyNode;
pub use op_key::{OpKeyInfo, OpKeyOp, OpKeyOplog};
pub use raft::RaftStatus;
pub use services::{BoardService, EntityKind, EntitySnapshot, FriendService, ProfileService, Services};
