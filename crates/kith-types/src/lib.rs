//! # kith-types
//!
//! Shared domain types used across the kith workspace: 32-byte identifiers,
//! lifecycle statuses, node types and their consensus weights, peer
//! classification and timestamps.

pub mod id;
pub mod node;
pub mod status;
pub mod time;

pub use id::{EntityId, Id, LogId, NodeId, NodeSignId};
pub use node::{ListOrder, NodeType, PeerType};
pub use status::Status;
pub use time::Timestamp;

/// Size of every identifier in bytes.
pub const ID_SIZE: usize = 32;

/// Bytes of an identity id taken from the key address.
pub const ADDRESS_SIZE: usize = 20;

/// Bytes of an identity id taken from the random postfix.
pub const POSTFIX_SIZE: usize = 12;

/// Errors raised when parsing domain types.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("invalid id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, TypeError>;
