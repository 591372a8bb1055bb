//! # kith-oplog
//!
//! Signed operation logs and their Merkle anti-entropy index.
//!
//! An [`Oplog`] is one signed event. The identity signs it with a rotating
//! sign key; devices co-sign it with their node sign keys until the weight
//! of the co-signers reaches the consensus quorum, at which point the log
//! becomes `Alive` and is stamped with the newest master log id.
//!
//! ## Modules
//!
//! - [`oplog`] - the record, its digest and the op-code families
//! - [`sign`] - rotating sign keys and signature records
//! - [`store`] - alive / pending storage of one oplog family
//! - [`merkle`] - time-bucketed Merkle tree and tree diffing

pub mod merkle;
pub mod oplog;
pub mod sign;
pub mod store;

pub use merkle::{Merkle, MerkleLevel, MerkleNode};
pub use oplog::{Family, OpKind, Oplog};
pub use sign::{SignInfo, SignKey};
pub use store::OplogStore;

/// Error types for oplog operations.
#[derive(Debug, thiserror::Error)]
pub enum OplogError {
    #[error("database error: {0}")]
    Db(#[from] kith_db::DbError),

    #[error("crypto error: {0}")]
    Crypto(#[from] kith_crypto::CryptoError),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, OplogError>;
