//! # kith-join
//!
//! The join handshake shared by the three join channels of an identity:
//! adding a device (`me`), befriending (`friend`) and joining a board
//! (`board`).
//!
//! - [`url`] - `kith://join/<path>/<base64>` URLs
//! - [`key`] - rotating join keys and the per-channel key ring
//! - [`request`] - guest-side join requests with TTL pruning
//! - [`handshake`] - the encrypted `JoinEntity` / `ApproveJoin` messages
//!
//! ## Flow
//!
//! 1. The host rotates a join key and publishes a URL carrying it.
//! 2. The guest parses the URL and records a pending [`JoinRequest`].
//! 3. The guest sends a [`JoinEntity`] sealed under the join key.
//! 4. The host finds the key by hash, approves, and answers with an
//!    [`ApproveJoin`] sealed under the same key and echoing the challenge.

pub mod handshake;
pub mod key;
pub mod request;
pub mod url;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use handshake::{ApproveJoin, ApprovePayload, JoinEntity, JoinEntityPayload};
pub use key::{JoinKey, JoinKeyInfo, JoinKeyRing, KeyHash, JOIN_KEY_RING_SIZE};
pub use request::{JoinRequest, JoinRequests, JoinStatus};
pub use url::JoinUrl;

/// Error types for join operations.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("invalid join URL: {0}")]
    InvalidUrl(String),

    #[error("join request already exists")]
    AlreadyExists,

    #[error("join request not found")]
    NotFound,

    #[error("unknown join key")]
    UnknownKey,

    #[error("challenge mismatch")]
    InvalidChallenge,

    #[error("cannot join own node")]
    OwnNode,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] kith_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, JoinError>;

/// The channel a join key or request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Me,
    Friend,
    Board,
}

impl JoinType {
    pub const ALL: [JoinType; 3] = [JoinType::Me, JoinType::Friend, JoinType::Board];

    /// URL path segment.
    pub fn path(self) -> &'static str {
        match self {
            JoinType::Me => "me",
            JoinType::Friend => "friend",
            JoinType::Board => "board",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for JoinType {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "me" => Ok(JoinType::Me),
            "friend" => Ok(JoinType::Friend),
            "board" => Ok(JoinType::Board),
            other => Err(JoinError::InvalidUrl(format!("unknown join path: {other}"))),
        }
    }
}
