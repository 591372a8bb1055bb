//! # kith-transport
//!
//! Message framing and peer delivery for the kith identity service.
//!
//! - [`wire`] - versioned [`Envelope`], CBOR-framed, JSON payloads
//! - [`cbor`] - CBOR helpers over [`ciborium`]
//! - [`messages`] - opcode registry
//! - [`hub`] - in-process [`Transport`] with partition control
//!
//! ```text
//! Me protocol handler
//!     |
//!     v
//! Envelope (wire.rs)   -- version, code, entity, JSON payload
//!     |
//!     v
//! Transport            -- send to a node id; join-key registry
//! ```

pub mod cbor;
pub mod hub;
pub mod messages;
pub mod wire;

use kith_types::{Id, NodeId};

pub use hub::{Hub, HubEndpoint, Incoming};
pub use wire::Envelope;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (version mismatch, oversized payload).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("peer unreachable: {0}")]
    Unreachable(NodeId),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Delivery of envelopes to other nodes.
///
/// Sending never blocks; an unreachable peer is an error the caller may log
/// and retry later.
pub trait Transport: Send + Sync {
    /// Node id of this endpoint.
    fn node_id(&self) -> NodeId;

    fn send(&self, to: &NodeId, envelope: &Envelope) -> Result<()>;

    /// Nodes this endpoint can currently reach.
    fn peers(&self) -> Vec<NodeId>;

    /// Open a connection to `node`, identifying with an op-key hash.
    fn dial(&self, node: &NodeId, op_key_hash: Option<[u8; 20]>) -> Result<()>;

    /// Announce that handshakes sealed under `hash` are served for `entity`.
    fn register_join_key(&self, hash: [u8; 20], entity: Id) -> Result<()>;

    fn unregister_join_key(&self, hash: &[u8; 20]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");
        let err = TransportError::Unreachable(Id([0xab; 32]));
        assert!(err.to_string().starts_with("peer unreachable: abab"));
    }
}
