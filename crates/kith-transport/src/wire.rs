//! Envelope around every message exchanged between kith nodes.
//!
//! ```text
//! Envelope {
//!     version:   u8,       // protocol version (1)
//!     code:      u16,      // opcode from the registry
//!     msg_id:    [u8; 16], // random message id
//!     timestamp: u64,      // unix seconds
//!     entity_id: Id,       // identity or entity the message is for
//!     payload:   Vec<u8>,  // JSON-encoded body
//! }
//! ```
//!
//! The envelope itself is CBOR-framed for transmission.

use kith_types::{time, Id};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{cbor, messages, TransportError};

pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a payload; large enough for a batch of raft entries.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub code: u16,
    pub msg_id: [u8; 16],
    pub timestamp: u64,
    pub entity_id: Id,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap `payload` (JSON-encoded) for `entity_id`.
    pub fn new<T: Serialize>(code: u16, entity_id: Id, payload: &T) -> Result<Self, TransportError> {
        let payload = serde_json::to_vec(payload).map_err(|e| {
            TransportError::Serialization(format!("{} payload: {e}", messages::name(code)))
        })?;
        Ok(Self::from_raw_payload(code, entity_id, payload))
    }

    pub fn from_raw_payload(code: u16, entity_id: Id, payload: Vec<u8>) -> Self {
        let mut msg_id = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut msg_id);
        Self {
            version: PROTOCOL_VERSION,
            code,
            msg_id,
            timestamp: time::now_secs(),
            entity_id,
            payload,
        }
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            TransportError::Deserialization(format!("{} payload: {e}", messages::name(self.code)))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        cbor::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let envelope: Self = cbor::from_slice(data)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.version != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolViolation(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                self.version
            )));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "payload too large: {} bytes, max {MAX_PAYLOAD_SIZE}",
                self.payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MSG_INIT_ME_INFO, MSG_SYNC_ME_OPLOG};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        status: String,
    }

    #[test]
    fn test_envelope_roundtrip() {
        let entity = Id::random();
        let probe = Probe {
            status: "init".to_string(),
        };
        let envelope = Envelope::new(MSG_INIT_ME_INFO, entity, &probe).expect("envelope");
        let bytes = envelope.to_bytes().expect("serialize");
        let restored = Envelope::from_bytes(&bytes).expect("deserialize");
        assert_eq!(restored, envelope);
        assert_eq!(restored.decode_payload::<Probe>().expect("payload"), probe);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut envelope = Envelope::from_raw_payload(MSG_SYNC_ME_OPLOG, Id::random(), b"{}".to_vec());
        envelope.version = 99;
        let bytes = cbor::to_vec(&envelope).expect("serialize");
        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let envelope = Envelope::from_raw_payload(MSG_SYNC_ME_OPLOG, Id::ZERO, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn test_wrong_payload_type() {
        let envelope = Envelope::new(MSG_SYNC_ME_OPLOG, Id::ZERO, &42u32).expect("envelope");
        assert!(envelope.decode_payload::<Probe>().is_err());
    }
}
