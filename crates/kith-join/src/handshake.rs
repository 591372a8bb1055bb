//! The encrypted handshake.
//!
//! Both messages are sealed with ChaCha20-Poly1305 under the join key's
//! cipher key; the key hash is bound as associated data.

use kith_crypto::chacha20;
use kith_types::Id;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::key::{JoinKey, KeyHash};
use crate::request::JoinRequest;
use crate::{JoinError, Result};

/// Guest to host.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEntity {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: KeyHash,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub nonce: Vec<u8>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub ciphertext: Vec<u8>,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEntityPayload {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub challenge: [u8; 32],
    pub node_id: Id,
    pub user_id: Id,
    pub name: String,
    /// Validate key of the host, proving the guest's operator was shown it.
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    #[serde(default)]
    pub validate_key: Option<Vec<u8>>,
}

/// Host to guest.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveJoin {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: KeyHash,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub nonce: Vec<u8>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub ciphertext: Vec<u8>,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovePayload {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub challenge: [u8; 32],
    /// JSON of the channel-specific approval.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub data: Vec<u8>,
}

impl ApprovePayload {
    pub fn new<T: Serialize>(challenge: [u8; 32], data: &T) -> Result<Self> {
        let data = serde_json::to_vec(data).map_err(|e| JoinError::Serialization(e.to_string()))?;
        Ok(Self { challenge, data })
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| JoinError::Serialization(e.to_string()))
    }
}

fn seal_json<T: Serialize>(key: &JoinKey, value: &T) -> Result<(Vec<u8>, Vec<u8>)> {
    let plaintext = serde_json::to_vec(value).map_err(|e| JoinError::Serialization(e.to_string()))?;
    let (nonce, ciphertext) = chacha20::seal(&key.cipher_key(), &plaintext, &key.hash())?;
    Ok((nonce.to_vec(), ciphertext))
}

fn open_json<T: DeserializeOwned>(key: &JoinKey, nonce: &[u8], ciphertext: &[u8]) -> Result<T> {
    let plaintext = chacha20::open(&key.cipher_key(), nonce, ciphertext, &key.hash())?;
    serde_json::from_slice(&plaintext).map_err(|e| JoinError::Serialization(e.to_string()))
}

impl JoinEntity {
    /// Seal the guest's handshake for `request`.
    pub fn seal(request: &JoinRequest, payload: &JoinEntityPayload) -> Result<Self> {
        let (nonce, ciphertext) = seal_json(&request.join_key(), payload)?;
        Ok(Self {
            hash: request.hash,
            nonce,
            ciphertext,
        })
    }

    pub fn open(&self, key: &JoinKey) -> Result<JoinEntityPayload> {
        open_json(key, &self.nonce, &self.ciphertext)
    }
}

impl ApproveJoin {
    pub fn seal(key: &JoinKey, payload: &ApprovePayload) -> Result<Self> {
        let (nonce, ciphertext) = seal_json(key, payload)?;
        Ok(Self {
            hash: key.hash(),
            nonce,
            ciphertext,
        })
    }

    /// Open on the guest side and check the echoed challenge.
    pub fn open(&self, request: &JoinRequest) -> Result<ApprovePayload> {
        let payload: ApprovePayload = open_json(&request.join_key(), &self.nonce, &self.ciphertext)?;
        if !kith_crypto::ct_eq(&payload.challenge, &request.challenge) {
            return Err(JoinError::InvalidChallenge);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::JoinUrl;
    use crate::JoinType;

    fn setup() -> (JoinKey, JoinRequest) {
        let key = JoinKey::generate();
        let url = JoinUrl::new(JoinType::Me, Id::random(), Id::random(), &key, "host");
        let request = JoinRequest::from_url(&url, JoinType::Me, 1);
        (key, request)
    }

    fn payload(request: &JoinRequest) -> JoinEntityPayload {
        JoinEntityPayload {
            challenge: request.challenge,
            node_id: Id::random(),
            user_id: Id::random(),
            name: "guest".to_string(),
            validate_key: Some(vec![1, 2, 3]),
        }
    }

    #[test]
    fn test_handshake() {
        let (host_key, request) = setup();
        let join = JoinEntity::seal(&request, &payload(&request)).expect("seal");
        assert_eq!(join.hash, host_key.hash());

        let opened = join.open(&host_key).expect("open");
        assert_eq!(opened.validate_key, Some(vec![1, 2, 3]));

        let approve = ApproveJoin::seal(
            &host_key,
            &ApprovePayload::new(opened.challenge, &serde_json::json!({"ok": true})).expect("payload"),
        )
        .expect("seal");
        let approved = approve.open(&request).expect("open");
        let data: serde_json::Value = approved.data_as().expect("data");
        assert_eq!(data["ok"], true);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_, request) = setup();
        let join = JoinEntity::seal(&request, &payload(&request)).expect("seal");
        assert!(join.open(&JoinKey::generate()).is_err());
    }

    #[test]
    fn test_challenge_mismatch() {
        let (host_key, request) = setup();
        let approve = ApproveJoin::seal(&host_key, &ApprovePayload::new([0u8; 32], &()).expect("payload"))
            .expect("seal");
        assert!(matches!(approve.open(&request), Err(JoinError::InvalidChallenge)));
    }
}
