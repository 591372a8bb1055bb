//! Join URLs: `kith://join/<me|friend|board>/<base64url(json)>`.

use base64::Engine;
use kith_types::{Id, Timestamp};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::key::{key_hash, JoinKey, KeyHash};
use crate::{JoinError, JoinType, Result};

const JOIN_SCHEME: &str = "kith://join/";

/// Everything a guest needs to start a handshake with the host.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinUrl {
    #[serde(skip)]
    pub join_type: Option<JoinType>,
    /// Identity (or entity) the guest joins.
    pub creator_id: Id,
    /// Host device to contact.
    pub node_id: Id,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub key: [u8; 32],
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: KeyHash,
    pub name: String,
    pub ts: Timestamp,
}

impl JoinUrl {
    pub fn new(join_type: JoinType, creator_id: Id, node_id: Id, key: &JoinKey, name: &str) -> Self {
        Self {
            join_type: Some(join_type),
            creator_id,
            node_id,
            key: *key.secret(),
            hash: key.hash(),
            name: name.to_string(),
            ts: key.create_ts(),
        }
    }

    pub fn join_key(&self) -> JoinKey {
        JoinKey::from_secret(self.key, self.ts)
    }

    pub fn encode(&self) -> Result<String> {
        let join_type = self
            .join_type
            .ok_or_else(|| JoinError::InvalidUrl("missing join type".to_string()))?;
        let json = serde_json::to_vec(self).map_err(|e| JoinError::Serialization(e.to_string()))?;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        Ok(format!("{JOIN_SCHEME}{}/{encoded}", join_type.path()))
    }

    /// Parse and check that the carried hash matches the carried key.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(JOIN_SCHEME)
            .ok_or_else(|| JoinError::InvalidUrl("missing kith://join/ prefix".to_string()))?;
        let (path, payload) = rest
            .split_once('/')
            .ok_or_else(|| JoinError::InvalidUrl("missing payload".to_string()))?;
        let join_type: JoinType = path.parse()?;
        let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| JoinError::InvalidUrl(format!("base64 decode error: {e}")))?;
        let mut parsed: JoinUrl =
            serde_json::from_slice(&json).map_err(|e| JoinError::InvalidUrl(e.to_string()))?;
        if key_hash(&parsed.key) != parsed.hash {
            return Err(JoinError::InvalidUrl("key hash mismatch".to_string()));
        }
        parsed.join_type = Some(join_type);
        Ok(parsed)
    }
}
