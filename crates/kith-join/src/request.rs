//! Guest-side join requests.
//!
//! A request is recorded when the guest parses a join URL and lives until
//! the host approves it, the guest removes it, or it outlives the join-key
//! TTL.

use std::collections::BTreeMap;

use kith_types::{Id, Timestamp};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::key::{JoinKey, KeyHash};
use crate::url::JoinUrl;
use crate::{JoinError, JoinType, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    #[default]
    Pending,
    Alive,
    Failed,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub join_type: JoinType,
    pub creator_id: Id,
    pub node_id: Id,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash: KeyHash,
    #[serde(skip)]
    pub key: [u8; 32],
    #[serde_as(as = "serde_with::hex::Hex")]
    pub challenge: [u8; 32],
    pub name: String,
    pub create_ts: Timestamp,
    pub status: JoinStatus,
}

impl JoinRequest {
    pub fn from_url(url: &JoinUrl, join_type: JoinType, now: Timestamp) -> Self {
        let mut challenge = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        Self {
            join_type,
            creator_id: url.creator_id,
            node_id: url.node_id,
            hash: url.hash,
            key: url.key,
            challenge,
            name: url.name.clone(),
            create_ts: now,
            status: JoinStatus::Pending,
        }
    }

    pub fn join_key(&self) -> JoinKey {
        JoinKey::from_secret(self.key, self.create_ts)
    }
}

/// Requests of one channel keyed by join-key hash.
#[derive(Debug, Default)]
pub struct JoinRequests {
    requests: BTreeMap<KeyHash, JoinRequest>,
}

impl JoinRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: JoinRequest) -> Result<()> {
        if self.requests.contains_key(&request.hash) {
            return Err(JoinError::AlreadyExists);
        }
        self.requests.insert(request.hash, request);
        Ok(())
    }

    pub fn get(&self, hash: &KeyHash) -> Option<&JoinRequest> {
        self.requests.get(hash)
    }

    pub fn set_status(&mut self, hash: &KeyHash, status: JoinStatus) -> Result<()> {
        let request = self.requests.get_mut(hash).ok_or(JoinError::NotFound)?;
        request.status = status;
        Ok(())
    }

    pub fn remove(&mut self, hash: &KeyHash) -> Option<JoinRequest> {
        self.requests.remove(hash)
    }

    pub fn list(&self) -> Vec<JoinRequest> {
        self.requests.values().cloned().collect()
    }

    pub fn pending(&self) -> Vec<JoinRequest> {
        self.requests
            .values()
            .filter(|r| r.status == JoinStatus::Pending)
            .cloned()
            .collect()
    }

    /// Drop requests created before `now - ttl`; returns them.
    pub fn prune(&mut self, now: Timestamp, ttl: Timestamp) -> Vec<JoinRequest> {
        let expired: Vec<KeyHash> = self
            .requests
            .values()
            .filter(|r| now.saturating_sub(r.create_ts) > ttl)
            .map(|r| r.hash)
            .collect();
        expired.iter().filter_map(|h| self.requests.remove(h)).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}
