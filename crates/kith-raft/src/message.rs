//! Log entries, membership records and wire messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Context attached to a vote request issued after a leader transfer.
pub const CAMPAIGN_TRANSFER: &[u8] = b"CampaignTransfer";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    #[default]
    Normal,
    ConfChange,
}

/// One replicated log entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    #[serde(default)]
    pub entry_type: EntryType,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Entry {
    /// Approximate size for message batching.
    pub fn size(&self) -> u64 {
        (self.data.len() + 24) as u64
    }

    /// A conf change entry carrying `cc`.
    pub fn conf_change(cc: &ConfChange) -> crate::Result<Entry> {
        Ok(Entry {
            entry_type: EntryType::ConfChange,
            data: cc.encode()?,
            ..Default::default()
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfChangeType {
    /// Add a voter, or update its weight when already present.
    #[default]
    AddNode,
    RemoveNode,
}

/// A weighted membership change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: u64,
    #[serde(default)]
    pub weight: u32,
    /// Application payload, opaque to the consensus core.
    #[serde(default)]
    pub context: Vec<u8>,
}

impl ConfChange {
    pub fn add_node(node_id: u64, weight: u32, context: Vec<u8>) -> Self {
        Self {
            change_type: ConfChangeType::AddNode,
            node_id,
            weight,
            context,
        }
    }

    pub fn remove_node(node_id: u64, context: Vec<u8>) -> Self {
        Self {
            change_type: ConfChangeType::RemoveNode,
            node_id,
            weight: 0,
            context,
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| crate::RaftError::Codec(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(data).map_err(|e| crate::RaftError::Codec(e.to_string()))
    }
}

/// Voters and their weights.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: BTreeMap<u64, u32>,
}

impl ConfState {
    pub fn total_weight(&self) -> u64 {
        self.voters.values().map(|w| u64::from(*w)).sum()
    }
}

/// State that must be persisted before messages are sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub conf_state: ConfState,
    pub index: u64,
    pub term: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Local: start an election.
    #[default]
    Hup,
    /// Local: leader heartbeat tick.
    Beat,
    Propose,
    Append,
    AppendResponse,
    RequestVote,
    RequestVoteResponse,
    RequestPreVote,
    RequestPreVoteResponse,
    Snapshot,
    Heartbeat,
    HeartbeatResponse,
    /// Transfer leadership to `from`.
    TransferLeader,
    TimeoutNow,
    /// Local: leader checks it still hears from a quorum.
    CheckQuorum,
    /// Local: a peer could not be reached.
    Unreachable,
    /// Local: result of sending a snapshot.
    SnapStatus,
}

impl MessageType {
    pub fn is_local(self) -> bool {
        matches!(
            self,
            MessageType::Hup | MessageType::Beat | MessageType::CheckQuorum | MessageType::Unreachable | MessageType::SnapStatus
        )
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::AppendResponse
                | MessageType::RequestVoteResponse
                | MessageType::RequestPreVoteResponse
                | MessageType::HeartbeatResponse
                | MessageType::Unreachable
                | MessageType::SnapStatus
        )
    }

    pub(crate) fn vote_response(self) -> MessageType {
        match self {
            MessageType::RequestPreVote => MessageType::RequestPreVoteResponse,
            _ => MessageType::RequestVoteResponse,
        }
    }
}

/// A consensus message between two raft ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub to: u64,
    pub from: u64,
    pub term: u64,
    #[serde(default)]
    pub log_term: u64,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub commit: u64,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub reject_hint: u64,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub context: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, to: u64, from: u64) -> Self {
        Self {
            msg_type,
            to,
            from,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_change_codec() {
        let cc = ConfChange::add_node(7, 2_000, b"ctx".to_vec());
        let decoded = ConfChange::decode(&cc.encode().expect("encode")).expect("decode");
        assert_eq!(cc, decoded);
        assert!(ConfChange::decode(b"{").is_err());
    }

    #[test]
    fn test_total_weight() {
        let mut cs = ConfState::default();
        cs.voters.insert(1, 2_000);
        cs.voters.insert(2, 2);
        cs.voters.insert(3, 0);
        assert_eq!(cs.total_weight(), 2_002);
    }

    #[test]
    fn test_message_json_defaults() {
        let m: Message = serde_json::from_str(r#"{"msg_type":"heartbeat","to":2,"from":1,"term":3}"#).expect("decode");
        assert_eq!(m.msg_type, MessageType::Heartbeat);
        assert!(m.entries.is_empty());
        assert!(m.snapshot.is_none());
    }
}
