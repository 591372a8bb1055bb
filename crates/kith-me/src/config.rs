//! Runtime configuration of the Me subsystem.

use std::path::PathBuf;
use std::time::Duration;

use kith_types::NodeType;
use serde::{Deserialize, Serialize};

/// Settings shared by every identity of one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeConfig {
    /// Root directory; keys live under `me/`, one SQLite file per space.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Identity key to import, hex.
    #[serde(default)]
    pub private_key: Option<String>,
    /// File holding the identity key to import, hex.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Postfix of the imported identity, hex.
    #[serde(default)]
    pub postfix: Option<String>,
    /// Expected id of the imported identity, hex.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub node_type: NodeType,
    /// Display name of this device.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Display name used when a new identity is created here.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_raft_tick_ms")]
    pub raft_tick_ms: u64,
    /// Applied entries between raft snapshots; 0 disables snapshots.
    #[serde(default)]
    pub snapshot_gap: u64,
    #[serde(default = "default_lead_retry_ms")]
    pub lead_retry_ms: u64,
    #[serde(default = "default_lead_attempts")]
    pub lead_attempts: u32,
    #[serde(default = "default_init_me_info_ms")]
    pub init_me_info_ms: u64,
    #[serde(default = "default_renew_join_key_secs")]
    pub renew_join_key_secs: u64,
    #[serde(default = "default_join_sync_ms")]
    pub join_sync_ms: u64,
    #[serde(default = "default_join_key_ttl_secs")]
    pub join_key_ttl_secs: u64,
    /// Period of the Merkle digest exchange.
    #[serde(default = "default_oplog_sync_ms")]
    pub oplog_sync_ms: u64,
    #[serde(default = "default_pending_sync_ms")]
    pub pending_sync_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".kith")
}

fn default_node_name() -> String {
    "device".to_string()
}

fn default_name() -> String {
    "me".to_string()
}

fn default_raft_tick_ms() -> u64 {
    100
}

fn default_lead_retry_ms() -> u64 {
    3_000
}

fn default_lead_attempts() -> u32 {
    10
}

fn default_init_me_info_ms() -> u64 {
    3_000
}

fn default_renew_join_key_secs() -> u64 {
    600
}

fn default_join_sync_ms() -> u64 {
    10_000
}

fn default_join_key_ttl_secs() -> u64 {
    1_800
}

fn default_oplog_sync_ms() -> u64 {
    30_000
}

fn default_pending_sync_ms() -> u64 {
    5_000
}

impl Default for MeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            private_key: None,
            key_file: None,
            postfix: None,
            id: None,
            node_type: NodeType::default(),
            node_name: default_node_name(),
            name: default_name(),
            raft_tick_ms: default_raft_tick_ms(),
            snapshot_gap: 0,
            lead_retry_ms: default_lead_retry_ms(),
            lead_attempts: default_lead_attempts(),
            init_me_info_ms: default_init_me_info_ms(),
            renew_join_key_secs: default_renew_join_key_secs(),
            join_sync_ms: default_join_sync_ms(),
            join_key_ttl_secs: default_join_key_ttl_secs(),
            oplog_sync_ms: default_oplog_sync_ms(),
            pending_sync_ms: default_pending_sync_ms(),
        }
    }
}

impl MeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Directory of the key files.
    pub fn key_dir(&self) -> PathBuf {
        self.data_dir.join("me")
    }

    pub fn raft_tick(&self) -> Duration {
        Duration::from_millis(self.raft_tick_ms.max(1))
    }

    pub fn lead_retry(&self) -> Duration {
        Duration::from_millis(self.lead_retry_ms)
    }

    pub fn init_me_info_period(&self) -> Duration {
        Duration::from_millis(self.init_me_info_ms.max(1))
    }

    pub fn renew_join_key_period(&self) -> Duration {
        Duration::from_secs(self.renew_join_key_secs.max(1))
    }

    pub fn join_sync_period(&self) -> Duration {
        Duration::from_millis(self.join_sync_ms.max(1))
    }

    /// Join key TTL in nanoseconds, the unit of request timestamps.
    pub fn join_key_ttl_nanos(&self) -> i64 {
        i64::try_from(self.join_key_ttl_secs)
            .unwrap_or(i64::MAX / kith_types::time::NANOS_PER_SECOND)
            .saturating_mul(kith_types::time::NANOS_PER_SECOND)
    }

    pub fn oplog_sync_period(&self) -> Duration {
        Duration::from_millis(self.oplog_sync_ms.max(1))
    }

    pub fn pending_sync_period(&self) -> Duration {
        Duration::from_millis(self.pending_sync_ms.max(1))
    }
}
