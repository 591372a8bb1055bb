//! Configuration file management.
//!
//! `config.toml` lives in the data directory. Every section and field is
//! optional; missing values take the defaults of [`MeConfig`].

use std::path::PathBuf;

use kith_me::MeConfig;
use kith_types::NodeType;
use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
}

/// Identity import and naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Identity private key to import, hex.
    pub private_key: Option<String>,
    /// File holding the identity key to import.
    pub key_file: Option<PathBuf>,
    /// Postfix of the imported identity, hex.
    pub postfix: Option<String>,
    /// Expected id of the imported identity, hex.
    pub id: Option<String>,
    /// "server" | "desktop" | "mobile".
    pub node_type: NodeType,
    pub node_name: String,
    /// Profile name of an identity created on this device.
    pub name: String,
}

/// Consensus timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub tick_ms: u64,
    /// Applied entries between snapshots; 0 disables them.
    pub snapshot_gap: u64,
    pub lead_retry_ms: u64,
    pub lead_attempts: u32,
}

/// Periods of the background loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub init_me_info_ms: u64,
    pub renew_join_key_secs: u64,
    pub join_sync_ms: u64,
    pub join_key_ttl_secs: u64,
    pub oplog_sync_ms: u64,
    pub pending_sync_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also log every identity event.
    #[serde(default)]
    pub events: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let me = MeConfig::default();
        Self {
            private_key: None,
            key_file: None,
            postfix: None,
            id: None,
            node_type: me.node_type,
            node_name: me.node_name,
            name: me.name,
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        let me = MeConfig::default();
        Self {
            tick_ms: me.raft_tick_ms,
            snapshot_gap: me.snapshot_gap,
            lead_retry_ms: me.lead_retry_ms,
            lead_attempts: me.lead_attempts,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let me = MeConfig::default();
        Self {
            init_me_info_ms: me.init_me_info_ms,
            renew_join_key_secs: me.renew_join_key_secs,
            join_sync_ms: me.join_sync_ms,
            join_key_ttl_secs: me.join_key_ttl_secs,
            oplog_sync_ms: me.oplog_sync_ms,
            pending_sync_ms: me.pending_sync_ms,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            events: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// Settings of the Me backend.
    pub fn me_config(&self) -> MeConfig {
        let identity = self.identity.clone();
        MeConfig {
            data_dir: self.data_dir(),
            private_key: identity.private_key,
            key_file: identity.key_file,
            postfix: identity.postfix,
            id: identity.id,
            node_type: identity.node_type,
            node_name: identity.node_name,
            name: identity.name,
            raft_tick_ms: self.raft.tick_ms,
            snapshot_gap: self.raft.snapshot_gap,
            lead_retry_ms: self.raft.lead_retry_ms,
            lead_attempts: self.raft.lead_attempts,
            init_me_info_ms: self.sync.init_me_info_ms,
            renew_join_key_secs: self.sync.renew_join_key_secs,
            join_sync_ms: self.sync.join_sync_ms,
            join_key_ttl_secs: self.sync.join_key_ttl_secs,
            oplog_sync_ms: self.sync.oplog_sync_ms,
            pending_sync_ms: self.sync.pending_sync_ms,
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("KITH_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("KITH_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/Kith")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("Kith")
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".kith")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/kith"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        let me = config.me_config();
        assert_eq!(me.raft_tick_ms, MeConfig::default().raft_tick_ms);
        assert_eq!(me.join_key_ttl_secs, 1800);
        assert_eq!(config.logging.level, "info");
        assert!(me.private_key.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let _parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
    }

    #[test]
    fn test_partial_sections() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [storage]
            data_dir = "/var/lib/kith"

            [identity]
            node_type = "server"
            node_name = "rack-1"

            [raft]
            tick_ms = 50
            "#,
        )
        .expect("parse");
        let me = config.me_config();
        assert_eq!(me.data_dir, PathBuf::from("/var/lib/kith"));
        assert_eq!(me.node_type, NodeType::Server);
        assert_eq!(me.node_name, "rack-1");
        assert_eq!(me.raft_tick_ms, 50);
        assert_eq!(me.lead_attempts, MeConfig::default().lead_attempts);
        assert_eq!(me.oplog_sync_ms, 30_000);
    }
}
