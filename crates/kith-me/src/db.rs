//! The key-value spaces of the Me subsystem.
//!
//! Every identity of a backend shares these spaces; records are keyed by
//! identity id where it matters.

use std::path::Path;
use std::sync::Arc;

use kith_db::Store;

use crate::Result;

/// Identity records (`.medb`).
pub const PREFIX_ME: &[u8] = b".medb";
/// MyNode records (`.mndb`).
pub const PREFIX_MY_NODE: &[u8] = b".mndb";
/// Raft log entries (`.rfdb`).
pub const PREFIX_RAFT_ENTRY: &[u8] = b".rfdb";
pub const PREFIX_RAFT_HARD_STATE: &[u8] = b".rfhs";
pub const PREFIX_RAFT_SNAPSHOT: &[u8] = b".rfsn";
pub const PREFIX_RAFT_CONF_STATE: &[u8] = b".rfcs";
/// Newest master log index.
pub const PREFIX_RAFT_LAST_MASTER: &[u8] = b".rfli";
/// Last applied raft index.
pub const PREFIX_RAFT_APPLIED: &[u8] = b".rfai";
/// Index of the last raft snapshot.
pub const PREFIX_RAFT_SNAPSHOT_INDEX: &[u8] = b".rfsi";
/// Leader seen last, kept for diagnostics.
pub const PREFIX_RAFT_LEAD: &[u8] = b".rfld";
/// Op key records (`.okdb`).
pub const PREFIX_OP_KEY: &[u8] = b".okdb";
/// Sign key rotation counters.
pub const PREFIX_SIGN_KEY: &[u8] = b".skdb";

/// `prefix || parts...`
pub fn key(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

#[derive(Debug, Clone)]
pub struct MeDb {
    pub me: Arc<Store>,
    pub mynodes: Arc<Store>,
    pub raft: Arc<Store>,
    pub memeta: Arc<Store>,
    pub signkey: Arc<Store>,
    pub oplog: Arc<Store>,
}

impl MeDb {
    /// Open (creating when missing) `<dir>/<space>.db` for every space.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| -> Result<Arc<Store>> { Ok(Arc::new(kith_db::open(&dir.join(format!("{name}.db")))?)) };
        Ok(Self {
            me: open("me")?,
            mynodes: open("mynodes")?,
            raft: open("raft")?,
            memeta: open("memeta")?,
            signkey: open("signkey")?,
            oplog: open("oplog")?,
        })
    }

    pub fn open_memory() -> Result<Self> {
        let open = || -> Result<Arc<Store>> { Ok(Arc::new(kith_db::open_memory()?)) };
        Ok(Self {
            me: open()?,
            mynodes: open()?,
            raft: open()?,
            memeta: open()?,
            signkey: open()?,
            oplog: open()?,
        })
    }
}
