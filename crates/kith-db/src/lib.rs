//! # kith-db
//!
//! Prefix-iterable key-value spaces on SQLite.
//!
//! Each space is one database file holding a single `kv` table with blob
//! keys. Keys are compared bytewise, so every record family is laid out as
//! `prefix || fixed-width parts` and read back with prefix or range scans.
//!
//! - WAL mode, `synchronous = NORMAL`
//! - Schema version stored in `PRAGMA user_version`
//! - Multi-key writes go through [`Batch`] and commit in one transaction

pub mod migrations;
pub mod store;

use std::path::Path;

use rusqlite::Connection;

pub use store::{Batch, Direction, Store};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the space at `path`.
pub fn open(path: &Path) -> Result<Store> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    tracing::debug!(path = %path.display(), "opened kv space");
    Ok(Store::new(conn, path.display().to_string()))
}

/// Open an in-memory space (for testing).
pub fn open_memory() -> Result<Store> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(Store::new(conn, ":memory:".to_string()))
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let store = open_memory().expect("open in-memory db");
        assert_eq!(store.user_version().expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn test_open_file_persists() {
        let dir = std::env::temp_dir().join(format!("kith-db-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("space.db");
        {
            let store = open(&path).expect("open");
            store.put(b"k", b"v").expect("put");
        }
        let store = open(&path).expect("reopen");
        assert_eq!(store.get(b"k").expect("get"), b"v");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
