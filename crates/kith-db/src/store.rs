//! Ordered key-value store over one SQLite table.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::{DbError, Result};

/// A key-value pair read back from a scan.
pub type Pair = (Vec<u8>, Vec<u8>);

/// Scan direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    DeletePrefix(Vec<u8>),
}

/// A set of writes applied atomically by [`Store::write`].
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
        self
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<Vec<u8>>, value: &T) -> Result<&mut Self> {
        let raw = serde_json::to_vec(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        Ok(self.put(key, raw))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key.into()));
        self
    }

    pub fn delete_prefix(&mut self, prefix: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::DeletePrefix(prefix.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One key-value space.
pub struct Store {
    conn: Mutex<Connection>,
    name: String,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("name", &self.name).finish()
    }
}

/// Smallest key greater than every key starting with `prefix`, if any.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xff {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

fn collect_pairs(conn: &Connection, sql: &str, args: Vec<Vec<u8>>) -> Result<Vec<Pair>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn delete_prefix_in(conn: &Connection, prefix: &[u8]) -> Result<usize> {
    let n = match prefix_upper_bound(prefix) {
        Some(upper) => conn.execute("DELETE FROM kv WHERE k >= ?1 AND k < ?2", params![prefix, upper])?,
        None => conn.execute("DELETE FROM kv WHERE k >= ?1", params![prefix])?,
    };
    Ok(n)
}

impl Store {
    pub(crate) fn new(conn: Connection, name: String) -> Self {
        Self {
            conn: Mutex::new(conn),
            name,
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema version of this space.
    pub fn user_version(&self) -> Result<u32> {
        let conn = self.conn()?;
        Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_opt(key)?
            .ok_or_else(|| DbError::NotFound(format!("{}: key {}", self.name, hex_key(key))))
    }

    pub fn get_opt(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get_opt(key)?.is_some())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)", params![key, value])?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE k = ?1", params![key])?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<T> {
        let raw = self.get(key)?;
        serde_json::from_slice(&raw).map_err(|e| DbError::Serialization(e.to_string()))
    }

    pub fn get_json_opt<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get_opt(key)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.put(key, &raw)
    }

    /// Apply every write in `batch` in one transaction.
    pub fn write(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for op in &batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    tx.execute("INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)", params![k, v])?;
                }
                BatchOp::Delete(k) => {
                    tx.execute("DELETE FROM kv WHERE k = ?1", params![k])?;
                }
                BatchOp::DeletePrefix(p) => {
                    delete_prefix_in(&tx, p)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Pair>> {
        self.scan(prefix, None, 0, Direction::Forward)
    }

    /// Pairs under `prefix` starting at `start` (inclusive) in `direction`.
    ///
    /// `limit == 0` means no limit.
    pub fn scan(&self, prefix: &[u8], start: Option<&[u8]>, limit: usize, direction: Direction) -> Result<Vec<Pair>> {
        let upper = prefix_upper_bound(prefix);
        let mut clauses = vec!["k >= ?".to_string()];
        let mut args: Vec<Vec<u8>> = Vec::new();
        match (direction, start) {
            (Direction::Forward, Some(start)) if start > prefix => args.push(start.to_vec()),
            _ => args.push(prefix.to_vec()),
        }
        if let Some(upper) = upper {
            clauses.push("k < ?".to_string());
            args.push(upper);
        }
        if let (Direction::Reverse, Some(start)) = (direction, start) {
            clauses.push("k <= ?".to_string());
            args.push(start.to_vec());
        }
        let order = match direction {
            Direction::Forward => "ASC",
            Direction::Reverse => "DESC",
        };
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let sql = format!(
            "SELECT k, v FROM kv WHERE {} ORDER BY k {order} LIMIT {limit}",
            clauses.join(" AND ")
        );
        let conn = self.conn()?;
        collect_pairs(&conn, &sql, args)
    }

    /// Pairs with `lo <= key < hi`, in key order.
    pub fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<Pair>> {
        let conn = self.conn()?;
        collect_pairs(
            &conn,
            "SELECT k, v FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k ASC",
            vec![lo.to_vec(), hi.to_vec()],
        )
    }

    /// First pair under `prefix`.
    pub fn first(&self, prefix: &[u8]) -> Result<Option<Pair>> {
        Ok(self.scan(prefix, None, 1, Direction::Forward)?.into_iter().next())
    }

    /// Last pair under `prefix`.
    pub fn last(&self, prefix: &[u8]) -> Result<Option<Pair>> {
        Ok(self.scan(prefix, None, 1, Direction::Reverse)?.into_iter().next())
    }

    /// Delete every key under `prefix`. Returns the number removed.
    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let conn = self.conn()?;
        delete_prefix_in(&conn, prefix)
    }

    /// Delete keys with `lo <= key < hi`.
    pub fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM kv WHERE k >= ?1 AND k < ?2", params![lo, hi])?)
    }

    pub fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = match prefix_upper_bound(prefix) {
            Some(upper) => conn.query_row(
                "SELECT COUNT(*) FROM kv WHERE k >= ?1 AND k < ?2",
                params![prefix, upper],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM kv WHERE k >= ?1", params![prefix], |row| row.get(0))?,
        };
        Ok(n as usize)
    }
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        crate::open_memory().expect("open test db")
    }

    #[test]
    fn test_put_get_delete() {
        let store = test_store();
        store.put(b".mndb1", b"node").expect("put");
        assert_eq!(store.get(b".mndb1").expect("get"), b"node");
        store.delete(b".mndb1").expect("delete");
        assert!(matches!(store.get(b".mndb1"), Err(DbError::NotFound(_))));
        assert!(store.get_opt(b".mndb1").expect("get opt").is_none());
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let store = test_store();
        store.put(b"b\x02", b"2").expect("put");
        store.put(b"b\x01", b"1").expect("put");
        store.put(b"a\xff", b"x").expect("put");
        store.put(b"c\x00", b"y").expect("put");
        let pairs = store.scan_prefix(b"b").expect("scan");
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"b\x01".to_vec(), b"b\x02".to_vec()]);
    }

    #[test]
    fn test_scan_reverse_with_start_and_limit() {
        let store = test_store();
        for i in 0u8..10 {
            store.put(&[b'p', i], &[i]).expect("put");
        }
        let pairs = store.scan(b"p", Some(&[b'p', 6]), 3, Direction::Reverse).expect("scan");
        let values: Vec<u8> = pairs.iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values, vec![6, 5, 4]);

        let pairs = store.scan(b"p", Some(&[b'p', 8]), 0, Direction::Forward).expect("scan");
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_first_last() {
        let store = test_store();
        assert!(store.first(b"r").expect("first").is_none());
        for i in [3u8, 1, 7] {
            store.put(&[b'r', i], b"").expect("put");
        }
        assert_eq!(store.first(b"r").expect("first").map(|p| p.0), Some(vec![b'r', 1]));
        assert_eq!(store.last(b"r").expect("last").map(|p| p.0), Some(vec![b'r', 7]));
    }

    #[test]
    fn test_batch_is_atomic_and_deletes_prefix() {
        let store = test_store();
        store.put(b"x1", b"old").expect("put");
        store.put(b"x2", b"old").expect("put");
        let mut batch = Batch::new();
        batch.delete_prefix(b"x".to_vec()).put(b"x3".to_vec(), b"new".to_vec());
        store.write(batch).expect("write");
        let pairs = store.scan_prefix(b"x").expect("scan");
        assert_eq!(pairs, vec![(b"x3".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_range_and_count() {
        let store = test_store();
        for i in 0u8..5 {
            store.put(&[b'i', i], b"").expect("put");
        }
        assert_eq!(store.range(&[b'i', 1], &[b'i', 3]).expect("range").len(), 2);
        assert_eq!(store.count_prefix(b"i").expect("count"), 5);
        assert_eq!(store.delete_range(&[b'i', 0], &[b'i', 2]).expect("delete"), 2);
        assert_eq!(store.count_prefix(b"i").expect("count"), 3);
    }

    #[test]
    fn test_json_helpers() {
        let store = test_store();
        store.put_json(b"j", &vec![1u32, 2, 3]).expect("put");
        let v: Vec<u32> = store.get_json(b"j").expect("get");
        assert_eq!(v, vec![1, 2, 3]);
        let missing: Option<Vec<u32>> = store.get_json_opt(b"nope").expect("get");
        assert!(missing.is_none());
    }
}
