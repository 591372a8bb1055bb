//! Alive and pending storage of one oplog family.
//!
//! ```text
//! alive   = family.log     || entity id || log id
//! pending = family.pending || entity id || log id
//! ```
//!
//! Saving a log as alive removes its pending copy in the same batch and adds
//! its leaf to the family's Merkle tree.

use std::marker::PhantomData;
use std::sync::Arc;

use kith_db::{Batch, Direction, Store};
use kith_types::{EntityId, ListOrder, LogId, Status};
use tracing::debug;

use crate::merkle::Merkle;
use crate::oplog::{OpKind, Oplog};
use crate::{OplogError, Result};

pub struct OplogStore<O: OpKind> {
    db: Arc<Store>,
    merkle: Option<Merkle>,
    _op: PhantomData<O>,
}

impl<O: OpKind> Clone for OplogStore<O> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            merkle: self.merkle.clone(),
            _op: PhantomData,
        }
    }
}

fn key(prefix: &[u8], entity: &EntityId, id: Option<&LogId>) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 64);
    key.extend_from_slice(prefix);
    key.extend_from_slice(entity.as_bytes());
    if let Some(id) = id {
        key.extend_from_slice(id.as_bytes());
    }
    key
}

fn direction(order: ListOrder) -> Direction {
    match order {
        ListOrder::Asc => Direction::Forward,
        ListOrder::Desc => Direction::Reverse,
    }
}

impl<O: OpKind> OplogStore<O> {
    pub fn new(db: Arc<Store>) -> Self {
        let merkle = O::FAMILY.merkle.map(|prefix| Merkle::new(db.clone(), prefix));
        Self {
            db,
            merkle,
            _op: PhantomData,
        }
    }

    pub fn merkle(&self) -> Option<&Merkle> {
        self.merkle.as_ref()
    }

    fn decode(raw: &[u8]) -> Result<Oplog<O>> {
        serde_json::from_slice(raw).map_err(|e| OplogError::Serialization(e.to_string()))
    }

    fn decode_all(pairs: Vec<kith_db::store::Pair>) -> Result<Vec<Oplog<O>>> {
        pairs.iter().map(|(_, v)| Self::decode(v)).collect()
    }

    /// Store `log` as alive. Returns false when it was already alive.
    pub fn save_alive(&self, log: &Oplog<O>) -> Result<bool> {
        let entity = &log.creator_id;
        let alive_key = key(O::FAMILY.log, entity, Some(&log.id));
        let existed = self.db.contains(&alive_key)?;
        let mut log = log.clone();
        log.status = Status::Alive;
        let mut batch = Batch::new();
        batch.put_json(alive_key, &log)?;
        batch.delete(key(O::FAMILY.pending, entity, Some(&log.id)));
        self.db.write(batch)?;
        if let Some(merkle) = &self.merkle {
            merkle.insert(entity, log.ts, &log.id, log.digest())?;
        }
        debug!(family = O::FAMILY.name, id = %log.id, op = ?log.op, new = !existed, "saved alive oplog");
        Ok(!existed)
    }

    /// Store `log` as pending (or internal pending); alive copies win.
    pub fn save_pending(&self, log: &Oplog<O>) -> Result<()> {
        if self.contains(&log.creator_id, &log.id)? {
            return Ok(());
        }
        self.db
            .put_json(&key(O::FAMILY.pending, &log.creator_id, Some(&log.id)), log)?;
        debug!(family = O::FAMILY.name, id = %log.id, status = %log.status, "saved pending oplog");
        Ok(())
    }

    pub fn get(&self, entity: &EntityId, id: &LogId) -> Result<Option<Oplog<O>>> {
        match self.db.get_opt(&key(O::FAMILY.log, entity, Some(id)))? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_pending(&self, entity: &EntityId, id: &LogId) -> Result<Option<Oplog<O>>> {
        match self.db.get_opt(&key(O::FAMILY.pending, entity, Some(id)))? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// The alive copy if any, else the pending one.
    pub fn get_any(&self, entity: &EntityId, id: &LogId) -> Result<Option<Oplog<O>>> {
        match self.get(entity, id)? {
            Some(log) => Ok(Some(log)),
            None => self.get_pending(entity, id),
        }
    }

    /// Whether an alive copy exists.
    pub fn contains(&self, entity: &EntityId, id: &LogId) -> Result<bool> {
        Ok(self.db.contains(&key(O::FAMILY.log, entity, Some(id)))?)
    }

    /// Flag an alive log as synced. Returns whether the log exists.
    pub fn mark_sync(&self, entity: &EntityId, id: &LogId) -> Result<bool> {
        let Some(mut log) = self.get(entity, id)? else {
            return Ok(false);
        };
        if !log.is_sync {
            log.is_sync = true;
            self.db.put_json(&key(O::FAMILY.log, entity, Some(id)), &log)?;
        }
        Ok(true)
    }

    /// Alive logs ordered by id, starting at `start` (inclusive). `limit == 0` is unbounded.
    pub fn list(&self, entity: &EntityId, start: Option<&LogId>, limit: usize, order: ListOrder) -> Result<Vec<Oplog<O>>> {
        let prefix = key(O::FAMILY.log, entity, None);
        let start = start.map(|id| key(O::FAMILY.log, entity, Some(id)));
        let pairs = self.db.scan(&prefix, start.as_deref(), limit, direction(order))?;
        Self::decode_all(pairs)
    }

    /// Pending logs, optionally only those with `status`.
    pub fn list_pending(
        &self,
        entity: &EntityId,
        status: Option<Status>,
        start: Option<&LogId>,
        limit: usize,
        order: ListOrder,
    ) -> Result<Vec<Oplog<O>>> {
        let prefix = key(O::FAMILY.pending, entity, None);
        let start = start.map(|id| key(O::FAMILY.pending, entity, Some(id)));
        let pairs = self.db.scan(&prefix, start.as_deref(), 0, direction(order))?;
        let mut out = Vec::new();
        for log in Self::decode_all(pairs)? {
            if status.is_some_and(|s| s != log.status) {
                continue;
            }
            out.push(log);
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn delete_pending(&self, entity: &EntityId, id: &LogId) -> Result<()> {
        self.db.delete(&key(O::FAMILY.pending, entity, Some(id)))?;
        Ok(())
    }

    /// The alive log with the greatest id.
    pub fn newest(&self, entity: &EntityId) -> Result<Option<Oplog<O>>> {
        match self.db.last(&key(O::FAMILY.log, entity, None))? {
            Some((_, raw)) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn count(&self, entity: &EntityId) -> Result<usize> {
        Ok(self.db.count_prefix(&key(O::FAMILY.log, entity, None))?)
    }

    /// Remove every log and the tree of `entity`.
    pub fn delete_all(&self, entity: &EntityId) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete_prefix(key(O::FAMILY.log, entity, None));
        batch.delete_prefix(key(O::FAMILY.pending, entity, None));
        self.db.write(batch)?;
        if let Some(merkle) = &self.merkle {
            merkle.clear(entity)?;
        }
        Ok(())
    }
}
