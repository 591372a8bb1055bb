//! One identity on this backend.
//!
//! [`Me`] aggregates the device registry, the raft engine, the oplog
//! families and the join channels of an identity. The protocol modules
//! extend it with further `impl Me` blocks.
//!
//! All locks are std locks held for short synchronous sections, never
//! across an await. The oplog family write locks are outermost; the
//! identity, device and key locks never wrap another lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use kith_crypto::secp256k1::PrivateKey;
use kith_oplog::OplogStore;
use kith_transport::{Envelope, Transport};
use kith_types::{EntityId, NodeId, NodeSignId, PeerType, Status};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MeConfig;
use crate::db::MeDb;
use crate::events::{self, Event, EventBus};
use crate::join::Joins;
use crate::keystore::KeyStore;
use crate::master_oplog::MasterOplogs;
use crate::me_oplog::MeOp;
use crate::my_info::{MyInfo, MyKeys, SignKeyIndex};
use crate::my_node::{load_my_nodes, MyNode, MyNodes};
use crate::op_key::{OpKeyOp, OpKeyRing};
use crate::raft::RaftEngine;
use crate::services::Services;
use crate::sync::{lock, read, write};
use crate::{MeError, Result};

/// Identities currently running on a backend.
pub type Registry = Arc<RwLock<HashMap<EntityId, Arc<Me>>>>;

/// Requests from an identity to its backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Stop and reopen the identity.
    Restart(EntityId),
    /// Open and start a newly recorded identity.
    Register(EntityId),
    /// The identity stopped itself for good.
    Stopped(EntityId),
    Fatal(String),
}

/// What every identity of a backend shares.
#[derive(Clone)]
pub struct MeContext {
    pub config: Arc<MeConfig>,
    pub db: MeDb,
    pub keystore: KeyStore,
    pub transport: Arc<dyn Transport>,
    pub services: Services,
    pub events: EventBus,
    pub node_key: PrivateKey,
    pub node_id: NodeId,
    pub validate_key: [u8; 32],
    pub signals: mpsc::UnboundedSender<Signal>,
    pub registry: Registry,
}

impl std::fmt::Debug for MeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeContext")
            .field("node_id", &self.node_id)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

pub struct Me {
    pub(crate) id: EntityId,
    pub(crate) node_id: NodeId,
    pub(crate) raft_id: u64,
    pub(crate) node_sign_id: NodeSignId,
    pub(crate) ctx: MeContext,
    pub(crate) info: Mutex<MyInfo>,
    pub(crate) keys: Mutex<MyKeys>,
    pub(crate) my_nodes: RwLock<MyNodes>,
    pub(crate) master: MasterOplogs,
    pub(crate) me_oplogs: OplogStore<MeOp>,
    pub(crate) me_oplog_lock: Mutex<()>,
    pub(crate) op_key_oplogs: OplogStore<OpKeyOp>,
    pub(crate) op_key_lock: Mutex<()>,
    pub(crate) op_keys: RwLock<OpKeyRing>,
    pub(crate) joins: Joins,
    pub(crate) raft: RwLock<Option<Arc<RaftEngine>>>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Me {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Me")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Me {
    /// Load the identity `id` recorded on this backend.
    pub fn open(ctx: &MeContext, id: EntityId) -> Result<Arc<Me>> {
        let info = MyInfo::load(&ctx.db.me, &id)?.ok_or_else(|| MeError::NotFound(format!("identity {id}")))?;
        if info.status.is_terminal() {
            return Err(MeError::InvalidMe(format!("identity {id} is {}", info.status)));
        }
        let identity = ctx.keystore.load_by_id(&id)?;
        let index = SignKeyIndex::load(&ctx.db.signkey, &id)?;
        let keys = MyKeys::new(identity.map(|k| k.key), ctx.node_key.clone(), index)?;
        let my_nodes = load_my_nodes(&ctx.db.mynodes, &id, &ctx.node_id)?;
        let master = MasterOplogs::open(id, &ctx.db)?;
        let op_keys = OpKeyRing::load(&ctx.db.signkey, &id)?;
        let self_node = my_nodes
            .get_by_node(&ctx.node_id)
            .cloned()
            .ok_or_else(|| MeError::InvalidMe(format!("this device is not a device of {id}")))?;
        let (quit, _) = watch::channel(false);
        debug!(id = %id, status = %info.status, devices = my_nodes.len(), "identity opened");
        Ok(Arc::new(Me {
            id,
            node_id: ctx.node_id,
            raft_id: self_node.raft_id,
            node_sign_id: self_node.node_sign_id,
            ctx: ctx.clone(),
            info: Mutex::new(info),
            keys: Mutex::new(keys),
            my_nodes: RwLock::new(my_nodes),
            master,
            me_oplogs: OplogStore::new(ctx.db.oplog.clone()),
            me_oplog_lock: Mutex::new(()),
            op_key_oplogs: OplogStore::new(ctx.db.oplog.clone()),
            op_key_lock: Mutex::new(()),
            op_keys: RwLock::new(op_keys),
            joins: Joins::new(),
            raft: RwLock::new(None),
            quit,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the raft engine and the background loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        info!(id = %self.id, status = %self.status(), raft_id = self.raft_id, "starting identity");
        self.start_raft()?;
        self.start_join_loops();
        self.spawn(self.clone().init_me_info_loop(self.quit_rx()));
        self.spawn(self.clone().me_oplog_sync_loop(self.quit_rx()));
        self.spawn(self.clone().pending_oplog_loop(self.quit_rx()));
        Ok(())
    }

    /// Stop every loop and the raft engine. Safe to call twice.
    pub fn stop(&self) {
        if self.quit.send_replace(true) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        *write(&self.raft) = None;
        self.unregister_join_keys();
        info!(id = %self.id, "identity stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.quit.borrow()
    }

    pub(crate) fn quit_rx(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.tasks).push(tokio::spawn(fut));
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft_id(&self) -> u64 {
        self.raft_id
    }

    pub(crate) fn config(&self) -> &MeConfig {
        &self.ctx.config
    }

    pub(crate) fn services(&self) -> &Services {
        &self.ctx.services
    }

    pub(crate) fn keystore(&self) -> &KeyStore {
        &self.ctx.keystore
    }

    pub(crate) fn db(&self) -> &MeDb {
        &self.ctx.db
    }

    pub fn status(&self) -> Status {
        lock(&self.info).status
    }

    pub fn info(&self) -> MyInfo {
        lock(&self.info).clone()
    }

    /// Advance and persist the identity status. Returns whether it changed.
    pub(crate) fn set_status(&self, status: Status) -> Result<bool> {
        let changed = {
            let mut info = lock(&self.info);
            let from = info.status;
            if !info.set_status(status) {
                return Ok(false);
            }
            info.save(&self.db().me)?;
            (from, info.status)
        };
        info!(id = %self.id, from = %changed.0, to = %changed.1, "identity status changed");
        self.emit(
            events::ME_STATUS_CHANGED,
            serde_json::json!({ "from": changed.0.to_string(), "to": changed.1.to_string() }),
        );
        Ok(true)
    }

    pub(crate) fn emit(&self, event_type: &str, payload: serde_json::Value) {
        self.ctx.events.emit(Event::new(event_type, self.id, payload));
    }

    pub(crate) fn signal(&self, signal: Signal) {
        if self.ctx.signals.send(signal).is_err() {
            debug!(id = %self.id, "backend no longer listens for signals");
        }
    }

    /// Persist the sign key counters after any rotation.
    pub(crate) fn rotate_sign_keys(&self, keys: &mut MyKeys) -> Result<()> {
        if keys.rotate_exhausted()? {
            keys.index.save(&self.db().signkey, &self.id)?;
            debug!(id = %self.id, index = ?keys.index, "rotated sign keys");
        }
        Ok(())
    }

    // ---- devices -----------------------------------------------------------

    pub fn my_nodes(&self) -> Vec<MyNode> {
        read(&self.my_nodes).values().cloned().collect()
    }

    pub fn my_node(&self, node_id: &NodeId) -> Option<MyNode> {
        read(&self.my_nodes).get_by_node(node_id).cloned()
    }

    pub fn self_node(&self) -> Option<MyNode> {
        self.my_node(&self.node_id)
    }

    pub fn total_weight(&self) -> u64 {
        read(&self.my_nodes).total_weight()
    }

    /// Devices other than this one exchanging consensus traffic.
    pub(crate) fn synced_peers(&self) -> Vec<MyNode> {
        read(&self.my_nodes).synced_peers(&self.node_id)
    }

    /// Advance and persist the status of a device. Returns whether it changed.
    pub(crate) fn set_node_status(&self, node_id: &NodeId, status: Status) -> Result<bool> {
        let mut nodes = write(&self.my_nodes);
        let Some(node) = nodes.get_by_node_mut(node_id) else {
            return Ok(false);
        };
        node.last_seen = kith_types::time::now();
        if !node.set_status(status) {
            return Ok(false);
        }
        node.save(&self.db().mynodes)?;
        debug!(id = %self.id, node = %node_id, status = %node.status, "device status changed");
        Ok(true)
    }

    /// How much this identity trusts the device `node_id`.
    pub fn peer_type(&self, node_id: &NodeId) -> PeerType {
        match read(&self.my_nodes).get_by_node(node_id) {
            Some(node) if node.status.is_synced() => PeerType::Me,
            Some(node) if node.status < Status::Sync => PeerType::Pending,
            _ => PeerType::Random,
        }
    }

    // ---- messaging ---------------------------------------------------------

    pub(crate) fn send<T: Serialize>(&self, to: &NodeId, code: u16, payload: &T) -> Result<()> {
        let envelope = Envelope::new(code, self.id, payload)?;
        self.ctx.transport.send(to, &envelope)?;
        Ok(())
    }

    /// Send to every synced device; unreachable ones are skipped.
    pub(crate) fn broadcast<T: Serialize>(&self, code: u16, payload: &T) {
        let peers = self.synced_peers();
        if peers.is_empty() {
            return;
        }
        let envelope = match Envelope::new(code, self.id, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(id = %self.id, code = kith_transport::messages::name(code), error = %e, "unable to encode broadcast");
                return;
            }
        };
        for peer in peers {
            if let Err(e) = self.ctx.transport.send(&peer.node_id, &envelope) {
                debug!(
                    id = %self.id,
                    peer = %peer.node_id,
                    code = kith_transport::messages::name(code),
                    error = %e,
                    "broadcast skipped peer"
                );
            }
        }
    }

    /// The running identity `id` on this backend, if any.
    pub(crate) fn registered(&self, id: &EntityId) -> Option<Arc<Me>> {
        read(&self.ctx.registry).get(id).cloned()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.ctx.transport
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use kith_transport::{Hub, Incoming};
    use kith_types::{Id, NodeType};

    use super::*;
    use crate::keystore::IdentityKey;

    /// A single-device identity on an in-memory backend.
    pub(crate) struct Fixture {
        pub me: Arc<Me>,
        pub identity: IdentityKey,
        pub incoming: mpsc::UnboundedReceiver<Incoming>,
        pub signals: mpsc::UnboundedReceiver<Signal>,
        pub hub: Arc<Hub>,
        _dir: tempdir::TempDir,
    }

    pub(crate) mod tempdir {
        use std::path::{Path, PathBuf};

        /// A directory removed on drop.
        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let path = std::env::temp_dir().join(format!("kith-me-{}", kith_types::Id::random().to_hex()));
                std::fs::create_dir_all(&path).expect("create temp dir");
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    pub(crate) fn context(hub: &Arc<Hub>, dir: &std::path::Path) -> (MeContext, mpsc::UnboundedReceiver<Incoming>, mpsc::UnboundedReceiver<Signal>) {
        let config = MeConfig::new(dir);
        let keystore = KeyStore::new(config.key_dir());
        let node_key = keystore.load_node_key().expect("node key");
        let node_id = Id(node_key.public_key().expect("pk").node_id());
        let (endpoint, incoming) = hub.connect(node_id);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let ctx = MeContext {
            config: Arc::new(config),
            db: MeDb::open_memory().expect("db"),
            keystore,
            transport: Arc::new(endpoint),
            services: Services::memory(),
            events: EventBus::default(),
            node_key,
            node_id,
            validate_key: rand::random(),
            signals,
            registry: Registry::default(),
        };
        (ctx, incoming, signal_rx)
    }

    /// Record a fresh identity in `status` with this device as its only member.
    pub(crate) fn fixture(status: Status) -> Fixture {
        fixture_on(&Hub::new(), status)
    }

    /// Like [`fixture`], attached to an existing hub.
    pub(crate) fn fixture_on(hub: &Arc<Hub>, status: Status) -> Fixture {
        let dir = tempdir::TempDir::new();
        let hub = hub.clone();
        let (ctx, incoming, signals) = context(&hub, dir.path());
        let identity = ctx.keystore.load().expect("identity");
        MyInfo::new(identity.id, status).save(&ctx.db.me).expect("save info");
        let weight = NodeType::Desktop.weight();
        MyNode::new(identity.id, ctx.node_id, NodeType::Desktop, weight, status)
            .save(&ctx.db.mynodes)
            .expect("save node");
        let me = Me::open(&ctx, identity.id).expect("open");
        Fixture {
            me,
            identity,
            incoming,
            signals,
            hub,
            _dir: dir,
        }
    }

    #[test]
    fn test_open_requires_record() {
        let dir = tempdir::TempDir::new();
        let hub = Hub::new();
        let (ctx, _incoming, _signals) = context(&hub, dir.path());
        assert!(matches!(Me::open(&ctx, Id::random()), Err(MeError::NotFound(_))));
    }

    #[test]
    fn test_open_refuses_terminal() {
        let fx = fixture(Status::Alive);
        let ctx = fx.me.ctx.clone();
        let mut info = fx.me.info();
        info.set_status(Status::Revoked);
        info.save(&ctx.db.me).expect("save");
        assert!(matches!(Me::open(&ctx, info.id), Err(MeError::InvalidMe(_))));
    }

    #[test]
    fn test_status_and_peer_type() {
        let fx = fixture(Status::Alive);
        let me = &fx.me;
        assert_eq!(me.status(), Status::Alive);
        assert!(!me.set_status(Status::Pending).expect("set"));
        assert_eq!(me.peer_type(&me.node_id), PeerType::Me);
        assert_eq!(me.peer_type(&Id::random()), PeerType::Random);

        let other = MyNode::new(me.id, Id::random(), NodeType::Mobile, 0, Status::Init);
        write(&me.my_nodes).insert(other.clone());
        assert_eq!(me.peer_type(&other.node_id), PeerType::Pending);
        assert!(me.set_node_status(&other.node_id, Status::Sync).expect("status"));
        assert_eq!(me.peer_type(&other.node_id), PeerType::Me);
        assert_eq!(me.synced_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let fx = fixture(Status::Init);
        fx.me.start().expect("start");
        fx.me.stop();
        fx.me.stop();
        assert!(fx.me.is_stopped());
    }
}
