//! The process-wide façade over every identity on this device.
//!
//! A [`Backend`] owns the shared [`MeContext`], opens the identities
//! recorded in the `me` space, routes incoming envelopes to them and
//! reacts to the [`Signal`]s they raise. The operations exposed to
//! clients act on the current identity: the one whose key is the primary
//! pair of the key store.

use std::sync::{Arc, Mutex};

use kith_crypto::derive::KeyInfo;
use kith_crypto::secp256k1::PrivateKey;
use kith_join::{JoinEntity, JoinKeyInfo, JoinRequest, JoinType, KeyHash};
use kith_oplog::MerkleLevel;
use kith_transport::messages::{MSG_APPROVE_JOIN, MSG_JOIN_ENTITY};
use kith_transport::{Envelope, Incoming, Transport};
use kith_types::{EntityId, Id, ListOrder, LogId, NodeId, Status};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MeConfig;
use crate::db::MeDb;
use crate::events::EventBus;
use crate::keystore::KeyStore;
use crate::manager::{Me, MeContext, Registry, Signal};
use crate::master_oplog::MasterOplog;
use crate::me_oplog::MeOplog;
use crate::my_info::MyInfo;
use crate::my_node::MyNode;
use crate::op_key::{OpKeyHash, OpKeyInfo, OpKeyOplog};
use crate::raft::RaftStatus;
use crate::services::{EntitySnapshot, Services};
use crate::sync::{lock, read, write};
use crate::{MeError, Result};

pub struct Backend {
    ctx: MeContext,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("node_id", &self.ctx.node_id)
            .field("identities", &read(&self.ctx.registry).len())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Node id of the device whose data lives under `config.data_dir`.
    ///
    /// Generates the node key on first use. The transport handed to
    /// [`Backend::new`] must be bound to this id.
    pub fn load_node_id(config: &MeConfig) -> Result<NodeId> {
        let node_key = KeyStore::new(config.key_dir()).load_node_key()?;
        Ok(Id(node_key.public_key()?.node_id()))
    }

    /// Open storage and keys. Nothing runs until [`Backend::start`].
    pub fn new(
        config: MeConfig,
        transport: Arc<dyn Transport>,
        incoming: mpsc::UnboundedReceiver<Incoming>,
        services: Services,
    ) -> Result<Arc<Self>> {
        let db = MeDb::open(&config.data_dir)?;
        let keystore = KeyStore::new(config.key_dir());
        keystore.set_my_key(&config)?;
        let node_key = keystore.load_node_key()?;
        let node_id = Id(node_key.public_key()?.node_id());
        if transport.node_id() != node_id {
            return Err(MeError::InvalidNode(format!(
                "transport is bound to {}, this device is {node_id}",
                transport.node_id()
            )));
        }
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let ctx = MeContext {
            config: Arc::new(config),
            db,
            keystore,
            transport,
            services,
            events: EventBus::default(),
            node_key,
            node_id,
            validate_key: rand::random(),
            signals: signal_tx,
            registry: Registry::default(),
        };
        let (quit, _) = watch::channel(false);
        info!(node_id = %node_id, data_dir = %ctx.config.data_dir.display(), "backend opened");
        Ok(Arc::new(Self {
            ctx,
            incoming: Mutex::new(Some(incoming)),
            signals: Mutex::new(Some(signal_rx)),
            quit,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Record the primary identity if new, then open and start every
    /// identity that is not terminal.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.init_me()?;
        for info in MyInfo::list(&self.ctx.db.me)? {
            if info.status.is_terminal() {
                continue;
            }
            if let Err(e) = self.open_me(&info.id) {
                warn!(id = %info.id, error = %e, "unable to start identity");
            }
        }
        if let Some(incoming) = lock(&self.incoming).take() {
            let task = tokio::spawn(self.clone().incoming_loop(incoming, self.quit.subscribe()));
            lock(&self.tasks).push(task);
        }
        if let Some(signals) = lock(&self.signals).take() {
            let task = tokio::spawn(self.clone().signal_loop(signals, self.quit.subscribe()));
            lock(&self.tasks).push(task);
        }
        info!(node_id = %self.ctx.node_id, identities = read(&self.ctx.registry).len(), "backend started");
        Ok(())
    }

    fn init_me(&self) -> Result<()> {
        let identity = self.ctx.keystore.load()?;
        if MyInfo::load(&self.ctx.db.me, &identity.id)?.is_some() {
            return Ok(());
        }
        let node_type = self.ctx.config.node_type;
        MyInfo::new(identity.id, Status::Pending).save(&self.ctx.db.me)?;
        let mut node = MyNode::new(identity.id, self.ctx.node_id, node_type, node_type.weight(), Status::Pending);
        node.name = self.ctx.config.node_name.clone();
        node.save(&self.ctx.db.mynodes)?;
        info!(id = %identity.id, node_type = ?node_type, "recorded new identity");
        Ok(())
    }

    fn open_me(&self, id: &EntityId) -> Result<Arc<Me>> {
        if let Some(running) = read(&self.ctx.registry).get(id) {
            return Ok(running.clone());
        }
        let me = Me::open(&self.ctx, *id)?;
        write(&self.ctx.registry).insert(*id, me.clone());
        me.start()?;
        Ok(me)
    }

    fn close_me(&self, id: &EntityId) {
        if let Some(me) = write(&self.ctx.registry).remove(id) {
            me.stop();
        }
    }

    /// Stop every identity and loop. Safe to call twice.
    pub fn stop(&self) {
        if self.quit.send_replace(true) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let running: Vec<Arc<Me>> = write(&self.ctx.registry).drain().map(|(_, me)| me).collect();
        for me in running {
            me.stop();
        }
        info!(node_id = %self.ctx.node_id, "backend stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.quit.borrow()
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn services(&self) -> &Services {
        &self.ctx.services
    }

    /// The running identity `id`.
    pub fn registered(&self, id: &EntityId) -> Option<Arc<Me>> {
        read(&self.ctx.registry).get(id).cloned()
    }

    /// The current identity of this device.
    pub fn me(&self) -> Result<Arc<Me>> {
        let current = self
            .ctx
            .keystore
            .load_current()?
            .ok_or_else(|| MeError::InvalidMe("no identity key on this device".into()))?;
        self.registered(&current.id)
            .ok_or_else(|| MeError::InvalidMe(format!("identity {} is not running", current.id)))
    }

    // ---- routing -----------------------------------------------------------

    async fn incoming_loop(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Incoming>, mut quit: watch::Receiver<bool>) {
        loop {
            let msg = tokio::select! {
                _ = quit.changed() => break,
                msg = incoming.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let envelope = match msg.envelope() {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(from = %msg.from, error = %e, "undecodable envelope");
                    continue;
                }
            };
            if let Err(e) = self.route(&msg.from, &envelope) {
                if e.is_fatal() {
                    self.raise_fatal(&e);
                } else {
                    debug!(
                        from = %msg.from,
                        entity = %envelope.entity_id,
                        code = kith_transport::messages::name(envelope.code),
                        error = %e,
                        "message not handled"
                    );
                }
            }
        }
        debug!("backend incoming loop stopped");
    }

    /// Hand one envelope to the identity it concerns.
    pub fn route(&self, from: &NodeId, envelope: &Envelope) -> Result<()> {
        match envelope.code {
            MSG_JOIN_ENTITY => {
                let msg: JoinEntity = envelope.decode_payload()?;
                let host = read(&self.ctx.registry)
                    .values()
                    .find(|me| me.find_join_key(&msg.hash).is_some())
                    .cloned()
                    .ok_or(kith_join::JoinError::UnknownKey)?;
                host.handle_join_entity(from, msg)
            }
            MSG_APPROVE_JOIN => self.target(&envelope.entity_id)?.handle_approve_join(from, envelope.decode_payload()?),
            _ => self.target(&envelope.entity_id)?.handle_message(from, envelope),
        }
    }

    fn target(&self, id: &EntityId) -> Result<Arc<Me>> {
        self.registered(id)
            .ok_or_else(|| MeError::InvalidEntity(format!("identity {id} is not on this device")))
    }

    fn raise_fatal(&self, e: &MeError) {
        if self.ctx.signals.send(Signal::Fatal(e.to_string())).is_err() {
            error!(error = %e, "fatal error with no signal loop");
        }
    }

    async fn signal_loop(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<Signal>, mut quit: watch::Receiver<bool>) {
        loop {
            let signal = tokio::select! {
                _ = quit.changed() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            debug!(signal = ?signal, "backend signal");
            match signal {
                Signal::Restart(id) => {
                    self.close_me(&id);
                    match self.open_me(&id) {
                        Ok(me) => info!(id = %id, status = %me.status(), "identity restarted"),
                        Err(e) => warn!(id = %id, error = %e, "unable to restart identity"),
                    }
                }
                Signal::Register(id) => {
                    if let Err(e) = self.open_me(&id) {
                        warn!(id = %id, error = %e, "unable to register identity");
                    }
                }
                Signal::Stopped(id) => {
                    write(&self.ctx.registry).remove(&id);
                    info!(id = %id, "identity left this device");
                }
                Signal::Fatal(reason) => {
                    error!(reason = %reason, "fatal error, stopping backend");
                    self.stop();
                    break;
                }
            }
        }
        debug!("backend signal loop stopped");
    }

    // ---- identity ----------------------------------------------------------

    /// The current identity, or the most recently changed record once the
    /// identity was revoked from this device.
    pub fn get(&self) -> Result<MyInfo> {
        match self.me() {
            Ok(me) => Ok(me.info()),
            Err(e) => MyInfo::list(&self.ctx.db.me)?
                .into_iter()
                .filter(|info| info.status.is_terminal())
                .max_by_key(|info| info.update_ts)
                .ok_or(e),
        }
    }

    pub fn get_me_list(&self) -> Result<Vec<MyInfo>> {
        MyInfo::list(&self.ctx.db.me)
    }

    pub fn get_raw_me(&self, id: &EntityId) -> Result<Option<MyInfo>> {
        MyInfo::load(&self.ctx.db.me, id)
    }

    pub fn get_my_id_str(&self) -> Result<String> {
        Ok(self.me()?.id.to_hex())
    }

    pub fn set_my_name(&self, name: &str) -> Result<()> {
        self.me()?.set_my_name(name)
    }

    pub fn set_my_node_name(&self, name: &str) -> Result<MeOplog> {
        self.me()?.set_my_node_name(name)
    }

    pub fn set_my_image(&self, image: &str) -> Result<()> {
        self.me()?.set_my_image(image)
    }

    pub fn get_my_profile(&self) -> Result<Option<EntitySnapshot>> {
        self.me()?.get_my_profile()
    }

    /// Delete the current identity everywhere. Needs this device's validate key.
    pub fn revoke(&self, validate_key: &[u8]) -> Result<MeOplog> {
        if !kith_crypto::ct_eq(validate_key, &self.ctx.validate_key) {
            return Err(MeError::InvalidMe("validate key does not match".into()));
        }
        self.me()?.delete_me()
    }

    /// The token another device must present to join this one, hex.
    pub fn show_validate_key(&self) -> String {
        hex::encode(self.ctx.validate_key)
    }

    // ---- join --------------------------------------------------------------

    pub fn show_me_url(&self) -> Result<String> {
        self.me()?.show_url(JoinType::Me)
    }

    pub fn show_url(&self) -> Result<String> {
        self.me()?.show_url(JoinType::Friend)
    }

    pub fn show_board_url(&self) -> Result<String> {
        self.me()?.show_url(JoinType::Board)
    }

    /// Join the identity behind `url`, proving access with the host's validate key (hex).
    pub fn join_me(&self, url: &str, validate_key: &str) -> Result<JoinRequest> {
        let validate_key = hex::decode(validate_key.trim())
            .map_err(|e| MeError::InvalidData(format!("validate key: {e}")))?;
        self.me()?.join_me(url, &validate_key)
    }

    pub fn join_friend(&self, url: &str) -> Result<JoinRequest> {
        self.me()?.join_friend(url)
    }

    pub fn join_board(&self, url: &str) -> Result<JoinRequest> {
        self.me()?.join_board(url)
    }

    pub fn get_join_key_infos(&self, join_type: JoinType) -> Result<Vec<JoinKeyInfo>> {
        Ok(self.me()?.get_join_key_infos(join_type))
    }

    pub fn get_me_requests(&self) -> Result<Vec<JoinRequest>> {
        Ok(self.me()?.list_join_requests(JoinType::Me))
    }

    pub fn remove_me_requests(&self, hashes: &[KeyHash]) -> Result<usize> {
        Ok(self.me()?.remove_join_requests(JoinType::Me, hashes))
    }

    pub fn get_friend_requests(&self) -> Result<Vec<JoinRequest>> {
        Ok(self.me()?.list_join_requests(JoinType::Friend))
    }

    pub fn remove_friend_requests(&self, hashes: &[KeyHash]) -> Result<usize> {
        Ok(self.me()?.remove_join_requests(JoinType::Friend, hashes))
    }

    pub fn get_board_requests(&self) -> Result<Vec<JoinRequest>> {
        Ok(self.me()?.list_join_requests(JoinType::Board))
    }

    pub fn remove_board_requests(&self, hashes: &[KeyHash]) -> Result<usize> {
        Ok(self.me()?.remove_join_requests(JoinType::Board, hashes))
    }

    // ---- op keys -----------------------------------------------------------

    pub fn get_op_key_infos(&self) -> Result<Vec<OpKeyInfo>> {
        Ok(self.me()?.get_op_key_infos())
    }

    pub fn get_op_key_infos_from_db(&self) -> Result<Vec<OpKeyInfo>> {
        self.me()?.get_op_key_infos_from_db()
    }

    pub fn revoke_op_key(&self, hash: &OpKeyHash) -> Result<()> {
        self.me()?.revoke_op_key(hash)
    }

    // ---- peers -------------------------------------------------------------

    pub fn count_peers(&self) -> usize {
        self.ctx.transport.peers().len()
    }

    pub fn get_peers(&self) -> Vec<NodeId> {
        self.ctx.transport.peers()
    }

    pub fn get_my_nodes(&self) -> Result<Vec<MyNode>> {
        Ok(self.me()?.my_nodes())
    }

    pub fn get_total_weight(&self) -> Result<u64> {
        Ok(self.me()?.total_weight())
    }

    // ---- raft --------------------------------------------------------------

    pub fn get_raft_status(&self) -> Result<RaftStatus> {
        self.me()?.raft_status()
    }

    pub async fn remove_node(&self, node_id: &NodeId) -> Result<()> {
        self.me()?.remove_node(node_id).await
    }

    pub async fn force_remove_node(&self, node_id: &NodeId) -> Result<()> {
        self.me()?.force_propose_raft_remove_node(node_id).await
    }

    pub async fn request_raft_lead(&self) -> Result<()> {
        self.me()?.ensure_raft_lead().await
    }

    // ---- oplogs ------------------------------------------------------------

    pub fn get_me_oplog_list(&self, start: Option<&LogId>, limit: usize, order: ListOrder) -> Result<Vec<MeOplog>> {
        self.me()?.me_oplog_list(start, limit, order)
    }

    /// Logs waiting for master signatures.
    pub fn get_pending_me_oplog_master_list(
        &self,
        start: Option<&LogId>,
        limit: usize,
        order: ListOrder,
    ) -> Result<Vec<MeOplog>> {
        self.me()?.pending_me_oplog_list(Status::Pending, start, limit, order)
    }

    /// Logs written while no master was known.
    pub fn get_pending_me_oplog_internal_list(
        &self,
        start: Option<&LogId>,
        limit: usize,
        order: ListOrder,
    ) -> Result<Vec<MeOplog>> {
        self.me()?.pending_me_oplog_list(Status::InternalPending, start, limit, order)
    }

    pub fn get_me_oplog_merkle_node_list(&self, level: MerkleLevel) -> Result<Vec<kith_oplog::MerkleNode>> {
        self.me()?.me_oplog_merkle_nodes(level)
    }

    pub fn force_sync_me_merkle(&self) -> Result<()> {
        self.me()?.force_sync_me_merkle();
        Ok(())
    }

    pub fn get_my_master_oplog_list(&self, start: Option<u64>, limit: usize, order: ListOrder) -> Result<Vec<MasterOplog>> {
        self.me()?.master.list(start, limit, order)
    }

    pub fn get_op_key_oplog_list(&self, start: Option<&LogId>, limit: usize, order: ListOrder) -> Result<Vec<OpKeyOplog>> {
        self.me()?.op_key_oplog_list(start, limit, order)
    }

    pub fn get_pending_op_key_oplog_master_list(
        &self,
        start: Option<&LogId>,
        limit: usize,
        order: ListOrder,
    ) -> Result<Vec<OpKeyOplog>> {
        self.me()?.pending_op_key_oplog_list(Status::Pending, start, limit, order)
    }

    pub fn get_pending_op_key_oplog_internal_list(
        &self,
        start: Option<&LogId>,
        limit: usize,
        order: ListOrder,
    ) -> Result<Vec<OpKeyOplog>> {
        self.me()?.pending_op_key_oplog_list(Status::InternalPending, start, limit, order)
    }

    // ---- keys --------------------------------------------------------------

    /// Identity private key, hex.
    pub fn show_my_key(&self) -> Result<String> {
        let me = self.me()?;
        let keys = lock(&me.keys);
        Ok(keys.identity()?.to_hex())
    }

    pub fn validate_my_key(&self, key: &str) -> Result<bool> {
        let me = self.me()?;
        let keys = lock(&me.keys);
        Ok(same_key(keys.identity()?, key))
    }

    /// The key that signs master entries. Identities sign them with the identity key.
    pub fn show_my_master_key(&self) -> Result<String> {
        self.show_my_key()
    }

    pub fn validate_my_master_key(&self, key: &str) -> Result<bool> {
        self.validate_my_key(key)
    }

    pub fn show_my_node_key(&self) -> String {
        self.ctx.node_key.to_hex()
    }

    pub fn validate_my_node_key(&self, key: &str) -> bool {
        same_key(&self.ctx.node_key, key)
    }

    pub fn show_my_sign_key(&self) -> Result<KeyInfo> {
        let me = self.me()?;
        let mut keys = lock(&me.keys);
        Ok(keys.sign_key()?.info())
    }

    pub fn refresh_my_sign_key(&self) -> Result<KeyInfo> {
        let me = self.me()?;
        let mut keys = lock(&me.keys);
        keys.refresh_sign()?;
        keys.index.save(&self.ctx.db.signkey, &me.id)?;
        info!(id = %me.id, index = keys.index.identity, "identity sign key refreshed");
        Ok(keys.sign_key()?.info())
    }

    pub fn show_my_node_sign_key(&self) -> Result<KeyInfo> {
        let me = self.me()?;
        let keys = lock(&me.keys);
        Ok(keys.node_sign.info())
    }

    pub fn refresh_my_node_sign_key(&self) -> Result<KeyInfo> {
        let me = self.me()?;
        let mut keys = lock(&me.keys);
        keys.refresh_node_sign()?;
        keys.index.save(&self.ctx.db.signkey, &me.id)?;
        info!(id = %me.id, index = keys.index.node, "node sign key refreshed");
        Ok(keys.node_sign.info())
    }
}

/// Constant-time comparison of a private key with a hex candidate.
fn same_key(key: &PrivateKey, candidate: &str) -> bool {
    match hex::decode(candidate.trim()) {
        Ok(bytes) => kith_crypto::ct_eq(key.as_bytes(), &bytes),
        Err(_) => false,
    }
}
