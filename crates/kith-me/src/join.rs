//! The three join channels of an identity: `me`, `friend` and `board`.
//!
//! Host side: a channel rotates join keys, publishes them in URLs and
//! registers their hashes with the transport. A `JoinEntity` sealed under
//! one of its keys is opened, approved and answered with an `ApproveJoin`.
//!
//! Guest side: a parsed URL becomes a pending [`JoinRequest`]; posting it
//! emits a `JoinRequest` event that the channel's consumer loop turns into
//! a `JoinEntity`. The approval is routed back by request hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use kith_join::{
    ApproveJoin, ApprovePayload, JoinEntity, JoinEntityPayload, JoinError, JoinKey, JoinKeyInfo, JoinKeyRing,
    JoinRequest, JoinRequests, JoinStatus, JoinType, JoinUrl, KeyHash,
};
use kith_transport::messages::{MSG_APPROVE_JOIN, MSG_JOIN_ENTITY, MSG_JOIN_FRIEND};
use kith_transport::Envelope;
use kith_types::{EntityId, NodeId, NodeType, Status};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::events;
use crate::manager::{Me, Signal};
use crate::me_oplog::{EntityData, MeOp};
use crate::my_info::MyInfo;
use crate::my_node::MyNode;
use crate::protocol::{ApproveMe, JoinFriendMsg};
use crate::services::{EntityKind, EntitySnapshot};
use crate::sync::{lock, read, write};
use crate::{MeError, Result};

/// Weight proposed for a device joining an existing identity.
pub const JOINED_NODE_WEIGHT: u32 = 1;

/// Keys and requests of one channel.
#[derive(Debug, Default)]
pub(crate) struct JoinChannel {
    ring: RwLock<JoinKeyRing>,
    requests: RwLock<JoinRequests>,
    /// Validate keys a guest carries to the host, by request hash.
    validate_keys: Mutex<HashMap<KeyHash, Vec<u8>>>,
}

#[derive(Debug, Default)]
pub struct Joins {
    me: JoinChannel,
    friend: JoinChannel,
    board: JoinChannel,
}

impl Joins {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn channel(&self, join_type: JoinType) -> &JoinChannel {
        match join_type {
            JoinType::Me => &self.me,
            JoinType::Friend => &self.friend,
            JoinType::Board => &self.board,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JoinRequestEvent {
    join_type: JoinType,
    hash: String,
}

impl Me {
    // ---- host side ---------------------------------------------------------

    /// Entity a channel's keys admit into.
    fn join_creator(&self, join_type: JoinType) -> Result<EntityId> {
        match join_type {
            JoinType::Board => self
                .info()
                .board_id
                .ok_or_else(|| MeError::NotFound(format!("board of {}", self.id))),
            _ => Ok(self.id),
        }
    }

    fn display_name(&self) -> String {
        match self.get_my_profile() {
            Ok(Some(profile)) if !profile.name.is_empty() => profile.name,
            _ => self.config().name.clone(),
        }
    }

    /// URL of the current join key of `join_type`, rotating one in if needed.
    pub fn show_url(&self, join_type: JoinType) -> Result<String> {
        self.require_alive()?;
        let creator = self.join_creator(join_type)?;
        let current = read(&self.joins.channel(join_type).ring).current().cloned();
        let key = match current {
            Some(key) => key,
            None => self.renew_join_key(join_type)?,
        };
        let name = match join_type {
            JoinType::Me => self.config().node_name.clone(),
            _ => self.display_name(),
        };
        let url = JoinUrl::new(join_type, creator, self.node_id, &key, &name).encode()?;
        debug!(id = %self.id, join_type = %join_type, hash = %hex::encode(key.hash()), "join url shown");
        Ok(url)
    }

    /// Rotate the key of `join_type`; the evicted key stops being served.
    pub fn renew_join_key(&self, join_type: JoinType) -> Result<JoinKey> {
        let creator = self.join_creator(join_type)?;
        let (key, evicted) = write(&self.joins.channel(join_type).ring).rotate();
        self.transport().register_join_key(key.hash(), creator)?;
        if let Some(old) = evicted {
            self.transport().unregister_join_key(&old.hash())?;
        }
        debug!(id = %self.id, join_type = %join_type, "join key renewed");
        Ok(key)
    }

    pub fn get_join_key_infos(&self, join_type: JoinType) -> Vec<JoinKeyInfo> {
        read(&self.joins.channel(join_type).ring).infos()
    }

    /// Channel and key a handshake sealed under `hash` belongs to.
    pub fn find_join_key(&self, hash: &KeyHash) -> Option<(JoinType, JoinKey)> {
        JoinType::ALL.into_iter().find_map(|t| {
            read(&self.joins.channel(t).ring)
                .find(hash)
                .map(|k| (t, k.clone()))
        })
    }

    pub(crate) fn unregister_join_keys(&self) {
        for join_type in JoinType::ALL {
            let keys = write(&self.joins.channel(join_type).ring).clear();
            for key in keys {
                if let Err(e) = self.transport().unregister_join_key(&key.hash()) {
                    debug!(id = %self.id, error = %e, "unable to unregister join key");
                }
            }
        }
    }

    /// Open a guest's handshake, approve it and answer.
    pub fn handle_join_entity(self: &Arc<Self>, from: &NodeId, msg: JoinEntity) -> Result<()> {
        let (join_type, key) = self.find_join_key(&msg.hash).ok_or(JoinError::UnknownKey)?;
        let payload = msg.open(&key)?;
        if payload.node_id != *from {
            return Err(MeError::InvalidNode(format!("handshake of {} sent by {from}", payload.node_id)));
        }
        info!(id = %self.id, join_type = %join_type, guest = %payload.user_id, node = %from, "join request received");
        let approval = match join_type {
            JoinType::Me => ApprovePayload::new(payload.challenge, &self.approve_join_me(&payload)?)?,
            JoinType::Friend => ApprovePayload::new(payload.challenge, &self.approve_join_friend(&payload)?)?,
            JoinType::Board => ApprovePayload::new(payload.challenge, &self.approve_join_board(&payload)?)?,
        };
        let sealed = ApproveJoin::seal(&key, &approval)?;
        let envelope = Envelope::new(MSG_APPROVE_JOIN, payload.user_id, &sealed)?;
        self.transport().send(from, &envelope)?;
        Ok(())
    }

    fn approve_join_me(self: &Arc<Self>, payload: &JoinEntityPayload) -> Result<ApproveMe> {
        self.require_alive()?;
        let offered = payload.validate_key.as_deref().unwrap_or_default();
        if !kith_crypto::ct_eq(offered, &self.ctx.validate_key) {
            return Err(MeError::InvalidMe("validate key does not match".into()));
        }
        let node = {
            let mut nodes = write(&self.my_nodes);
            if nodes.get_by_node(&payload.node_id).is_some_and(|n| !n.is_deleted()) {
                return Err(MeError::AlreadyMyNode);
            }
            let mut node = MyNode::new(self.id, payload.node_id, NodeType::default(), 0, Status::Init);
            node.name = payload.name.clone();
            node.save(&self.db().mynodes)?;
            nodes.insert(node.clone());
            node
        };
        let host = self
            .self_node()
            .ok_or_else(|| MeError::InvalidMe(format!("this device is not a device of {}", self.id)))?;

        let me = self.clone();
        self.spawn(async move {
            let proposed = async {
                me.ensure_raft_lead().await?;
                me.propose_add_node(&node, JOINED_NODE_WEIGHT).await
            };
            match proposed.await {
                Ok(()) => info!(id = %me.id, node = %node.node_id, "proposed new device"),
                Err(e) => warn!(id = %me.id, node = %node.node_id, error = %e, "unable to propose new device"),
            }
        });
        Ok(ApproveMe {
            op_key: self.oldest_op_key(),
            info: self.info(),
            host,
        })
    }

    fn approve_join_friend(&self, payload: &JoinEntityPayload) -> Result<JoinFriendMsg> {
        let friend = self
            .services()
            .friend
            .approve_join_friend(&self.id, &payload.user_id, &payload.node_id, &payload.name)?;
        let data = EntityData {
            entity_id: friend.entity_id,
            peer_id: Some(payload.user_id),
            peer_node_id: Some(payload.node_id),
            name: payload.name.clone(),
        };
        let log = self.create_me_oplog(friend.entity_id, MeOp::CreateFriend, &data)?;
        self.services()
            .set_entity_log(EntityKind::Friend, &friend.entity_id, log.id, log.ts)?;
        Ok(JoinFriendMsg { friend })
    }

    fn approve_join_board(&self, payload: &JoinEntityPayload) -> Result<EntitySnapshot> {
        let board = self.join_creator(JoinType::Board)?;
        self.services()
            .board
            .create_join_entity(&board, &payload.user_id, &payload.node_id)
    }

    // ---- guest side --------------------------------------------------------

    /// Record a request for the URL and hand it to the consumer loop.
    pub fn post_join_request(&self, join_type: JoinType, url: &str) -> Result<JoinRequest> {
        let url = JoinUrl::parse(url)?;
        if url.join_type != Some(join_type) {
            return Err(MeError::InvalidData(format!("url is not a {join_type} join url")));
        }
        if url.node_id == self.node_id {
            return Err(JoinError::OwnNode.into());
        }
        let request = JoinRequest::from_url(&url, join_type, kith_types::time::now());
        write(&self.joins.channel(join_type).requests).insert(request.clone())?;
        self.emit_join_request(&request);
        Ok(request)
    }

    fn emit_join_request(&self, request: &JoinRequest) {
        self.emit(
            events::JOIN_REQUEST,
            serde_json::json!({ "join_type": request.join_type, "hash": hex::encode(request.hash) }),
        );
    }

    /// Make this device a device of the identity behind `url`.
    pub fn join_me(&self, url: &str, validate_key: &[u8]) -> Result<JoinRequest> {
        self.require_alive()?;
        if read(&self.my_nodes).live_count() > 1 {
            return Err(MeError::AlreadyMyNode);
        }
        let request = self.post_join_request(JoinType::Me, url)?;
        lock(&self.joins.channel(JoinType::Me).validate_keys).insert(request.hash, validate_key.to_vec());
        Ok(request)
    }

    pub fn join_friend(&self, url: &str) -> Result<JoinRequest> {
        self.require_alive()?;
        self.post_join_request(JoinType::Friend, url)
    }

    pub fn join_board(&self, url: &str) -> Result<JoinRequest> {
        self.require_alive()?;
        self.post_join_request(JoinType::Board, url)
    }

    /// Send the sealed handshake of a pending request.
    pub(crate) fn try_join(&self, join_type: JoinType, hash: &KeyHash) -> Result<()> {
        let channel = self.joins.channel(join_type);
        let request = read(&channel.requests)
            .get(hash)
            .cloned()
            .ok_or(JoinError::NotFound)?;
        if request.status != JoinStatus::Pending {
            return Ok(());
        }
        let name = match join_type {
            JoinType::Me => self.config().node_name.clone(),
            _ => self.display_name(),
        };
        let payload = JoinEntityPayload {
            challenge: request.challenge,
            node_id: self.node_id,
            user_id: self.id,
            name,
            validate_key: lock(&channel.validate_keys).get(hash).cloned(),
        };
        let sealed = JoinEntity::seal(&request, &payload)?;
        let envelope = Envelope::new(MSG_JOIN_ENTITY, request.creator_id, &sealed)?;
        self.transport().send(&request.node_id, &envelope)?;
        debug!(id = %self.id, join_type = %join_type, host = %request.node_id, "join request sent");
        Ok(())
    }

    /// A host approved one of our requests.
    pub fn handle_approve_join(&self, from: &NodeId, msg: ApproveJoin) -> Result<()> {
        let request = JoinType::ALL
            .into_iter()
            .find_map(|t| read(&self.joins.channel(t).requests).get(&msg.hash).cloned())
            .ok_or(JoinError::NotFound)?;
        if request.node_id != *from {
            return Err(MeError::InvalidNode(format!("approval for {} sent by {from}", request.node_id)));
        }
        let payload = msg.open(&request)?;
        let handled = match request.join_type {
            JoinType::Me => payload.data_as().map_err(MeError::from).and_then(|a| self.handle_approve_me(&request, a)),
            JoinType::Friend => payload
                .data_as()
                .map_err(MeError::from)
                .and_then(|m| self.handle_approve_friend(&request, m)),
            JoinType::Board => payload
                .data_as()
                .map_err(MeError::from)
                .and_then(|b| self.handle_approve_board(&request, b)),
        };
        let channel = self.joins.channel(request.join_type);
        match handled {
            Ok(()) => {
                write(&channel.requests).remove(&request.hash);
                lock(&channel.validate_keys).remove(&request.hash);
                info!(id = %self.id, join_type = %request.join_type, host = %request.creator_id, "join approved");
                Ok(())
            }
            Err(e) => {
                if let Err(se) = write(&channel.requests).set_status(&request.hash, JoinStatus::Failed) {
                    debug!(id = %self.id, error = %se, "join request vanished");
                }
                Err(e)
            }
        }
    }

    /// Record the identity this device was approved into and register it.
    fn handle_approve_me(&self, request: &JoinRequest, approve: ApproveMe) -> Result<()> {
        let host_id = approve.info.id;
        if host_id != request.creator_id || approve.host.node_id != request.node_id || approve.host.entity_id != host_id {
            return Err(MeError::InvalidData("approval does not match the join url".into()));
        }
        let db = self.db();
        if MyInfo::load(&db.me, &host_id)?.is_some() {
            debug!(id = %self.id, host = %host_id, "identity already recorded on this device");
            return Ok(());
        }
        if let Some(key) = approve.op_key {
            key.install(&db.signkey, &host_id)?;
        }
        let mut host = approve.host;
        host.set_status(Status::Alive);
        host.save(&db.mynodes)?;
        let mut own = MyNode::new(host_id, self.node_id, self.config().node_type, 0, Status::Init);
        own.name = self.config().node_name.clone();
        own.save(&db.mynodes)?;

        let mut info = MyInfo::new(host_id, Status::Init);
        info.profile_id = approve.info.profile_id;
        info.board_id = approve.info.board_id;
        info.log_id = approve.info.log_id;
        info.save(&db.me)?;
        info!(id = %self.id, host = %host_id, "recorded identity this device joined");
        self.signal(Signal::Register(host_id));
        Ok(())
    }

    fn handle_approve_friend(&self, request: &JoinRequest, msg: JoinFriendMsg) -> Result<()> {
        let friend = msg.friend;
        if friend.owner_id != request.creator_id || friend.peer_id != Some(self.id) {
            return Err(MeError::InvalidData("friendship does not match the join url".into()));
        }
        let services = self.services();
        if let Some(existing) = services.get_entity(EntityKind::Friend, &friend.entity_id)? {
            if existing.status != Status::Deleted {
                return Err(MeError::AlreadyExists(format!("friend {}", friend.entity_id)));
            }
            services.remove_entity(EntityKind::Friend, &friend.entity_id)?;
        }
        let created = services.friend.create_friend(
            &self.id,
            &friend.entity_id,
            &request.creator_id,
            &request.node_id,
            &request.name,
        )?;
        services.friend.init_friend_info(&created.entity_id, &request.node_id)?;
        let data = EntityData {
            entity_id: created.entity_id,
            peer_id: Some(request.creator_id),
            peer_node_id: Some(request.node_id),
            name: request.name.clone(),
        };
        let log = self.create_me_oplog(created.entity_id, MeOp::JoinFriend, &data)?;
        services.set_entity_log(EntityKind::Friend, &created.entity_id, log.id, log.ts)?;
        if let Some(mut replay) = services.get_entity(EntityKind::Friend, &created.entity_id)? {
            replay.log_id = Some(log.id);
            self.broadcast(MSG_JOIN_FRIEND, &JoinFriendMsg { friend: replay });
        }
        Ok(())
    }

    fn handle_approve_board(&self, request: &JoinRequest, board: EntitySnapshot) -> Result<()> {
        if board.entity_id != request.creator_id {
            return Err(MeError::InvalidData("board does not match the join url".into()));
        }
        let services = self.services();
        let joined = services.board.join_board(&self.id, board)?;
        let data = EntityData {
            entity_id: joined.entity_id,
            peer_id: joined.peer_id,
            peer_node_id: Some(request.node_id),
            name: joined.name.clone(),
        };
        let log = self.create_me_oplog(joined.entity_id, MeOp::JoinBoard, &data)?;
        services.set_entity_log(EntityKind::Board, &joined.entity_id, log.id, log.ts)?;
        Ok(())
    }

    /// A sibling device joined a friendship.
    pub(crate) fn handle_join_friend_msg(&self, msg: JoinFriendMsg) -> Result<()> {
        if msg.friend.owner_id != self.id {
            return Err(MeError::InvalidEntity(format!("friend {} belongs to {}", msg.friend.entity_id, msg.friend.owner_id)));
        }
        self.services().restore_entity(EntityKind::Friend, msg.friend)
    }

    pub fn list_join_requests(&self, join_type: JoinType) -> Vec<JoinRequest> {
        read(&self.joins.channel(join_type).requests).list()
    }

    /// Drop requests by hash; returns how many existed.
    pub fn remove_join_requests(&self, join_type: JoinType, hashes: &[KeyHash]) -> usize {
        let channel = self.joins.channel(join_type);
        let mut requests = write(&channel.requests);
        let mut validate_keys = lock(&channel.validate_keys);
        hashes
            .iter()
            .filter(|hash| {
                validate_keys.remove(*hash);
                requests.remove(hash).is_some()
            })
            .count()
    }

    // ---- loops -------------------------------------------------------------

    pub(crate) fn start_join_loops(self: &Arc<Self>) {
        for join_type in JoinType::ALL {
            self.spawn(self.clone().join_renewal_loop(join_type, self.quit_rx()));
            self.spawn(self.clone().join_sync_loop(join_type, self.quit_rx()));
            self.spawn(self.clone().join_consumer_loop(join_type, self.quit_rx()));
        }
    }

    /// Rotate published keys so old URLs expire.
    async fn join_renewal_loop(self: Arc<Self>, join_type: JoinType, mut quit: watch::Receiver<bool>) {
        let period = self.config().renew_join_key_period();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    let published = !read(&self.joins.channel(join_type).ring).is_empty();
                    if published && self.status() == Status::Alive {
                        if let Err(e) = self.renew_join_key(join_type) {
                            warn!(id = %self.id, join_type = %join_type, error = %e, "join key renewal failed");
                        }
                    }
                }
            }
        }
        debug!(id = %self.id, join_type = %join_type, "join renewal loop stopped");
    }

    /// Expire old requests and retry the pending ones.
    async fn join_sync_loop(self: Arc<Self>, join_type: JoinType, mut quit: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config().join_sync_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => self.sync_join_requests(join_type),
            }
        }
        debug!(id = %self.id, join_type = %join_type, "join sync loop stopped");
    }

    fn sync_join_requests(&self, join_type: JoinType) {
        let channel = self.joins.channel(join_type);
        let ttl = self.config().join_key_ttl_nanos();
        let (expired, pending) = {
            let mut requests = write(&channel.requests);
            let expired = requests.prune(kith_types::time::now(), ttl);
            (expired, requests.pending())
        };
        if !expired.is_empty() {
            let mut validate_keys = lock(&channel.validate_keys);
            for request in &expired {
                validate_keys.remove(&request.hash);
            }
            debug!(id = %self.id, join_type = %join_type, count = expired.len(), "expired join requests");
        }
        for request in &pending {
            self.emit_join_request(request);
        }
    }

    /// Turn posted requests into handshakes.
    async fn join_consumer_loop(self: Arc<Self>, join_type: JoinType, mut quit: watch::Receiver<bool>) {
        let mut events = self.ctx.events.subscribe();
        loop {
            let event = tokio::select! {
                _ = quit.changed() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(id = %self.id, skipped, "join consumer lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !event.is(events::JOIN_REQUEST, &self.id) {
                continue;
            }
            let Ok(posted) = serde_json::from_value::<JoinRequestEvent>(event.payload) else {
                continue;
            };
            if posted.join_type != join_type {
                continue;
            }
            let Some(hash) = hex::decode(&posted.hash).ok().and_then(|h| KeyHash::try_from(h).ok()) else {
                continue;
            };
            if let Err(e) = self.try_join(join_type, &hash) {
                debug!(id = %self.id, join_type = %join_type, error = %e, "join attempt failed");
            }
        }
        debug!(id = %self.id, join_type = %join_type, "join consumer loop stopped");
    }
}
