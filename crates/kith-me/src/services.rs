//! Collaborator services the Me subsystem drives.
//!
//! Profiles, boards and friendships are owned by other subsystems. The Me
//! subsystem only creates, joins, snapshots and restores them through these
//! traits. [`MemoryEntities`] backs the daemon and the tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kith_types::{EntityId, Id, LogId, NodeId, Status, Timestamp};
use serde::{Deserialize, Serialize};

use crate::sync::{read, write};
use crate::{MeError, Result};

/// Portable state of a profile, board or friendship.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    /// Identity the entity belongs to.
    pub owner_id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    /// The other identity of a friendship, or the creator of a joined board.
    #[serde(default)]
    pub peer_id: Option<EntityId>,
    #[serde(default)]
    pub peer_node_id: Option<NodeId>,
    /// MeOplog that introduced the entity.
    #[serde(default)]
    pub log_id: Option<LogId>,
    pub status: Status,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
}

impl EntitySnapshot {
    pub fn new(entity_id: EntityId, owner_id: EntityId, name: &str, status: Status) -> Self {
        let ts = kith_types::time::now();
        Self {
            entity_id,
            owner_id,
            name: name.to_string(),
            image: String::new(),
            peer_id: None,
            peer_node_id: None,
            log_id: None,
            status,
            create_ts: ts,
            update_ts: ts,
        }
    }
}

/// Storage shared by every kind of entity.
pub trait EntityService: Send + Sync {
    fn get_entity(&self, id: &EntityId) -> Result<Option<EntitySnapshot>>;

    /// Install a snapshot received from another device of the owner.
    fn restore_entity(&self, snapshot: EntitySnapshot) -> Result<()>;

    fn remove_entity(&self, id: &EntityId) -> Result<()>;

    /// Record the MeOplog that introduced the entity.
    fn set_entity_log(&self, id: &EntityId, log_id: LogId, ts: Timestamp) -> Result<()>;

    fn list_entities(&self, owner: &EntityId) -> Result<Vec<EntitySnapshot>>;
}

pub trait ProfileService: EntityService {
    fn create_profile(&self, owner: &EntityId, name: &str) -> Result<EntitySnapshot>;

    fn set_name(&self, id: &EntityId, name: &str) -> Result<()>;

    fn set_image(&self, id: &EntityId, image: &str) -> Result<()>;
}

pub trait BoardService: EntityService {
    fn create_board(&self, owner: &EntityId, name: &str) -> Result<EntitySnapshot>;

    /// Host side of a board join: admit `user` and describe the board.
    fn create_join_entity(&self, board: &EntityId, user: &EntityId, node: &NodeId) -> Result<EntitySnapshot>;

    /// Guest side: record that `owner` joined the described board.
    fn join_board(&self, owner: &EntityId, board: EntitySnapshot) -> Result<EntitySnapshot>;
}

pub trait FriendService: EntityService {
    /// Host side: accept `user` as a friend of `owner`.
    fn approve_join_friend(&self, owner: &EntityId, user: &EntityId, node: &NodeId, name: &str)
        -> Result<EntitySnapshot>;

    /// Guest side: create the friendship `friend_id` in `Init` status.
    fn create_friend(
        &self,
        owner: &EntityId,
        friend_id: &EntityId,
        peer: &EntityId,
        peer_node: &NodeId,
        name: &str,
    ) -> Result<EntitySnapshot>;

    /// Start exchanging friend info with the peer device.
    fn init_friend_info(&self, friend_id: &EntityId, peer_node: &NodeId) -> Result<()>;
}

/// Which collaborator owns an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Profile,
    Board,
    Friend,
}

/// The collaborators of one backend.
#[derive(Clone)]
pub struct Services {
    pub profile: Arc<dyn ProfileService>,
    pub board: Arc<dyn BoardService>,
    pub friend: Arc<dyn FriendService>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    pub fn memory() -> Self {
        Self {
            profile: Arc::new(MemoryEntities::new("profile")),
            board: Arc::new(MemoryEntities::new("board")),
            friend: Arc::new(MemoryEntities::new("friend")),
        }
    }

    pub fn get_entity(&self, kind: EntityKind, id: &EntityId) -> Result<Option<EntitySnapshot>> {
        match kind {
            EntityKind::Profile => self.profile.get_entity(id),
            EntityKind::Board => self.board.get_entity(id),
            EntityKind::Friend => self.friend.get_entity(id),
        }
    }

    pub fn restore_entity(&self, kind: EntityKind, snapshot: EntitySnapshot) -> Result<()> {
        match kind {
            EntityKind::Profile => self.profile.restore_entity(snapshot),
            EntityKind::Board => self.board.restore_entity(snapshot),
            EntityKind::Friend => self.friend.restore_entity(snapshot),
        }
    }

    pub fn remove_entity(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        match kind {
            EntityKind::Profile => self.profile.remove_entity(id),
            EntityKind::Board => self.board.remove_entity(id),
            EntityKind::Friend => self.friend.remove_entity(id),
        }
    }

    pub fn set_entity_log(&self, kind: EntityKind, id: &EntityId, log_id: LogId, ts: Timestamp) -> Result<()> {
        match kind {
            EntityKind::Profile => self.profile.set_entity_log(id, log_id, ts),
            EntityKind::Board => self.board.set_entity_log(id, log_id, ts),
            EntityKind::Friend => self.friend.set_entity_log(id, log_id, ts),
        }
    }

    pub fn list_entities(&self, kind: EntityKind, owner: &EntityId) -> Result<Vec<EntitySnapshot>> {
        match kind {
            EntityKind::Profile => self.profile.list_entities(owner),
            EntityKind::Board => self.board.list_entities(owner),
            EntityKind::Friend => self.friend.list_entities(owner),
        }
    }
}

/// In-memory entities of one kind.
#[derive(Debug)]
pub struct MemoryEntities {
    kind: &'static str,
    entities: RwLock<HashMap<EntityId, EntitySnapshot>>,
}

impl MemoryEntities {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entities: RwLock::new(HashMap::new()),
        }
    }

    fn not_found(&self, id: &EntityId) -> MeError {
        MeError::NotFound(format!("{} {id}", self.kind))
    }

    fn update(&self, id: &EntityId, f: impl FnOnce(&mut EntitySnapshot)) -> Result<()> {
        let mut entities = write(&self.entities);
        let entity = entities.get_mut(id).ok_or_else(|| self.not_found(id))?;
        f(entity);
        entity.update_ts = kith_types::time::now();
        Ok(())
    }

    fn insert(&self, snapshot: EntitySnapshot) -> EntitySnapshot {
        write(&self.entities).insert(snapshot.entity_id, snapshot.clone());
        snapshot
    }
}

impl EntityService for MemoryEntities {
    fn get_entity(&self, id: &EntityId) -> Result<Option<EntitySnapshot>> {
        Ok(read(&self.entities).get(id).cloned())
    }

    fn restore_entity(&self, snapshot: EntitySnapshot) -> Result<()> {
        let mut entities = write(&self.entities);
        match entities.get(&snapshot.entity_id) {
            Some(current) if current.update_ts > snapshot.update_ts => {}
            _ => {
                entities.insert(snapshot.entity_id, snapshot);
            }
        }
        Ok(())
    }

    fn remove_entity(&self, id: &EntityId) -> Result<()> {
        write(&self.entities).remove(id);
        Ok(())
    }

    fn set_entity_log(&self, id: &EntityId, log_id: LogId, ts: Timestamp) -> Result<()> {
        self.update(id, |e| {
            e.log_id = Some(log_id);
            e.create_ts = ts;
        })
    }

    fn list_entities(&self, owner: &EntityId) -> Result<Vec<EntitySnapshot>> {
        let mut list: Vec<_> = read(&self.entities)
            .values()
            .filter(|e| e.owner_id == *owner)
            .cloned()
            .collect();
        list.sort_by_key(|e| (e.create_ts, e.entity_id));
        Ok(list)
    }
}

impl ProfileService for MemoryEntities {
    fn create_profile(&self, owner: &EntityId, name: &str) -> Result<EntitySnapshot> {
        Ok(self.insert(EntitySnapshot::new(Id::random(), *owner, name, Status::Alive)))
    }

    fn set_name(&self, id: &EntityId, name: &str) -> Result<()> {
        self.update(id, |e| e.name = name.to_string())
    }

    fn set_image(&self, id: &EntityId, image: &str) -> Result<()> {
        self.update(id, |e| e.image = image.to_string())
    }
}

impl BoardService for MemoryEntities {
    fn create_board(&self, owner: &EntityId, name: &str) -> Result<EntitySnapshot> {
        Ok(self.insert(EntitySnapshot::new(Id::random(), *owner, name, Status::Alive)))
    }

    fn create_join_entity(&self, board: &EntityId, user: &EntityId, node: &NodeId) -> Result<EntitySnapshot> {
        let mut snapshot = self.get_entity(board)?.ok_or_else(|| self.not_found(board))?;
        tracing::debug!(board = %board, user = %user, node = %node, "admitted board member");
        snapshot.peer_id = Some(snapshot.owner_id);
        Ok(snapshot)
    }

    fn join_board(&self, owner: &EntityId, mut board: EntitySnapshot) -> Result<EntitySnapshot> {
        board.owner_id = *owner;
        board.status = Status::Alive;
        board.log_id = None;
        board.update_ts = kith_types::time::now();
        Ok(self.insert(board))
    }
}

impl FriendService for MemoryEntities {
    fn approve_join_friend(
        &self,
        owner: &EntityId,
        user: &EntityId,
        node: &NodeId,
        name: &str,
    ) -> Result<EntitySnapshot> {
        let mut friend = EntitySnapshot::new(Id::random(), *owner, name, Status::Alive);
        friend.peer_id = Some(*user);
        friend.peer_node_id = Some(*node);
        Ok(self.insert(friend))
    }

    fn create_friend(
        &self,
        owner: &EntityId,
        friend_id: &EntityId,
        peer: &EntityId,
        peer_node: &NodeId,
        name: &str,
    ) -> Result<EntitySnapshot> {
        if read(&self.entities).contains_key(friend_id) {
            return Err(MeError::AlreadyExists(format!("friend {friend_id}")));
        }
        let mut friend = EntitySnapshot::new(*friend_id, *owner, name, Status::Init);
        friend.peer_id = Some(*peer);
        friend.peer_node_id = Some(*peer_node);
        Ok(self.insert(friend))
    }

    fn init_friend_info(&self, friend_id: &EntityId, peer_node: &NodeId) -> Result<()> {
        self.update(friend_id, |e| {
            e.peer_node_id = Some(*peer_node);
            e.status = e.status.advance(Status::Alive);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile() {
        let profiles = MemoryEntities::new("profile");
        let owner = Id::random();
        let p = profiles.create_profile(&owner, "alice").expect("create");
        profiles.set_name(&p.entity_id, "alice2").expect("name");
        profiles.set_image(&p.entity_id, "img").expect("image");
        let got = profiles.get_entity(&p.entity_id).expect("get").expect("some");
        assert_eq!(got.name, "alice2");
        assert_eq!(got.image, "img");
        assert!(profiles.set_name(&Id::random(), "x").is_err());
        assert_eq!(profiles.list_entities(&owner).expect("list").len(), 1);
    }

    #[test]
    fn test_restore_keeps_newer() {
        let boards = MemoryEntities::new("board");
        let b = boards.create_board(&Id::random(), "b").expect("create");
        let mut stale = b.clone();
        stale.name = "stale".into();
        stale.update_ts -= 10;
        boards.restore_entity(stale).expect("restore");
        assert_eq!(boards.get_entity(&b.entity_id).expect("get").expect("some").name, "b");
    }

    #[test]
    fn test_board_join() {
        let host = MemoryEntities::new("board");
        let guest = MemoryEntities::new("board");
        let owner = Id::random();
        let board = host.create_board(&owner, "b").expect("create");
        let described = host
            .create_join_entity(&board.entity_id, &Id::random(), &Id::random())
            .expect("join entity");
        assert_eq!(described.peer_id, Some(owner));
        let me = Id::random();
        let joined = guest.join_board(&me, described).expect("join");
        assert_eq!(joined.owner_id, me);
        assert_eq!(joined.entity_id, board.entity_id);
    }

    #[test]
    fn test_services_by_kind() {
        let services = Services::memory();
        let owner = Id::random();
        let board = services.board.create_board(&owner, "b").expect("create");
        assert!(services
            .get_entity(EntityKind::Board, &board.entity_id)
            .expect("get")
            .is_some());
        assert!(services
            .get_entity(EntityKind::Friend, &board.entity_id)
            .expect("get")
            .is_none());
        let log_id = Id::random();
        services
            .set_entity_log(EntityKind::Board, &board.entity_id, log_id, 5)
            .expect("set log");
        let listed = services.list_entities(EntityKind::Board, &owner).expect("list");
        assert_eq!(listed[0].log_id, Some(log_id));
        services
            .remove_entity(EntityKind::Board, &board.entity_id)
            .expect("remove");
        assert!(services.list_entities(EntityKind::Board, &owner).expect("list").is_empty());
    }

    #[test]
    fn test_friend_flow() {
        let friends = MemoryEntities::new("friend");
        let (me, peer, node) = (Id::random(), Id::random(), Id::random());
        let approved = friends.approve_join_friend(&me, &peer, &node, "bob").expect("approve");
        assert_eq!(approved.peer_id, Some(peer));

        let guest = MemoryEntities::new("friend");
        let f = guest
            .create_friend(&peer, &approved.entity_id, &me, &node, "alice")
            .expect("create");
        assert_eq!(f.status, Status::Init);
        assert!(guest.create_friend(&peer, &approved.entity_id, &me, &node, "a").is_err());
        guest.init_friend_info(&f.entity_id, &node).expect("init");
        assert_eq!(
            guest.get_entity(&f.entity_id).expect("get").expect("some").status,
            Status::Alive
        );
    }
}
