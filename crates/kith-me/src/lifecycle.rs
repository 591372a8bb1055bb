//! Creation, promotion and removal of an identity on this device.

use kith_types::{EntityId, Status};
use tracing::{info, warn};

use crate::keystore::IdentityKey;
use crate::manager::{Me, Signal};
use crate::me_oplog::{CreateMeData, MeOp, MeOplog, TerminateData};
use crate::services::{EntityKind, EntitySnapshot};
use crate::sync::lock;
use crate::{events, MeError, Result};

impl Me {
    /// First device: the bootstrap entry committed, so build the profile,
    /// the board, the CreateMe log and the first op key.
    pub(crate) fn create_full_me(&self) -> Result<()> {
        if lock(&self.info).log_id.is_some() {
            return self.promote_to_alive();
        }
        let name = self.config().name.clone();
        let profile = self.services().profile.create_profile(&self.id, &name)?;
        let board = self.services().board.create_board(&self.id, &name)?;
        let data = CreateMeData {
            profile_id: profile.entity_id,
            board_id: board.entity_id,
            name,
        };
        let log = self.create_me_oplog(self.id, MeOp::CreateMe, &data)?;
        {
            let mut info = lock(&self.info);
            info.profile_id = Some(profile.entity_id);
            info.board_id = Some(board.entity_id);
            info.log_id = Some(log.id);
            info.save(&self.db().me)?;
        }
        self.services()
            .set_entity_log(EntityKind::Profile, &profile.entity_id, log.id, log.ts)?;
        self.services()
            .set_entity_log(EntityKind::Board, &board.entity_id, log.id, log.ts)?;
        self.create_op_key()?;
        self.promote_to_alive()?;

        let node_name = self.config().node_name.clone();
        if !node_name.is_empty() {
            self.set_my_node_name(&node_name)?;
        }
        info!(id = %self.id, profile = %profile.entity_id, board = %board.entity_id, "identity created");
        Ok(())
    }

    fn promote_to_alive(&self) -> Result<()> {
        self.set_status(Status::Alive)?;
        self.set_node_status(&self.node_id, Status::Alive)?;
        Ok(())
    }

    /// Joined device: its add-node committed after init-me-info finished.
    pub(crate) fn internal_sync_to_alive(&self) -> Result<()> {
        self.promote_to_alive()?;
        info!(id = %self.id, "joined device is alive");
        self.sync_me_oplog_now();
        Ok(())
    }

    /// This device was removed from the identity.
    pub(crate) fn handle_revoke_my_node(&self) -> Result<()> {
        warn!(id = %self.id, node = %self.node_id, "this device was removed from the identity");
        self.revoke_keys()?;
        self.set_status(Status::Deleted)?;
        self.signal(Signal::Stopped(self.id));
        self.stop();
        Ok(())
    }

    pub(crate) fn handle_revoke_other_node(&self, node_id: &kith_types::NodeId) -> Result<()> {
        info!(id = %self.id, node = %node_id, "device removed from the identity");
        self.emit(events::MY_NODE_REMOVED, serde_json::json!({ "node_id": node_id.to_hex() }));
        Ok(())
    }

    /// Drop the key files of this identity, and the primary pair if it is this one.
    fn revoke_keys(&self) -> Result<()> {
        let keystore = self.keystore();
        keystore.revoke(&self.id)?;
        if keystore.load_current()?.is_some_and(|k| k.id == self.id) {
            keystore.revoke_current()?;
        }
        Ok(())
    }

    /// Tear the identity down after an alive MigrateMe or DeleteMe.
    ///
    /// Moves to `terminal`, removes the entities this identity owns, revokes
    /// the keys and ends in `Revoked`. Later calls are no-ops.
    pub(crate) fn run_delete_pipeline(&self, terminal: Status) -> Result<()> {
        if self.status().is_terminal() {
            return Ok(());
        }
        self.set_status(terminal)?;
        let info = self.info();
        let services = self.services();
        if let Some(board) = info.board_id {
            services.remove_entity(EntityKind::Board, &board)?;
        }
        if let Some(profile) = info.profile_id {
            services.remove_entity(EntityKind::Profile, &profile)?;
        }
        for kind in [EntityKind::Friend, EntityKind::Board] {
            for entity in services.list_entities(kind, &self.id)? {
                if let Err(e) = services.remove_entity(kind, &entity.entity_id) {
                    warn!(id = %self.id, entity = %entity.entity_id, error = %e, "unable to leave entity");
                }
            }
        }
        self.revoke_keys()?;
        self.set_status(Status::Revoked)?;
        info!(id = %self.id, via = %terminal, "identity revoked");
        self.signal(Signal::Stopped(self.id));
        self.stop();
        Ok(())
    }

    /// Delete this identity on every device.
    pub fn delete_me(&self) -> Result<MeOplog> {
        self.require_alive()?;
        let log = self.create_me_oplog(self.id, MeOp::DeleteMe, &TerminateData::default())?;
        if log.is_alive() {
            self.run_delete_pipeline(Status::Deleted)?;
        }
        Ok(log)
    }

    /// Retire this identity in favour of `new_id`.
    pub fn migrate_me(&self, new_id: EntityId) -> Result<MeOplog> {
        if new_id == self.id {
            return Err(MeError::InvalidData("an identity cannot migrate into itself".into()));
        }
        let log = self.create_me_oplog(self.id, MeOp::MigrateMe, &TerminateData { new_id: Some(new_id) })?;
        {
            let mut info = lock(&self.info);
            if !info.owner_ids.contains(&new_id) {
                info.owner_ids.push(new_id);
                info.save(&self.db().me)?;
            }
        }
        if log.is_alive() {
            self.run_delete_pipeline(Status::Migrated)?;
        }
        Ok(log)
    }

    /// Adopt `identity` as this device's primary key.
    pub(crate) fn renew_me(&self, identity: &IdentityKey) -> Result<()> {
        if identity.id != self.id {
            return Err(MeError::InvalidMe(format!("key of {} offered to {}", identity.id, self.id)));
        }
        self.keystore().delete()?;
        self.keystore().save(identity)?;
        let mut keys = lock(&self.keys);
        keys.set_identity(identity.key.clone())?;
        keys.index.save(&self.db().signkey, &self.id)?;
        info!(id = %self.id, "identity key renewed");
        Ok(())
    }

    pub(crate) fn require_alive(&self) -> Result<()> {
        match self.status() {
            Status::Alive => Ok(()),
            other => Err(MeError::InvalidMe(format!("identity {} is {other}", self.id))),
        }
    }

    // ---- profile -----------------------------------------------------------

    pub fn get_my_profile(&self) -> Result<Option<EntitySnapshot>> {
        match self.info().profile_id {
            Some(profile) => self.services().profile.get_entity(&profile),
            None => Ok(None),
        }
    }

    fn profile_id(&self) -> Result<EntityId> {
        self.info()
            .profile_id
            .ok_or_else(|| MeError::NotFound(format!("profile of {}", self.id)))
    }

    pub fn set_my_name(&self, name: &str) -> Result<()> {
        self.services().profile.set_name(&self.profile_id()?, name)
    }

    pub fn set_my_image(&self, image: &str) -> Result<()> {
        self.services().profile.set_image(&self.profile_id()?, image)
    }
}

#[cfg(test)]
mod tests {
    use kith_types::NodeType;

    use super::*;
    use crate::manager::tests::fixture;

    #[tokio::test]
    async fn test_create_full_me_on_bootstrap() {
        let fx = fixture(Status::Pending);
        fx.me.start().expect("start");
        // The bootstrap entry commits on the first ready.
        for _ in 0..100 {
            if fx.me.status() == Status::Alive {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(fx.me.status(), Status::Alive);
        let info = fx.me.info();
        assert!(info.profile_id.is_some() && info.board_id.is_some() && info.log_id.is_some());
        assert_eq!(fx.me.get_my_profile().expect("profile").map(|p| p.name), Some("me".to_string()));
        assert!(fx.me.oldest_op_key_hash().is_some());
        assert_eq!(fx.me.self_node().expect("self").status, Status::Alive);
        assert_eq!(fx.me.self_node().expect("self").weight, NodeType::Desktop.weight());
        fx.me.set_my_name("alice").expect("name");
        assert_eq!(fx.me.get_my_profile().expect("profile").map(|p| p.name), Some("alice".to_string()));
        fx.me.stop();
    }

    #[test]
    fn test_delete_pipeline_revokes() {
        let mut fx = fixture(Status::Alive);
        let services = fx.me.services().clone();
        let board = services.board.create_board(&fx.me.id, "b").expect("board");
        let friend = services
            .friend
            .create_friend(&fx.me.id, &kith_types::Id::random(), &kith_types::Id::random(), &fx.me.node_id, "f")
            .expect("friend");

        fx.me.run_delete_pipeline(Status::Deleted).expect("pipeline");
        assert_eq!(fx.me.status(), Status::Revoked);
        assert!(fx.me.is_stopped());
        assert!(services.get_entity(EntityKind::Board, &board.entity_id).expect("get").is_none());
        assert!(services.get_entity(EntityKind::Friend, &friend.entity_id).expect("get").is_none());
        assert!(fx.me.keystore().load_by_id(&fx.me.id).expect("load").is_none());
        assert!(fx.me.keystore().load_current().expect("load").is_none());
        assert_eq!(fx.signals.try_recv().ok(), Some(Signal::Stopped(fx.me.id)));

        // A second run changes nothing.
        fx.me.run_delete_pipeline(Status::Migrated).expect("again");
        assert_eq!(fx.me.status(), Status::Revoked);
    }

    #[test]
    fn test_migrate_into_self_refused() {
        let fx = fixture(Status::Alive);
        assert!(matches!(fx.me.migrate_me(fx.me.id), Err(MeError::InvalidData(_))));
    }

    #[test]
    fn test_delete_requires_alive() {
        let fx = fixture(Status::Init);
        assert!(matches!(fx.me.delete_me(), Err(MeError::InvalidMe(_))));
    }

    #[test]
    fn test_renew_refuses_other_identity() {
        let fx = fixture(Status::Sync);
        let other = IdentityKey::generate().expect("key");
        assert!(matches!(fx.me.renew_me(&other), Err(MeError::InvalidMe(_))));
        fx.me.renew_me(&fx.identity).expect("renew own");
        fx.me.renew_me(&fx.identity).expect("renew again");
        let keystore = fx.me.keystore();
        assert_eq!(keystore.load_current().expect("load").map(|k| k.id), Some(fx.me.id));
        assert_eq!(keystore.load_by_id(&fx.me.id).expect("load").map(|k| k.id), Some(fx.me.id));
    }
}
