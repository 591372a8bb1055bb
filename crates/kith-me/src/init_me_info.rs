//! Bringing a newly approved device up to `Sync`.
//!
//! ```text
//! host (Alive)                               guest (Init)
//! InitMeInfo{Alive}              ->
//!                                <-          InitMeInfoAck{InternalPending}
//! InitMeInfoSync{key, oplog0..}  ->
//!                                <-          InitMeInfoAck{Sync}   (guest restarts)
//! ```
//!
//! Once the host sees `Sync` it starts replicating raft to the guest; the
//! guest turns `Alive` when its own add-node entry applies.

use std::sync::Arc;

use kith_transport::messages::{MSG_INIT_ME_INFO, MSG_INIT_ME_INFO_ACK, MSG_INIT_ME_INFO_SYNC};
use kith_types::{NodeId, Status};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::keystore::IdentityKey;
use crate::manager::{Me, Signal};
use crate::me_oplog::MeOp;
use crate::protocol::{InitMeInfo, InitMeInfoAck, InitMeInfoSync};
use crate::services::EntityKind;
use crate::sync::{lock, read};
use crate::{MeError, Result};

impl Me {
    pub(crate) async fn init_me_info_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config().init_me_info_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    if self.status() == Status::Alive {
                        self.send_init_me_info();
                    }
                }
            }
        }
        debug!(id = %self.id, "init-me-info loop stopped");
    }

    /// Greet every device still on its way in.
    pub(crate) fn send_init_me_info(&self) {
        let joining: Vec<NodeId> = read(&self.my_nodes)
            .live()
            .filter(|n| n.node_id != self.node_id && n.status < Status::Alive)
            .map(|n| n.node_id)
            .collect();
        for node in joining {
            if let Err(e) = self.send(&node, MSG_INIT_ME_INFO, &InitMeInfo { status: Status::Alive }) {
                debug!(id = %self.id, node = %node, error = %e, "init-me-info not delivered");
            }
        }
    }

    /// Guest side: a host of the identity greets this device.
    pub(crate) fn handle_init_me_info(&self, from: &NodeId, msg: InitMeInfo) -> Result<()> {
        if self.my_node(from).is_none_or(|n| n.is_deleted()) {
            return Err(MeError::InvalidNode(format!("{from} is not a device of {}", self.id)));
        }
        self.set_node_status(from, msg.status)?;
        if self.status() == Status::Init {
            self.set_status(Status::InternalPending)?;
            self.set_node_status(&self.node_id, Status::InternalPending)?;
            debug!(id = %self.id, host = %from, "waiting for identity material");
        }
        self.send(from, MSG_INIT_ME_INFO_ACK, &InitMeInfoAck { status: self.status() })
    }

    /// Host side: the guest reported its status.
    pub(crate) fn handle_init_me_info_ack(&self, from: &NodeId, ack: InitMeInfoAck) -> Result<()> {
        if self.my_node(from).is_none_or(|n| n.is_deleted()) {
            return Err(MeError::InvalidNode(format!("{from} is not a device of {}", self.id)));
        }
        if self.set_node_status(from, ack.status)? && ack.status == Status::Sync {
            info!(id = %self.id, node = %from, "joined device synced");
        }
        if ack.status != Status::InternalPending || self.status() != Status::Alive {
            return Ok(());
        }
        let identity = self
            .keystore()
            .load_by_id(&self.id)?
            .ok_or_else(|| MeError::InvalidMe(format!("no key for {} on this device", self.id)))?;
        let info = self.info();
        let oplog0 = match info.log_id {
            Some(log_id) => self.me_oplogs.get(&self.id, &log_id)?,
            None => None,
        };
        let services = self.services();
        let profile = match info.profile_id {
            Some(id) => services.get_entity(EntityKind::Profile, &id)?,
            None => None,
        };
        let board = match info.board_id {
            Some(id) => services.get_entity(EntityKind::Board, &id)?,
            None => None,
        };
        let sync = InitMeInfoSync {
            key: identity.key.to_hex(),
            postfix: hex::encode(identity.postfix),
            oplog0,
            profile,
            board,
        };
        self.send(from, MSG_INIT_ME_INFO_SYNC, &sync)?;
        debug!(id = %self.id, node = %from, "identity material sent");
        Ok(())
    }

    /// Guest side: take the identity material and restart as `Sync`.
    pub(crate) fn handle_init_me_info_sync(&self, from: &NodeId, msg: InitMeInfoSync<MeOp>) -> Result<()> {
        if self.my_node(from).is_none_or(|n| !n.status.is_synced()) {
            return Err(MeError::InvalidNode(format!("{from} may not hand out {}", self.id)));
        }
        if self.status() >= Status::Sync {
            return self.send(from, MSG_INIT_ME_INFO_ACK, &InitMeInfoAck { status: self.status() });
        }
        let identity = IdentityKey::from_hex(&msg.key, &msg.postfix)?;
        if identity.id != self.id {
            return Err(MeError::InvalidMe(format!("material of {} sent for {}", identity.id, self.id)));
        }

        // The previous primary of this device gives way to the joined identity.
        // Its key stays primary until the migration is on record.
        if let Some(old) = self.keystore().load_current()?.filter(|k| k.id != self.id) {
            match self.registered(&old.id) {
                Some(previous) => {
                    previous.migrate_me(self.id).inspect_err(|e| {
                        warn!(id = %self.id, previous = %old.id, error = %e, "unable to migrate previous identity");
                    })?;
                }
                None => debug!(id = %self.id, previous = %old.id, "previous identity not running"),
            }
        }

        if let Some(log) = msg.oplog0 {
            self.verify_received(&log)?;
            let _guard = lock(&self.me_oplog_lock);
            self.me_oplogs.save_alive(&log)?;
        }
        let services = self.services();
        for (kind, snapshot) in [(EntityKind::Profile, msg.profile), (EntityKind::Board, msg.board)] {
            if let Some(snapshot) = snapshot {
                services.restore_entity(kind, snapshot)?;
            }
        }
        self.renew_me(&identity)?;
        self.set_status(Status::Sync)?;
        self.set_node_status(&self.node_id, Status::Sync)?;
        self.send(from, MSG_INIT_ME_INFO_ACK, &InitMeInfoAck { status: Status::Sync })?;
        info!(id = %self.id, host = %from, "identity material received");
        self.signal(Signal::Restart(self.id));
        Ok(())
    }
}
