//! Routing of Me protocol messages to their handlers.

use kith_transport::messages::*;
use kith_transport::Envelope;
use kith_types::{NodeId, PeerType};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::manager::Me;
use crate::me_oplog::MeOp;
use crate::op_key::OpKeyOp;
use crate::protocol::*;
use crate::services::EntityKind;
use crate::{MeError, Result};

fn payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    Ok(envelope.decode_payload()?)
}

/// Messages taken from any peer. Their handlers check the sender themselves.
fn is_open_code(code: u16) -> bool {
    matches!(
        code,
        MSG_INIT_ME_INFO | MSG_INIT_ME_INFO_ACK | MSG_INIT_ME_INFO_SYNC | MSG_SEND_RAFT_MSGS
    )
}

impl Me {
    /// Handle one message addressed to this identity.
    pub fn handle_message(&self, from: &NodeId, envelope: &Envelope) -> Result<()> {
        let code = envelope.code;
        let peer = self.peer_type(from);
        if !is_open_code(code) && peer < PeerType::Member {
            return Err(MeError::InvalidEntity(format!(
                "{} from {from} ({peer:?}) refused by {}",
                name(code),
                self.id
            )));
        }
        trace!(id = %self.id, from = %from, code = name(code), "me message");

        match code {
            MSG_JOIN_FRIEND => self.handle_join_friend_msg(payload(envelope)?),

            MSG_ADD_ME_OPLOG | MSG_ADD_PENDING_ME_OPLOG => {
                let msg: OplogMsg<MeOp> = payload(envelope)?;
                self.receive_me_oplogs(from, vec![msg.oplog]);
                Ok(())
            }
            MSG_ADD_ME_OPLOGS | MSG_ADD_PENDING_ME_OPLOGS => {
                let msg: OplogsMsg<MeOp> = payload(envelope)?;
                self.receive_me_oplogs(from, msg.oplogs);
                Ok(())
            }

            MSG_SYNC_ME_OPLOG => self.handle_sync_me_oplog(from, payload(envelope)?),
            MSG_SYNC_ME_OPLOG_ACK => {
                self.handle_sync_me_oplog_ack(from, payload(envelope)?);
                Ok(())
            }
            MSG_INVALID_SYNC_ME_OPLOG => {
                let msg: InvalidSyncMeOplog = payload(envelope)?;
                self.reconcile_top(from, &msg.nodes)
            }
            MSG_SYNC_ME_OPLOG_NEW_OPLOGS => self.handle_new_oplogs(from, payload(envelope)?),
            MSG_SYNC_ME_OPLOG_NEW_OPLOGS_ACK => self.handle_new_oplogs_ack(payload(envelope)?),
            MSG_FORCE_SYNC_ME_OPLOG => self.handle_force_sync_me_oplog(from, payload(envelope)?),
            MSG_FORCE_SYNC_ME_OPLOG_ACK => self.handle_force_sync_me_oplog_ack(from, payload(envelope)?),
            MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE => self.handle_by_merkle(from, payload(envelope)?),
            MSG_FORCE_SYNC_ME_OPLOG_BY_MERKLE_ACK => self.handle_by_merkle_ack(from, payload(envelope)?),
            MSG_FORCE_SYNC_ME_OPLOG_BY_OPLOG_ACK => {
                self.handle_by_oplog_ack(from, payload(envelope)?);
                Ok(())
            }
            MSG_SYNC_PENDING_ME_OPLOG => self.handle_sync_pending(from, payload(envelope)?),
            MSG_SYNC_PENDING_ME_OPLOG_ACK => {
                self.handle_sync_pending_ack(from, payload(envelope)?);
                Ok(())
            }

            MSG_SEND_RAFT_MSGS => {
                let msg: SendRaftMsgs = payload(envelope)?;
                self.handle_send_raft_msgs(from, msg.msgs);
                Ok(())
            }
            MSG_REQUEST_RAFT_LEAD => self.handle_request_raft_lead(from, payload(envelope)?),

            MSG_INIT_ME_INFO => self.handle_init_me_info(from, payload(envelope)?),
            MSG_INIT_ME_INFO_ACK => self.handle_init_me_info_ack(from, payload(envelope)?),
            MSG_INIT_ME_INFO_SYNC => self.handle_init_me_info_sync(from, payload(envelope)?),

            MSG_INTERNAL_SYNC_BOARD => self.handle_internal_sync(from, EntityKind::Board, payload(envelope)?),
            MSG_INTERNAL_SYNC_BOARD_ACK => self.handle_internal_sync_ack(EntityKind::Board, payload(envelope)?),
            MSG_INTERNAL_SYNC_FRIEND => self.handle_internal_sync(from, EntityKind::Friend, payload(envelope)?),
            MSG_INTERNAL_SYNC_FRIEND_ACK => self.handle_internal_sync_ack(EntityKind::Friend, payload(envelope)?),

            MSG_ADD_OP_KEY_OPLOG | MSG_ADD_PENDING_OP_KEY_OPLOG => {
                let msg: OplogMsg<OpKeyOp> = payload(envelope)?;
                self.receive_op_key_oplog(from, msg.oplog)
            }

            other => Err(MeError::InvalidData(format!("unexpected message code {other:#06x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use kith_types::{Id, NodeType, Status};

    use super::*;
    use crate::manager::tests::fixture;
    use crate::my_node::MyNode;
    use crate::sync::write;

    #[test]
    fn test_stranger_refused() {
        let fx = fixture(Status::Alive);
        let envelope = Envelope::new(MSG_FORCE_SYNC_ME_OPLOG, fx.me.id, &ForceSyncMeOplog::default()).expect("env");
        let result = fx.me.handle_message(&Id::random(), &envelope);
        assert!(matches!(result, Err(MeError::InvalidEntity(_))));
    }

    #[test]
    fn test_joining_device_limited_to_init() {
        let fx = fixture(Status::Alive);
        let joining = Id::random();
        let (_endpoint, mut joining_rx) = fx.hub.connect(joining);
        write(&fx.me.my_nodes).insert(MyNode::new(fx.me.id, joining, NodeType::Mobile, 0, Status::Init));

        let sync = Envelope::new(MSG_FORCE_SYNC_ME_OPLOG, fx.me.id, &ForceSyncMeOplog::default()).expect("env");
        assert!(matches!(fx.me.handle_message(&joining, &sync), Err(MeError::InvalidEntity(_))));

        let ack = Envelope::new(MSG_INIT_ME_INFO_ACK, fx.me.id, &InitMeInfoAck { status: Status::InternalPending })
            .expect("env");
        fx.me.handle_message(&joining, &ack).expect("ack");
        assert_eq!(fx.me.my_node(&joining).expect("node").status, Status::InternalPending);
        let sent = joining_rx.try_recv().expect("sent").envelope().expect("envelope");
        assert_eq!(sent.code, MSG_INIT_ME_INFO_SYNC);
    }

    #[test]
    fn test_open_codes_pass_the_gate() {
        let fx = fixture(Status::Alive);
        let stranger = Id::random();
        let (_endpoint, mut stranger_rx) = fx.hub.connect(stranger);
        assert_eq!(fx.me.peer_type(&stranger), PeerType::Random);

        let init = Envelope::new(MSG_INIT_ME_INFO, fx.me.id, &InitMeInfo { status: Status::Init }).expect("env");
        assert!(matches!(fx.me.handle_message(&stranger, &init), Err(MeError::InvalidNode(_))));
        let ack = Envelope::new(MSG_INIT_ME_INFO_ACK, fx.me.id, &InitMeInfoAck { status: Status::InternalPending })
            .expect("env");
        assert!(matches!(fx.me.handle_message(&stranger, &ack), Err(MeError::InvalidNode(_))));
        let material = InitMeInfoSync::<MeOp> {
            key: String::new(),
            postfix: String::new(),
            oplog0: None,
            profile: None,
            board: None,
        };
        let sync = Envelope::new(MSG_INIT_ME_INFO_SYNC, fx.me.id, &material).expect("env");
        assert!(matches!(fx.me.handle_message(&stranger, &sync), Err(MeError::InvalidNode(_))));
        let raft = Envelope::new(MSG_SEND_RAFT_MSGS, fx.me.id, &SendRaftMsgs { msgs: Vec::new() }).expect("env");
        fx.me.handle_message(&stranger, &raft).expect("raft messages");

        // Nothing was answered to the stranger.
        assert!(stranger_rx.try_recv().is_err());
        assert_eq!(fx.me.peer_type(&stranger), PeerType::Random);
    }

    #[test]
    fn test_synced_device_served() {
        let fx = fixture(Status::Alive);
        let sibling = Id::random();
        let (_endpoint, mut sibling_rx) = fx.hub.connect(sibling);
        write(&fx.me.my_nodes).insert(MyNode::new(fx.me.id, sibling, NodeType::Desktop, 2_000, Status::Alive));
        let envelope = Envelope::new(MSG_FORCE_SYNC_ME_OPLOG, fx.me.id, &ForceSyncMeOplog::default()).expect("env");
        fx.me.handle_message(&sibling, &envelope).expect("served");
        let reply = sibling_rx.try_recv().expect("reply").envelope().expect("envelope");
        assert_eq!(reply.code, MSG_FORCE_SYNC_ME_OPLOG_ACK);
    }

    #[test]
    fn test_unknown_code() {
        let fx = fixture(Status::Alive);
        let sibling = Id::random();
        write(&fx.me.my_nodes).insert(MyNode::new(fx.me.id, sibling, NodeType::Desktop, 2_000, Status::Alive));
        let envelope = Envelope::new(0x0fff, fx.me.id, &()).expect("env");
        assert!(matches!(fx.me.handle_message(&sibling, &envelope), Err(MeError::InvalidData(_))));
    }
}
