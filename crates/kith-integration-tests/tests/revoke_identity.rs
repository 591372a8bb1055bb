//! Integration test: deleting an identity everywhere.
//!
//! 1. A single-device identity befriends another identity
//! 2. The validate-key challenge gates the revocation
//! 3. The DeleteMe log is alive at once, the delete pipeline runs
//! 4. Profile, board and friendship are gone, the keys are removed and
//!    the identity reports Revoked

use kith_integration_tests::{init_tracing, wait_until, Device};
use kith_me::{EntityKind, KeyStore, MeError, MeOp};
use kith_transport::Hub;
use kith_types::Status;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn revoke_identity() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    let friend = Device::start(&hub, "friend").expect("start friend");
    assert!(a.wait_alive().await);
    assert!(friend.wait_alive().await);
    let id = a.id().expect("identity");
    let info = a.backend.get().expect("info");
    let profile = info.profile_id.expect("profile");
    let board = info.board_id.expect("board");

    a.backend.join_friend(&friend.backend.show_url().expect("url")).expect("join friend");
    let services = a.backend.services();
    assert!(wait_until(|| services.list_entities(EntityKind::Friend, &id).is_ok_and(|f| f.len() == 1)).await);

    // The challenge must match this device's validate key.
    assert!(matches!(a.backend.revoke(&[1u8; 32]), Err(MeError::InvalidMe(_))));
    assert_eq!(a.status(), Some(Status::Alive));

    let validate_key = hex::decode(a.backend.show_validate_key()).expect("hex");
    let log = a.backend.revoke(&validate_key).expect("revoke");
    assert_eq!(log.op, MeOp::DeleteMe);
    assert_eq!(log.status, Status::Alive);
    assert!(log.master_log_id.is_some());

    // Owned entities are gone.
    assert!(services.get_entity(EntityKind::Profile, &profile).expect("profile").is_none());
    assert!(services.get_entity(EntityKind::Board, &board).expect("board").is_none());
    assert!(services.list_entities(EntityKind::Friend, &id).expect("friends").is_empty());

    // Keys are removed and the identity stopped.
    let keys = KeyStore::new(a.config.key_dir());
    assert!(keys.load_by_id(&id).expect("keystore").is_none());
    assert!(keys.load_current().expect("keystore").is_none());
    assert!(wait_until(|| a.backend.registered(&id).is_none()).await);

    let revoked = a.backend.get().expect("get after revoke");
    assert_eq!(revoked.id, id);
    assert_eq!(revoked.status, Status::Revoked);
    assert!(a.backend.show_me_url().is_err());

    a.stop();
    friend.stop();
}
