//! Integration test: adding a second device to an identity.
//!
//! 1. Device A creates an identity and shows a join-me URL
//! 2. Device B, alive with its own throwaway identity, joins with A's validate key
//! 3. A proposes the new device; both devices write the master oplog at index 2
//! 4. Init-me-info ships the identity to B, which goes Sync and then Alive
//! 5. B's previous identity is migrated away

use kith_integration_tests::{init_tracing, pair, wait_until, Device};
use kith_join::JoinType;
use kith_me::master_oplog::MasterData;
use kith_me::KeyStore;
use kith_transport::Hub;
use kith_types::{ListOrder, Status};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn pair_two_devices() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    let b = Device::start(&hub, "b").expect("start b");
    assert!(a.wait_alive().await);
    assert!(b.wait_alive().await);
    let id = a.id().expect("a identity");
    let old_b = b.id().expect("b identity");
    assert_ne!(id, old_b);

    assert!(pair(&a, &b).await.expect("pair"), "b should join the identity of a");
    assert_eq!(a.backend.get_join_key_infos(JoinType::Me).expect("keys").len(), 1);

    // Both devices converge on the same two records and master index.
    assert!(wait_until(|| a.node_ids().len() == 2 && a.node_ids() == b.node_ids()).await);
    assert!(wait_until(|| a.newest_master_index() == Some(2) && b.newest_master_index() == Some(2)).await);
    let joined = a.my_node(&b.node_id).expect("b on a");
    assert_eq!(joined.weight, 1);
    assert_eq!(b.my_node(&b.node_id).expect("b on b").status, Status::Alive);
    assert_eq!(
        a.backend.get_total_weight().expect("weight a"),
        b.backend.get_total_weight().expect("weight b")
    );

    // Every synced device is a master of the newest master oplog.
    let newest = a
        .backend
        .get_my_master_oplog_list(None, 1, ListOrder::Desc)
        .expect("master list");
    let data: MasterData = newest[0].data_as().expect("master data");
    let nodes = a.backend.get_my_nodes().expect("nodes");
    for node in nodes.iter().filter(|n| n.status >= Status::Sync) {
        assert!(data.masters.contains_key(&node.raft_id), "{} missing from the masters", node.node_id);
    }
    assert_eq!(data.total_weight, a.backend.get_total_weight().expect("weight a"));

    // B holds A's identity key, and it is B's primary now.
    let key = a.backend.show_my_key().expect("key a");
    assert_eq!(b.backend.show_my_key().expect("key b"), key);
    let current = KeyStore::new(b.config.key_dir())
        .load_current()
        .expect("keystore")
        .expect("current key");
    assert_eq!(current.id, id);

    // The throwaway identity of B retired in favour of A's.
    let retired = b.backend.get_raw_me(&old_b).expect("raw").expect("recorded");
    assert!(retired.status.is_terminal());
    assert!(b.backend.registered(&old_b).is_none());

    a.stop();
    b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn pair_refuses_wrong_validate_key() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    let b = Device::start(&hub, "b").expect("start b");
    assert!(a.wait_alive().await);
    assert!(b.wait_alive().await);
    let old_b = b.id().expect("b identity");

    let url = a.backend.show_me_url().expect("url");
    b.backend.join_me(&url, &hex::encode([7u8; 32])).expect("request posted");

    // A never records B; B keeps its own identity.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(a.my_node(&b.node_id).is_none());
    assert_eq!(a.node_ids().len(), 1);
    assert_eq!(b.id(), Some(old_b));
    assert_eq!(b.status(), Some(Status::Alive));

    a.stop();
    b.stop();
}
