//! Integration test: removing a device through the raft leader.
//!
//! 1. Three devices share one identity
//! 2. A removes C; the leader commits the removal
//! 3. A and B flip C to Deleted and write a RevokeMaster oplog
//! 4. C learns of its own removal, stops the identity and drops its keys

use kith_integration_tests::{init_tracing, pair, wait_until, Device};
use kith_me::master_oplog::MasterOp;
use kith_me::KeyStore;
use kith_transport::Hub;
use kith_types::Status;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn graceful_removal_of_third_device() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    let b = Device::start(&hub, "b").expect("start b");
    let c = Device::start(&hub, "c").expect("start c");
    for device in [&a, &b, &c] {
        assert!(device.wait_alive().await, "{} should start alive", device.name);
    }
    let id = a.id().expect("a identity");

    assert!(pair(&a, &b).await.expect("pair b"));
    assert!(pair(&a, &c).await.expect("pair c"));
    assert!(wait_until(|| [&a, &b, &c].iter().all(|d| d.node_ids().len() == 3)).await);
    assert!(wait_until(|| b.newest_master_index() == a.newest_master_index()).await);
    let before = a.backend.get_total_weight().expect("weight");

    a.backend.remove_node(&c.node_id).await.expect("remove c");

    // Survivors record the removal.
    let deleted = |d: &Device| d.my_node(&c.node_id).is_some_and(|n| n.status == Status::Deleted);
    assert!(wait_until(|| deleted(&a) && deleted(&b)).await, "c should be deleted on a and b");
    assert!(wait_until(|| a.has_master_op(MasterOp::RevokeMaster) && b.has_master_op(MasterOp::RevokeMaster)).await);
    assert!(a.backend.get_total_weight().expect("weight") < before);
    let raft = a.backend.get_raft_status().expect("raft");
    assert_eq!(raft.voters.len(), 2);

    // C stops the identity and forgets its key.
    assert!(wait_until(|| c.backend.registered(&id).is_none()).await, "c should stop the identity");
    let keys = KeyStore::new(c.config.key_dir());
    assert!(keys.load_by_id(&id).expect("keystore").is_none());
    assert!(keys.load_current().expect("keystore").is_none());
    let record = c.backend.get_raw_me(&id).expect("raw").expect("recorded");
    assert_eq!(record.status, Status::Deleted);

    // Removing it again is refused.
    assert!(a.backend.remove_node(&c.node_id).await.is_err());

    a.stop();
    b.stop();
    c.stop();
}
