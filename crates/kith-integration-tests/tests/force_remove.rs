//! Integration test: force-removing a leader that went away.
//!
//! 1. Two devices share one identity, A leads
//! 2. A is cut off from the network
//! 3. B refuses to force-remove while it still follows a leader
//! 4. Once B's election timeout clears the leader, the force removal commits

use kith_integration_tests::{init_tracing, pair, wait_until, wait_until_async, Device};
use kith_me::master_oplog::MasterOp;
use kith_me::MeError;
use kith_transport::Hub;
use kith_types::Status;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn force_remove_partitioned_leader() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    let b = Device::start(&hub, "b").expect("start b");
    assert!(a.wait_alive().await);
    assert!(b.wait_alive().await);
    assert!(pair(&a, &b).await.expect("pair"));

    let a_raft = a.backend.get_raft_status().expect("raft a");
    assert_eq!(a_raft.lead, a_raft.id, "the first device leads");
    assert!(wait_until(|| b.backend.get_raft_status().is_ok_and(|s| s.lead == a_raft.id)).await);

    hub.isolate(a.node_id);

    // B still follows A.
    let early = b.backend.force_remove_node(&a.node_id).await;
    assert!(matches!(early, Err(MeError::WithLead(lead)) if lead == a_raft.id), "got {early:?}");

    // Without heartbeats B drops the leader, and the removal goes through.
    assert!(
        wait_until_async(|| async { b.backend.force_remove_node(&a.node_id).await.is_ok() }).await,
        "force removal should succeed once the leader is gone"
    );
    assert!(wait_until(|| b.my_node(&a.node_id).is_some_and(|n| n.status == Status::Deleted)).await);
    assert!(b.has_master_op(MasterOp::RevokeMaster));
    let raft = b.backend.get_raft_status().expect("raft b");
    assert!(!raft.voters.contains_key(&a_raft.id));
    assert_eq!(b.status(), Some(Status::Alive));

    a.stop();
    b.stop();
}
