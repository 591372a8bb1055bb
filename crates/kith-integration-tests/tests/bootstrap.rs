//! Integration test: first device of a new identity.
//!
//! 1. Start a device on a clean data directory
//! 2. Its single-node raft elects itself and commits the bootstrap entry
//! 3. The identity becomes Alive with one master oplog at index 1
//! 4. A CreateMe oplog introduces the profile and board

use kith_integration_tests::{init_tracing, Device};
use kith_me::master_oplog::{MasterData, MasterOp};
use kith_me::MeOp;
use kith_transport::Hub;
use kith_types::{ListOrder, NodeType, Status};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn bootstrap_single_device() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    assert!(a.wait_alive().await, "first device should become alive");

    // Raft: one voter that leads itself.
    let raft = a.backend.get_raft_status().expect("raft status");
    assert_eq!(raft.lead, raft.id);
    assert_eq!(raft.voters.len(), 1);

    // Master oplog at index 1 adds this device with the desktop weight.
    let masters = a
        .backend
        .get_my_master_oplog_list(None, 10, ListOrder::Asc)
        .expect("master list");
    assert_eq!(masters.len(), 1);
    let first = &masters[0];
    assert_eq!(first.id.master_index(), Some(1));
    assert_eq!(first.op, MasterOp::AddMaster);
    let data: MasterData = first.data_as().expect("master data");
    assert_eq!(data.node_id, a.node_id);
    assert_eq!(data.masters.get(&data.raft_id).copied(), Some(NodeType::Desktop.weight()));
    assert_eq!(data.total_weight, u64::from(NodeType::Desktop.weight()));

    // One CreateMe log, alive, pointing at the new profile and board.
    let logs = a.backend.get_me_oplog_list(None, 100, ListOrder::Asc).expect("me oplogs");
    let creates: Vec<_> = logs.iter().filter(|log| log.op == MeOp::CreateMe).collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].status, Status::Alive);
    assert!(creates[0].master_log_id.is_some());

    let info = a.backend.get().expect("info");
    assert_eq!(info.log_id, Some(creates[0].id));
    assert!(a.backend.get_my_profile().expect("profile").is_some());
    assert!(info.board_id.is_some());

    // A single device record, alive, with the full weight.
    let nodes = a.backend.get_my_nodes().expect("nodes");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_id, a.node_id);
    assert_eq!(nodes[0].status, Status::Alive);
    assert_eq!(a.backend.get_total_weight().expect("weight"), u64::from(NodeType::Desktop.weight()));

    a.stop();
}
