//! Integration test: MeOplog convergence after a partition.
//!
//! 1. Two devices share one identity; two unrelated identities host friend URLs
//! 2. The devices are partitioned and each joins a different friend
//! 3. The light device's log waits for a co-signature, the heavy one's is alive at once
//! 4. After healing, pending sync and Merkle anti-entropy bring both logs
//!    and both friendships to both devices

use kith_integration_tests::{init_tracing, pair, wait_until, Device};
use kith_me::{EntityKind, MeOp};
use kith_oplog::MerkleLevel;
use kith_transport::Hub;
use kith_types::{EntityId, ListOrder, LogId, Status};

fn alive_join_friend_logs(device: &Device) -> Vec<LogId> {
    let mut ids: Vec<LogId> = device
        .backend
        .get_me_oplog_list(None, 1000, ListOrder::Asc)
        .unwrap_or_default()
        .into_iter()
        .filter(|log| log.op == MeOp::JoinFriend && log.status == Status::Alive)
        .map(|log| log.id)
        .collect();
    ids.sort();
    ids
}

fn friends(device: &Device, id: &EntityId) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = device
        .backend
        .services()
        .list_entities(EntityKind::Friend, id)
        .unwrap_or_default()
        .into_iter()
        .map(|f| f.entity_id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn me_oplog_convergence_after_partition() {
    init_tracing();
    let hub = Hub::new();
    let a = Device::start(&hub, "a").expect("start a");
    let b = Device::start(&hub, "b").expect("start b");
    let alice = Device::start(&hub, "alice").expect("start alice");
    let bob = Device::start(&hub, "bob").expect("start bob");
    for device in [&a, &b, &alice, &bob] {
        assert!(device.wait_alive().await, "{} should start alive", device.name);
    }
    assert!(pair(&a, &b).await.expect("pair"));
    let id = a.id().expect("identity");

    // Partition the two devices; each befriends someone else.
    hub.partition(a.node_id, b.node_id);
    a.backend.join_friend(&alice.backend.show_url().expect("alice url")).expect("a joins alice");
    b.backend.join_friend(&bob.backend.show_url().expect("bob url")).expect("b joins bob");

    assert!(wait_until(|| alive_join_friend_logs(&a).len() == 1).await, "a holds quorum alone");
    assert!(wait_until(|| friends(&b, &id).len() == 1).await, "b records its friend locally");
    let pending = b
        .backend
        .get_pending_me_oplog_master_list(None, 100, ListOrder::Asc)
        .expect("pending");
    assert!(b
        .backend
        .get_pending_me_oplog_internal_list(None, 100, ListOrder::Asc)
        .expect("internal pending")
        .is_empty());
    assert!(pending.iter().any(|log| log.op == MeOp::JoinFriend), "b waits for a co-signature");
    assert!(alive_join_friend_logs(&b).is_empty());

    // Heal; the devices converge.
    hub.heal();
    assert!(
        wait_until(|| {
            let on_a = alive_join_friend_logs(&a);
            on_a.len() == 2 && on_a == alive_join_friend_logs(&b)
        })
        .await,
        "both join-friend logs should be alive on both devices"
    );
    assert!(
        wait_until(|| {
            let on_a = friends(&a, &id);
            on_a.len() == 2 && on_a == friends(&b, &id)
        })
        .await,
        "both friendships should be on both devices"
    );
    let roots = |d: &Device| d.backend.get_me_oplog_merkle_node_list(MerkleLevel::Year).ok();
    assert!(wait_until(|| roots(&a).is_some() && roots(&a) == roots(&b)).await, "merkle roots should match");

    for device in [&a, &b, &alice, &bob] {
        device.stop();
    }
}
