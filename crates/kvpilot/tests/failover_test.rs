//! Failover pipeline: promotion, flagging, healing, terminal failure

mod common;

use chrono::Utc;
use common::{full_slot_space, Harness};
use kp_core::Role;
use kvpilot::failover::{handle_failover, FailoverMsg, NO_SUITABLE_REPLICA};
use kvpilot::node::NODE_PORT;
use kvpilot::resource::{ClusterKind, Phase, ResourceKey};

fn down_msg(key: &ResourceKey, ip: &str, shard: usize) -> FailoverMsg {
    FailoverMsg {
        ip: ip.to_string(),
        port: NODE_PORT,
        key: key.clone(),
        shard,
        deadline: Utc::now() + chrono::Duration::seconds(30),
    }
}

#[tokio::test]
async fn killing_a_master_promotes_the_most_caught_up_replica() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 3, 3).await;
    h.converge(10).await;

    let before = h.cluster(&key).await;
    assert_eq!(before.status.phase, Phase::Running);
    let old_master = Harness::shard_master(&before, 0).clone();
    let replicas: Vec<_> = Harness::shard_entries(&before, 0)
        .iter()
        .filter(|n| n.role == Some(Role::Replica))
        .cloned()
        .collect();
    assert_eq!(replicas.len(), 2);

    // the second replica is further ahead; it must win
    h.sim.set_offset(&replicas[0].ip, "pw", 100);
    h.sim.set_offset(&replicas[1].ip, "pw", 250);
    h.sim.kill(&old_master.ip);

    handle_failover(h.ctx.clone(), down_msg(&key, &old_master.ip, 0)).await;

    let after = h.cluster(&key).await;
    let new_master = Harness::shard_master(&after, 0);
    assert_eq!(new_master.node_id, replicas[1].node_id);
    // the new master inherits the old master's exact slot set
    assert_eq!(new_master.slots, old_master.slots);
    // the old master is flagged for replacement, demoted, not promoted again
    let old_entry = Harness::shard_entries(&after, 0)
        .iter()
        .find(|n| n.node_id == old_master.node_id)
        .unwrap();
    assert!(old_entry.failover);
    assert_eq!(old_entry.role, Some(Role::Replica));
    // version moves by exactly one
    assert_eq!(after.status.version, before.status.version + 1);
    // the surviving replica now follows the new master
    let other = Harness::shard_entries(&after, 0)
        .iter()
        .find(|n| n.node_id == replicas[0].node_id)
        .unwrap();
    assert_eq!(other.master_id, new_master.node_id);
    // live nodes observed the new topology
    let (_, version) = h.sim.topology_of(&new_master.ip).unwrap();
    assert_eq!(version, after.status.version);

    // a duplicate notification for the dead master changes nothing
    handle_failover(h.ctx.clone(), down_msg(&key, &old_master.ip, 0)).await;
    let again = h.cluster(&key).await;
    assert_eq!(again.status.version, after.status.version);
    assert_eq!(again.status.topo, after.status.topo);
}

#[tokio::test]
async fn promotion_skips_flagged_nodes_even_with_higher_offsets() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 1, 3).await;
    h.converge(10).await;

    let before = h.cluster(&key).await;
    let master = Harness::shard_master(&before, 0).clone();
    let replicas: Vec<_> = Harness::shard_entries(&before, 0)
        .iter()
        .filter(|n| n.role == Some(Role::Replica))
        .cloned()
        .collect();

    // first replica dies and gets flagged
    h.sim.kill(&replicas[0].ip);
    handle_failover(h.ctx.clone(), down_msg(&key, &replicas[0].ip, 0)).await;
    let flagged = h.cluster(&key).await;
    assert!(Harness::shard_entries(&flagged, 0)
        .iter()
        .any(|n| n.node_id == replicas[0].node_id && n.failover));

    // the flagged node advertises a much higher offset, but is dead
    h.sim.set_offset(&replicas[0].ip, "pw", 9999);
    h.sim.set_offset(&replicas[1].ip, "pw", 10);
    h.sim.kill(&master.ip);
    handle_failover(h.ctx.clone(), down_msg(&key, &master.ip, 0)).await;

    let after = h.cluster(&key).await;
    let new_master = Harness::shard_master(&after, 0);
    assert_eq!(new_master.node_id, replicas[1].node_id);
}

#[tokio::test]
async fn flagged_nodes_are_replaced_and_rejoin_as_replicas() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 1, 3).await;
    h.converge(10).await;

    let before = h.cluster(&key).await;
    let old_master = Harness::shard_master(&before, 0).clone();
    h.sim.kill(&old_master.ip);
    handle_failover(h.ctx.clone(), down_msg(&key, &old_master.ip, 0)).await;

    // reconciliation replaces the dead pod and relinks the newcomer
    h.converge(10).await;

    let after = h.cluster(&key).await;
    assert_eq!(after.status.phase, Phase::Running);
    let entries = Harness::shard_entries(&after, 0);
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|n| !n.failover));
    assert_eq!(
        entries.iter().filter(|n| n.role == Some(Role::Master)).count(),
        1
    );
    let master = Harness::shard_master(&after, 0);
    for replica in entries.iter().filter(|n| n.role == Some(Role::Replica)) {
        assert_eq!(replica.master_id, master.node_id);
    }
    // the replaced pod came back on a fresh address
    let replaced = entries.iter().find(|n| n.pod == old_master.pod).unwrap();
    assert_ne!(replaced.ip, old_master.ip);
    assert_eq!(Harness::master_slot_union(&after), full_slot_space());
}

#[tokio::test]
async fn a_shard_with_a_single_member_fails_terminally() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 2, 1).await;
    h.converge(10).await;

    let before = h.cluster(&key).await;
    let master = Harness::shard_master(&before, 1).clone();
    h.sim.kill(&master.ip);
    handle_failover(h.ctx.clone(), down_msg(&key, &master.ip, 1)).await;

    let after = h.cluster(&key).await;
    assert_eq!(after.status.phase, Phase::Failed);
    assert_eq!(after.status.reason, NO_SUITABLE_REPLICA);

    // failed clusters are left alone afterwards
    h.converge(3).await;
    let still = h.cluster(&key).await;
    assert_eq!(still.status.phase, Phase::Failed);
    assert_eq!(still.status.version, after.status.version);
}
