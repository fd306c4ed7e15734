//! Replica shrink/expand with ordinal reservation

mod common;

use common::{full_slot_space, Harness};
use kvpilot::resource::{ClusterKind, Phase};
use kvpilot::store::ResourceStore;

#[tokio::test]
async fn shrinking_replicas_retires_one_non_master_per_shard() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 3, 2).await;
    h.converge(10).await;

    let before = h.cluster(&key).await;
    let masters_before: Vec<String> = (0..3)
        .map(|s| Harness::shard_master(&before, s).node_id.clone())
        .collect();

    h.edit_spec(&key, |spec| spec.replicas = 1).await;
    h.converge(10).await;

    let after = h.cluster(&key).await;
    assert_eq!(after.status.phase, Phase::Running);
    assert!(after.status.shrink.is_none());
    for shard in 0..3 {
        let entries = Harness::shard_entries(&after, shard);
        // exactly the master remains; it never changed
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, masters_before[shard]);
        let set = h.store.get_pod_set(&after.pod_set_key(shard)).await.unwrap();
        assert_eq!(set.replicas, 1);
        let pods = h.store.list_set_pods(&after.pod_set_key(shard)).await.unwrap();
        assert_eq!(pods.len(), 1);
    }
    // the slot space survived intact
    assert_eq!(Harness::master_slot_union(&after), full_slot_space());
    assert!(h.sim.move_log().is_empty());
}

#[tokio::test]
async fn expansion_consumes_reserved_ordinals_first() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 1, 3).await;
    h.converge(10).await;

    // move the master to the highest ordinal so shrinking has to reserve
    // the gaps below it
    let before = h.cluster(&key).await;
    let old_master = Harness::shard_master(&before, 0).clone();
    for entry in Harness::shard_entries(&before, 0) {
        if entry.node_id != old_master.node_id {
            let offset = 10 * (entry.pod.rsplit('-').next().unwrap().parse::<i64>().unwrap() + 1);
            h.sim.set_offset(&entry.ip, "pw", offset);
        }
    }
    h.sim.kill(&old_master.ip);
    kvpilot::failover::handle_failover(
        h.ctx.clone(),
        kvpilot::failover::FailoverMsg {
            ip: old_master.ip.clone(),
            port: kvpilot::node::NODE_PORT,
            key: key.clone(),
            shard: 0,
            deadline: chrono::Utc::now() + chrono::Duration::seconds(30),
        },
    )
    .await;
    h.converge(10).await;
    let healed = h.cluster(&key).await;
    let master = Harness::shard_master(&healed, 0).clone();
    assert_eq!(master.pod, "kv-demo-0-2");

    h.edit_spec(&key, |spec| spec.replicas = 1).await;
    h.converge(10).await;
    let shrunk = h.cluster(&key).await;
    assert_eq!(Harness::shard_entries(&shrunk, 0).len(), 1);
    // ordinals below the master's stay reserved while shrunk
    let set = h.store.get_pod_set(&shrunk.pod_set_key(0)).await.unwrap();
    assert_eq!(set.replicas, 1);
    assert_eq!(set.reserve_ordinals, vec![0, 1]);
    assert_eq!(Harness::shard_master(&shrunk, 0).node_id, master.node_id);

    h.edit_spec(&key, |spec| spec.replicas = 3).await;
    h.converge(10).await;

    let grown = h.cluster(&key).await;
    assert_eq!(grown.status.phase, Phase::Running);
    assert_eq!(Harness::shard_entries(&grown, 0).len(), 3);
    // ordinal numbering stays minimal: reserved gaps were reused
    let mut ordinals: Vec<usize> = h
        .store
        .list_set_pods(&grown.pod_set_key(0))
        .await
        .unwrap()
        .iter()
        .filter_map(|p| p.ordinal())
        .collect();
    ordinals.sort_unstable();
    assert_eq!(ordinals, vec![0, 1, 2]);
    let set = h.store.get_pod_set(&grown.pod_set_key(0)).await.unwrap();
    assert!(set.reserve_ordinals.is_empty());
    assert_eq!(Harness::shard_master(&grown, 0).node_id, master.node_id);
}

#[tokio::test]
async fn retired_replica_claims_are_garbage_collected() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 1, 2).await;
    h.converge(10).await;
    let cluster = h.cluster(&key).await;
    let claims = h
        .store
        .list_volume_claims("default", &cluster.selector_labels())
        .await
        .unwrap();
    assert_eq!(claims.len(), 2);

    h.edit_spec(&key, |spec| spec.replicas = 1).await;
    h.converge(10).await;

    let cluster = h.cluster(&key).await;
    let claims = h
        .store
        .list_volume_claims("default", &cluster.selector_labels())
        .await
        .unwrap();
    assert_eq!(claims.len(), 1);
}
