//! Creation, convergence, validation and teardown of sharded clusters

mod common;

use common::{full_slot_space, Harness};
use kp_core::Role;
use kvpilot::resource::{ClusterKind, Phase, FINALIZER};
use kvpilot::store::ResourceStore;

#[tokio::test]
async fn creating_a_cluster_converges_to_a_full_slot_partition() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 3, 2).await;
    h.converge(10).await;

    let cluster = h.cluster(&key).await;
    assert_eq!(cluster.status.phase, Phase::Running);
    assert!(!cluster.status.rebalance);
    assert_eq!(cluster.status.topo.len(), 3);

    // the union of master-owned slots is exactly [0, 16383]
    assert_eq!(Harness::master_slot_union(&cluster), full_slot_space());

    // one master per shard, replicas linked to it
    for shard in 0..3 {
        let entries = Harness::shard_entries(&cluster, shard);
        assert_eq!(entries.len(), 2);
        let masters: Vec<_> = entries.iter().filter(|n| n.role == Some(Role::Master)).collect();
        assert_eq!(masters.len(), 1);
        for replica in entries.iter().filter(|n| n.role == Some(Role::Replica)) {
            assert_eq!(replica.master_id, masters[0].node_id);
        }
    }

    // every live node holds the same topology at the same version
    let version = cluster.status.version;
    assert!(version >= 1);
    let mut seen = None;
    for ip in Harness::node_ips(&cluster) {
        let (message, node_version) = h.sim.topology_of(&ip).expect("topology installed");
        assert_eq!(node_version, version, "node {ip}");
        match &seen {
            None => seen = Some(message),
            Some(expected) => assert_eq!(&message, expected, "node {ip}"),
        }
    }

    // monitors registered for every shard master, finalizer pinned
    assert!(cluster.meta.has_finalizer(FINALIZER));
    let sentinels = h.sentinel_ips(&cluster).await;
    assert!(!sentinels.is_empty());
    for shard in 0..3 {
        let master = Harness::shard_master(&cluster, shard);
        for sentinel in &sentinels {
            assert_eq!(
                h.sim.monitor_of(sentinel, &cluster.master_name(Some(shard))),
                Some(master.ip.clone()),
            );
        }
    }
}

#[tokio::test]
async fn converged_clusters_reconcile_as_a_no_op() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 3, 2).await;
    h.converge(10).await;

    let before = h.cluster(&key).await;
    h.converge(5).await;
    let after = h.cluster(&key).await;

    assert_eq!(before.status.version, after.status.version);
    assert_eq!(before.status.topo, after.status.topo);
    assert!(!after.status.rebalance);
    assert!(after.status.shrink.is_none());
    // no slot ever moved
    assert!(h.sim.move_log().is_empty());
}

#[tokio::test]
async fn invalid_declarations_fail_terminally() {
    let h = Harness::new();
    let key = h.declare("kv-nopass", ClusterKind::Cluster, 3, 2).await;
    h.edit_spec(&key, |spec| spec.password.clear()).await;
    h.converge(3).await;

    let cluster = h.cluster(&key).await;
    assert_eq!(cluster.status.phase, Phase::Failed);
    assert_eq!(cluster.status.reason, "password must be set");

    // failed clusters stay failed; no pods are created for them
    h.converge(3).await;
    let cluster = h.cluster(&key).await;
    assert_eq!(cluster.status.phase, Phase::Failed);
    assert!(cluster.status.topo.is_empty());

    let sentinel = h
        .declare("sentinel-even", ClusterKind::Sentinel, 0, 4)
        .await;
    h.converge(2).await;
    let sentinel = h.cluster(&sentinel).await;
    assert_eq!(sentinel.status.phase, Phase::Failed);
}

#[tokio::test]
async fn deletion_tears_down_monitors_and_releases_the_finalizer() {
    let h = Harness::new();
    let key = h.declare("kv-demo", ClusterKind::Cluster, 2, 2).await;
    h.converge(10).await;
    let cluster = h.cluster(&key).await;
    assert!(cluster.meta.has_finalizer(FINALIZER));
    let sentinels = h.sentinel_ips(&cluster).await;
    assert!(sentinels
        .iter()
        .all(|s| h.sim.monitor_of(s, &cluster.master_name(Some(0))).is_some()));

    h.store.mark_cluster_deleted(&key).unwrap();
    h.converge(3).await;

    assert!(h.store.get_cluster(&key).await.is_err());
    for shard in 0..2 {
        for sentinel in &sentinels {
            assert_eq!(
                h.sim.monitor_of(sentinel, &cluster.master_name(Some(shard))),
                None
            );
        }
    }
}
