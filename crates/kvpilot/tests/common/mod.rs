//! Shared test harness: in-memory store + simulated node fleet
//!
//! `sweep` plays one platform step (settle pods) followed by one
//! reconciliation pass over every declared cluster, which is how the
//! suites drive convergence deterministically without the background
//! runtime.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kp_core::{expand_ranges, Role};
use kvpilot::controllers::reconcile;
use kvpilot::failover::FailoverMsg;
use kvpilot::node::sim::SimNodeClient;
use kvpilot::resource::{
    ClusterKind, ClusterSpec, ClusterStatus, KvCluster, NodeTopology, ObjectMeta, ResourceKey,
};
use kvpilot::store::memory::MemoryResourceStore;
use kvpilot::store::ResourceStore;
use kvpilot::{Ctx, OperatorConfig, OperatorContext};
use tokio::sync::mpsc;

pub struct Harness {
    pub store: Arc<MemoryResourceStore>,
    pub sim: SimNodeClient,
    pub ctx: Ctx,
    pub failover_rx: mpsc::Receiver<FailoverMsg>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let store = Arc::new(MemoryResourceStore::new());
        let sim = SimNodeClient::new();
        let (ctx, failover_rx) =
            OperatorContext::new(store.clone(), Arc::new(sim.clone()), config);
        Self {
            store,
            sim,
            ctx,
            failover_rx,
        }
    }

    pub async fn declare(
        &self,
        name: &str,
        kind: ClusterKind,
        shards: usize,
        replicas: usize,
    ) -> ResourceKey {
        let cluster = KvCluster {
            meta: ObjectMeta::named("default", name),
            spec: ClusterSpec {
                kind,
                shards,
                replicas,
                password: "pw".into(),
                node_config: BTreeMap::new(),
            },
            status: ClusterStatus::default(),
        };
        self.store.create_cluster_if_absent(&cluster).await.unwrap();
        cluster.key()
    }

    /// One platform step plus one reconciliation pass per cluster
    pub async fn sweep(&self) {
        self.store.settle_pods();
        let clusters = self
            .store
            .list_clusters(None, &BTreeMap::new())
            .await
            .unwrap();
        for cluster in clusters {
            let _ = reconcile(&self.ctx, &cluster.key()).await;
        }
    }

    pub async fn converge(&self, sweeps: usize) {
        for _ in 0..sweeps {
            self.sweep().await;
        }
    }

    pub async fn cluster(&self, key: &ResourceKey) -> KvCluster {
        self.store.get_cluster(key).await.unwrap()
    }

    pub async fn edit_spec(&self, key: &ResourceKey, edit: impl FnOnce(&mut ClusterSpec)) {
        let mut cluster = self.cluster(key).await;
        edit(&mut cluster.spec);
        self.store.update_cluster(&cluster).await.unwrap();
    }

    /// Sorted union of every live master's owned slots, from status
    pub fn master_slot_union(cluster: &KvCluster) -> Vec<u16> {
        let mut slots = Vec::new();
        for shard in &cluster.status.topo {
            for node in &shard.topology {
                if node.role == Some(Role::Master) && !node.failover {
                    slots.extend(expand_ranges(&node.slots).unwrap());
                }
            }
        }
        slots.sort_unstable();
        slots
    }

    pub fn shard_master(cluster: &KvCluster, shard: usize) -> &NodeTopology {
        cluster.status.topo[shard]
            .topology
            .iter()
            .find(|n| n.role == Some(Role::Master) && !n.failover)
            .expect("shard has a live master")
    }

    pub fn shard_entries(cluster: &KvCluster, shard: usize) -> &[NodeTopology] {
        &cluster.status.topo[shard].topology
    }

    /// Every node IP recorded in status
    pub fn node_ips(cluster: &KvCluster) -> Vec<String> {
        cluster
            .status
            .topo
            .iter()
            .flat_map(|s| s.topology.iter())
            .map(|n| n.ip.clone())
            .collect()
    }

    /// Sentinel pod IPs for the system a cluster belongs to
    pub async fn sentinel_ips(&self, cluster: &KvCluster) -> Vec<String> {
        let key = ResourceKey::new(cluster.meta.namespace.clone(), cluster.sentinel_name());
        self.store
            .list_set_pods(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.ip)
            .collect()
    }
}

/// The full slot space, for partition assertions
pub fn full_slot_space() -> Vec<u16> {
    (0..kp_core::TOTAL_SLOTS).collect()
}
