//! Declared cluster resource and its persisted status
//!
//! A `KvCluster` is the single declarative object users manage: the spec says
//! what they want (kind, shard count, replicas, config), the status is the
//! operator's durable record of convergence (lifecycle phase, topology
//! version, per-shard topology descriptors, in-flight rebalance/shrink
//! state). The status must round-trip losslessly across reconciliation
//! passes; the working model is rebuilt from it every pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kp_core::{NodeId, Role};
use serde::{Deserialize, Serialize};

/// Finalizer the operator installs on managed clusters
pub const FINALIZER: &str = "kvpilot/finalizer";

/// Label carrying a pod's current replication role
pub const ROLE_LABEL: &str = "kvpilot/role";
/// Label selecting every object belonging to one cluster
pub const CLUSTER_LABEL: &str = "kvpilot/cluster";
/// Label naming the system a cluster belongs to
pub const SYSTEM_LABEL: &str = "kvpilot/system";
/// Label marking sentinel-kind clusters
pub const SENTINEL_LABEL: &str = "kvpilot/sentinel";
/// Label pointing a data cluster at the sentinel fleet monitoring it
pub const MONITORED_BY_LABEL: &str = "kvpilot/monitored-by";
/// Annotation counter poked to nudge a sentinel reconciliation
pub const CHANGE_COUNT_ANNOTATION: &str = "kvpilot/change-count";

/// Namespaced resource identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Common metadata carried by every stored object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Optimistic-concurrency token, bumped by the store on every update
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

/// Deployment shape of a declared cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    /// One master with replicas, no slot sharding
    Standalone,
    /// A monitor fleet watching other clusters
    Sentinel,
    /// Sharded cluster owning the full slot space
    Cluster,
}

/// Desired state, immutable within one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub kind: ClusterKind,
    /// Number of shards (masters); ignored for standalone/sentinel kinds
    #[serde(default)]
    pub shards: usize,
    /// Members per shard, master included
    pub replicas: usize,
    pub password: String,
    /// Per-node configuration applied verbatim through the node protocol
    #[serde(default)]
    pub node_config: BTreeMap<String, String>,
}

/// Lifecycle phase of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    None,
    Creating,
    Running,
    Failed,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::None
    }
}

/// Pending outbound slot transfer recorded on a master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateRecord {
    pub dst_node: NodeId,
    pub slots: Vec<String>,
}

/// Pending inbound slot transfer recorded on a master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub src_node: NodeId,
    pub slots: Vec<String>,
}

/// Persisted view of one node within a shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTopology {
    pub pod: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub master_id: NodeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrate: Vec<MigrateRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import: Vec<ImportRecord>,
    #[serde(default)]
    pub failover: bool,
}

/// Persisted topology of one shard's pod set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardTopology {
    pub shard_name: String,
    pub topology: Vec<NodeTopology>,
}

/// In-flight shrink bookkeeping: shards being removed outright plus
/// per-pod-set ordinal reservations for partial replica scale-down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShrinkState {
    #[serde(default)]
    pub shards: Vec<usize>,
    #[serde(default)]
    pub reserve: BTreeMap<String, Vec<usize>>,
}

/// Observed state, the sole durable record of convergence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Monotonic topology version agreed with every node
    #[serde(default)]
    pub version: u64,
    /// True while a rebalance/migration sequence is in flight
    #[serde(default)]
    pub rebalance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink: Option<ShrinkState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topo: Vec<ShardTopology>,
}

/// The declared cluster object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCluster {
    pub meta: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl KvCluster {
    pub fn key(&self) -> ResourceKey {
        self.meta.key()
    }

    pub fn is_deleting(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    /// Cluster names follow `<system>-<name>`; the system id groups every
    /// cluster sharing one sentinel fleet.
    pub fn parse_name(&self) -> (&str, &str) {
        match self.meta.name.split_once('-') {
            Some((system, short)) => (system, short),
            None => (self.meta.name.as_str(), self.meta.name.as_str()),
        }
    }

    /// Name of the sentinel cluster responsible for this system
    pub fn sentinel_name(&self) -> String {
        let (system, _) = self.parse_name();
        format!("sentinel-{system}")
    }

    /// Monitored-master name for one shard, as registered on sentinels
    pub fn master_name(&self, shard: Option<usize>) -> String {
        let (_, short) = self.parse_name();
        match shard {
            Some(index) => format!("{short}-{index}"),
            None => short.to_string(),
        }
    }

    /// Pod set name for one shard
    pub fn pod_set_name(&self, shard: usize) -> String {
        format!("{}-{}", self.meta.name, shard)
    }

    pub fn pod_set_key(&self, shard: usize) -> ResourceKey {
        ResourceKey::new(self.meta.namespace.clone(), self.pod_set_name(shard))
    }

    /// Labels selecting every object owned by this cluster
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let (system, _) = self.parse_name();
        BTreeMap::from([
            (CLUSTER_LABEL.to_string(), self.meta.name.clone()),
            (SYSTEM_LABEL.to_string(), system.to_string()),
        ])
    }

    /// Reject declarations the operator cannot act on. A failed validation
    /// is terminal: the cluster is marked `Failed` and never retried.
    pub fn validate(&self) -> Result<(), String> {
        if self.spec.password.is_empty() {
            return Err("password must be set".into());
        }
        if self.spec.replicas == 0 {
            return Err("replicas must be greater than zero".into());
        }
        match self.spec.kind {
            ClusterKind::Sentinel => {
                if self.spec.replicas < 3 || self.spec.replicas % 2 == 0 {
                    return Err("sentinel replicas must be odd and at least 3".into());
                }
            }
            ClusterKind::Cluster => {
                if self.spec.shards == 0 {
                    return Err("cluster kind requires at least one shard".into());
                }
            }
            ClusterKind::Standalone => {}
        }
        Ok(())
    }
}

/// Labels marking sentinel-kind clusters, used by the failover producer scan
pub fn sentinel_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(SENTINEL_LABEL.to_string(), "true".to_string())])
}

/// Labels tying a monitored cluster to its sentinel fleet
pub fn monitor_labels(sentinel_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(MONITORED_BY_LABEL.to_string(), sentinel_name.to_string())])
}

/// Ordinal suffix of a pod or volume-claim name (`demo-0-2` -> 2)
pub fn ordinal_of(name: &str) -> Option<usize> {
    name.rsplit_once('-')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(kind: ClusterKind, shards: usize, replicas: usize, password: &str) -> KvCluster {
        KvCluster {
            meta: ObjectMeta::named("default", "kv-demo"),
            spec: ClusterSpec {
                kind,
                shards,
                replicas,
                password: password.to_string(),
                node_config: BTreeMap::new(),
            },
            status: ClusterStatus::default(),
        }
    }

    #[test]
    fn validation_rejects_bad_declarations() {
        assert!(cluster(ClusterKind::Cluster, 3, 2, "").validate().is_err());
        assert!(cluster(ClusterKind::Cluster, 0, 2, "pw").validate().is_err());
        assert!(cluster(ClusterKind::Sentinel, 0, 4, "pw").validate().is_err());
        assert!(cluster(ClusterKind::Sentinel, 0, 1, "pw").validate().is_err());
        assert!(cluster(ClusterKind::Sentinel, 0, 3, "pw").validate().is_ok());
        assert!(cluster(ClusterKind::Cluster, 3, 2, "pw").validate().is_ok());
    }

    #[test]
    fn names_derive_from_system_prefix() {
        let c = cluster(ClusterKind::Cluster, 3, 2, "pw");
        assert_eq!(c.sentinel_name(), "sentinel-kv");
        assert_eq!(c.master_name(Some(1)), "demo-1");
        assert_eq!(c.master_name(None), "demo");
        assert_eq!(c.pod_set_name(2), "kv-demo-2");
        assert_eq!(ordinal_of("kv-demo-2-11"), Some(11));
    }

    #[test]
    fn status_round_trips_through_json() {
        let mut c = cluster(ClusterKind::Cluster, 2, 2, "pw");
        c.status.version = 7;
        c.status.rebalance = true;
        c.status.topo = vec![ShardTopology {
            shard_name: "kv-demo-0".into(),
            topology: vec![NodeTopology {
                pod: "kv-demo-0-0".into(),
                role: Some(Role::Master),
                node_id: "a".repeat(40),
                ip: "10.0.0.1".into(),
                port: 6379,
                slots: vec!["0-8191".into()],
                migrate: vec![MigrateRecord {
                    dst_node: "b".repeat(40),
                    slots: vec!["100-200".into()],
                }],
                ..Default::default()
            }],
        }];
        let json = serde_json::to_string(&c).unwrap();
        let back: KvCluster = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status.version, 7);
        assert!(back.status.rebalance);
        assert_eq!(back.status.topo[0].topology[0].slots, vec!["0-8191"]);
        assert_eq!(back.status.topo[0].topology[0].migrate[0].slots, vec!["100-200"]);
    }
}
