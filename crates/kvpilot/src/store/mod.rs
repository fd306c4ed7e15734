//! Resource platform capability
//!
//! The operator never talks to the hosting platform directly; everything it
//! needs (pods, pod sets, config objects, services, volume claims, and the
//! declared cluster objects themselves) goes through the `ResourceStore`
//! trait. Create operations are idempotent, updates are compare-and-swap on
//! the object's resource version, and the error taxonomy drives the
//! orchestrator's retry decisions.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::resource::{KvCluster, ObjectMeta, ResourceKey};

/// Store failure classes; `is_retryable`/`is_terminal` encode the
/// orchestrator's requeue policy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ResourceKey },
    #[error("conflict updating {kind} {key}: stale resource version")]
    Conflict { kind: &'static str, key: ResourceKey },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store failure: {0}")]
    Internal(String),
}

impl StoreError {
    /// Not-found and stale-version failures clear up on their own; the pass
    /// is requeued rather than surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::NotFound { .. } | StoreError::Conflict { .. })
    }

    /// Forbidden/invalid failures never succeed on retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreError::Forbidden(_) | StoreError::Invalid(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// One running process of the managed key-value service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    pub ip: String,
    pub ready: bool,
}

impl Pod {
    /// Ordinal index within the owning pod set
    pub fn ordinal(&self) -> Option<usize> {
        crate::resource::ordinal_of(&self.meta.name)
    }
}

/// Stateful replica set: an ordered set of pods with stable ordinals.
/// `reserve_ordinals` names ordinals the set skips when creating pods,
/// which is what makes gap-preserving shrink possible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSet {
    pub meta: ObjectMeta,
    pub replicas: usize,
    #[serde(default)]
    pub reserve_ordinals: Vec<usize>,
    #[serde(default)]
    pub ready_replicas: usize,
}

/// Cluster-scoped configuration document (generated password included)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigObject {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Stable network entry point for a cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceObject {
    pub meta: ObjectMeta,
    pub port: u16,
}

/// Persistent volume claim backing one pod's data directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub meta: ObjectMeta,
}

/// Name of the claim backing a pod
pub fn claim_name(pod_name: &str) -> String {
    format!("data-{pod_name}")
}

/// Declarative resource platform operations consumed by the operator
#[async_trait]
pub trait ResourceStore: Send + Sync {
    // declared clusters
    async fn get_cluster(&self, key: &ResourceKey) -> Result<KvCluster, StoreError>;
    /// CAS update; returns the stored object with its new resource version
    async fn update_cluster(&self, cluster: &KvCluster) -> Result<KvCluster, StoreError>;
    async fn create_cluster_if_absent(&self, cluster: &KvCluster) -> Result<(), StoreError>;
    async fn list_clusters(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<KvCluster>, StoreError>;
    /// Fires the cluster's key on every create/update/delete
    fn watch_clusters(&self) -> broadcast::Receiver<ResourceKey>;

    // pod sets
    async fn create_pod_set_if_absent(&self, set: &PodSet) -> Result<(), StoreError>;
    async fn get_pod_set(&self, key: &ResourceKey) -> Result<PodSet, StoreError>;
    async fn update_pod_set(&self, set: &PodSet) -> Result<PodSet, StoreError>;
    async fn delete_pod_set_if_exists(&self, key: &ResourceKey) -> Result<(), StoreError>;
    async fn list_pod_sets(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSet>, StoreError>;
    /// Pods belonging to one pod set, ordered by ordinal
    async fn list_set_pods(&self, key: &ResourceKey) -> Result<Vec<Pod>, StoreError>;

    // pods
    async fn get_pod(&self, key: &ResourceKey) -> Result<Pod, StoreError>;
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
    async fn delete_pod_if_exists(&self, key: &ResourceKey) -> Result<(), StoreError>;

    // config and services
    async fn create_config_if_absent(&self, config: &ConfigObject) -> Result<(), StoreError>;
    async fn get_config(&self, key: &ResourceKey) -> Result<ConfigObject, StoreError>;
    async fn update_config(&self, config: &ConfigObject) -> Result<ConfigObject, StoreError>;
    async fn create_service_if_absent(&self, service: &ServiceObject) -> Result<(), StoreError>;

    // volume claims
    async fn list_volume_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeClaim>, StoreError>;
    async fn delete_volume_claim_if_exists(&self, key: &ResourceKey) -> Result<(), StoreError>;
}

/// True when `labels` carries every entry of `selector`
pub fn selector_matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
