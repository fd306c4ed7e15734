//! In-memory resource store
//!
//! Backs tests and the self-contained dev harness with the same
//! compare-and-swap and watch semantics the operator expects from a real
//! platform. `settle_pods` plays the platform's scheduler: it materializes
//! pods for every pod set (honoring reserved ordinals), assigns IPs, and
//! reports readiness.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{
    selector_matches, ConfigObject, Pod, PodSet, ResourceStore, ServiceObject, StoreError,
    VolumeClaim,
};
use crate::resource::{KvCluster, ObjectMeta, ResourceKey};
use async_trait::async_trait;

trait Stored: Clone {
    const KIND: &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_stored {
    ($ty:ty, $kind:literal) => {
        impl Stored for $ty {
            const KIND: &'static str = $kind;
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

impl_stored!(KvCluster, "cluster");
impl_stored!(PodSet, "podset");
impl_stored!(Pod, "pod");
impl_stored!(ConfigObject, "config");
impl_stored!(ServiceObject, "service");
impl_stored!(VolumeClaim, "volumeclaim");

struct Table<T> {
    items: HashMap<ResourceKey, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<T: Stored> Table<T> {
    fn get(&self, key: &ResourceKey) -> Result<T, StoreError> {
        self.items.get(key).cloned().ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        })
    }

    fn create_if_absent(&mut self, obj: &T) -> bool {
        let key = obj.meta().key();
        if self.items.contains_key(&key) {
            return false;
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = 1;
        self.items.insert(key, obj);
        true
    }

    fn cas_update(&mut self, obj: &T) -> Result<T, StoreError> {
        let key = obj.meta().key();
        let current = self.items.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        })?;
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::Conflict { kind: T::KIND, key });
        }
        let mut next = obj.clone();
        next.meta_mut().resource_version += 1;
        self.items.insert(key, next.clone());
        Ok(next)
    }

    fn delete(&mut self, key: &ResourceKey) -> Option<T> {
        self.items.remove(key)
    }

    fn list(&self, namespace: Option<&str>, selector: &BTreeMap<String, String>) -> Vec<T> {
        let mut found: Vec<T> = self
            .items
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.meta().namespace == ns))
            .filter(|o| selector_matches(&o.meta().labels, selector))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.meta().key().cmp(&b.meta().key()));
        found
    }
}

#[derive(Default)]
struct Inner {
    clusters: Table<KvCluster>,
    pod_sets: Table<PodSet>,
    pods: Table<Pod>,
    configs: Table<ConfigObject>,
    services: Table<ServiceObject>,
    claims: Table<VolumeClaim>,
    next_ip: u32,
}

/// In-memory `ResourceStore`
pub struct MemoryResourceStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<ResourceKey>,
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    fn notify(&self, key: ResourceKey) {
        let _ = self.events.send(key);
    }

    /// Mark a cluster for deletion the way a user would: the object stays
    /// visible until the operator removes its finalizers.
    pub fn mark_cluster_deleted(&self, key: &ResourceKey) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write();
            let reap = {
                let cluster = inner.clusters.items.get_mut(key).ok_or(StoreError::NotFound {
                    kind: "cluster",
                    key: key.clone(),
                })?;
                cluster.meta.deletion_timestamp = Some(chrono::Utc::now());
                cluster.meta.resource_version += 1;
                cluster.meta.finalizers.is_empty()
            };
            if reap {
                inner.clusters.delete(key);
            }
        }
        self.notify(key.clone());
        Ok(())
    }

    /// Act as the platform scheduler for one step: create missing pods at
    /// the lowest non-reserved ordinals of every pod set, delete surplus
    /// ones, mark everything ready and refresh ready-replica counts.
    /// Returns the number of pods created.
    pub fn settle_pods(&self) -> usize {
        let mut inner = self.inner.write();
        let sets: Vec<PodSet> = inner.pod_sets.items.values().cloned().collect();
        let mut created = 0;
        for set in sets {
            let mut want = Vec::new();
            let mut ordinal = 0usize;
            while want.len() < set.replicas {
                if !set.reserve_ordinals.contains(&ordinal) {
                    want.push(ordinal);
                }
                ordinal += 1;
            }
            let prefix = format!("{}-", set.meta.name);
            let stale: Vec<ResourceKey> = inner
                .pods
                .items
                .values()
                .filter(|p| {
                    p.meta.namespace == set.meta.namespace
                        && p.meta.name.starts_with(&prefix)
                        && p.ordinal().map_or(true, |o| !want.contains(&o))
                })
                .map(|p| p.meta.key())
                .collect();
            for key in stale {
                inner.pods.delete(&key);
            }
            for ordinal in want {
                let name = format!("{}{}", prefix, ordinal);
                let key = ResourceKey::new(set.meta.namespace.clone(), name.clone());
                if inner.pods.items.contains_key(&key) {
                    continue;
                }
                inner.next_ip += 1;
                let ip = format!("10.244.{}.{}", inner.next_ip / 256, inner.next_ip % 256);
                let mut meta = ObjectMeta::named(&set.meta.namespace, &name);
                meta.labels = set.meta.labels.clone();
                meta.resource_version = 1;
                inner.pods.items.insert(key.clone(), Pod { meta, ip, ready: true });
                // a pod gets a backing volume claim the first time it runs
                let claim = ResourceKey::new(set.meta.namespace.clone(), super::claim_name(&name));
                if !inner.claims.items.contains_key(&claim) {
                    let mut meta = ObjectMeta::named(&set.meta.namespace, &claim.name);
                    meta.labels = set.meta.labels.clone();
                    meta.resource_version = 1;
                    inner.claims.items.insert(claim, VolumeClaim { meta });
                }
                created += 1;
            }
            let ready = inner
                .pods
                .items
                .values()
                .filter(|p| p.meta.namespace == set.meta.namespace && p.meta.name.starts_with(&prefix) && p.ready)
                .count();
            if let Some(stored) = inner.pod_sets.items.get_mut(&set.meta.key()) {
                stored.ready_replicas = ready;
            }
        }
        created
    }

    /// Current IP of a pod, for harnesses that need to reach its node
    pub fn pod_ip(&self, key: &ResourceKey) -> Option<String> {
        self.inner.read().pods.items.get(key).map(|p| p.ip.clone())
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get_cluster(&self, key: &ResourceKey) -> Result<KvCluster, StoreError> {
        self.inner.read().clusters.get(key)
    }

    async fn update_cluster(&self, cluster: &KvCluster) -> Result<KvCluster, StoreError> {
        let (updated, declaration_changed) = {
            let mut inner = self.inner.write();
            // status-only writes do not fire watch events, the same way a
            // platform treats status as a subresource; otherwise every
            // convergence checkpoint would re-trigger its own pass
            let declaration_changed = match inner.clusters.items.get(&cluster.meta.key()) {
                Some(old) => {
                    old.spec != cluster.spec
                        || old.meta.labels != cluster.meta.labels
                        || old.meta.annotations != cluster.meta.annotations
                        || old.meta.finalizers != cluster.meta.finalizers
                        || old.meta.deletion_timestamp != cluster.meta.deletion_timestamp
                }
                None => true,
            };
            let updated = inner.clusters.cas_update(cluster)?;
            // finalizers all gone on a deleting object: the store reaps it
            if updated.meta.deletion_timestamp.is_some() && updated.meta.finalizers.is_empty() {
                inner.clusters.delete(&updated.meta.key());
            }
            (updated, declaration_changed)
        };
        if declaration_changed {
            self.notify(updated.meta.key());
        }
        Ok(updated)
    }

    async fn create_cluster_if_absent(&self, cluster: &KvCluster) -> Result<(), StoreError> {
        if self.inner.write().clusters.create_if_absent(cluster) {
            self.notify(cluster.meta.key());
        }
        Ok(())
    }

    async fn list_clusters(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<KvCluster>, StoreError> {
        Ok(self.inner.read().clusters.list(namespace, selector))
    }

    fn watch_clusters(&self) -> broadcast::Receiver<ResourceKey> {
        self.events.subscribe()
    }

    async fn create_pod_set_if_absent(&self, set: &PodSet) -> Result<(), StoreError> {
        self.inner.write().pod_sets.create_if_absent(set);
        Ok(())
    }

    async fn get_pod_set(&self, key: &ResourceKey) -> Result<PodSet, StoreError> {
        self.inner.read().pod_sets.get(key)
    }

    async fn update_pod_set(&self, set: &PodSet) -> Result<PodSet, StoreError> {
        self.inner.write().pod_sets.cas_update(set)
    }

    async fn delete_pod_set_if_exists(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.pod_sets.delete(key).is_some() {
            let prefix = format!("{}-", key.name);
            let pods: Vec<ResourceKey> = inner
                .pods
                .items
                .values()
                .filter(|p| p.meta.namespace == key.namespace && p.meta.name.starts_with(&prefix))
                .map(|p| p.meta.key())
                .collect();
            for pod in pods {
                inner.pods.delete(&pod);
            }
        }
        Ok(())
    }

    async fn list_pod_sets(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSet>, StoreError> {
        Ok(self.inner.read().pod_sets.list(Some(namespace), selector))
    }

    async fn list_set_pods(&self, key: &ResourceKey) -> Result<Vec<Pod>, StoreError> {
        let prefix = format!("{}-", key.name);
        let mut pods: Vec<Pod> = self
            .inner
            .read()
            .pods
            .items
            .values()
            .filter(|p| p.meta.namespace == key.namespace && p.meta.name.starts_with(&prefix))
            .cloned()
            .collect();
        pods.sort_by_key(|p| p.ordinal());
        Ok(pods)
    }

    async fn get_pod(&self, key: &ResourceKey) -> Result<Pod, StoreError> {
        self.inner.read().pods.get(key)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.inner.write().pods.cas_update(pod)
    }

    async fn delete_pod_if_exists(&self, key: &ResourceKey) -> Result<(), StoreError> {
        self.inner.write().pods.delete(key);
        Ok(())
    }

    async fn create_config_if_absent(&self, config: &ConfigObject) -> Result<(), StoreError> {
        self.inner.write().configs.create_if_absent(config);
        Ok(())
    }

    async fn get_config(&self, key: &ResourceKey) -> Result<ConfigObject, StoreError> {
        self.inner.read().configs.get(key)
    }

    async fn update_config(&self, config: &ConfigObject) -> Result<ConfigObject, StoreError> {
        self.inner.write().configs.cas_update(config)
    }

    async fn create_service_if_absent(&self, service: &ServiceObject) -> Result<(), StoreError> {
        self.inner.write().services.create_if_absent(service);
        Ok(())
    }

    async fn list_volume_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeClaim>, StoreError> {
        Ok(self.inner.read().claims.list(Some(namespace), selector))
    }

    async fn delete_volume_claim_if_exists(&self, key: &ResourceKey) -> Result<(), StoreError> {
        self.inner.write().claims.delete(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ClusterKind, ClusterSpec, ClusterStatus};

    fn demo_cluster() -> KvCluster {
        KvCluster {
            meta: ObjectMeta::named("default", "kv-demo"),
            spec: ClusterSpec {
                kind: ClusterKind::Cluster,
                shards: 2,
                replicas: 2,
                password: "pw".into(),
                node_config: BTreeMap::new(),
            },
            status: ClusterStatus::default(),
        }
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryResourceStore::new();
        store.create_cluster_if_absent(&demo_cluster()).await.unwrap();
        let key = ResourceKey::new("default", "kv-demo");
        let fresh = store.get_cluster(&key).await.unwrap();
        let stored = store.update_cluster(&fresh).await.unwrap();
        assert_eq!(stored.meta.resource_version, fresh.meta.resource_version + 1);
        // the old copy now loses the race
        let err = store.update_cluster(&fresh).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn settle_honors_reserved_ordinals() {
        let store = MemoryResourceStore::new();
        let mut set = PodSet {
            meta: ObjectMeta::named("default", "kv-demo-0"),
            replicas: 3,
            reserve_ordinals: vec![1],
            ready_replicas: 0,
        };
        store.create_pod_set_if_absent(&set).await.unwrap();
        store.settle_pods();
        let pods = store
            .list_set_pods(&ResourceKey::new("default", "kv-demo-0"))
            .await
            .unwrap();
        let ordinals: Vec<usize> = pods.iter().filter_map(|p| p.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 2, 3]);
        // releasing the reservation fills the gap
        set = store.get_pod_set(&ResourceKey::new("default", "kv-demo-0")).await.unwrap();
        set.reserve_ordinals.clear();
        store.update_pod_set(&set).await.unwrap();
        store.settle_pods();
        let pods = store
            .list_set_pods(&ResourceKey::new("default", "kv-demo-0"))
            .await
            .unwrap();
        let ordinals: Vec<usize> = pods.iter().filter_map(|p| p.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}
