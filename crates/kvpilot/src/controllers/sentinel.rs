//! Sentinel handler: the monitor fleet watching other clusters
//!
//! Keeps the fleet's own pods running, then sweeps every cluster labelled
//! as monitored by this fleet and re-asserts its monitor registrations.
//! Clusters that are not Running yet are skipped, not waited for: they
//! register their own monitors once they converge, and the sweep here
//! only repairs drift afterwards (a restarted sentinel pod, a master
//! moved while the fleet was down).

use async_trait::async_trait;
use tracing::{debug, info};

use super::{common, Handler, ReconcileError};
use crate::context::Ctx;
use crate::resource::{
    monitor_labels, ClusterKind, KvCluster, ObjectMeta, Phase, ResourceKey,
};
use crate::store::{ConfigObject, Pod, PodSet, ServiceObject};

pub struct SentinelHandler {
    ctx: Ctx,
    cluster: KvCluster,
    key: ResourceKey,
    pods: Vec<Pod>,
    requeue: bool,
}

impl SentinelHandler {
    pub fn new(ctx: Ctx, cluster: KvCluster) -> Self {
        let key = cluster.key();
        Self {
            ctx,
            cluster,
            key,
            pods: Vec::new(),
            requeue: false,
        }
    }

    async fn ensure_resources(&mut self) -> Result<(), ReconcileError> {
        let labels = {
            let mut labels = self.cluster.selector_labels();
            labels.extend(self.cluster.meta.labels.clone());
            labels
        };
        let mut meta = ObjectMeta::named(&self.cluster.meta.namespace, &self.cluster.meta.name);
        meta.labels = labels;

        self.ctx
            .store
            .create_config_if_absent(&ConfigObject {
                meta: meta.clone(),
                data: common::config_data(&self.cluster.spec),
            })
            .await?;
        self.ctx
            .store
            .create_service_if_absent(&ServiceObject {
                meta: meta.clone(),
                port: crate::node::SENTINEL_PORT,
            })
            .await?;
        self.ctx
            .store
            .create_pod_set_if_absent(&PodSet {
                meta,
                replicas: self.cluster.spec.replicas,
                reserve_ordinals: Vec::new(),
                ready_replicas: 0,
            })
            .await?;
        let set = self.ctx.store.get_pod_set(&self.key).await?;
        if set.ready_replicas != set.replicas {
            info!(cluster = %self.key, "waiting for sentinel pods");
            self.requeue = true;
            return Ok(());
        }
        self.pods = self.ctx.store.list_set_pods(&self.key).await?;
        debug!(cluster = %self.key, pods = self.pods.len(), "resources ok");
        Ok(())
    }

    /// Re-assert monitors for every Running cluster this fleet watches
    async fn ensure_monitors(&mut self) -> Result<(), ReconcileError> {
        let monitored = self
            .ctx
            .store
            .list_clusters(
                Some(&self.cluster.meta.namespace),
                &monitor_labels(&self.cluster.meta.name),
            )
            .await?;
        for cluster in monitored {
            if cluster.status.phase != Phase::Running {
                continue;
            }
            match cluster.spec.kind {
                ClusterKind::Standalone => {
                    let Some(master_ip) = self.find_master(&cluster.key(), &cluster.spec.password).await? else {
                        continue;
                    };
                    self.assert_monitor(&cluster, &master_ip, cluster.master_name(None)).await?;
                }
                ClusterKind::Cluster => {
                    for shard in 0..cluster.spec.shards {
                        let Some(master_ip) = self
                            .find_master(&cluster.pod_set_key(shard), &cluster.spec.password)
                            .await?
                        else {
                            continue;
                        };
                        self.assert_monitor(&cluster, &master_ip, cluster.master_name(Some(shard)))
                            .await?;
                    }
                }
                ClusterKind::Sentinel => {}
            }
        }
        debug!(cluster = %self.key, "monitors ok");
        Ok(())
    }

    /// First pod of the set answering as master, if any
    async fn find_master(
        &self,
        set_key: &ResourceKey,
        password: &str,
    ) -> Result<Option<String>, ReconcileError> {
        for pod in self.ctx.store.list_set_pods(set_key).await? {
            if !self.ctx.nodes.ping(&pod.ip, password).await {
                continue;
            }
            if self.ctx.nodes.node_role(&pod.ip, password).await?.is_master() {
                return Ok(Some(pod.ip));
            }
        }
        Ok(None)
    }

    async fn assert_monitor(
        &self,
        monitored: &KvCluster,
        master_ip: &str,
        master_name: String,
    ) -> Result<(), ReconcileError> {
        let password = &self.cluster.spec.password;
        for pod in &self.pods {
            let registered = self
                .ctx
                .nodes
                .monitored_master(&pod.ip, password, &master_name)
                .await?;
            if registered.as_deref() != Some(master_ip) {
                let _ = self
                    .ctx
                    .nodes
                    .deregister_monitor(&pod.ip, password, &master_name)
                    .await;
                self.ctx
                    .nodes
                    .register_monitor(
                        &pod.ip,
                        password,
                        &master_name,
                        master_ip,
                        &monitored.spec.password,
                    )
                    .await?;
                info!(master = %master_name, ip = %master_ip, "monitor registered");
            }
        }
        Ok(())
    }

}

#[async_trait]
impl Handler for SentinelHandler {
    async fn handle(&mut self) -> Result<(), ReconcileError> {
        self.ensure_resources().await?;
        if self.requeue {
            return Ok(());
        }
        self.ensure_monitors().await?;
        if self.requeue {
            return Ok(());
        }
        if self.cluster.status.phase != Phase::Running {
            self.cluster.status.phase = Phase::Running;
            self.cluster = self.ctx.store.update_cluster(&self.cluster).await?;
            info!(cluster = %self.key, "sentinel fleet running");
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), ReconcileError> {
        Ok(())
    }

    fn requeue(&self) -> bool {
        self.requeue
    }
}
