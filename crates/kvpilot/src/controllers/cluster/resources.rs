//! State builder
//!
//! Rebuilds the working model each pass from two sources: live pod
//! membership/readiness from the resource store, and per-shard persisted
//! topology from status. Requeues (never errors) while any pod set is not
//! fully ready, a pod is terminating, or the cluster object was updated
//! concurrently; downstream steps must not run against a half-built model.

use kp_core::expand_ranges;
use tracing::{debug, info};

use super::{common, ClusterHandler};
use crate::controllers::ReconcileError;
use crate::node::{ImportIn, MigrateOut, Node, NODE_PORT};
use crate::resource::{ordinal_of, ObjectMeta};
use crate::store::{ConfigObject, PodSet, ServiceObject};

impl ClusterHandler {
    pub(super) async fn ensure_resources(&mut self) -> Result<(), ReconcileError> {
        let namespace = self.cluster.meta.namespace.clone();
        let labels = {
            let mut labels = self.cluster.selector_labels();
            labels.extend(self.cluster.meta.labels.clone());
            labels
        };

        // ambient objects first: config, service, one pod set per shard
        let mut config_meta = ObjectMeta::named(&namespace, &self.cluster.meta.name);
        config_meta.labels = labels.clone();
        self.ctx
            .store
            .create_config_if_absent(&ConfigObject {
                meta: config_meta.clone(),
                data: common::config_data(&self.cluster.spec),
            })
            .await?;
        self.ctx
            .store
            .create_service_if_absent(&ServiceObject {
                meta: config_meta.clone(),
                port: NODE_PORT,
            })
            .await?;

        // the stored config carries the password nodes actually run with
        let config = match self.ctx.store.get_config(&self.key).await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => {
                self.requeue = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.password = config.data.get("password").cloned().unwrap_or_default();

        for shard in 0..self.cluster.spec.shards {
            let mut meta = ObjectMeta::named(&namespace, &self.cluster.pod_set_name(shard));
            meta.labels = labels.clone();
            self.ctx
                .store
                .create_pod_set_if_absent(&PodSet {
                    meta,
                    replicas: self.cluster.spec.replicas,
                    reserve_ordinals: Vec::new(),
                    ready_replicas: 0,
                })
                .await?;
        }
        let sets = self
            .ctx
            .store
            .list_pod_sets(&namespace, &self.cluster.selector_labels())
            .await?;
        if sets.len() < self.cluster.spec.shards {
            self.requeue = true;
            return Ok(());
        }

        // replica scale-up happens right here, reusing reserved ordinals
        // first; scale-down goes through the shrink path instead
        for shard in 0..sets.len() {
            let key = self.cluster.pod_set_key(shard);
            let mut set = self.ctx.store.get_pod_set(&key).await?;
            if self.cluster.spec.replicas > set.replicas {
                let mut delta = self.cluster.spec.replicas - set.replicas;
                while delta > 0 && !set.reserve_ordinals.is_empty() {
                    set.reserve_ordinals.remove(0);
                    delta -= 1;
                }
                set.replicas = self.cluster.spec.replicas;
                self.ctx.store.update_pod_set(&set).await?;
            }
        }

        // readiness gate, then the bare working model from pods
        self.shard_nodes = vec![Vec::new(); sets.len()];
        for shard in 0..sets.len() {
            let key = self.cluster.pod_set_key(shard);
            let set = self.ctx.store.get_pod_set(&key).await?;
            if set.ready_replicas != set.replicas {
                info!(pod_set = %key, "waiting for pod set to become ready");
                self.requeue = true;
                return Ok(());
            }
            let pods = self.ctx.store.list_set_pods(&key).await?;
            for pod in pods {
                if pod.meta.deletion_timestamp.is_some() {
                    info!(pod = %pod.meta.name, "pod is terminating, waiting");
                    self.requeue = true;
                    return Ok(());
                }
                let Some(ordinal) = pod.ordinal() else {
                    continue;
                };
                self.shard_nodes[shard].push(Node {
                    ip: pod.ip.clone(),
                    pod_index: ordinal,
                    ..Default::default()
                });
            }
            self.shard_nodes[shard].sort_by_key(|n| n.pod_index);
        }

        // a concurrent status write means our copy is stale; start over
        let fresh = self.ctx.store.get_cluster(&self.key).await?;
        if fresh.meta.resource_version != self.cluster.meta.resource_version {
            debug!(cluster = %self.key, "cluster updated concurrently, requeueing");
            self.requeue = true;
            return Ok(());
        }

        // overlay persisted topology onto the live pods
        let topo = self.cluster.status.topo.clone();
        for shard_topo in &topo {
            let Some(shard) = ordinal_of(&shard_topo.shard_name) else {
                continue;
            };
            let Some(nodes) = self.shard_nodes.get_mut(shard) else {
                continue;
            };
            for entry in &shard_topo.topology {
                let Some(node) = nodes
                    .iter_mut()
                    .find(|n| format!("{}-{}", shard_topo.shard_name, n.pod_index) == entry.pod)
                else {
                    continue;
                };
                node.node_id = entry.node_id.clone();
                node.role = entry.role;
                node.master_id = entry.master_id.clone();
                node.slots = expand_ranges(&entry.slots)?;
                node.failover = entry.failover;
                node.migrate = entry
                    .migrate
                    .iter()
                    .map(|m| {
                        Ok(MigrateOut {
                            dst_node: m.dst_node.clone(),
                            slots: expand_ranges(&m.slots)?,
                        })
                    })
                    .collect::<Result<_, ReconcileError>>()?;
                node.import = entry
                    .import
                    .iter()
                    .map(|i| {
                        Ok(ImportIn {
                            src_node: i.src_node.clone(),
                            slots: expand_ranges(&i.slots)?,
                        })
                    })
                    .collect::<Result<_, ReconcileError>>()?;
            }
        }
        self.version = self.cluster.status.version;
        debug!(cluster = %self.key, shards = self.shard_nodes.len(), "resources ok");
        Ok(())
    }
}
