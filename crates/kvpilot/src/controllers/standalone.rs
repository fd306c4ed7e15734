//! Standalone handler: one master plus replicas, no slot sharding
//!
//! Replication is driven per node here (unlike the sharded kind, which
//! publishes a topology message): the first ordinal becomes master on
//! creation, everything else replicates from it, and later passes repair
//! drifted master links. Shrink uses the same reserve-ordinal selection
//! as the sharded kind.

use async_trait::async_trait;
use kp_core::Role;
use tracing::{debug, info, warn};

use super::{common, Handler, ReconcileError};
use crate::context::Ctx;
use crate::node::{Node, NODE_PORT};
use crate::resource::{
    ordinal_of, KvCluster, ObjectMeta, Phase, ResourceKey, FINALIZER,
    CHANGE_COUNT_ANNOTATION, MONITORED_BY_LABEL,
};
use crate::store::{ConfigObject, PodSet, ServiceObject};

pub struct StandaloneHandler {
    ctx: Ctx,
    cluster: KvCluster,
    key: ResourceKey,
    password: String,
    nodes: Vec<Node>,
    requeue: bool,
}

impl StandaloneHandler {
    pub fn new(ctx: Ctx, cluster: KvCluster) -> Self {
        let key = cluster.key();
        Self {
            ctx,
            cluster,
            key,
            password: String::new(),
            nodes: Vec::new(),
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
                port: NODE_PORT,
            })
            .await?;
        let config = match self.ctx.store.get_config(&self.key).await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => {
                self.requeue = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.password = config.data.get("password").cloned().unwrap_or_default();

        self.ctx
            .store
            .create_pod_set_if_absent(&PodSet {
                meta,
                replicas: self.cluster.spec.replicas,
                reserve_ordinals: Vec::new(),
                ready_replicas: 0,
            })
            .await?;
        let mut set = self.ctx.store.get_pod_set(&self.key).await?;
        // scale-up applies directly, reusing reserved ordinals first
        if self.cluster.spec.replicas > set.replicas {
            let mut delta = self.cluster.spec.replicas - set.replicas;
            while delta > 0 && !set.reserve_ordinals.is_empty() {
                set.reserve_ordinals.remove(0);
                delta -= 1;
            }
            set.replicas = self.cluster.spec.replicas;
            set = self.ctx.store.update_pod_set(&set).await?;
        }
        if set.ready_replicas != set.replicas {
            info!(cluster = %self.key, "waiting for pod set to become ready");
            self.requeue = true;
            return Ok(());
        }

        for pod in self.ctx.store.list_set_pods(&self.key).await? {
            if pod.meta.deletion_timestamp.is_some() {
                self.requeue = true;
                return Ok(());
            }
            let Some(ordinal) = pod.ordinal() else { continue };
            let role = self.ctx.nodes.node_role(&pod.ip, &self.password).await?;
            self.nodes.push(Node {
                ip: pod.ip.clone(),
                pod_index: ordinal,
                role: Some(role),
                ..Default::default()
            });
        }
        self.nodes.sort_by_key(|n| n.pod_index);
        debug!(cluster = %self.key, nodes = self.nodes.len(), "resources ok");
        Ok(())
    }

    async fn ensure_status(&mut self) -> Result<(), ReconcileError> {
        common::ensure_node_config(&self.ctx, &self.cluster.spec, &self.nodes, &self.password)
            .await?;
        self.password = self.cluster.spec.password.clone();
        let mut config = self.ctx.store.get_config(&self.key).await?;
        let desired = common::config_data(&self.cluster.spec);
        if config.data != desired {
            config.data = desired;
            self.ctx.store.update_config(&config).await?;
        }
        self.ensure_replication().await?;
        if self.requeue {
            return Ok(());
        }
        if self.cluster.meta.add_finalizer(FINALIZER) {
            self.cluster = self.ctx.store.update_cluster(&self.cluster).await?;
        }
        // a replication change is interesting to whoever monitors us
        if let Some(sentinel) = self.cluster.meta.labels.get(MONITORED_BY_LABEL).cloned() {
            self.poke_sentinel(&sentinel).await?;
        }
        Ok(())
    }

    async fn ensure_replication(&mut self) -> Result<(), ReconcileError> {
        if self.cluster.status.phase == Phase::Creating {
            let master_ip = self.nodes.first().map(|n| n.ip.clone()).unwrap_or_default();
            for index in 0..self.nodes.len() {
                if index == 0 {
                    self.ctx.nodes.make_master(&master_ip, &self.password).await?;
                    self.set_role(index, Role::Master).await?;
                } else {
                    self.replicate_from(index, &master_ip).await?;
                }
            }
            self.cluster.status.phase = Phase::Running;
            self.cluster = self.ctx.store.update_cluster(&self.cluster).await?;
            info!(cluster = %self.key, master = %master_ip, "replication established");
            return Ok(());
        }

        let masters: Vec<usize> = (0..self.nodes.len())
            .filter(|i| self.nodes[*i].is_master())
            .collect();
        if masters.is_empty() {
            info!(cluster = %self.key, "no master yet, waiting");
            self.requeue = true;
            return Ok(());
        }
        // several nodes may answer as master (a fresh pod boots that way);
        // the one actually being replicated wins, lowest ordinal breaks ties
        let master_index = if masters.len() == 1 {
            masters[0]
        } else {
            let mut followed: std::collections::HashMap<String, usize> = Default::default();
            for node in &self.nodes {
                if let Some(target) = self.ctx.nodes.get_master(&node.ip, &self.password).await? {
                    *followed.entry(target).or_default() += 1;
                }
            }
            let mut best = masters[0];
            for &candidate in &masters[1..] {
                let score = followed.get(&self.nodes[candidate].ip).copied().unwrap_or(0);
                let best_score = followed.get(&self.nodes[best].ip).copied().unwrap_or(0);
                if score > best_score {
                    best = candidate;
                }
            }
            warn!(
                cluster = %self.key,
                master = %self.nodes[best].ip,
                "multiple nodes answer as master, demoting the rest"
            );
            best
        };
        let master_ip = self.nodes[master_index].ip.clone();
        for index in 0..self.nodes.len() {
            if index == master_index {
                self.set_role(index, Role::Master).await?;
            } else {
                self.replicate_from(index, &master_ip).await?;
            }
        }
        debug!(cluster = %self.key, "replication ok");
        Ok(())
    }

    /// Point one node at the master unless it already follows it
    async fn replicate_from(&mut self, index: usize, master_ip: &str) -> Result<(), ReconcileError> {
        let ip = self.nodes[index].ip.clone();
        let current = self.ctx.nodes.get_master(&ip, &self.password).await?;
        if current.as_deref() != Some(master_ip) {
            self.ctx.nodes.set_replica_of(&ip, master_ip, &self.password).await?;
        }
        self.set_role(index, Role::Replica).await
    }

    async fn set_role(&mut self, index: usize, role: Role) -> Result<(), ReconcileError> {
        self.nodes[index].role = Some(role);
        let pod_key = ResourceKey::new(
            self.cluster.meta.namespace.clone(),
            format!("{}-{}", self.cluster.meta.name, self.nodes[index].pod_index),
        );
        common::update_pod_role_label(&self.ctx, &pod_key, role).await
    }

    /// Bump the sentinel's change-count annotation so it reconciles soon
    async fn poke_sentinel(&mut self, sentinel_name: &str) -> Result<(), ReconcileError> {
        let key = ResourceKey::new(self.cluster.meta.namespace.clone(), sentinel_name.to_string());
        let mut sentinel = match self.ctx.store.get_cluster(&key).await {
            Ok(sentinel) => sentinel,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let count: u64 = sentinel
            .meta
            .annotations
            .get(CHANGE_COUNT_ANNOTATION)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        sentinel
            .meta
            .annotations
            .insert(CHANGE_COUNT_ANNOTATION.to_string(), (count + 1).to_string());
        self.ctx.store.update_cluster(&sentinel).await?;
        Ok(())
    }

    /// Scale-down: retire surplus replicas, reserving the gaps below the
    /// master's ordinal
    async fn resize(&mut self) -> Result<(), ReconcileError> {
        if self.nodes.len() <= self.cluster.spec.replicas {
            return Ok(());
        }
        let reserve = common::reserve_ordinals(&mut self.nodes, self.cluster.spec.replicas);
        let mut set = self.ctx.store.get_pod_set(&self.key).await?;
        set.replicas = self.cluster.spec.replicas;
        for ordinal in reserve {
            if !set.reserve_ordinals.contains(&ordinal) {
                set.reserve_ordinals.push(ordinal);
            }
        }
        info!(
            cluster = %self.key,
            to = self.cluster.spec.replicas,
            reserve = ?set.reserve_ordinals,
            "scaling down"
        );
        self.ctx.store.update_pod_set(&set).await?;
        self.requeue = true;
        Ok(())
    }

    async fn clean_volume_claims(&mut self) -> Result<(), ReconcileError> {
        let claims = self
            .ctx
            .store
            .list_volume_claims(&self.cluster.meta.namespace, &self.cluster.selector_labels())
            .await?;
        for claim in claims {
            let Some(ordinal) = ordinal_of(&claim.meta.name) else { continue };
            if !self.nodes.iter().any(|n| n.pod_index == ordinal) {
                self.ctx
                    .store
                    .delete_volume_claim_if_exists(&claim.meta.key())
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for StandaloneHandler {
    async fn handle(&mut self) -> Result<(), ReconcileError> {
        self.ensure_resources().await?;
        if self.requeue {
            return Ok(());
        }
        self.ensure_status().await?;
        if self.requeue {
            return Ok(());
        }
        self.resize().await?;
        if self.requeue {
            return Ok(());
        }
        self.clean_volume_claims().await
    }

    async fn finalize(&mut self) -> Result<(), ReconcileError> {
        if !self.cluster.meta.labels.contains_key(MONITORED_BY_LABEL) {
            return Ok(());
        }
        self.requeue = common::remove_monitor(&self.ctx, &self.cluster, None).await?;
        if !self.requeue {
            info!(cluster = %self.key, "sentinel monitor cleaned up");
        }
        Ok(())
    }

    fn requeue(&self) -> bool {
        self.requeue
    }
}
