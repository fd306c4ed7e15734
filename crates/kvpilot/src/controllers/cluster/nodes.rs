//! Node role, identity and configuration convergence
//!
//! Creating clusters get ordinal 0 of each shard as master, fresh
//! identities, and an even contiguous slot split. Running clusters get
//! drift repair: masterless shards re-anchor on ordinal 0, stray replicas
//! are relinked, identities are reasserted on restarted pods, and roles
//! are reflected onto pod labels. Replication itself follows the published
//! topology message; no per-node replication commands are needed here.

use kp_core::{even_split, Role};
use tracing::{debug, info};

use super::{common, ClusterHandler};
use crate::controllers::ReconcileError;
use crate::failover::{self, FailoverMsg};
use crate::node::{generate_node_id, NODE_PORT};
use crate::resource::ResourceKey;
use crate::store::claim_name;

impl ClusterHandler {
    pub(super) async fn ensure_status(&mut self) -> Result<(), ReconcileError> {
        self.ensure_config().await?;
        if self.cluster.status.topo.is_empty() {
            self.init_cluster().await?;
        } else {
            self.ensure_replication().await?;
        }
        self.ensure_version();
        self.persist_topology().await?;
        Ok(())
    }

    /// Repair config drift on every node, then refresh the stored config
    /// object so the next pass reads the rotated password.
    async fn ensure_config(&mut self) -> Result<(), ReconcileError> {
        for nodes in &self.shard_nodes {
            common::ensure_node_config(&self.ctx, &self.cluster.spec, nodes, &self.password).await?;
        }
        self.password = self.cluster.spec.password.clone();
        let mut config = self.ctx.store.get_config(&self.key).await?;
        let desired = common::config_data(&self.cluster.spec);
        if config.data != desired {
            config.data = desired;
            self.ctx.store.update_config(&config).await?;
        }
        debug!(cluster = %self.key, "node config ready");
        Ok(())
    }

    /// First bootstrap: roles, identities, and the initial slot layout
    async fn init_cluster(&mut self) -> Result<(), ReconcileError> {
        let ranges = even_split(self.cluster.spec.shards);
        for shard in 0..self.shard_nodes.len() {
            if self.shard_nodes[shard].is_empty() {
                continue;
            }
            for index in 0..self.shard_nodes[shard].len() {
                if self.shard_nodes[shard][index].node_id.is_empty() {
                    self.shard_nodes[shard][index].node_id = generate_node_id();
                }
            }
            let master_id = self.shard_nodes[shard][0].node_id.clone();
            for index in 0..self.shard_nodes[shard].len() {
                let node = &mut self.shard_nodes[shard][index];
                if index == 0 {
                    node.role = Some(Role::Master);
                    node.master_id.clear();
                    if node.slots.is_empty() {
                        if let Some(range) = ranges.get(shard) {
                            node.slots = (range.start..=range.end).collect();
                        }
                    }
                } else {
                    node.role = Some(Role::Replica);
                    node.master_id = master_id.clone();
                }
            }
            self.sync_shard_nodes(shard).await?;
        }
        info!(cluster = %self.key, "cluster topology initialized");
        Ok(())
    }

    /// Drift repair for a running cluster
    async fn ensure_replication(&mut self) -> Result<(), ReconcileError> {
        for shard in 0..self.shard_nodes.len() {
            if self.shard_nodes[shard].is_empty() {
                continue;
            }
            let master_index = match self.shard_nodes[shard].iter().position(|n| n.is_master()) {
                Some(index) => index,
                None => {
                    // shard lost its recorded master entirely: re-anchor
                    self.shard_nodes[shard][0].role = Some(Role::Master);
                    self.shard_nodes[shard][0].master_id.clear();
                    0
                }
            };
            for index in 0..self.shard_nodes[shard].len() {
                if self.shard_nodes[shard][index].node_id.is_empty() {
                    self.shard_nodes[shard][index].node_id = generate_node_id();
                }
            }
            let master_id = self.shard_nodes[shard][master_index].node_id.clone();
            for index in 0..self.shard_nodes[shard].len() {
                let node = &mut self.shard_nodes[shard][index];
                if node.node_id != master_id && node.master_id != master_id {
                    node.master_id = master_id.clone();
                    node.role = Some(Role::Replica);
                }
            }
            self.sync_shard_nodes(shard).await?;
        }
        Ok(())
    }

    /// Reassert identity on every node of a shard (covers replaced pods)
    /// and reflect roles onto pod labels.
    async fn sync_shard_nodes(&mut self, shard: usize) -> Result<(), ReconcileError> {
        let set_name = self.cluster.pod_set_name(shard);
        let entries: Vec<(String, String, Option<Role>, usize, bool)> = self.shard_nodes[shard]
            .iter()
            .map(|n| (n.ip.clone(), n.node_id.clone(), n.role, n.pod_index, n.failover))
            .collect();
        for (ip, node_id, role, ordinal, flagged) in entries {
            if flagged {
                continue;
            }
            self.ctx
                .nodes
                .set_cluster_identity(&ip, &self.password, &node_id)
                .await?;
            if let Some(role) = role {
                let pod_key = ResourceKey::new(
                    self.cluster.meta.namespace.clone(),
                    format!("{set_name}-{ordinal}"),
                );
                common::update_pod_role_label(&self.ctx, &pod_key, role).await?;
            }
        }
        Ok(())
    }

    /// Bump the topology version whenever membership, addresses, or roles
    /// differ from the last persisted topology.
    pub(super) fn ensure_version(&mut self) {
        if self.topology_changed() {
            self.version += 1;
        }
    }

    fn topology_changed(&self) -> bool {
        if self.cluster.status.topo.is_empty() {
            return true;
        }
        let live: Vec<(usize, &Vec<crate::node::Node>)> = self
            .shard_nodes
            .iter()
            .enumerate()
            .filter(|(_, nodes)| !nodes.is_empty())
            .collect();
        if live.len() != self.cluster.status.topo.len() {
            return true;
        }
        for ((shard, nodes), shard_topo) in live.iter().zip(self.cluster.status.topo.iter()) {
            if self.cluster.pod_set_name(*shard) != shard_topo.shard_name {
                return true;
            }
            if nodes.len() != shard_topo.topology.len() {
                return true;
            }
            for (node, entry) in nodes.iter().zip(shard_topo.topology.iter()) {
                if node.ip != entry.ip || node.role != entry.role {
                    return true;
                }
            }
        }
        false
    }

    /// Heal nodes flagged for replacement and report newly-dead ones to
    /// the failover pipeline.
    pub(super) async fn ensure_failover(&mut self) -> Result<(), ReconcileError> {
        let mut changed = false;
        for shard in 0..self.shard_nodes.len() {
            for index in 0..self.shard_nodes[shard].len() {
                let (ip, flagged, ordinal) = {
                    let node = &self.shard_nodes[shard][index];
                    (node.ip.clone(), node.failover, node.pod_index)
                };
                if flagged {
                    self.requeue = true;
                    if self.ctx.nodes.ping(&ip, &self.password).await {
                        // it came back on its own; no replacement needed
                        self.shard_nodes[shard][index].failover = false;
                        changed = true;
                        continue;
                    }
                    let pod_name = format!("{}-{}", self.cluster.pod_set_name(shard), ordinal);
                    let namespace = self.cluster.meta.namespace.clone();
                    self.ctx
                        .store
                        .delete_volume_claim_if_exists(&ResourceKey::new(
                            namespace.clone(),
                            claim_name(&pod_name),
                        ))
                        .await?;
                    self.ctx
                        .store
                        .delete_pod_if_exists(&ResourceKey::new(namespace, pod_name.clone()))
                        .await?;
                    self.shard_nodes[shard][index].failover = false;
                    changed = true;
                    info!(pod = %pod_name, "failed node replaced");
                    continue;
                }
                if !self.ctx.nodes.ping(&ip, &self.password).await {
                    self.requeue = true;
                    self.ctx.failover.report(FailoverMsg {
                        ip,
                        port: NODE_PORT,
                        key: self.key.clone(),
                        shard,
                        deadline: failover::deadline(&self.ctx),
                    });
                }
            }
        }
        if changed {
            self.version += 1;
            self.persist_topology().await?;
        }
        Ok(())
    }
}
