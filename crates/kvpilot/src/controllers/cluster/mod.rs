//! Sharded-cluster handler
//!
//! The core reconciliation pipeline: rebuild the working model from pods
//! and persisted status, heal or report failed nodes, converge roles and
//! node config, plan and execute slot rebalancing, shrink or expand pod
//! sets, keep sentinel monitors registered, and publish the agreed
//! topology to every node.

mod nodes;
mod rebalance;
mod resources;
mod scale;

use async_trait::async_trait;
use kp_core::{encode_ranges, NodeId};
use tracing::info;

use super::{common, Handler, ReconcileError};
use crate::context::Ctx;
use crate::node::{Node, NODE_PORT};
use crate::resource::{
    ImportRecord, KvCluster, MigrateRecord, NodeTopology, ResourceKey, ShardTopology, FINALIZER,
};

pub struct ClusterHandler {
    ctx: Ctx,
    cluster: KvCluster,
    key: ResourceKey,
    password: String,
    /// Working model, one ordinal-ordered node list per pod set; an empty
    /// list marks a shard being torn down
    shard_nodes: Vec<Vec<Node>>,
    version: u64,
    requeue: bool,
}

impl ClusterHandler {
    pub fn new(ctx: Ctx, cluster: KvCluster) -> Self {
        let key = cluster.key();
        Self {
            ctx,
            cluster,
            key,
            password: String::new(),
            shard_nodes: Vec::new(),
            version: 0,
            requeue: false,
        }
    }

    /// Serialize the working model into persisted status and write it.
    /// This is the checkpoint every multi-step operation relies on.
    pub(super) async fn persist_topology(&mut self) -> Result<(), ReconcileError> {
        let mut topo = Vec::new();
        for (shard, nodes) in self.shard_nodes.iter().enumerate() {
            if nodes.is_empty() {
                continue;
            }
            let shard_name = self.cluster.pod_set_name(shard);
            let topology = nodes
                .iter()
                .map(|node| NodeTopology {
                    pod: format!("{}-{}", shard_name, node.pod_index),
                    role: node.role,
                    node_id: node.node_id.clone(),
                    ip: node.ip.clone(),
                    port: NODE_PORT,
                    slots: encode_ranges(&node.slots),
                    master_id: node.master_id.clone(),
                    migrate: node
                        .migrate
                        .iter()
                        .map(|m| MigrateRecord {
                            dst_node: m.dst_node.clone(),
                            slots: encode_ranges(&m.slots),
                        })
                        .collect(),
                    import: node
                        .import
                        .iter()
                        .map(|i| ImportRecord {
                            src_node: i.src_node.clone(),
                            slots: encode_ranges(&i.slots),
                        })
                        .collect(),
                    failover: node.failover,
                })
                .collect();
            topo.push(ShardTopology { shard_name, topology });
        }
        self.cluster.status.topo = topo;
        self.cluster.status.version = self.version;
        self.cluster = self.ctx.store.update_cluster(&self.cluster).await?;
        Ok(())
    }

    /// Locate a node in the working model by cluster identity
    fn find_node(&self, node_id: &NodeId) -> Option<(usize, usize)> {
        for (shard, nodes) in self.shard_nodes.iter().enumerate() {
            if let Some(index) = nodes.iter().position(|n| &n.node_id == node_id) {
                return Some((shard, index));
            }
        }
        None
    }

    /// Masters in shard-declaration order
    fn master_positions(&self) -> Vec<(usize, usize)> {
        let mut positions = Vec::new();
        for (shard, nodes) in self.shard_nodes.iter().enumerate() {
            for (index, node) in nodes.iter().enumerate() {
                if node.is_master() {
                    positions.push((shard, index));
                }
            }
        }
        positions
    }

    /// Register every shard master with the sentinel fleet and pin the
    /// finalizer once the cluster is being monitored.
    async fn ensure_monitors(&mut self) -> Result<(), ReconcileError> {
        if self.cluster.status.shrink.is_some() {
            return Ok(());
        }
        for shard in 0..self.shard_nodes.len() {
            let Some(master_ip) = self.shard_nodes[shard]
                .iter()
                .find(|n| n.is_master() && !n.failover)
                .map(|n| n.ip.clone())
            else {
                continue;
            };
            if common::ensure_monitors(&self.ctx, &self.cluster, &master_ip, Some(shard)).await? {
                self.requeue = true;
                return Ok(());
            }
        }
        if self.cluster.meta.add_finalizer(FINALIZER) {
            self.cluster = self.ctx.store.update_cluster(&self.cluster).await?;
        }
        info!(cluster = %self.key, "sentinel monitors ready");
        Ok(())
    }
}

#[async_trait]
impl Handler for ClusterHandler {
    async fn handle(&mut self) -> Result<(), ReconcileError> {
        if self.cluster.status.shrink.is_some() {
            self.apply_shrink().await?;
            if self.requeue {
                return Ok(());
            }
        }
        self.ensure_resources().await?;
        if self.requeue {
            return Ok(());
        }
        self.ensure_failover().await?;
        if self.requeue {
            return Ok(());
        }
        self.ensure_status().await?;
        if self.requeue {
            return Ok(());
        }
        self.rebalance().await?;
        if self.requeue {
            return Ok(());
        }
        self.ensure_shrink().await?;
        if self.requeue {
            return Ok(());
        }
        self.ensure_monitors().await?;
        if self.requeue {
            return Ok(());
        }
        self.clean_volume_claims().await?;
        common::publish_topology(&self.ctx, &mut self.cluster, &self.password).await?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), ReconcileError> {
        for shard in 0..self.cluster.spec.shards {
            if common::remove_monitor(&self.ctx, &self.cluster, Some(shard)).await? {
                self.requeue = true;
                return Ok(());
            }
        }
        info!(cluster = %self.key, "sentinel monitors cleaned up");
        Ok(())
    }

    fn requeue(&self) -> bool {
        self.requeue
    }
}
