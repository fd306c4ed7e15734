//! Shrink/expand of the underlying pod sets
//!
//! Shrinking happens in two passes. This pass records what is going away:
//! whole shards beyond the declared count (their monitors torn down
//! first), and surplus replica ordinals per surviving shard, reserved so
//! the pod set keeps its gaps. The next pass (`apply_shrink`, run before
//! anything else) deletes the surplus pod sets, resizes the survivors,
//! and clears the descriptor. Expansion needs no descriptor: the state
//! builder raises replica counts directly. Shrink and rebalance are
//! mutually exclusive.

use std::collections::BTreeMap;

use tracing::info;

use super::{common, ClusterHandler};
use crate::controllers::ReconcileError;
use crate::resource::{ordinal_of, ResourceKey, ShrinkState};

impl ClusterHandler {
    /// Record pending retirements into the shrink descriptor
    pub(super) async fn ensure_shrink(&mut self) -> Result<(), ReconcileError> {
        if self.cluster.status.rebalance {
            return Ok(());
        }
        let declared = self.cluster.spec.shards;
        let mut shrink_shards = Vec::new();
        for shard in declared..self.shard_nodes.len() {
            // the monitor must go before the pod set, or it would keep
            // pointing at a removed master
            if common::remove_monitor(&self.ctx, &self.cluster, Some(shard)).await? {
                self.requeue = true;
            }
            self.shard_nodes[shard].clear();
            shrink_shards.push(shard);
        }

        let mut reserve = BTreeMap::new();
        for shard in 0..declared.min(self.shard_nodes.len()) {
            if self.shard_nodes[shard].len() > self.cluster.spec.replicas {
                let ordinals =
                    common::reserve_ordinals(&mut self.shard_nodes[shard], self.cluster.spec.replicas);
                reserve.insert(self.cluster.pod_set_name(shard), ordinals);
            }
        }

        if shrink_shards.is_empty() && reserve.is_empty() {
            return Ok(());
        }
        info!(
            cluster = %self.key,
            shards = shrink_shards.len(),
            resized = reserve.len(),
            "shrink recorded"
        );
        self.cluster.status.shrink = Some(ShrinkState {
            shards: shrink_shards,
            reserve,
        });
        self.persist_topology().await
    }

    /// Execute a previously recorded shrink descriptor
    pub(super) async fn apply_shrink(&mut self) -> Result<(), ReconcileError> {
        let Some(shrink) = self.cluster.status.shrink.clone() else {
            return Ok(());
        };
        for shard in &shrink.shards {
            self.ctx
                .store
                .delete_pod_set_if_exists(&self.cluster.pod_set_key(*shard))
                .await?;
        }
        for (set_name, ordinals) in &shrink.reserve {
            let key = ResourceKey::new(self.cluster.meta.namespace.clone(), set_name.clone());
            let mut set = self.ctx.store.get_pod_set(&key).await?;
            set.replicas = self.cluster.spec.replicas;
            for ordinal in ordinals {
                if !set.reserve_ordinals.contains(ordinal) {
                    set.reserve_ordinals.push(*ordinal);
                }
            }
            self.ctx.store.update_pod_set(&set).await?;
        }
        self.cluster.status.shrink = None;
        self.cluster.status.version += 1;
        self.cluster = self.ctx.store.update_cluster(&self.cluster).await?;
        info!(cluster = %self.key, "shrink applied");
        Ok(())
    }

    /// Garbage-collect volume claims whose pod no longer exists; deferred
    /// while a shrink is still pending.
    pub(super) async fn clean_volume_claims(&mut self) -> Result<(), ReconcileError> {
        if self.cluster.status.shrink.is_some() {
            return Ok(());
        }
        let claims = self
            .ctx
            .store
            .list_volume_claims(&self.cluster.meta.namespace, &self.cluster.selector_labels())
            .await?;
        for claim in claims {
            // claim names follow data-<cluster>-<shard>-<ordinal>
            let Some(ordinal) = ordinal_of(&claim.meta.name) else {
                continue;
            };
            let Some(shard) = claim
                .meta
                .name
                .rsplit_once('-')
                .and_then(|(rest, _)| ordinal_of(rest))
            else {
                continue;
            };
            let live = shard < self.cluster.spec.shards
                && self
                    .shard_nodes
                    .get(shard)
                    .is_some_and(|nodes| nodes.iter().any(|n| n.pod_index == ordinal));
            if !live {
                self.ctx
                    .store
                    .delete_volume_claim_if_exists(&claim.meta.key())
                    .await?;
                info!(claim = %claim.meta.name, "volume claim removed");
            }
        }
        Ok(())
    }
}
