//! Slot rebalancing: planning and execution
//!
//! Planning is pure: given the masters in shard-declaration order and the
//! declared shard count, compute each master's expected slot count
//! (floor + remainder-first; masters beyond the declared count get zero
//! and are evacuated) and sweep two pointers over the list, pledging
//! `min(excess, deficit)` slots between the outermost unbalanced pair
//! until the pointers meet. Pledges only touch the in-memory
//! migrate/import lists.
//!
//! Execution drains one master's pledges a slot at a time in ascending
//! order: instruct the source to move the slot, then broadcast the new
//! ownership to every node at the current version, bumping on stale.
//! Status is persisted after every completed pledge, so a crash resumes
//! from the next unmoved slot.

use std::sync::atomic::{AtomicU64, Ordering};

use kp_core::{NodeId, TOTAL_SLOTS};
use tracing::{info, warn};

use super::ClusterHandler;
use crate::controllers::ReconcileError;
use crate::node::{ImportIn, MigrateOut, NodeError};
use crate::retry::{retry, RetryPolicy};

/// Planning view of one master
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanMaster {
    pub node_id: NodeId,
    pub slots: Vec<u16>,
    pub migrate: Vec<MigrateOut>,
    pub import: Vec<ImportIn>,
    pub expected: usize,
}

impl PlanMaster {
    /// Slot count with pledged transfers applied in both directions
    fn settled_len(&self) -> usize {
        let inbound: usize = self.import.iter().map(|i| i.slots.len()).sum();
        let outbound: usize = self.migrate.iter().map(|m| m.slots.len()).sum();
        self.slots.len() + inbound - outbound
    }
}

/// Compute expected counts and pledge the moves that even the masters
/// out. Deterministic: masters are visited in shard-declaration order.
/// Returns true when any move was pledged.
pub(crate) fn plan_rebalance(masters: &mut [PlanMaster], declared_shards: usize) -> bool {
    let base = TOTAL_SLOTS as usize / declared_shards;
    let remainder = TOTAL_SLOTS as usize % declared_shards;
    for (index, master) in masters.iter_mut().enumerate() {
        master.expected = if index >= declared_shards {
            0
        } else {
            base + usize::from(index < remainder)
        };
    }

    let mut changed = false;
    let mut first = 0;
    let mut last = masters.len().saturating_sub(1);
    while first < last {
        if masters[first].settled_len() == masters[first].expected {
            first += 1;
            continue;
        }
        if masters[last].settled_len() == masters[last].expected {
            last -= 1;
            continue;
        }
        changed = true;
        if pledge_between(masters, first, last) == 0 {
            last -= 1;
        }
    }
    changed
}

/// Pledge `min(excess, deficit)` slots between the masters at `a` and `b`
/// (whichever direction balances them); returns the number pledged.
fn pledge_between(masters: &mut [PlanMaster], a: usize, b: usize) -> usize {
    let balance_a = masters[a].settled_len() as i64 - masters[a].expected as i64;
    let balance_b = masters[b].settled_len() as i64 - masters[b].expected as i64;
    let (src, dst, count) = if balance_a > 0 && balance_b < 0 {
        (a, b, balance_a.min(-balance_b) as usize)
    } else if balance_a < 0 && balance_b > 0 {
        (b, a, (-balance_a).min(balance_b) as usize)
    } else {
        return 0;
    };

    // take the lowest-indexed slots not already pledged away
    let pledged: usize = masters[src].migrate.iter().map(|m| m.slots.len()).sum();
    let available = masters[src].slots.len().saturating_sub(pledged);
    let count = count.min(available);
    if count == 0 {
        return 0;
    }
    let slots: Vec<u16> = masters[src].slots[pledged..pledged + count].to_vec();
    let dst_node = masters[dst].node_id.clone();
    let src_node = masters[src].node_id.clone();
    masters[src].migrate.push(MigrateOut {
        dst_node,
        slots: slots.clone(),
    });
    masters[dst].import.push(ImportIn {
        src_node,
        slots,
    });
    count
}

impl ClusterHandler {
    /// Rebalance step: finish any in-flight migration first, otherwise
    /// plan a fresh set of pledges against the declared shard count.
    pub(super) async fn rebalance(&mut self) -> Result<(), ReconcileError> {
        let positions = self.master_positions();

        // an in-flight migration always finishes before replanning
        for &(shard, index) in &positions {
            if !self.shard_nodes[shard][index].migrate.is_empty() {
                self.requeue = true;
                return self.execute_migrations(shard, index).await;
            }
        }

        self.cluster.status.rebalance = false;
        let mut plan: Vec<PlanMaster> = positions
            .iter()
            .map(|&(shard, index)| {
                let node = &self.shard_nodes[shard][index];
                PlanMaster {
                    node_id: node.node_id.clone(),
                    slots: node.slots.clone(),
                    migrate: node.migrate.clone(),
                    import: node.import.clone(),
                    expected: 0,
                }
            })
            .collect();
        if plan.is_empty() {
            return Ok(());
        }
        if plan_rebalance(&mut plan, self.cluster.spec.shards) {
            info!(cluster = %self.key, "rebalance planned");
            self.cluster.status.rebalance = true;
        }
        for (&(shard, index), planned) in positions.iter().zip(plan.into_iter()) {
            let node = &mut self.shard_nodes[shard][index];
            node.expected = planned.expected;
            node.migrate = planned.migrate;
            node.import = planned.import;
        }
        self.persist_topology().await
    }

    /// Drain every pledge of one master, a slot at a time in ascending
    /// order, checkpointing status after each completed pledge.
    async fn execute_migrations(&mut self, shard: usize, index: usize) -> Result<(), ReconcileError> {
        loop {
            let Some(entry) = self.shard_nodes[shard][index].migrate.first().cloned() else {
                break;
            };
            let src_ip = self.shard_nodes[shard][index].ip.clone();
            let src_id = self.shard_nodes[shard][index].node_id.clone();
            info!(
                cluster = %self.key,
                src = %src_id,
                dst = %entry.dst_node,
                slots = entry.slots.len(),
                "begin moving slots"
            );
            for &slot in &entry.slots {
                self.move_one_slot(&src_ip, slot, &entry.dst_node).await?;
                self.reset_slot_everywhere(slot, &entry.dst_node).await?;
            }

            // pledge complete: settle the working model and checkpoint
            {
                let src = &mut self.shard_nodes[shard][index];
                src.slots.retain(|s| !entry.slots.contains(s));
                src.migrate.remove(0);
            }
            if let Some((dst_shard, dst_index)) = self.find_node(&entry.dst_node) {
                let dst = &mut self.shard_nodes[dst_shard][dst_index];
                dst.slots.extend(entry.slots.iter().copied());
                dst.slots.sort_unstable();
                if !dst.import.is_empty() {
                    dst.import.remove(0);
                }
            }
            self.persist_topology().await?;
            info!(
                cluster = %self.key,
                src = %src_id,
                dst = %entry.dst_node,
                "slots moved"
            );
        }
        Ok(())
    }

    /// Move one slot with bounded retry; responses saying the move already
    /// happened count as success.
    async fn move_one_slot(
        &self,
        src_ip: &str,
        slot: u16,
        dst_node: &NodeId,
    ) -> Result<(), ReconcileError> {
        let nodes = self.ctx.nodes.as_ref();
        let password = self.password.as_str();
        let result = retry(
            RetryPolicy::slot_migration(),
            |_| async move { nodes.move_slot(src_ip, password, slot, dst_node).await },
            |err| !err.is_migrated_already(),
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_migrated_already() => Ok(()),
            Err(err) => {
                warn!(cluster = %self.key, slot, error = %err, "slot migration timed out");
                Err(ReconcileError::Failed(format!("slot {slot} migration timeout")))
            }
        }
    }

    /// Broadcast one slot's new owner to every node at the current
    /// version, advancing the version whenever a node reports it stale.
    async fn reset_slot_everywhere(&mut self, slot: u16, dst_node: &NodeId) -> Result<(), ReconcileError> {
        let ips: Vec<String> = self
            .shard_nodes
            .iter()
            .flatten()
            .map(|n| n.ip.clone())
            .collect();
        let version = AtomicU64::new(self.version);
        let nodes = self.ctx.nodes.as_ref();
        let password = self.password.as_str();
        let version_ref = &version;
        for ip in &ips {
            let ip = ip.as_str();
            retry(
                RetryPolicy::version_gated(),
                move |_| {
                    let v = version_ref.load(Ordering::Relaxed);
                    async move {
                        match nodes.reset_slot(ip, password, slot, v, dst_node).await {
                            Err(NodeError::StaleVersion) => {
                                // resync with the node before retrying it
                                if let Ok(held) = nodes.cluster_version(ip, password).await {
                                    version_ref.fetch_max(held + 1, Ordering::Relaxed);
                                } else {
                                    version_ref.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(NodeError::StaleVersion)
                            }
                            other => other,
                        }
                    }
                },
                |err| matches!(err, NodeError::StaleVersion),
            )
            .await?;
        }
        self.version = version.load(Ordering::Relaxed);
        Ok(())
    }
}
