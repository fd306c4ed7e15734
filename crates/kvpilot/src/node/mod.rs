//! Node wire-protocol capability
//!
//! Every command the operator issues against a running node (or a sentinel
//! monitoring one) goes through the `NodeClient` trait: health checks,
//! config, replication control, cluster identity/topology commands, slot
//! moves, and down-notification subscriptions. The error classes matter
//! more than the transport: `StaleVersion` drives the version-retry loops,
//! and the two idempotent migration classes let a crashed migration resume
//! without double-moving slots.

pub mod sim;

use async_trait::async_trait;
use kp_core::{NodeId, Role};
use thiserror::Error;
use tokio::sync::mpsc;

/// Client port of managed nodes
pub const NODE_PORT: u16 = 6379;
/// Client port of sentinel monitors
pub const SENTINEL_PORT: u16 = 26379;

/// Node command failure classes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("node {0} unreachable")]
    Unreachable(String),
    /// The node holds a newer topology version than the one supplied
    #[error("invalid cluster version")]
    StaleVersion,
    /// Migration already happened; safe to treat as success
    #[error("slot has already been migrated")]
    SlotAlreadyMigrated,
    /// Slot is not owned by the addressed node; safe to treat as success
    #[error("slot does not belong to this node")]
    SlotNotOwned,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl NodeError {
    /// Responses a retried slot move may treat as completed
    pub fn is_migrated_already(&self) -> bool {
        matches!(self, NodeError::SlotAlreadyMigrated | NodeError::SlotNotOwned)
    }
}

/// Pending outbound slot transfer on the working model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOut {
    pub dst_node: NodeId,
    pub slots: Vec<u16>,
}

/// Pending inbound slot transfer on the working model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportIn {
    pub src_node: NodeId,
    pub slots: Vec<u16>,
}

/// Working view of one node, rebuilt from live pods and persisted status on
/// every reconciliation pass; never persisted in this form.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub ip: String,
    pub role: Option<Role>,
    pub pod_index: usize,
    pub slots: Vec<u16>,
    pub node_id: NodeId,
    pub master_id: NodeId,
    /// Rebalance target slot count; meaningful only while planning
    pub expected: usize,
    pub failover: bool,
    pub migrate: Vec<MigrateOut>,
    pub import: Vec<ImportIn>,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.role == Some(Role::Master)
    }

    /// Slot count including transfers already pledged in either direction,
    /// so replanning mid-migration does not double-count.
    pub fn settled_slot_len(&self) -> usize {
        let inbound: usize = self.import.iter().map(|i| i.slots.len()).sum();
        let outbound: usize = self.migrate.iter().map(|m| m.slots.len()).sum();
        self.slots.len() + inbound - outbound
    }
}

/// Wire commands the operator issues to nodes and sentinels
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Short-timeout liveness probe; false on any failure
    async fn ping(&self, ip: &str, password: &str) -> bool;

    async fn get_config(&self, ip: &str, password: &str, key: &str) -> Result<Option<String>, NodeError>;
    async fn set_config(&self, ip: &str, password: &str, key: &str, value: &str) -> Result<(), NodeError>;
    /// Rotates both the node's own auth and its master-link auth
    async fn change_password(&self, ip: &str, old: &str, new: &str) -> Result<(), NodeError>;

    async fn get_replication_offset(&self, ip: &str, password: &str) -> Result<i64, NodeError>;
    async fn get_master(&self, ip: &str, password: &str) -> Result<Option<String>, NodeError>;
    async fn set_replica_of(&self, ip: &str, master_ip: &str, password: &str) -> Result<(), NodeError>;
    async fn make_master(&self, ip: &str, password: &str) -> Result<(), NodeError>;
    async fn node_role(&self, ip: &str, password: &str) -> Result<Role, NodeError>;

    async fn set_cluster_identity(&self, ip: &str, password: &str, node_id: &NodeId) -> Result<(), NodeError>;
    /// Installs the serialized topology at `version`; `StaleVersion` when the
    /// node already holds a newer one
    async fn set_topology(&self, ip: &str, password: &str, message: &str, version: u64) -> Result<(), NodeError>;
    async fn cluster_version(&self, ip: &str, password: &str) -> Result<u64, NodeError>;

    /// Starts moving one slot's data and ownership toward `dst_node`
    async fn move_slot(&self, ip: &str, password: &str, slot: u16, dst_node: &NodeId) -> Result<(), NodeError>;
    /// Rewrites one slot's ownership on the addressed node at `version`
    async fn reset_slot(
        &self,
        ip: &str,
        password: &str,
        slot: u16,
        version: u64,
        dst_node: &NodeId,
    ) -> Result<(), NodeError>;

    // sentinel-side operations
    /// IP currently registered for a monitored master, if any
    async fn monitored_master(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
    ) -> Result<Option<String>, NodeError>;
    async fn register_monitor(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
        master_ip: &str,
        node_password: &str,
    ) -> Result<(), NodeError>;
    async fn deregister_monitor(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
    ) -> Result<(), NodeError>;
    /// Refreshes monitor credentials without re-registering
    async fn reset_monitor(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
        node_password: &str,
    ) -> Result<(), NodeError>;

    /// Stream of down-notification payloads (`<shard-label> <ip> <port>`)
    /// published by one sentinel; closes when the sentinel goes away
    async fn subscribe_down_notifications(
        &self,
        sentinel_ip: &str,
        password: &str,
    ) -> Result<mpsc::Receiver<String>, NodeError>;
}

/// Generate a fresh 40-hex-char node identity
pub fn generate_node_id() -> NodeId {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_len_counts_pledged_transfers() {
        let node = Node {
            slots: (0..100).collect(),
            migrate: vec![MigrateOut { dst_node: "b".into(), slots: (0..10).collect() }],
            import: vec![ImportIn { src_node: "c".into(), slots: (200..204).collect() }],
            ..Default::default()
        };
        assert_eq!(node.settled_slot_len(), 94);
    }

    #[test]
    fn node_ids_are_forty_hex_chars() {
        let id = generate_node_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_node_id());
    }
}
