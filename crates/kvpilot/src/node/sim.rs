//! In-process simulated node fleet
//!
//! A `SimNodeClient` stands in for a real fleet: every IP the operator
//! contacts is a simulated node holding role, replication offset, cluster
//! identity, topology version and owned slots, with the same error classes
//! a real node produces (stale version, already-migrated, unreachable).
//! Used by the integration tests and the self-contained dev harness.
//! Nodes boot lazily on first contact; `kill` keeps an address dead until
//! `revive`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kp_core::{expand_ranges, NodeId, Role};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{NodeClient, NodeError};

#[derive(Debug, Default)]
struct SimNode {
    alive: bool,
    password: String,
    config: BTreeMap<String, String>,
    role: Role,
    master_ip: Option<String>,
    node_id: NodeId,
    offset: i64,
    version: u64,
    topology: String,
    owned: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMove {
    pub slot: u16,
    pub src_ip: String,
    pub dst_node: NodeId,
}

#[derive(Default)]
struct SimInner {
    nodes: HashMap<String, SimNode>,
    /// last destination each migrated slot was shipped to
    migrated: HashMap<u16, NodeId>,
    /// every accepted slot move, in order
    move_log: Vec<SlotMove>,
    /// moves remaining before the fleet starts failing them (test knob)
    moves_until_failure: Option<usize>,
    monitors: HashMap<(String, String), String>,
    down_subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl SimInner {
    fn node_mut(&mut self, ip: &str, password: &str) -> &mut SimNode {
        self.nodes.entry(ip.to_string()).or_insert_with(|| SimNode {
            alive: true,
            password: password.to_string(),
            role: Role::Master,
            ..Default::default()
        })
    }

    fn live_node_mut(&mut self, ip: &str, password: &str) -> Result<&mut SimNode, NodeError> {
        let node = self.node_mut(ip, password);
        if !node.alive {
            return Err(NodeError::Unreachable(ip.to_string()));
        }
        Ok(node)
    }
}

/// Simulated fleet behind the `NodeClient` trait
#[derive(Clone, Default)]
pub struct SimNodeClient {
    inner: Arc<Mutex<SimInner>>,
}

impl SimNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an address down; it stays unreachable until revived
    pub fn kill(&self, ip: &str) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(ip) {
            node.alive = false;
        } else {
            inner.nodes.insert(ip.to_string(), SimNode::default());
        }
    }

    pub fn revive(&self, ip: &str) {
        if let Some(node) = self.inner.lock().nodes.get_mut(ip) {
            node.alive = true;
        }
    }

    pub fn set_offset(&self, ip: &str, password: &str, offset: i64) {
        self.inner.lock().node_mut(ip, password).offset = offset;
    }

    /// Pre-set a node's cluster version, to exercise the stale-version path
    pub fn set_version(&self, ip: &str, password: &str, version: u64) {
        self.inner.lock().node_mut(ip, password).version = version;
    }

    /// Fail every slot move after the next `n` succeed, until cleared
    pub fn fail_moves_after(&self, n: usize) {
        self.inner.lock().moves_until_failure = Some(n);
    }

    pub fn clear_move_failures(&self) {
        self.inner.lock().moves_until_failure = None;
    }

    pub fn move_log(&self) -> Vec<SlotMove> {
        self.inner.lock().move_log.clone()
    }

    pub fn topology_of(&self, ip: &str) -> Option<(String, u64)> {
        self.inner
            .lock()
            .nodes
            .get(ip)
            .filter(|n| !n.topology.is_empty())
            .map(|n| (n.topology.clone(), n.version))
    }

    pub fn owned_slots(&self, ip: &str) -> Vec<u16> {
        self.inner.lock().nodes.get(ip).map(|n| n.owned.clone()).unwrap_or_default()
    }

    pub fn role_of(&self, ip: &str) -> Option<Role> {
        self.inner.lock().nodes.get(ip).map(|n| n.role)
    }

    pub fn monitor_of(&self, sentinel_ip: &str, master_name: &str) -> Option<String> {
        self.inner
            .lock()
            .monitors
            .get(&(sentinel_ip.to_string(), master_name.to_string()))
            .cloned()
    }

    /// Inject a down-notification as the sentinel at `sentinel_ip` would
    /// publish it: `<shard-label> <ip> <port>`
    pub fn publish_down(&self, sentinel_ip: &str, payload: &str) {
        let senders = self
            .inner
            .lock()
            .down_subscribers
            .get(sentinel_ip)
            .cloned()
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.try_send(payload.to_string());
        }
    }

    /// Apply a topology message to one node: learn its own role, owned
    /// slots, and master link from the line carrying its identity.
    fn apply_topology(node: &mut SimNode, message: &str) {
        let mut master_ip_of: HashMap<&str, &str> = HashMap::new();
        for line in message.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 4 && fields[3] == "master" {
                master_ip_of.insert(fields[0], fields[1]);
            }
        }
        for line in message.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[0] != node.node_id {
                continue;
            }
            if fields[3] == "master" {
                node.role = Role::Master;
                node.master_ip = None;
                node.owned = expand_ranges(&fields[5..]).unwrap_or_default();
            } else {
                node.role = Role::Replica;
                node.master_ip = master_ip_of.get(fields[4]).map(|ip| ip.to_string());
                node.owned.clear();
            }
            return;
        }
    }
}

#[async_trait]
impl NodeClient for SimNodeClient {
    async fn ping(&self, ip: &str, password: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.node_mut(ip, password).alive
    }

    async fn get_config(&self, ip: &str, password: &str, key: &str) -> Result<Option<String>, NodeError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_node_mut(ip, password)?.config.get(key).cloned())
    }

    async fn set_config(&self, ip: &str, password: &str, key: &str, value: &str) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        let node = inner.live_node_mut(ip, password)?;
        node.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn change_password(&self, ip: &str, old: &str, new: &str) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        let node = inner.live_node_mut(ip, old)?;
        if node.password != old {
            return Err(NodeError::Protocol("invalid password".into()));
        }
        node.password = new.to_string();
        Ok(())
    }

    async fn get_replication_offset(&self, ip: &str, password: &str) -> Result<i64, NodeError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_node_mut(ip, password)?.offset)
    }

    async fn get_master(&self, ip: &str, password: &str) -> Result<Option<String>, NodeError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_node_mut(ip, password)?.master_ip.clone())
    }

    async fn set_replica_of(&self, ip: &str, master_ip: &str, password: &str) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        let node = inner.live_node_mut(ip, password)?;
        node.role = Role::Replica;
        node.master_ip = Some(master_ip.to_string());
        Ok(())
    }

    async fn make_master(&self, ip: &str, password: &str) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        let node = inner.live_node_mut(ip, password)?;
        node.role = Role::Master;
        node.master_ip = None;
        Ok(())
    }

    async fn node_role(&self, ip: &str, password: &str) -> Result<Role, NodeError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_node_mut(ip, password)?.role)
    }

    async fn set_cluster_identity(&self, ip: &str, password: &str, node_id: &NodeId) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        inner.live_node_mut(ip, password)?.node_id = node_id.clone();
        Ok(())
    }

    async fn set_topology(&self, ip: &str, password: &str, message: &str, version: u64) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        let node = inner.live_node_mut(ip, password)?;
        // a topology that differs from the installed one needs a fresh
        // version; re-installing the same one is idempotent
        let changes = node.topology != message;
        if version < node.version || (version == node.version && changes && !node.topology.is_empty()) {
            return Err(NodeError::StaleVersion);
        }
        node.version = version;
        node.topology = message.to_string();
        Self::apply_topology(node, message);
        Ok(())
    }

    async fn cluster_version(&self, ip: &str, password: &str) -> Result<u64, NodeError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_node_mut(ip, password)?.version)
    }

    async fn move_slot(&self, ip: &str, password: &str, slot: u16, dst_node: &NodeId) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        match inner.moves_until_failure {
            Some(0) => return Err(NodeError::Protocol("migration refused".into())),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        let owned_at = {
            let node = inner.live_node_mut(ip, password)?;
            node.owned.iter().position(|s| *s == slot)
        };
        match owned_at {
            None => {
                if inner.migrated.get(&slot) == Some(dst_node) {
                    Err(NodeError::SlotAlreadyMigrated)
                } else {
                    Err(NodeError::SlotNotOwned)
                }
            }
            Some(pos) => {
                if let Some(node) = inner.nodes.get_mut(ip) {
                    node.owned.remove(pos);
                }
                inner.migrated.insert(slot, dst_node.clone());
                inner.move_log.push(SlotMove {
                    slot,
                    src_ip: ip.to_string(),
                    dst_node: dst_node.clone(),
                });
                Ok(())
            }
        }
    }

    async fn reset_slot(
        &self,
        ip: &str,
        password: &str,
        slot: u16,
        version: u64,
        dst_node: &NodeId,
    ) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        let node = inner.live_node_mut(ip, password)?;
        // changing ownership needs a fresh version; replaying an already
        // applied reset at the current version is accepted
        let changes = if node.node_id == *dst_node {
            !node.owned.contains(&slot)
        } else {
            node.owned.contains(&slot)
        };
        if version < node.version || (version == node.version && changes) {
            return Err(NodeError::StaleVersion);
        }
        node.version = version;
        if node.node_id == *dst_node {
            if !node.owned.contains(&slot) {
                node.owned.push(slot);
                node.owned.sort_unstable();
            }
        } else {
            node.owned.retain(|s| *s != slot);
        }
        Ok(())
    }

    async fn monitored_master(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
    ) -> Result<Option<String>, NodeError> {
        let mut inner = self.inner.lock();
        inner.live_node_mut(sentinel_ip, password)?;
        Ok(inner
            .monitors
            .get(&(sentinel_ip.to_string(), master_name.to_string()))
            .cloned())
    }

    async fn register_monitor(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
        master_ip: &str,
        _node_password: &str,
    ) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        inner.live_node_mut(sentinel_ip, password)?;
        inner.monitors.insert(
            (sentinel_ip.to_string(), master_name.to_string()),
            master_ip.to_string(),
        );
        Ok(())
    }

    async fn deregister_monitor(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
    ) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        inner.live_node_mut(sentinel_ip, password)?;
        inner
            .monitors
            .remove(&(sentinel_ip.to_string(), master_name.to_string()));
        Ok(())
    }

    async fn reset_monitor(
        &self,
        sentinel_ip: &str,
        password: &str,
        master_name: &str,
        _node_password: &str,
    ) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        inner.live_node_mut(sentinel_ip, password)?;
        if !inner
            .monitors
            .contains_key(&(sentinel_ip.to_string(), master_name.to_string()))
        {
            return Err(NodeError::Protocol(format!("no such master: {master_name}")));
        }
        Ok(())
    }

    async fn subscribe_down_notifications(
        &self,
        sentinel_ip: &str,
        password: &str,
    ) -> Result<mpsc::Receiver<String>, NodeError> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock();
        inner.live_node_mut(sentinel_ip, password)?;
        inner
            .down_subscribers
            .entry(sentinel_ip.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
