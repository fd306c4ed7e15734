//! Failover pipeline
//!
//! Independent of the reconciliation loop, this pipeline turns sentinel
//! down-notifications into replica promotions. A periodic producer keeps
//! one subscription open per sentinel pod; listeners parse notifications
//! into messages on a bounded queue (deduplicated by reporting IP); the
//! consumer promotes under the same per-cluster lock reconciliation uses.
//! Delivery is at-least-once and level-triggered, so promotion is
//! idempotent against duplicate notifications; messages past their
//! deadline are dropped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kp_core::Role;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::Ctx;
use crate::controllers::{common, ReconcileError};
use crate::node::NODE_PORT;
use crate::resource::{
    sentinel_labels, ClusterKind, KvCluster, NodeTopology, Phase, ResourceKey,
};

/// Terminal reason recorded when a shard has nothing left to promote
pub const NO_SUITABLE_REPLICA: &str = "no suitable replica";

/// One down-notification, addressed to a shard of a declared cluster
#[derive(Debug, Clone)]
pub struct FailoverMsg {
    pub ip: String,
    pub port: u16,
    pub key: ResourceKey,
    pub shard: usize,
    pub deadline: DateTime<Utc>,
}

/// Bounded queue with duplicate suppression keyed by the reported IP
#[derive(Clone)]
pub struct FailoverQueue {
    tx: mpsc::Sender<FailoverMsg>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl FailoverQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FailoverMsg>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Enqueue unless this IP is already being handled
    pub fn report(&self, msg: FailoverMsg) {
        if self.pending.lock().insert(msg.ip.clone()) {
            let ip = msg.ip.clone();
            if self.tx.try_send(msg).is_err() {
                self.pending.lock().remove(&ip);
                warn!(ip = %ip, "failover queue full, notification dropped");
            }
        }
    }

    /// Put a message back after a failed attempt; it stays pending
    fn requeue(&self, msg: FailoverMsg) {
        let ip = msg.ip.clone();
        if self.tx.try_send(msg).is_err() {
            self.pending.lock().remove(&ip);
        }
    }

    fn clear(&self, ip: &str) {
        self.pending.lock().remove(ip);
    }
}

/// Spawn the producer and consumer tasks
pub fn spawn(ctx: Ctx, mut rx: mpsc::Receiver<FailoverMsg>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let subscribed: Arc<Mutex<HashSet<ResourceKey>>> = Arc::new(Mutex::new(HashSet::new()));

    // producer: keep one down-notification subscription per sentinel pod
    {
        let ctx = ctx.clone();
        let subscribed = subscribed.clone();
        handles.push(tokio::spawn(async move {
            info!("listening for failover notifications");
            let mut tick = tokio::time::interval(ctx.config.failover_scan_interval);
            loop {
                tick.tick().await;
                if let Err(err) = scan_sentinels(&ctx, &subscribed).await {
                    warn!(error = %err, "sentinel scan failed");
                }
            }
        }));
    }

    // consumer: one task per message
    handles.push(tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                handle_failover(ctx, msg).await;
            });
        }
    }));

    handles
}

async fn scan_sentinels(
    ctx: &Ctx,
    subscribed: &Arc<Mutex<HashSet<ResourceKey>>>,
) -> Result<(), ReconcileError> {
    let sentinels = ctx.store.list_clusters(None, &sentinel_labels()).await?;
    for sentinel in sentinels {
        if sentinel.status.phase != Phase::Running {
            continue;
        }
        let Some(system) = sentinel.meta.name.strip_prefix("sentinel-").map(str::to_string) else {
            continue;
        };
        let pods = ctx.store.list_set_pods(&sentinel.key()).await?;
        for pod in pods {
            let pod_key = pod.meta.key();
            if !subscribed.lock().insert(pod_key.clone()) {
                continue;
            }
            match ctx
                .nodes
                .subscribe_down_notifications(&pod.ip, &sentinel.spec.password)
                .await
            {
                Ok(stream) => {
                    debug!(sentinel = %pod_key, "subscribed to down notifications");
                    tokio::spawn(listen(
                        ctx.clone(),
                        stream,
                        pod.meta.namespace.clone(),
                        system.clone(),
                        pod_key,
                        subscribed.clone(),
                    ));
                }
                Err(err) => {
                    subscribed.lock().remove(&pod_key);
                    warn!(sentinel = %pod_key, error = %err, "subscription failed");
                }
            }
        }
    }
    Ok(())
}

/// Parse down-notifications (`<shard-label> <ip> <port>`) until the
/// subscription closes, then release the slot so the producer resubscribes.
async fn listen(
    ctx: Ctx,
    mut stream: mpsc::Receiver<String>,
    namespace: String,
    system: String,
    pod_key: ResourceKey,
    subscribed: Arc<Mutex<HashSet<ResourceKey>>>,
) {
    while let Some(payload) = stream.recv().await {
        let fields: Vec<&str> = payload.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        // standalone master labels carry no shard suffix; nothing to do here
        let Some((short, index)) = fields[0].rsplit_once('-') else {
            continue;
        };
        let Ok(shard) = index.parse::<usize>() else {
            continue;
        };
        let key = ResourceKey::new(namespace.clone(), format!("{system}-{short}"));
        info!(cluster = %key, shard, ip = %fields[1], "received failover notification");
        ctx.failover.report(FailoverMsg {
            ip: fields[1].to_string(),
            port: fields[2].parse().unwrap_or(NODE_PORT),
            key,
            shard,
            deadline: deadline(&ctx),
        });
    }
    subscribed.lock().remove(&pod_key);
    debug!(sentinel = %pod_key, "down-notification subscription closed");
}

/// Deadline for a notification reported now
pub fn deadline(ctx: &Ctx) -> DateTime<Utc> {
    Utc::now()
        + chrono::Duration::from_std(ctx.config.failover_deadline)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
}

/// Consume one message: promote under the cluster's advisory lock,
/// re-enqueueing on failure until the deadline passes.
pub async fn handle_failover(ctx: Ctx, msg: FailoverMsg) {
    let guard = ctx.locks.lock(&msg.key).await;
    let result = promote(&ctx, &msg).await;
    drop(guard);
    match result {
        Ok(()) => {
            ctx.failover.clear(&msg.ip);
            info!(cluster = %msg.key, shard = msg.shard, "failover handled");
        }
        Err(err) if Utc::now() < msg.deadline => {
            warn!(cluster = %msg.key, error = %err, "promotion failed, re-queueing");
            ctx.failover.requeue(msg);
        }
        Err(err) => {
            warn!(cluster = %msg.key, error = %err, "promotion deadline elapsed, dropping");
            ctx.failover.clear(&msg.ip);
        }
    }
}

/// The promotion state machine (spec steps 1-5). Idempotent: a duplicate
/// notification for an already-replaced master finds no matching live
/// entry and completes without touching anything.
async fn promote(ctx: &Ctx, msg: &FailoverMsg) -> Result<(), ReconcileError> {
    let mut cluster = match ctx.store.get_cluster(&msg.key).await {
        Ok(cluster) => cluster,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if cluster.spec.kind != ClusterKind::Cluster
        || cluster.is_deleting()
        || cluster.status.phase == Phase::Failed
    {
        return Ok(());
    }
    let Some(shard) = cluster.status.topo.get(msg.shard) else {
        return Ok(());
    };
    let entries = shard.topology.clone();

    // a shard down to one member has nothing to promote
    if entries.len() == 1 {
        return mark_failed(ctx, cluster).await;
    }

    let mut old_master: Option<usize> = None;
    let mut candidates: Vec<(usize, String)> = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.failover {
            continue;
        }
        if entry.ip == msg.ip {
            if entry.role != Some(Role::Master) {
                // a failed replica is only flagged; pod replacement heals it
                cluster.status.topo[msg.shard].topology[index].failover = true;
                ctx.store.update_cluster(&cluster).await?;
                info!(cluster = %msg.key, pod = %entries[index].pod, "replica flagged for replacement");
                return Ok(());
            }
            old_master = Some(index);
        } else {
            candidates.push((index, entry.ip.clone()));
        }
    }
    // the reported node is gone from the topology: already replaced
    let Some(old_index) = old_master else {
        return Ok(());
    };

    // the monitor entry points at a dead master now; drop it first
    let _ = common::remove_monitor(ctx, &cluster, Some(msg.shard)).await;

    let password = cluster.spec.password.clone();
    let mut best: Option<(usize, i64)> = None;
    let mut unreadable = false;
    for (index, ip) in &candidates {
        match ctx.nodes.get_replication_offset(ip, &password).await {
            Ok(offset) if offset >= 0 => {
                if best.map_or(true, |(_, top)| offset > top) {
                    best = Some((*index, offset));
                }
            }
            _ => {
                unreadable = true;
                break;
            }
        }
    }
    let new_index = match best {
        Some((index, _)) if !unreadable => index,
        _ => {
            if Utc::now() >= msg.deadline {
                return mark_failed(ctx, cluster).await;
            }
            return Err(ReconcileError::Failed(
                "replication offset unavailable, promotion deferred".into(),
            ));
        }
    };

    let old = entries[old_index].clone();
    let new = entries[new_index].clone();
    for (index, entry) in cluster.status.topo[msg.shard].topology.iter_mut().enumerate() {
        if index == new_index {
            // the new master inherits the old one's entire slot state
            *entry = NodeTopology {
                pod: new.pod.clone(),
                role: Some(Role::Master),
                node_id: new.node_id.clone(),
                ip: new.ip.clone(),
                port: NODE_PORT,
                slots: old.slots.clone(),
                migrate: old.migrate.clone(),
                import: old.import.clone(),
                master_id: String::new(),
                failover: false,
            };
        } else {
            *entry = NodeTopology {
                pod: entry.pod.clone(),
                role: Some(Role::Replica),
                node_id: entry.node_id.clone(),
                ip: entry.ip.clone(),
                port: NODE_PORT,
                slots: Vec::new(),
                migrate: Vec::new(),
                import: Vec::new(),
                master_id: new.node_id.clone(),
                failover: entry.failover || entry.node_id == old.node_id,
            };
        }
    }
    cluster.status.version += 1;
    cluster = ctx.store.update_cluster(&cluster).await?;
    common::publish_topology(ctx, &mut cluster, &password).await?;
    info!(
        cluster = %msg.key,
        shard = msg.shard,
        new_master = %new.pod,
        version = cluster.status.version,
        "replica promoted to master"
    );
    Ok(())
}

async fn mark_failed(ctx: &Ctx, mut cluster: KvCluster) -> Result<(), ReconcileError> {
    warn!(cluster = %cluster.key(), reason = NO_SUITABLE_REPLICA, "marking cluster failed");
    cluster.status.phase = Phase::Failed;
    cluster.status.reason = NO_SUITABLE_REPLICA.to_string();
    ctx.store.update_cluster(&cluster).await?;
    Ok(())
}
