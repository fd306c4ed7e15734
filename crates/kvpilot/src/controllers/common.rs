//! Operations shared by every handler kind
//!
//! Config drift repair, sentinel monitor management, replica retirement
//! selection, and the topology publisher all behave identically whether a
//! cluster is standalone or sharded; handlers call in here.

use std::sync::atomic::{AtomicU64, Ordering};

use kp_core::Role;
use tracing::{debug, info};

use super::ReconcileError;
use crate::context::Ctx;
use crate::node::{Node, NodeError};
use crate::resource::{
    sentinel_labels, ClusterKind, ClusterSpec, ClusterStatus, KvCluster, NodeTopology, ObjectMeta,
    Phase, ResourceKey, ROLE_LABEL,
};
use crate::retry::{retry, RetryPolicy};
use crate::store::Pod;

/// Rendered node configuration document: declared entries plus password
pub fn config_data(spec: &ClusterSpec) -> std::collections::BTreeMap<String, String> {
    let mut data = spec.node_config.clone();
    data.insert("password".to_string(), spec.password.clone());
    data
}

/// Bring every node's runtime configuration in line with the declaration,
/// rotating the password last so earlier commands still authenticate.
pub async fn ensure_node_config(
    ctx: &Ctx,
    spec: &ClusterSpec,
    nodes: &[Node],
    current_password: &str,
) -> Result<(), ReconcileError> {
    for node in nodes {
        for (key, value) in &spec.node_config {
            let current = ctx.nodes.get_config(&node.ip, current_password, key).await?;
            if current.as_deref() != Some(value.as_str()) {
                ctx.nodes.set_config(&node.ip, current_password, key, value).await?;
                debug!(ip = %node.ip, key = %key, "node config updated");
            }
        }
        if current_password != spec.password {
            ctx.nodes
                .change_password(&node.ip, current_password, &spec.password)
                .await?;
            info!(ip = %node.ip, "node password rotated");
        }
    }
    Ok(())
}

/// Fetch the sentinel fleet responsible for `cluster`, declaring it first if
/// nobody has. Returns `None` (requeue) until the fleet reports Running.
pub async fn get_sentinel(
    ctx: &Ctx,
    cluster: &KvCluster,
) -> Result<Option<(Vec<Pod>, String)>, ReconcileError> {
    let name = cluster.sentinel_name();
    let key = ResourceKey::new(cluster.meta.namespace.clone(), name.clone());
    let mut meta = ObjectMeta::named(&cluster.meta.namespace, &name);
    meta.labels = sentinel_labels();
    let declared = KvCluster {
        meta,
        spec: ClusterSpec {
            kind: ClusterKind::Sentinel,
            shards: 0,
            replicas: 3,
            password: cluster.spec.password.clone(),
            node_config: Default::default(),
        },
        status: ClusterStatus::default(),
    };
    ctx.store.create_cluster_if_absent(&declared).await?;
    let sentinel = ctx.store.get_cluster(&key).await?;
    if sentinel.status.phase != Phase::Running {
        return Ok(None);
    }
    let pods = ctx.store.list_set_pods(&key).await?;
    Ok(Some((pods, sentinel.spec.password.clone())))
}

/// Make every sentinel pod monitor `master_ip` under the cluster's
/// per-shard master name. Returns true when the fleet is not ready yet.
pub async fn ensure_monitors(
    ctx: &Ctx,
    cluster: &KvCluster,
    master_ip: &str,
    shard: Option<usize>,
) -> Result<bool, ReconcileError> {
    let Some((pods, sentinel_password)) = get_sentinel(ctx, cluster).await? else {
        return Ok(true);
    };
    let master_name = cluster.master_name(shard);
    for pod in &pods {
        let registered = ctx
            .nodes
            .monitored_master(&pod.ip, &sentinel_password, &master_name)
            .await?;
        if registered.as_deref() != Some(master_ip) {
            // stale registration first, then the fresh one
            let _ = ctx
                .nodes
                .deregister_monitor(&pod.ip, &sentinel_password, &master_name)
                .await;
            ctx.nodes
                .register_monitor(
                    &pod.ip,
                    &sentinel_password,
                    &master_name,
                    master_ip,
                    &cluster.spec.password,
                )
                .await?;
            info!(master = %master_name, ip = %master_ip, "sentinel monitor registered");
        } else {
            ctx.nodes
                .reset_monitor(&pod.ip, &sentinel_password, &master_name, &cluster.spec.password)
                .await?;
        }
    }
    Ok(false)
}

/// Drop the monitor entry for one master from every sentinel pod.
/// Returns true when the fleet is not ready yet.
pub async fn remove_monitor(
    ctx: &Ctx,
    cluster: &KvCluster,
    shard: Option<usize>,
) -> Result<bool, ReconcileError> {
    let Some((pods, sentinel_password)) = get_sentinel(ctx, cluster).await? else {
        return Ok(true);
    };
    let master_name = cluster.master_name(shard);
    for pod in &pods {
        let registered = ctx
            .nodes
            .monitored_master(&pod.ip, &sentinel_password, &master_name)
            .await?;
        if registered.is_some() {
            ctx.nodes
                .deregister_monitor(&pod.ip, &sentinel_password, &master_name)
                .await?;
            info!(master = %master_name, sentinel = %pod.ip, "sentinel monitor removed");
        }
    }
    Ok(false)
}

/// One line of the node-native topology message
pub fn topology_line(node: &NodeTopology) -> String {
    match node.role {
        Some(Role::Master) => format!(
            "{} {} {} master - {}",
            node.node_id,
            node.ip,
            node.port,
            node.slots.join(" "),
        ),
        _ => format!(
            "{} {} {} slave {}",
            node.node_id, node.ip, node.port, node.master_id,
        ),
    }
}

/// Serialize the full persisted topology, skipping evacuating nodes
pub fn topology_message(status: &ClusterStatus) -> String {
    let mut message = String::new();
    for shard in &status.topo {
        for node in &shard.topology {
            if node.failover {
                continue;
            }
            message.push_str(&topology_line(node));
            message.push('\n');
        }
    }
    message
}

/// Push the persisted topology to every live node at the current version,
/// bumping the version and restarting the broadcast when any node reports
/// it stale, then persist status. Skipped while a rebalance is in flight
/// (the migration executor synchronizes slot ownership itself).
pub async fn publish_topology(
    ctx: &Ctx,
    cluster: &mut KvCluster,
    password: &str,
) -> Result<(), ReconcileError> {
    if cluster.status.rebalance {
        return Ok(());
    }
    let message = topology_message(&cluster.status);
    let version = AtomicU64::new(cluster.status.version);
    let targets: Vec<String> = cluster
        .status
        .topo
        .iter()
        .flat_map(|s| s.topology.iter())
        .filter(|n| !n.failover)
        .map(|n| n.ip.clone())
        .collect();

    let nodes = ctx.nodes.as_ref();
    let targets = &targets;
    let message_ref = message.as_str();
    let version_ref = &version;
    retry(
        RetryPolicy::version_gated(),
        move |_| {
            let v = version_ref.load(Ordering::Relaxed);
            async move {
                for ip in targets {
                    match nodes.set_topology(ip, password, message_ref, v).await {
                        Err(NodeError::StaleVersion) => {
                            // resync with the node's actual version, then
                            // restart the whole broadcast one version up
                            if let Ok(held) = nodes.cluster_version(ip, password).await {
                                version_ref.fetch_max(held + 1, Ordering::Relaxed);
                            } else {
                                version_ref.fetch_add(1, Ordering::Relaxed);
                            }
                            return Err(NodeError::StaleVersion);
                        }
                        other => other?,
                    }
                }
                Ok::<_, NodeError>(())
            }
        },
        |err| matches!(err, NodeError::StaleVersion),
    )
    .await?;

    cluster.status.version = version.load(Ordering::Relaxed);
    if cluster.status.phase != Phase::Running {
        cluster.status.phase = Phase::Running;
    }
    *cluster = ctx.store.update_cluster(cluster).await?;
    debug!(version = cluster.status.version, nodes = targets.len(), "topology published");
    Ok(())
}

/// Reflect a node's replication role onto its pod label
pub async fn update_pod_role_label(
    ctx: &Ctx,
    key: &ResourceKey,
    role: Role,
) -> Result<(), ReconcileError> {
    let mut pod = ctx.store.get_pod(key).await?;
    let value = role.to_string();
    if pod.meta.labels.get(ROLE_LABEL) != Some(&value) {
        pod.meta.labels.insert(ROLE_LABEL.to_string(), value);
        ctx.store.update_pod(&pod).await?;
    }
    Ok(())
}

/// Pick the surplus ordinals to retire when shrinking a pod set to
/// `target` members. The master is never retired; retired ordinals below
/// the master's need an explicit reservation (higher ones simply
/// truncate). Retired nodes are removed from `nodes`; the reservation
/// list comes back in ascending order.
pub fn reserve_ordinals(nodes: &mut Vec<Node>, target: usize) -> Vec<usize> {
    let mut delta = nodes.len().saturating_sub(target);
    if delta == 0 {
        return Vec::new();
    }
    let mut master_ordinal = 0;
    let mut retired = Vec::new();
    for node in nodes.iter().rev() {
        if delta == 0 {
            break;
        }
        if node.is_master() {
            master_ordinal = node.pod_index;
        } else {
            retired.push(node.pod_index);
            delta -= 1;
        }
    }
    nodes.retain(|n| !retired.contains(&n.pod_index));
    let mut reserve: Vec<usize> = retired
        .into_iter()
        .filter(|ordinal| *ordinal <= master_ordinal)
        .collect();
    reserve.sort_unstable();
    reserve
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ShardTopology;

    fn replica(ordinal: usize) -> Node {
        Node {
            pod_index: ordinal,
            role: Some(Role::Replica),
            ip: format!("10.0.0.{ordinal}"),
            ..Default::default()
        }
    }

    fn master(ordinal: usize) -> Node {
        Node {
            role: Some(Role::Master),
            ..replica(ordinal)
        }
    }

    #[test]
    fn shrink_never_retires_the_master() {
        let mut nodes = vec![replica(0), master(1), replica(2)];
        let reserve = reserve_ordinals(&mut nodes, 1);
        assert_eq!(reserve, vec![0]);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_master());
        assert_eq!(nodes[0].pod_index, 1);
    }

    #[test]
    fn ordinals_above_the_master_are_not_reserved() {
        let mut nodes = vec![master(0), replica(1), replica(2)];
        let reserve = reserve_ordinals(&mut nodes, 1);
        // both retired ordinals sit above the master: plain truncation
        assert!(reserve.is_empty());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].pod_index, 0);
    }

    #[test]
    fn shrink_by_one_prefers_the_highest_replica() {
        let mut nodes = vec![master(0), replica(1), replica(2)];
        let reserve = reserve_ordinals(&mut nodes, 2);
        assert!(reserve.is_empty());
        let ordinals: Vec<usize> = nodes.iter().map(|n| n.pod_index).collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn no_surplus_is_a_no_op() {
        let mut nodes = vec![master(0), replica(1)];
        assert!(reserve_ordinals(&mut nodes, 2).is_empty());
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn topology_lines_match_the_wire_format() {
        let master = NodeTopology {
            node_id: "a".repeat(40),
            ip: "10.0.0.1".into(),
            port: 6379,
            role: Some(Role::Master),
            slots: vec!["0-99".into(), "200".into()],
            ..Default::default()
        };
        assert_eq!(
            topology_line(&master),
            format!("{} 10.0.0.1 6379 master - 0-99 200", "a".repeat(40))
        );
        let replica = NodeTopology {
            node_id: "b".repeat(40),
            ip: "10.0.0.2".into(),
            port: 6379,
            role: Some(Role::Replica),
            master_id: "a".repeat(40),
            ..Default::default()
        };
        assert_eq!(
            topology_line(&replica),
            format!("{} 10.0.0.2 6379 slave {}", "b".repeat(40), "a".repeat(40))
        );
    }

    #[test]
    fn failover_nodes_are_left_out_of_the_message() {
        let status = ClusterStatus {
            topo: vec![ShardTopology {
                shard_name: "kv-demo-0".into(),
                topology: vec![
                    NodeTopology {
                        node_id: "a".repeat(40),
                        ip: "10.0.0.1".into(),
                        port: 6379,
                        role: Some(Role::Master),
                        slots: vec!["0-16383".into()],
                        ..Default::default()
                    },
                    NodeTopology {
                        node_id: "b".repeat(40),
                        ip: "10.0.0.2".into(),
                        port: 6379,
                        role: Some(Role::Replica),
                        master_id: "a".repeat(40),
                        failover: true,
                        ..Default::default()
                    },
                ],
            }],
            ..Default::default()
        };
        let message = topology_message(&status);
        assert_eq!(message.lines().count(), 1);
        assert!(message.contains("master"));
    }
}
