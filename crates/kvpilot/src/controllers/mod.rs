//! Reconciliation orchestrator
//!
//! One reconciliation pass takes a declared cluster and runs a fixed
//! pipeline against it through a kind-specific handler. Any step may flag
//! `requeue` (state not ready yet, try again shortly) or fail; retryable
//! failures (not-found, stale-version) requeue the pass, terminal ones
//! (validation, forbidden) abort it. The runtime serializes passes per
//! cluster and runs different clusters on a bounded worker pool, fed by
//! store watch events plus a periodic resync.

pub mod cluster;
pub mod common;
pub mod sentinel;
pub mod standalone;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kp_core::SlotRangeError;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::Ctx;
use crate::node::NodeError;
use crate::resource::{
    monitor_labels, sentinel_labels, ClusterKind, KvCluster, Phase, ResourceKey, FINALIZER,
};
use crate::store::StoreError;

/// Anything a reconciliation step can fail with
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("corrupt slot record: {0}")]
    Slots(#[from] SlotRangeError),
    #[error("{0}")]
    Failed(String),
}

impl ReconcileError {
    /// Clears up on its own; requeue without surfacing
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Store(e) if e.is_retryable())
    }

    /// Will never succeed on retry; abort the pass
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcileError::Store(e) if e.is_terminal())
    }
}

/// Outcome of one pass
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

/// Kind-specific reconciliation pipeline
#[async_trait]
pub trait Handler: Send {
    /// Run the pipeline once; steps set the requeue flag instead of
    /// erroring when state is simply not ready yet
    async fn handle(&mut self) -> Result<(), ReconcileError>;
    /// Teardown on deletion (deregister monitors and the like)
    async fn finalize(&mut self) -> Result<(), ReconcileError>;
    fn requeue(&self) -> bool;
}

fn handler_for(ctx: Ctx, cluster: KvCluster) -> Box<dyn Handler> {
    match cluster.spec.kind {
        ClusterKind::Standalone => Box::new(standalone::StandaloneHandler::new(ctx, cluster)),
        ClusterKind::Sentinel => Box::new(sentinel::SentinelHandler::new(ctx, cluster)),
        ClusterKind::Cluster => Box::new(cluster::ClusterHandler::new(ctx, cluster)),
    }
}

/// Run one reconciliation pass for `key` and decide what happens next
pub async fn reconcile(ctx: &Ctx, key: &ResourceKey) -> Action {
    let backoff = ctx.config.requeue_delay;
    match reconcile_inner(ctx, key).await {
        Ok(action) => action,
        Err(err) if err.is_retryable() => {
            debug!(cluster = %key, error = %err, "pass requeued");
            Action::RequeueAfter(backoff)
        }
        Err(err) if err.is_terminal() => {
            error!(cluster = %key, error = %err, "pass aborted");
            Action::Done
        }
        Err(err) => {
            warn!(cluster = %key, error = %err, "pass failed, will retry");
            Action::RequeueAfter(backoff)
        }
    }
}

async fn reconcile_inner(ctx: &Ctx, key: &ResourceKey) -> Result<Action, ReconcileError> {
    let cluster = match ctx.store.get_cluster(key).await {
        Ok(cluster) => cluster,
        Err(err) if err.is_not_found() => return Ok(Action::Done),
        Err(err) => return Err(err.into()),
    };

    if cluster.is_deleting() {
        return teardown(ctx, key, cluster).await;
    }
    // a failed cluster needs operator intervention, not another pass
    if cluster.status.phase == Phase::Failed {
        return Ok(Action::Done);
    }
    if let Err(reason) = cluster.validate() {
        error!(cluster = %key, reason = %reason, "declaration rejected");
        let mut cluster = cluster;
        cluster.status.phase = Phase::Failed;
        cluster.status.reason = reason;
        ctx.store.update_cluster(&cluster).await?;
        return Ok(Action::Done);
    }

    let cluster = initialize(ctx, cluster).await?;
    debug!(cluster = %key, "reconcile begin");
    let mut handler = handler_for(ctx.clone(), cluster);
    handler.handle().await?;
    if handler.requeue() {
        return Ok(Action::RequeueAfter(ctx.config.requeue_delay));
    }
    debug!(cluster = %key, "reconcile end");
    Ok(Action::Done)
}

async fn teardown(ctx: &Ctx, key: &ResourceKey, cluster: KvCluster) -> Result<Action, ReconcileError> {
    if !cluster.meta.has_finalizer(FINALIZER) {
        return Ok(Action::Done);
    }
    info!(cluster = %key, "begin teardown");
    let mut handler = handler_for(ctx.clone(), cluster);
    handler.finalize().await?;
    if handler.requeue() {
        return Ok(Action::RequeueAfter(ctx.config.requeue_delay));
    }
    // the handler may have rewritten the object; release on a fresh copy
    let mut cluster = ctx.store.get_cluster(key).await?;
    cluster.meta.remove_finalizer(FINALIZER);
    ctx.store.update_cluster(&cluster).await?;
    info!(cluster = %key, "teardown complete");
    Ok(Action::Done)
}

/// First-observation bookkeeping: stamp selector labels and move the
/// lifecycle out of `None`
async fn initialize(ctx: &Ctx, mut cluster: KvCluster) -> Result<KvCluster, ReconcileError> {
    let mut labels = cluster.meta.labels.clone();
    labels.extend(cluster.selector_labels());
    match cluster.spec.kind {
        ClusterKind::Cluster => labels.extend(monitor_labels(&cluster.sentinel_name())),
        ClusterKind::Sentinel => labels.extend(sentinel_labels()),
        ClusterKind::Standalone => {}
    }
    let mut dirty = false;
    if labels != cluster.meta.labels {
        cluster.meta.labels = labels;
        dirty = true;
    }
    if cluster.status.phase == Phase::None {
        info!(cluster = %cluster.key(), "cluster is creating");
        cluster.status.phase = Phase::Creating;
        dirty = true;
    }
    if dirty {
        cluster = ctx.store.update_cluster(&cluster).await?;
    }
    Ok(cluster)
}

/// Deduplicating work queue: a key sits in the queue at most once, and is
/// eligible again the moment a worker picks it up
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<ResourceKey>,
    queued: Arc<Mutex<HashSet<ResourceKey>>>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ResourceKey>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                queued: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Enqueue unless the key is already waiting
    pub fn offer(&self, key: ResourceKey) {
        if self.queued.lock().insert(key.clone()) {
            if self.tx.try_send(key.clone()).is_err() {
                self.queued.lock().remove(&key);
            }
        }
    }

    fn taken(&self, key: &ResourceKey) {
        self.queued.lock().remove(key);
    }
}

/// The reconciliation runtime: watch + resync feeders and a worker pool
pub struct Controller {
    ctx: Ctx,
}

impl Controller {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Spawn the runtime; the returned handles live as long as the process
    pub fn spawn(self) -> Vec<tokio::task::JoinHandle<()>> {
        let (queue, rx) = WorkQueue::new(1024);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::new();

        // watch feeder
        {
            let queue = queue.clone();
            let mut events = self.ctx.store.watch_clusters();
            handles.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(key) => queue.offer(key),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        // periodic resync feeder
        {
            let queue = queue.clone();
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(ctx.config.resync_interval);
                loop {
                    tick.tick().await;
                    match ctx.store.list_clusters(None, &Default::default()).await {
                        Ok(clusters) => {
                            for cluster in clusters {
                                queue.offer(cluster.key());
                            }
                        }
                        Err(err) => warn!(error = %err, "resync listing failed"),
                    }
                }
            }));
        }

        // worker pool
        for worker in 0..self.ctx.config.workers {
            let ctx = self.ctx.clone();
            let queue = queue.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let key = { rx.lock().await.recv().await };
                    let Some(key) = key else { break };
                    queue.taken(&key);
                    // same-cluster passes and failover promotions serialize here
                    let guard = ctx.locks.lock(&key).await;
                    let action = reconcile(&ctx, &key).await;
                    drop(guard);
                    if let Action::RequeueAfter(delay) = action {
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            queue.offer(key);
                        });
                    }
                }
                debug!(worker, "worker stopped");
            }));
        }

        handles
    }
}
