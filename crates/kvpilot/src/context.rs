//! Shared operator context
//!
//! One `OperatorContext` is built at startup and handed (as `Ctx`) to the
//! controller runtime, every handler, and the failover pipeline. It owns
//! the two external capabilities (resource store, node client), the
//! per-cluster advisory locks both sides serialize on, and the failover
//! queue reconciliation feeds into.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::OperatorConfig;
use crate::failover::{FailoverMsg, FailoverQueue};
use crate::locks::KeyLocks;
use crate::node::NodeClient;
use crate::store::ResourceStore;

pub struct OperatorContext {
    pub store: Arc<dyn ResourceStore>,
    pub nodes: Arc<dyn NodeClient>,
    pub locks: KeyLocks,
    pub failover: FailoverQueue,
    pub config: OperatorConfig,
}

pub type Ctx = Arc<OperatorContext>;

impl OperatorContext {
    /// Build the context; the returned receiver feeds the failover
    /// consumer (`failover::spawn`).
    pub fn new(
        store: Arc<dyn ResourceStore>,
        nodes: Arc<dyn NodeClient>,
        config: OperatorConfig,
    ) -> (Ctx, mpsc::Receiver<FailoverMsg>) {
        let (failover, rx) = FailoverQueue::new(config.failover_queue_capacity);
        let ctx = Arc::new(Self {
            store,
            nodes,
            locks: KeyLocks::new(),
            failover,
            config,
        });
        (ctx, rx)
    }
}
