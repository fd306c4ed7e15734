//! Operator tunables

use std::time::Duration;

/// Knobs for the reconciliation runtime and the failover pipeline
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Backoff before an incomplete pass runs again
    pub requeue_delay: Duration,
    /// Cadence of the full resync that backstops watch events
    pub resync_interval: Duration,
    /// How often the failover producer scans for unmonitored sentinels
    pub failover_scan_interval: Duration,
    /// How long a down-notification stays actionable
    pub failover_deadline: Duration,
    /// Bound on queued down-notifications
    pub failover_queue_capacity: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            requeue_delay: Duration::from_secs(10),
            resync_interval: Duration::from_secs(10),
            failover_scan_interval: Duration::from_secs(30),
            failover_deadline: Duration::from_secs(30),
            failover_queue_capacity: 1000,
        }
    }
}
