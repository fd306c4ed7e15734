//! Bounded retry with exponential backoff
//!
//! One combinator serves every retry site: per-slot migration commands,
//! per-node slot-ownership resets, and whole-broadcast topology pushes.
//! The `recover` callback decides whether an error is worth another attempt
//! and is where version-bump-on-stale lives at the call sites.

use std::future::Future;
use std::time::Duration;

/// Attempt budget and backoff curve
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    /// Slot migration commands: 5 attempts, 10ms growing tenfold
    pub fn slot_migration() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            factor: 10,
        }
    }

    /// Version-gated commands: no sleep, bounded only against runaway
    /// version gaps (the version counter is owned by this process)
    pub fn version_gated() -> Self {
        Self {
            max_attempts: 64,
            base_delay: Duration::ZERO,
            factor: 1,
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
        }
        delay
    }
}

/// Run `op` until it succeeds, `recover` declines the error, or the attempt
/// budget is spent. `op` receives the zero-based attempt number; `recover`
/// may mutate captured state (bump a version) before the next attempt.
pub async fn retry<T, E, Fut, Op, Rec>(
    policy: RetryPolicy,
    mut op: Op,
    mut recover: Rec,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Rec: FnMut(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !recover(&err) {
                    return Err(err);
                }
                let delay = policy.delay(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0usize);
        let result: Result<usize, &str> = retry(
            RetryPolicy { max_attempts: 5, base_delay: Duration::ZERO, factor: 1 },
            |attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn stops_when_recover_declines() {
        let result: Result<(), &str> = retry(
            RetryPolicy { max_attempts: 5, base_delay: Duration::ZERO, factor: 1 },
            |_| async { Err("fatal") },
            |err| *err != "fatal",
        )
        .await;
        assert_eq!(result, Err("fatal"));
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let calls = Cell::new(0usize);
        let result: Result<(), &str> = retry(
            RetryPolicy { max_attempts: 3, base_delay: Duration::ZERO, factor: 1 },
            |_| {
                calls.set(calls.get() + 1);
                async { Err("busy") }
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn migration_backoff_grows_tenfold() {
        let policy = RetryPolicy::slot_migration();
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
    }
}
