//! Per-cluster advisory locks
//!
//! Failover promotion and reconciliation both rewrite a cluster's persisted
//! topology; they serialize on a lock keyed by the cluster, so independent
//! clusters proceed in parallel. The store's compare-and-swap remains the
//! final backstop against lost updates.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::resource::ResourceKey;

#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<ResourceKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one cluster, waiting if another task holds it
    pub async fn lock(&self, key: &ResourceKey) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock();
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_key_serializes_different_keys_do_not() {
        let locks = Arc::new(KeyLocks::new());
        let key = ResourceKey::new("default", "kv-demo");
        let other = ResourceKey::new("default", "kv-other");

        let held = locks.lock(&key).await;
        // a different key is immediately available
        let _free = locks.lock(&other).await;

        let running = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            let running = running.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                running.store(1, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(running.load(Ordering::SeqCst), 0);
        drop(held);
        waiter.await.unwrap();
        assert_eq!(running.load(Ordering::SeqCst), 1);
    }
}
