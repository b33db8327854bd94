//! Per-resource deployment locks.
//!
//! A lock is held for every `(instance, resource)` a run touches so a second
//! concurrent deployment against the same resource blocks until the first
//! run finishes. Guards are dropped by the orchestrator when it sends the
//! terminal `Finish` event, which also covers worker panics since the guards
//! live with the orchestrator task, not the workers.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockKey = (String, String);

/// Process-wide registry of per-resource locks.
#[derive(Default)]
pub struct ResourceLockRegistry {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Guard for a single acquired resource lock.
pub struct ResourceLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ResourceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `(instance_id, resource_name)`, waiting if a
    /// concurrent run holds it.
    pub async fn acquire(&self, instance_id: &str, resource_name: &str) -> ResourceLockGuard {
        let lock = self
            .locks
            .entry((instance_id.to_string(), resource_name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ResourceLockGuard {
            _guard: lock.lock_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_blocks_second_acquirer_until_released() {
        let registry = Arc::new(ResourceLockRegistry::new());
        let guard = registry.acquire("inst-1", "ordersTable").await;

        let registry_clone = registry.clone();
        let second = tokio::spawn(async move {
            registry_clone.acquire("inst-1", "ordersTable").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second acquirer should proceed after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_resources_do_not_contend() {
        let registry = ResourceLockRegistry::new();
        let _a = registry.acquire("inst-1", "ordersTable").await;
        let _b = registry.acquire("inst-1", "invoicesTable").await;
        let _c = registry.acquire("inst-2", "ordersTable").await;
    }
}
