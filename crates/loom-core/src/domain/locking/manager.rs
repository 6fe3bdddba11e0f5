//! Node lock manager
//!
//! One holder per node id. Waiters park on a release notification until
//! their deadline; several ids are taken in sorted order, all or nothing.
//! A hold past its stale window is taken over with a warning.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::guard::{LockTable, MultiLockGuard, NodeLockGuard};
use super::types::{LockConfig, LockError, LockHold, LockResult};

#[derive(Debug)]
pub struct NodeLockManager {
    config: LockConfig,
    holds: LockTable,
    /// Signalled whenever a guard drops
    released: Arc<Notify>,
}

impl Default for NodeLockManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl NodeLockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            holds: Arc::new(Mutex::new(HashMap::new())),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LockConfig::default())
    }

    /// Lock one node, waiting up to `timeout` (the configured default when None)
    pub async fn acquire(
        &self,
        node_id: &str,
        holder: &str,
        timeout: Option<Duration>,
    ) -> LockResult<NodeLockGuard> {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_timeout);
        self.acquire_until(node_id, holder, deadline).await
    }

    async fn acquire_until(
        &self,
        node_id: &str,
        holder: &str,
        deadline: Instant,
    ) -> LockResult<NodeLockGuard> {
        let start = Instant::now();
        loop {
            // Register before trying so a release in between still wakes us
            let notified = self.released.notified();
            match self.try_acquire(node_id, holder) {
                Ok(guard) => {
                    debug!(
                        node_id = %node_id,
                        holder = %holder,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "Node lock acquired"
                    );
                    return Ok(guard);
                }
                Err(LockError::Contention { resource, holder: current }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        info!(
                            node_id = %resource,
                            holder = %current,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Gave up waiting for node lock"
                        );
                        return Err(LockError::Timeout {
                            resource,
                            holder: current,
                        });
                    }
                    let nap = (deadline - now).min(self.config.retry_interval);
                    let _ = tokio::time::timeout(nap, notified).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lock one node if it is free right now
    pub fn try_acquire(&self, node_id: &str, holder: &str) -> LockResult<NodeLockGuard> {
        if node_id.is_empty() {
            return Err(LockError::InvalidState("cannot lock an empty node id".to_string()));
        }
        let mut holds = self
            .holds
            .lock()
            .map_err(|_| LockError::InvalidState("lock table poisoned".to_string()))?;

        if let Some(current) = holds.get(node_id) {
            if !current.is_stale() {
                return Err(LockError::Contention {
                    resource: node_id.to_string(),
                    holder: current.holder.clone(),
                });
            }
            warn!(
                node_id = %node_id,
                holder = %current.holder,
                held_secs = current.held_for().num_seconds(),
                "Taking over stale node lock"
            );
        }

        let hold = LockHold::new(node_id, holder, Some(self.config.stale_after));
        holds.insert(node_id.to_string(), hold.clone());
        Ok(NodeLockGuard::new(
            hold,
            Arc::clone(&self.holds),
            Arc::clone(&self.released),
        ))
    }

    /// Lock every id in `node_ids` or none of them
    ///
    /// Ids are deduplicated and taken in sorted order, so overlapping
    /// callers cannot deadlock. `timeout` bounds the whole call.
    pub async fn acquire_many<I, S>(
        &self,
        node_ids: I,
        holder: &str,
        timeout: Option<Duration>,
    ) -> LockResult<MultiLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sorted: BTreeSet<String> = node_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_timeout);

        let mut guards = Vec::with_capacity(sorted.len());
        for node_id in &sorted {
            // on error, guards taken so far drop here
            guards.push(self.acquire_until(node_id, holder, deadline).await?);
        }
        Ok(MultiLockGuard::new(guards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> LockConfig {
        LockConfig::default()
            .with_timeout(Duration::from_millis(200))
            .with_retry_interval(Duration::from_millis(5))
    }

    fn is_free(manager: &NodeLockManager, node_id: &str) -> bool {
        manager.try_acquire(node_id, "check").is_ok()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = NodeLockManager::new(fast_config());
        let guard = manager.acquire("n1", "test", None).await.unwrap();
        assert_eq!(guard.node_id(), "n1");
        assert!(!is_free(&manager, "n1"));

        drop(guard);
        assert!(is_free(&manager, "n1"));
    }

    #[tokio::test]
    async fn test_locks_are_not_reentrant() {
        let manager = NodeLockManager::new(fast_config());
        let _guard = manager.try_acquire("n1", "first").unwrap();
        let second = manager.try_acquire("n1", "second");
        assert!(matches!(second, Err(LockError::Contention { ref holder, .. }) if holder == "first"));
        assert!(matches!(
            manager.try_acquire("", "nobody"),
            Err(LockError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let manager = NodeLockManager::new(fast_config());
        let _guard = manager.acquire("n1", "holder", None).await.unwrap();

        let result = manager
            .acquire("n1", "waiter", Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(LockError::Timeout { ref holder, .. }) if holder == "holder"));
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let manager = Arc::new(NodeLockManager::new(fast_config()));
        let guard = manager.acquire("n1", "holder", None).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .acquire("n1", "waiter", Some(Duration::from_secs(2)))
                    .await
                    .map(|g| g.holder().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert_eq!(waiter.await.unwrap().unwrap(), "waiter");
    }

    #[tokio::test]
    async fn test_acquire_many_is_all_or_nothing() {
        let manager = NodeLockManager::new(fast_config());
        let held = manager.try_acquire("b", "other").unwrap();

        let result = manager
            .acquire_many(["c", "a", "b"], "merge", Some(Duration::from_millis(30)))
            .await;
        assert!(result.is_err());
        assert!(is_free(&manager, "a"));
        assert!(is_free(&manager, "c"));

        drop(held);
        let guard = manager
            .acquire_many(["c", "a", "b", "a"], "merge", None)
            .await
            .unwrap();
        assert_eq!(guard.node_ids(), vec!["a", "b", "c"]);
        assert!(guard.covers("b"));
        assert!(!guard.covers("d"));

        drop(guard);
        assert!(is_free(&manager, "b"));
    }

    #[tokio::test]
    async fn test_exclusive_critical_sections() {
        let manager = Arc::new(NodeLockManager::new(
            fast_config().with_timeout(Duration::from_secs(5)),
        ));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let ids = if i % 2 == 0 { ["x", "y"] } else { ["y", "x"] };
                let _guard = manager
                    .acquire_many(ids, &format!("worker-{}", i), None)
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let manager = NodeLockManager::new(fast_config().with_stale_after(Duration::ZERO));
        let stale = manager.try_acquire("n1", "crashed").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let fresh = manager.try_acquire("n1", "fresh").unwrap();
        assert_eq!(fresh.holder(), "fresh");
        // The old guard must not clear its successor's hold
        drop(stale);
        let current = manager
            .holds
            .lock()
            .unwrap()
            .get("n1")
            .map(|h| h.holder.clone());
        assert_eq!(current.as_deref(), Some("fresh"));
    }
}
