use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::pool::{PoolStats, WorkFn, WorkerPool};
use crate::infrastructure::error::PoolError;

/// Type-erased view of a pool, so pools over different task types share one registry
#[async_trait]
pub trait ManagedPool: Send + Sync {
    fn name(&self) -> &str;

    fn stats(&self) -> PoolStats;

    async fn shutdown(&self, wait: bool, timeout: Duration) -> Result<(), PoolError>;
}

#[async_trait]
impl<T: Send + 'static> ManagedPool for WorkerPool<T> {
    fn name(&self) -> &str {
        WorkerPool::name(self)
    }

    fn stats(&self) -> PoolStats {
        WorkerPool::stats(self)
    }

    async fn shutdown(&self, wait: bool, timeout: Duration) -> Result<(), PoolError> {
        WorkerPool::shutdown(self, wait, timeout).await
    }
}

/// Registry of named worker pools.
///
/// Passed around by `Arc`; there is no process-wide instance. Cancelling the
/// root token makes every pool stop accepting work.
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<dyn ManagedPool>>>,
    cancel: CancellationToken,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Root token. Cancel it once, e.g. from a signal handler, to stop intake everywhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a pool whose intake stops when the manager's root token is cancelled
    pub async fn create_pool<T: Send + 'static>(
        &self,
        name: &str,
        worker_count: usize,
        queue_capacity: usize,
        work_fn: WorkFn<T>,
    ) -> Result<Arc<WorkerPool<T>>, PoolError> {
        let cancel = self.cancel.child_token();
        self.create_pool_with_token(name, worker_count, queue_capacity, work_fn, cancel)
            .await
    }

    /// Register a pool driven by its own token. Cancelling the root token leaves
    /// its intake open; `shutdown_all` still stops it.
    pub async fn create_pool_with_token<T: Send + 'static>(
        &self,
        name: &str,
        worker_count: usize,
        queue_capacity: usize,
        work_fn: WorkFn<T>,
        cancel: CancellationToken,
    ) -> Result<Arc<WorkerPool<T>>, PoolError> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(name) {
            return Err(PoolError::DuplicateName(name.to_string()));
        }

        let pool = Arc::new(WorkerPool::new(
            name,
            worker_count,
            queue_capacity,
            work_fn,
            cancel,
        ));
        pools.insert(name.to_string(), pool.clone() as Arc<dyn ManagedPool>);
        Ok(pool)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ManagedPool>> {
        self.pools.read().await.get(name).cloned()
    }

    /// Unregister a pool without shutting it down
    pub async fn remove(&self, name: &str) -> Option<Arc<dyn ManagedPool>> {
        self.pools.write().await.remove(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .read()
            .await
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Shut down and unregister every pool. All pools are attempted; the first error is returned.
    pub async fn shutdown_all(&self, wait: bool, timeout: Duration) -> Result<(), PoolError> {
        let pools: Vec<Arc<dyn ManagedPool>> = self.pools.write().await.drain().map(|(_, pool)| pool).collect();

        let mut first_error = None;
        for pool in &pools {
            if let Err(e) = pool.shutdown(wait, timeout).await {
                warn!(pool = pool.name(), error = %e, "pool did not shut down cleanly");
                first_error.get_or_insert(e);
            }
        }

        info!(pools = pools.len(), "all worker pools shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
