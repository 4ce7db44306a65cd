//! # Worker Pools
//!
//! Bounded execution pools keyed by integration type. Each pool runs at most
//! `max_concurrency` jobs and holds at most `queue_depth` more waiting for a
//! slot. Admission is reserved *before* a job is claimed so the dispatcher
//! never leases work it cannot start.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{AppConfig, WorkerPoolConfig};

/// A reserved admission slot. Dropping it without spawning releases the slot.
pub struct PoolSlot {
    permit: OwnedSemaphorePermit,
    pool: WorkerPool,
}

impl PoolSlot {
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Runs `job` on the pool. The admission slot is held until `job` completes.
    pub fn spawn<F>(self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let PoolSlot { permit, pool } = self;
        tokio::spawn(async move {
            let _admission = permit;
            let Ok(_running) = pool.running.clone().acquire_owned().await else {
                return;
            };
            gauge!("etl_worker_pool_busy", "pool" => pool.name.clone()).increment(1.0);
            job.await;
            gauge!("etl_worker_pool_busy", "pool" => pool.name.clone()).decrement(1.0);
        })
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    name: String,
    config: WorkerPoolConfig,
    admission: Arc<Semaphore>,
    running: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            name: name.into(),
            config,
            admission: Arc::new(Semaphore::new(max_concurrency + config.queue_depth)),
            running: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> WorkerPoolConfig {
        self.config
    }

    /// Admission slots still free (running plus queued capacity).
    pub fn available(&self) -> usize {
        self.admission.available_permits()
    }

    /// Reserves an admission slot, or `None` when the pool is saturated.
    pub fn try_reserve(&self) -> Option<PoolSlot> {
        let permit = self.admission.clone().try_acquire_owned().ok()?;
        Some(PoolSlot {
            permit,
            pool: self.clone(),
        })
    }

    fn capacity(&self) -> u32 {
        (self.config.max_concurrency.max(1) + self.config.queue_depth) as u32
    }

    /// Waits until every admitted job of this pool has finished.
    async fn wait_idle(&self) {
        if let Ok(all) = self.admission.acquire_many(self.capacity()).await {
            drop(all);
        }
    }
}

/// Lazily builds one [`WorkerPool`] per integration type from configuration.
#[derive(Clone)]
pub struct WorkerPools {
    config: Arc<AppConfig>,
    pools: Arc<Mutex<HashMap<String, WorkerPool>>>,
}

impl WorkerPools {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The pool for `integration_type`; names are case-insensitive.
    pub fn pool_for(&self, integration_type: &str) -> WorkerPool {
        let key = integration_type.to_ascii_lowercase();
        let mut pools = self
            .pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pools
            .entry(key.clone())
            .or_insert_with(|| {
                let config = self.config.worker_pool_for(&key);
                debug!(
                    pool = %key,
                    max_concurrency = config.max_concurrency,
                    queue_depth = config.queue_depth,
                    "Creating worker pool"
                );
                WorkerPool::new(key.clone(), config)
            })
            .clone()
    }

    /// Waits for every pool created so far to drain.
    pub async fn wait_idle(&self) {
        let pools: Vec<WorkerPool> = self
            .pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for pool in pools {
            pool.wait_idle().await;
        }
    }
}
