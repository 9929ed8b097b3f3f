//! Bounded worker pools.
//!
//! Each queue gets exactly `concurrency` worker tasks, so the number of
//! simultaneously active jobs per queue can never exceed it. Workers sleep on
//! a [`Notify`] between claims and wake on enqueue, on retry due-time or
//! after `poll_interval` at the latest.

pub mod executor;
pub mod generator;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::QueueConfig;
use crate::observability::QueueGauge;
use crate::store::JobStore;
use crate::{PipelineError, PipelineResult};

pub use executor::{ExecutionResult, JobExecutor};
pub use generator::{
    ArtifactGenerator, CancelGuard, CancelRegistry, CancellationFlag, GenerationUpdate, ProgressSender,
};
pub use rate_limit::SlidingWindowLimiter;

/// Back-off after a store error while claiming
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Workers for a single queue
pub struct WorkerPool {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    notify: Arc<Notify>,
    gauge: Arc<QueueGauge>,
}

impl WorkerPool {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<JobExecutor>,
        notify: Arc<Notify>,
        gauge: Arc<QueueGauge>,
    ) -> Self {
        let limiter = config.rate_limit.map(|limit| Arc::new(SlidingWindowLimiter::new(limit)));
        Self {
            config,
            store,
            executor,
            limiter,
            notify,
            gauge,
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.name
    }

    /// Spawn the workers
    #[instrument(skip(self), fields(queue = %self.config.name, concurrency = self.config.concurrency))]
    pub fn start(self) -> PoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(self);

        let workers = (0..pool.config.concurrency)
            .map(|index| {
                let worker = Worker {
                    index,
                    pool: pool.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(queue = %pool.config.name, "worker pool started");
        PoolHandle {
            queue: pool.config.name.clone(),
            shutdown_tx,
            workers,
        }
    }
}

/// Handle for stopping a running pool
pub struct PoolHandle {
    queue: String,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop claiming and wait for in-flight jobs to finish
    pub async fn shutdown(mut self) -> PipelineResult<()> {
        let _ = self.shutdown_tx.send(true);
        for worker in std::mem::take(&mut self.workers) {
            worker
                .await
                .map_err(|e| PipelineError::Internal(format!("Worker join error: {}", e)))?;
        }
        info!(queue = %self.queue, "worker pool stopped");
        Ok(())
    }
}

struct Worker {
    index: usize,
    pool: Arc<WorkerPool>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let queue = self.pool.config.name.clone();
        debug!(queue = %queue, worker = self.index, "worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if !self.acquire_slot().await {
                break;
            }

            match self.pool.store.claim_next(&queue, self.pool.config.lease_duration).await {
                Ok(Some(leased)) => {
                    let _active = self.pool.gauge.enter();
                    let result = self.pool.executor.execute(leased).await;
                    if let ExecutionResult::Retrying { delay } = result {
                        self.wake_after(delay);
                    }
                }
                Ok(None) => {
                    self.refund_slot();
                    tokio::select! {
                        _ = self.pool.notify.notified() => {}
                        _ = tokio::time::sleep(self.pool.config.poll_interval) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    self.refund_slot();
                    error!(queue = %queue, error = %e, "Error claiming job");
                    tokio::select! {
                        _ = tokio::time::sleep(CLAIM_ERROR_BACKOFF) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }

        debug!(queue = %queue, worker = self.index, "worker stopped");
    }

    /// Wait for a rate-limit slot. False when shutdown arrived first.
    async fn acquire_slot(&mut self) -> bool {
        let Some(limiter) = self.pool.limiter.clone() else {
            return true;
        };
        loop {
            match limiter.try_acquire() {
                Ok(()) => return true,
                Err(wait) => {
                    debug!(queue = %self.pool.config.name, ?wait, "rate limit reached");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() || *self.shutdown.borrow() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    fn refund_slot(&self) {
        if let Some(limiter) = &self.pool.limiter {
            limiter.refund();
        }
    }

    /// Wake a sleeping worker when a retried job becomes eligible
    fn wake_after(&self, delay: Duration) {
        let notify = self.pool.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notify.notify_one();
        });
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if !self.workers.is_empty() && !*self.shutdown_tx.borrow() {
            warn!(queue = %self.queue, "pool handle dropped without shutdown");
            let _ = self.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::config::{Backoff, CacheConfig, GatewayConfig};
    use crate::gateway::EventGateway;
    use crate::observability::PipelineMetrics;
    use crate::store::MemoryStore;
    use crate::{FactLearning, JobError, JobId, JobPayload, JobRecord, JobStatus, Phase};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArtifactGenerator for Flaky {
        async fn generate(&self, _payload: &JobPayload, progress: ProgressSender) -> Result<Value, JobError> {
            progress.phase(Phase::Generating);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(JobError::transient("upstream timeout"));
            }
            Ok(json!({ "call": call }))
        }
    }

    fn payload() -> JobPayload {
        JobPayload::FactLearning(FactLearning {
            user_id: "u1".into(),
            source_text: "rust is fun".into(),
        })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        executor: Arc<JobExecutor>,
        gauge: Arc<QueueGauge>,
    }

    fn harness(generator: Arc<dyn ArtifactGenerator>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let gateway = Arc::new(EventGateway::new(store.clone(), GatewayConfig::default()));
        let cache = Arc::new(TieredCache::new(&CacheConfig::default()));
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            cache,
            gateway,
            generator,
            Arc::new(CancelRegistry::new()),
            metrics.clone(),
        ));
        Harness {
            store,
            executor,
            gauge: metrics.queue_gauge("q"),
        }
    }

    async fn insert(store: &MemoryStore, backoff: Backoff) -> JobId {
        let payload = payload();
        let fingerprint = payload.fingerprint().unwrap();
        let record = JobRecord::new("q", "owner", payload, fingerprint, 3, backoff);
        store.insert(record).await.unwrap().job_id
    }

    #[tokio::test]
    async fn test_pool_retries_until_success() {
        let h = harness(Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        }));
        let job_id = insert(&h.store, Backoff::new(Duration::from_millis(10), Duration::from_millis(20))).await;

        let config = QueueConfig::new("q")
            .with_concurrency(1)
            .with_poll_interval(Duration::from_millis(5));
        let pool = WorkerPool::new(config, h.store.clone(), h.executor.clone(), Arc::new(Notify::new()), h.gauge.clone());
        let handle = pool.start();

        let mut record = h.store.get(&job_id).await.unwrap();
        for _ in 0..200 {
            if record.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            record = h.store.get(&job_id).await.unwrap();
        }
        handle.shutdown().await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempt, 3);
        assert!(h.gauge.peak() <= 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let h = harness(Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        }));
        let config = QueueConfig::new("q").with_concurrency(4);
        let pool = WorkerPool::new(config, h.store.clone(), h.executor.clone(), Arc::new(Notify::new()), h.gauge);
        let handle = pool.start();
        assert_eq!(handle.queue(), "q");

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
    }
}
