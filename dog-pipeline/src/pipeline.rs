//! Pipeline lifetime context.
//!
//! A [`Pipeline`] collects configuration and collaborators; [`Pipeline::start`]
//! wires the store, cache, gateway, scheduler and one worker pool per queue,
//! spawns the lease reaper and retention sweeper, and returns a
//! [`PipelineHandle`]. Everything stops with [`PipelineHandle::shutdown`].
//! Several pipelines can run side by side in one process.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStats, DistributedCache, InvalidateReport, TieredCache, WarmEntry, WarmReport};
use crate::client::{into_frames, FrameStream, ReconnectingSubscriber, StreamTransport};
use crate::config::PipelineConfig;
use crate::gateway::{EventGateway, EventStream};
use crate::observability::{MetricsSnapshot, PipelineMetrics};
use crate::queue::{JobOptions, LeaseReaper, RetentionSweeper, Scheduler};
use crate::store::{EventLog, JobStore, MemoryStore, QueueStats};
use crate::worker::{ArtifactGenerator, CancelRegistry, JobExecutor, PoolHandle, WorkerPool};
use crate::{JobHandle, JobId, JobPayload, JobStatusView, PipelineError, PipelineResult, StreamTransportError};

/// Builder for a running pipeline
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn JobStore>,
    log: Arc<dyn EventLog>,
    l2: Option<Arc<dyn DistributedCache>>,
    generator: Arc<dyn ArtifactGenerator>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// Pipeline backed by an in-memory store
    pub fn new(config: PipelineConfig, generator: Arc<dyn ArtifactGenerator>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            config,
            store: store.clone(),
            log: store,
            l2: None,
            generator,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Use a store that keeps both job records and event logs
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: JobStore + EventLog + 'static,
    {
        self.store = store.clone();
        self.log = store;
        self
    }

    pub fn with_distributed_cache(mut self, l2: Arc<dyn DistributedCache>) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate configuration and spawn workers and background tasks.
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(queues = self.config.queues.len()))]
    pub fn start(self) -> PipelineResult<PipelineHandle> {
        self.config.validate()?;

        let Pipeline {
            config,
            store,
            log,
            l2,
            generator,
            metrics,
        } = self;

        let mut cache = TieredCache::new(&config.cache).with_metrics(metrics.clone());
        if let Some(l2) = l2 {
            cache = cache.with_distributed(l2);
        }
        let cache = Arc::new(cache);
        let gateway = Arc::new(EventGateway::new(log.clone(), config.gateway).with_metrics(metrics.clone()));
        let cancels = Arc::new(CancelRegistry::new());
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            cache.clone(),
            gateway.clone(),
            generator,
            cancels.clone(),
            metrics.clone(),
        ));

        let mut scheduler = Scheduler::new(store.clone(), gateway.clone(), cancels, metrics.clone());
        let mut pools = Vec::with_capacity(config.queues.len());
        for queue in &config.queues {
            let notify = scheduler.add_queue(queue.clone());
            let gauge = metrics.queue_gauge(&queue.name);
            let pool = WorkerPool::new(queue.clone(), store.clone(), executor.clone(), notify, gauge);
            pools.push(pool);
        }
        let scheduler = Arc::new(scheduler);
        let pools: Vec<PoolHandle> = pools.into_iter().map(WorkerPool::start).collect();

        let (background_tx, background_rx) = watch::channel(false);
        let reaper = LeaseReaper::new(store.clone(), gateway.clone(), scheduler.clone(), metrics.clone())
            .with_interval(config.reaper.interval);
        let sweeper = RetentionSweeper::new(store.clone(), log.clone(), gateway.clone(), scheduler.clone())
            .with_interval(config.reaper.cleanup_interval);
        let background = vec![
            tokio::spawn(reaper.start(background_rx.clone())),
            tokio::spawn(sweeper.start(background_rx)),
        ];

        info!("pipeline started");
        Ok(PipelineHandle {
            inner: Arc::new(Inner {
                config,
                store,
                log,
                cache,
                gateway,
                scheduler,
                metrics,
                lifecycle: Mutex::new(Some(Lifecycle {
                    pools,
                    background_tx,
                    background,
                })),
            }),
        })
    }
}

struct Lifecycle {
    pools: Vec<PoolHandle>,
    background_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn JobStore>,
    log: Arc<dyn EventLog>,
    cache: Arc<TieredCache>,
    gateway: Arc<EventGateway>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<PipelineMetrics>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// Cloneable handle to a running pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Inner>,
}

impl PipelineHandle {
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    fn ensure_running(&self) -> PipelineResult<()> {
        if self.inner.lifecycle.lock().is_none() {
            return Err(PipelineError::Shutdown);
        }
        Ok(())
    }

    /// Queue a job; returns as soon as it is persisted
    pub async fn submit(&self, queue: &str, payload: JobPayload, options: JobOptions) -> PipelineResult<JobHandle> {
        self.ensure_running()?;
        self.inner.scheduler.enqueue(queue, payload, options).await
    }

    pub async fn get_status(&self, job_id: &JobId) -> PipelineResult<JobStatusView> {
        self.inner.scheduler.get_status(job_id).await
    }

    pub async fn cancel(&self, job_id: &JobId) -> PipelineResult<bool> {
        self.inner.scheduler.cancel(job_id).await
    }

    pub async fn list_jobs(&self, owner_id: &str) -> PipelineResult<Vec<JobStatusView>> {
        self.inner.scheduler.list_jobs(owner_id).await
    }

    pub async fn queue_stats(&self, queue: &str) -> PipelineResult<QueueStats> {
        self.inner.scheduler.queue_stats(queue).await
    }

    /// Events of `job_id` after `last_seen`.
    ///
    /// A running job is followed live until its terminal event. A terminal
    /// job always gets a finite replay; when its log lacks the closing event,
    /// one rebuilt from the stored outcome is published first.
    pub async fn subscribe(&self, job_id: &JobId, last_seen: Option<u64>) -> PipelineResult<EventStream> {
        let record = self.inner.store.get(job_id).await?;
        let last_seen = last_seen.unwrap_or(0);

        if !record.status.is_terminal() {
            self.inner.gateway.open(job_id);
            return self.inner.gateway.subscribe(job_id, last_seen).await;
        }

        let closed = self
            .inner
            .log
            .last_event(job_id)
            .await?
            .is_some_and(|last| last.is_terminal());
        if !closed {
            if let Some(event) = record.terminal_event() {
                if self.inner.gateway.publish_if_open(job_id, event).await? {
                    debug!(job_id = %job_id, status = %record.status, "closing event rebuilt from job record");
                }
            }
        }
        self.inner.gateway.replay(job_id, last_seen).await
    }

    /// Reconnecting client bound to this pipeline
    pub fn subscriber(&self, job_id: JobId) -> ReconnectingSubscriber {
        ReconnectingSubscriber::new(job_id, Arc::new(self.clone()))
    }

    pub async fn invalidate_cache(&self, key_or_pattern: &str) -> InvalidateReport {
        self.inner.cache.invalidate(key_or_pattern).await
    }

    pub async fn warm_cache(&self, entries: Vec<WarmEntry>) -> WarmReport {
        self.inner.cache.warm(entries).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop workers after their current job, then the background tasks.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) -> PipelineResult<()> {
        let lifecycle = self.inner.lifecycle.lock().take();
        let Some(lifecycle) = lifecycle else {
            return Ok(());
        };

        for pool in lifecycle.pools {
            pool.shutdown().await?;
        }

        let _ = lifecycle.background_tx.send(true);
        for task in lifecycle.background {
            if let Err(e) = task.await {
                warn!("background task ended abnormally: {}", e);
            }
        }

        info!("pipeline stopped");
        Ok(())
    }
}

/// Store-checked transport: unknown or purged jobs fail for good instead
/// of opening an empty stream
#[async_trait]
impl StreamTransport for PipelineHandle {
    async fn open(&self, job_id: &JobId, last_seen: Option<u64>) -> Result<FrameStream, StreamTransportError> {
        let events = self.subscribe(job_id, last_seen).await.map_err(StreamTransportError::from)?;
        Ok(into_frames(events))
    }
}
