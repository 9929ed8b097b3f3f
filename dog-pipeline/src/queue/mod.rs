//! Named queues: admission, cancellation and inspection.
//!
//! The [`Scheduler`] is the write side facing callers. Workers never go
//! through it; they claim straight from the [`JobStore`].

pub mod reaper;
pub mod retention;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::config::{Backoff, QueueConfig};
use crate::gateway::EventGateway;
use crate::observability::PipelineMetrics;
use crate::store::{JobStore, QueueStats};
use crate::worker::CancelRegistry;
use crate::{JobError, JobHandle, JobId, JobPayload, JobRecord, JobStatus, JobStatusView, NewEvent, PipelineError, PipelineResult};

pub use reaper::LeaseReaper;
pub use retention::RetentionSweeper;

/// Owner recorded when a submission names none
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// Per-submission overrides of the queue defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    /// Hold the job back for this long before it becomes claimable
    #[serde(default, with = "crate::cache::optional_secs")]
    pub delay: Option<Duration>,
    pub owner_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

struct QueueSlot {
    config: QueueConfig,
    notify: Arc<Notify>,
}

/// Submission, cancellation and inspection across all configured queues
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    gateway: Arc<EventGateway>,
    queues: HashMap<String, QueueSlot>,
    cancels: Arc<CancelRegistry>,
    metrics: Arc<PipelineMetrics>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateway: Arc<EventGateway>,
        cancels: Arc<CancelRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            gateway,
            queues: HashMap::new(),
            cancels,
            metrics,
        }
    }

    /// Register a queue; returns the wake-up handle its workers wait on
    pub fn add_queue(&mut self, config: QueueConfig) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.queues.insert(
            config.name.clone(),
            QueueSlot {
                config,
                notify: notify.clone(),
            },
        );
        notify
    }

    pub fn queue_config(&self, queue: &str) -> Option<&QueueConfig> {
        self.queues.get(queue).map(|slot| &slot.config)
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Wake one idle worker of `queue`
    pub fn notify(&self, queue: &str) {
        if let Some(slot) = self.queues.get(queue) {
            slot.notify.notify_one();
        }
    }

    fn slot(&self, queue: &str) -> PipelineResult<&QueueSlot> {
        self.queues
            .get(queue)
            .ok_or_else(|| PipelineError::QueueNotFound(queue.to_string()))
    }

    /// Persist a pending job and wake the queue
    #[instrument(skip(self, payload, options), fields(job_class = payload.job_class()))]
    pub async fn enqueue(&self, queue: &str, payload: JobPayload, options: JobOptions) -> PipelineResult<JobHandle> {
        let slot = self.slot(queue)?;
        payload.validate()?;
        let fingerprint = payload.fingerprint()?;

        let defaults = &slot.config.default_job_options;
        let attempts = options.attempts.unwrap_or(defaults.attempts);
        if attempts == 0 {
            return Err(PipelineError::validation("attempts must be at least 1"));
        }
        let backoff = options.backoff.unwrap_or(defaults.backoff);
        let owner = options.owner_id.unwrap_or_else(|| ANONYMOUS_OWNER.to_string());

        let mut record = JobRecord::new(queue, owner, payload, fingerprint, attempts, backoff);
        record.idempotency_key = options.idempotency_key;
        if let Some(delay) = options.delay {
            let delay = chrono::Duration::from_std(delay)
                .map_err(|_| PipelineError::validation("delay out of range"))?;
            record.run_at = Utc::now() + delay;
        }

        let handle = self.store.insert(record).await?;
        self.gateway.open(&handle.job_id);
        if handle.accepted {
            self.metrics.increment_jobs_submitted();
            slot.notify.notify_one();
            if let Some(delay) = options.delay {
                let notify = slot.notify.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    notify.notify_one();
                });
            }
            info!(job_id = %handle.job_id, queue = %queue, "Enqueued job");
        } else {
            debug!(job_id = %handle.job_id, queue = %queue, "idempotency key matched existing job");
        }
        Ok(handle)
    }

    /// Cancel a job. False when it had already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &JobId) -> PipelineResult<bool> {
        let Some(previous) = self.store.cancel(job_id).await? else {
            return Ok(false);
        };

        if previous == JobStatus::Active && !self.cancels.cancel(job_id) {
            debug!(job_id = %job_id, "active job not executing in this process");
        }

        let attempt = self.store.get(job_id).await.map(|r| r.attempt).unwrap_or_default();
        if let Err(err) = self
            .gateway
            .publish(job_id, NewEvent::error(JobError::Cancelled.message(), false, attempt))
            .await
        {
            warn!(job_id = %job_id, error = %err, "failed to publish cancellation event");
        }

        self.metrics.increment_jobs_cancelled();
        info!(job_id = %job_id, previous = %previous, "Cancelled job");
        Ok(true)
    }

    pub async fn get_status(&self, job_id: &JobId) -> PipelineResult<JobStatusView> {
        Ok(self.store.get(job_id).await?.status_view())
    }

    /// Jobs submitted by `owner_id`, oldest first
    pub async fn list_jobs(&self, owner_id: &str) -> PipelineResult<Vec<JobStatusView>> {
        let mut records = self.store.list_by_owner(owner_id).await?;
        records.sort_by_key(|record| record.created_at);
        Ok(records.iter().map(JobRecord::status_view).collect())
    }

    pub async fn queue_stats(&self, queue: &str) -> PipelineResult<QueueStats> {
        self.slot(queue)?;
        self.store.queue_stats(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::store::MemoryStore;
    use crate::{DocumentGeneration, EventKind};
    use futures::StreamExt;
    use serde_json::json;

    fn scheduler() -> (Scheduler, Arc<MemoryStore>, Arc<EventGateway>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(EventGateway::new(store.clone(), GatewayConfig::default()));
        let mut scheduler = Scheduler::new(
            store.clone(),
            gateway.clone(),
            Arc::new(CancelRegistry::new()),
            Arc::new(PipelineMetrics::new()),
        );
        scheduler.add_queue(QueueConfig::new("generation").with_attempts(5));
        (scheduler, store, gateway)
    }

    fn document() -> JobPayload {
        JobPayload::DocumentGeneration(DocumentGeneration {
            document_kind: "cover_letter".into(),
            subject_id: "app-1".into(),
            template: None,
            inputs: json!({ "company": "Acme" }),
        })
    }

    #[tokio::test]
    async fn test_enqueue_applies_queue_defaults() {
        let (scheduler, store, _) = scheduler();
        let handle = scheduler
            .enqueue("generation", document(), JobOptions::new())
            .await
            .unwrap();
        assert!(handle.accepted);

        let record = store.get(&handle.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.max_attempts, 5);
        assert_eq!(record.owner_id, ANONYMOUS_OWNER);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_queue() {
        let (scheduler, _, _) = scheduler();
        let err = scheduler
            .enqueue("missing", document(), JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QueueNotFound(q) if q == "missing"));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let (scheduler, _, _) = scheduler();
        let payload = JobPayload::DocumentGeneration(DocumentGeneration {
            document_kind: String::new(),
            subject_id: "app-1".into(),
            template: None,
            inputs: json!({}),
        });
        let err = scheduler
            .enqueue("generation", payload, JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delay_defers_run_at() {
        let (scheduler, store, _) = scheduler();
        let handle = scheduler
            .enqueue("generation", document(), JobOptions::new().with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
        let record = store.get(&handle.job_id).await.unwrap();
        assert!(record.run_at > Utc::now() + chrono::Duration::seconds(30));
        assert!(store
            .claim_next("generation", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_closes_stream() {
        let (scheduler, _, gateway) = scheduler();
        let handle = scheduler
            .enqueue("generation", document(), JobOptions::new())
            .await
            .unwrap();

        assert!(scheduler.cancel(&handle.job_id).await.unwrap());
        assert!(!scheduler.cancel(&handle.job_id).await.unwrap());

        let view = scheduler.get_status(&handle.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);

        let events: Vec<_> = gateway.subscribe(&handle.job_id, 0).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(events[0].data["retryable"], json!(false));
    }

    #[tokio::test]
    async fn test_list_jobs_by_owner() {
        let (scheduler, _, _) = scheduler();
        let mine = scheduler
            .enqueue("generation", document(), JobOptions::new().with_owner("alice"))
            .await
            .unwrap();
        scheduler
            .enqueue("generation", document(), JobOptions::new().with_owner("bob"))
            .await
            .unwrap();

        let jobs = scheduler.list_jobs("alice").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, mine.job_id);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let (scheduler, _, _) = scheduler();
        scheduler
            .enqueue("generation", document(), JobOptions::new())
            .await
            .unwrap();
        let stats = scheduler.queue_stats("generation").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert!(scheduler.queue_stats("nope").await.unwrap_err().is_not_found());
    }
}
