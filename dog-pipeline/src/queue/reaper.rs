use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::gateway::EventGateway;
use crate::observability::PipelineMetrics;
use crate::store::{FailureDisposition, JobStore};
use crate::{NewEvent, PipelineResult};

/// Error recorded on a job whose worker stopped renewing its lease
pub const LEASE_EXPIRED: &str = "lease expired";

/// Lease expiry reaper for reclaiming jobs of crashed or stuck workers
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    gateway: Arc<EventGateway>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateway: Arc<EventGateway>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            gateway,
            scheduler,
            metrics,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `shutdown` flips to true
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting lease reaper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.reap_once().await {
                Ok(0) => debug!("No expired leases found"),
                Ok(reclaimed) => info!("Reclaimed {} expired leases", reclaimed),
                Err(e) => warn!("Error during lease reaping: {}", e),
            }
        }

        debug!("lease reaper stopped");
    }

    /// Run one reaper cycle
    pub async fn reap_once(&self) -> PipelineResult<usize> {
        let reaped = self.store.reap_expired(Utc::now()).await?;

        for lease in &reaped {
            self.metrics.increment_leases_reaped();
            let retryable = match lease.disposition {
                FailureDisposition::Retrying { run_at } => {
                    self.metrics.increment_jobs_retried();
                    let delay = (run_at - Utc::now()).to_std().unwrap_or_default();
                    self.wake_after(&lease.queue, delay);
                    true
                }
                FailureDisposition::Failed => {
                    self.metrics.increment_jobs_failed();
                    false
                }
            };

            debug!(job_id = %lease.job_id, attempt = lease.attempt, retryable, "Reclaimed expired lease");
            if let Err(e) = self
                .gateway
                .publish(&lease.job_id, NewEvent::error(LEASE_EXPIRED, retryable, lease.attempt))
                .await
            {
                warn!(job_id = %lease.job_id, error = %e, "failed to publish lease expiry");
            }
        }

        Ok(reaped.len())
    }

    fn wake_after(&self, queue: &str, delay: Duration) {
        if delay.is_zero() {
            self.scheduler.notify(queue);
            return;
        }
        let scheduler = self.scheduler.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.notify(&queue);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, GatewayConfig, QueueConfig};
    use crate::store::MemoryStore;
    use crate::worker::CancelRegistry;
    use crate::{EventKind, JobRecord, JobStatus, RejectionAnalysis};
    use crate::JobPayload;
    use futures::StreamExt;
    use serde_json::json;
    use tracing_test::traced_test;

    fn setup() -> (LeaseReaper, Arc<MemoryStore>, Arc<EventGateway>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let gateway = Arc::new(EventGateway::new(store.clone(), GatewayConfig::default()));
        let mut scheduler = Scheduler::new(store.clone(), gateway.clone(), Arc::new(CancelRegistry::new()), metrics.clone());
        scheduler.add_queue(QueueConfig::new("q"));
        let reaper = LeaseReaper::new(store.clone(), gateway.clone(), Arc::new(scheduler), metrics);
        (reaper, store, gateway)
    }

    async fn leased_job(store: &MemoryStore, max_attempts: u32) -> crate::JobId {
        let payload = JobPayload::RejectionAnalysis(RejectionAnalysis {
            application_id: "a1".into(),
            rejection_text: "position filled".into(),
        });
        let fingerprint = payload.fingerprint().unwrap();
        let record = JobRecord::new("q", "owner", payload, fingerprint, max_attempts, Backoff::new(Duration::ZERO, Duration::ZERO));
        let job_id = store.insert(record).await.unwrap().job_id;
        store.claim_next("q", Duration::from_secs(30)).await.unwrap().unwrap();
        store.force_lease_expiry(&job_id);
        job_id
    }

    #[tokio::test]
    #[traced_test]
    async fn test_expired_lease_returns_to_pending() {
        let (reaper, store, gateway) = setup();
        let job_id = leased_job(&store, 3).await;

        assert_eq!(reaper.reap_once().await.unwrap(), 1);

        let record = store.get(&job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.error.as_deref(), Some(LEASE_EXPIRED));

        let events = gateway.replay(&job_id, 0).await.unwrap().collect::<Vec<_>>().await;
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(events[0].data["retryable"], json!(true));
        assert!(logs_contain("Reclaimed expired lease"));
    }

    #[tokio::test]
    async fn test_expired_lease_fails_when_exhausted() {
        let (reaper, store, gateway) = setup();
        let job_id = leased_job(&store, 1).await;

        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        assert_eq!(store.get(&job_id).await.unwrap().status, JobStatus::Failed);
        assert!(gateway.is_closed(&job_id));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (reaper, _, _) = setup();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(reaper.with_interval(Duration::from_millis(10)).start(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
