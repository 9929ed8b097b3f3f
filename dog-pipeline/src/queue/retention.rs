use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::gateway::EventGateway;
use crate::store::{EventLog, JobStore};
use crate::PipelineResult;

/// Periodic purge of terminal jobs and their event logs
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    log: Arc<dyn EventLog>,
    gateway: Arc<EventGateway>,
    scheduler: Arc<Scheduler>,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        log: Arc<dyn EventLog>,
        gateway: Arc<EventGateway>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            log,
            gateway,
            scheduler,
            interval: Duration::from_secs(300),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn start(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "retention sweep finished"),
                Err(e) => warn!("Error during retention sweep: {}", e),
            }
        }

        debug!("retention sweeper stopped");
    }

    /// Purge every queue against its retention policy as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let mut total = 0;
        let queues: Vec<String> = self.scheduler.queue_names().map(str::to_string).collect();

        for queue in queues {
            let Some(config) = self.scheduler.queue_config(&queue) else {
                continue;
            };
            let policy = config.default_job_options.retention;
            let purged = self.store.purge(&queue, &policy, now).await?;
            for job_id in &purged {
                self.gateway.forget(job_id);
                self.log.remove(job_id).await?;
            }
            total += purged.len();
        }

        self.gateway.prune();
        Ok(total)
    }
}
