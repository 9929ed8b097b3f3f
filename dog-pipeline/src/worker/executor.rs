use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::generator::{ArtifactGenerator, CancelRegistry, CancellationFlag, GenerationUpdate, ProgressSender};
use crate::cache::{CacheLookup, CacheOptions, TieredCache};
use crate::gateway::EventGateway;
use crate::observability::PipelineMetrics;
use crate::store::{FailureDisposition, JobStore};
use crate::{JobError, JobId, JobOutcome, JobRecord, LeasedJob, NewEvent, PipelineError};

/// How one execution ended, as seen by the worker loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed,
    /// Served from cache without generating
    CacheHit,
    /// Back to pending; eligible again after `delay`
    Retrying { delay: Duration },
    Failed,
    Cancelled,
    /// The store rejected our acknowledgement (stale lease, already terminal)
    Abandoned,
}

/// Runs a single leased job end to end
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    cache: Arc<TieredCache>,
    gateway: Arc<EventGateway>,
    generator: Arc<dyn ArtifactGenerator>,
    cancels: Arc<CancelRegistry>,
    metrics: Arc<PipelineMetrics>,
    cache_options: CacheOptions,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: Arc<TieredCache>,
        gateway: Arc<EventGateway>,
        generator: Arc<dyn ArtifactGenerator>,
        cancels: Arc<CancelRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            cache,
            gateway,
            generator,
            cancels,
            metrics,
            cache_options: CacheOptions::default(),
        }
    }

    pub fn with_cache_options(mut self, options: CacheOptions) -> Self {
        self.cache_options = options;
        self
    }

    #[instrument(skip(self, leased), fields(job_id = %leased.record.job_id, attempt = leased.record.attempt))]
    pub async fn execute(&self, leased: LeasedJob) -> ExecutionResult {
        let job_id = leased.record.job_id.clone();
        let guard = self.cancels.register(&job_id);
        let cancel = guard.flag().clone();

        // Cancelled between claim and registration
        if matches!(self.store.is_cancelled(&job_id).await, Ok(true)) {
            return ExecutionResult::Cancelled;
        }

        let lookup = self.run_generation(&job_id, &leased.record, &cancel).await;
        let result = match lookup {
            Ok(lookup) => self.finish_success(&leased, lookup, &cancel).await,
            Err(err) => self.finish_failure(&leased, err).await,
        };
        drop(guard);
        result
    }

    /// Cache lookup, or generation with progress relayed as stream events
    async fn run_generation(
        &self,
        job_id: &JobId,
        record: &JobRecord,
        cancel: &CancellationFlag,
    ) -> Result<CacheLookup, JobError> {
        let key = record.fingerprint.as_str();
        self.cache
            .get_or_compute(key, self.cache_options, || async move {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let progress = ProgressSender::new(tx, cancel.clone());
                let call = AssertUnwindSafe(self.generator.generate(&record.payload, progress)).catch_unwind();
                tokio::pin!(call);

                let mut sections = 0usize;
                let outcome = loop {
                    tokio::select! {
                        biased;
                        Some(update) = rx.recv() => {
                            if let Err(err) = self.relay(job_id, update, &mut sections, cancel).await {
                                break Ok(Err(err));
                            }
                        }
                        outcome = &mut call => break outcome,
                    }
                };

                // Updates sent right before the generator returned
                while let Ok(update) = rx.try_recv() {
                    self.relay(job_id, update, &mut sections, cancel).await?;
                }

                match outcome {
                    Ok(result) => result,
                    Err(panic) => Err(JobError::transient(format!(
                        "generator panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            })
            .await
    }

    async fn relay(
        &self,
        job_id: &JobId,
        update: GenerationUpdate,
        sections: &mut usize,
        cancel: &CancellationFlag,
    ) -> Result<(), JobError> {
        let event = match update {
            GenerationUpdate::Phase { phase, percent } => NewEvent::progress(phase, percent),
            GenerationUpdate::Section(content) => {
                if cancel.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                let event = NewEvent::section(*sections, content);
                *sections += 1;
                event
            }
        };
        match self.gateway.publish(job_id, event).await {
            Ok(_) => Ok(()),
            // Closed by a cancellation
            Err(PipelineError::JobAlreadyTerminal) => Err(JobError::Cancelled),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to publish progress event");
                Ok(())
            }
        }
    }

    async fn finish_success(&self, leased: &LeasedJob, lookup: CacheLookup, cancel: &CancellationFlag) -> ExecutionResult {
        let job_id = leased.job_id();
        if cancel.is_cancelled() {
            info!(job_id = %job_id, "job cancelled before persisting result");
            return ExecutionResult::Cancelled;
        }

        let cached = lookup.tier.is_cached();
        let outcome = JobOutcome {
            value: lookup.value.clone(),
            cached_from: cached.then_some(lookup.tier),
            saved_ms: cached.then_some(lookup.compute_ms),
        };

        if let Err(err) = self.store.complete(job_id, &leased.lease_token, outcome).await {
            return self.rejected(job_id, err);
        }

        let event = if cached {
            NewEvent::cache_hit(lookup.value, lookup.tier.name(), Some(lookup.compute_ms))
        } else {
            NewEvent::complete(lookup.value)
        };
        if let Err(err) = self.gateway.publish(job_id, event).await {
            warn!(job_id = %job_id, error = %err, "failed to publish completion event");
        }

        self.metrics.increment_jobs_completed();
        if cached {
            info!(job_id = %job_id, tier = lookup.tier.name(), "job served from cache");
            ExecutionResult::CacheHit
        } else {
            info!(job_id = %job_id, "job completed");
            ExecutionResult::Completed
        }
    }

    async fn finish_failure(&self, leased: &LeasedJob, err: JobError) -> ExecutionResult {
        let job_id = leased.job_id();
        let record = &leased.record;

        if err == JobError::Cancelled && matches!(self.store.is_cancelled(job_id).await, Ok(true)) {
            info!(job_id = %job_id, "job observed cancellation");
            return ExecutionResult::Cancelled;
        }

        let delay = record.backoff.delay_for_attempt(record.attempt);
        let retry_at = (err.is_retryable() && record.attempt < record.max_attempts)
            .then(|| Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));

        let disposition = match self
            .store
            .release(job_id, &leased.lease_token, err.message().to_string(), retry_at)
            .await
        {
            Ok(disposition) => disposition,
            Err(rejected) => return self.rejected(job_id, rejected),
        };

        let retrying = matches!(disposition, FailureDisposition::Retrying { .. });
        let event = NewEvent::error(err.message(), retrying, record.attempt);
        if let Err(publish_err) = self.gateway.publish(job_id, event).await {
            warn!(job_id = %job_id, error = %publish_err, "failed to publish error event");
        }

        if retrying {
            self.metrics.increment_jobs_retried();
            warn!(job_id = %job_id, error = %err, ?delay, "job failed, will retry");
            ExecutionResult::Retrying { delay }
        } else {
            self.metrics.increment_jobs_failed();
            error!(job_id = %job_id, error = %err, attempts = record.attempt, "job failed permanently");
            ExecutionResult::Failed
        }
    }

    fn rejected(&self, job_id: &JobId, err: PipelineError) -> ExecutionResult {
        match err {
            PipelineError::JobCanceled => {
                info!(job_id = %job_id, "job was cancelled while running");
                ExecutionResult::Cancelled
            }
            other => {
                debug!(job_id = %job_id, error = %other, "acknowledgement rejected");
                ExecutionResult::Abandoned
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
