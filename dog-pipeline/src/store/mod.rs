pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetentionPolicy;
use crate::{
    JobHandle, JobId, JobOutcome, JobRecord, JobStatus, LeaseToken, LeasedJob, NewEvent,
    PipelineResult, StreamEvent,
};

pub use memory::MemoryStore;

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to pending until `run_at`
    Retrying { run_at: DateTime<Utc> },
    /// Attempts exhausted or error not retryable
    Failed,
}

/// An expired lease returned by [`JobStore::reap_expired`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedLease {
    pub job_id: JobId,
    pub queue: String,
    pub attempt: u32,
    pub disposition: FailureDisposition,
}

/// Per-status job counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub(crate) fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Durable record of job lifecycle.
///
/// Acknowledgements follow cancel-wins semantics: once a job is cancelled,
/// `complete` and `release` from the worker that held its lease are rejected
/// with `JobCanceled`. A stale lease token is rejected with
/// `InvalidLeaseToken` so a reaped worker can never overwrite a newer attempt.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a pending job. With an idempotency key that matches a
    /// non-terminal job in the same queue, the existing id is returned instead.
    async fn insert(&self, record: JobRecord) -> PipelineResult<JobHandle>;

    async fn get(&self, job_id: &JobId) -> PipelineResult<JobRecord>;

    /// Atomically lease the oldest eligible job in `queue`
    async fn claim_next(&self, queue: &str, lease_duration: Duration) -> PipelineResult<Option<LeasedJob>>;

    async fn complete(&self, job_id: &JobId, lease: &LeaseToken, outcome: JobOutcome) -> PipelineResult<()>;

    /// Record a failed attempt. `retry_at` is `None` for non-retryable errors;
    /// the store fails the job regardless once attempts are exhausted.
    async fn release(
        &self,
        job_id: &JobId,
        lease: &LeaseToken,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> PipelineResult<FailureDisposition>;

    /// Cancel a non-terminal job. Returns its previous status, or `None` when
    /// the job had already reached a terminal state.
    async fn cancel(&self, job_id: &JobId) -> PipelineResult<Option<JobStatus>>;

    /// Whether the job has been cancelled
    async fn is_cancelled(&self, job_id: &JobId) -> PipelineResult<bool>;

    /// Return every active job whose lease expired before `now` to pending,
    /// or fail it when attempts are exhausted
    async fn reap_expired(&self, now: DateTime<Utc>) -> PipelineResult<Vec<ReapedLease>>;

    /// Delete terminal jobs of `queue` that fall outside `policy`
    async fn purge(&self, queue: &str, policy: &RetentionPolicy, now: DateTime<Utc>) -> PipelineResult<Vec<JobId>>;

    async fn list_by_owner(&self, owner_id: &str) -> PipelineResult<Vec<JobRecord>>;

    async fn queue_stats(&self, queue: &str) -> PipelineResult<QueueStats>;
}

/// Append-only per-job event log, the replay source for stream resumption
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event, assigning the next sequence (starting at 1)
    async fn append(&self, job_id: &JobId, event: NewEvent) -> PipelineResult<StreamEvent>;

    /// Events with sequence greater than `after`, in order
    async fn events_after(&self, job_id: &JobId, after: u64) -> PipelineResult<Vec<StreamEvent>>;

    /// Highest assigned sequence, 0 when the log is empty
    async fn last_sequence(&self, job_id: &JobId) -> PipelineResult<u64>;

    /// Most recent event, if any
    async fn last_event(&self, job_id: &JobId) -> PipelineResult<Option<StreamEvent>>;

    async fn remove(&self, job_id: &JobId) -> PipelineResult<()>;
}
