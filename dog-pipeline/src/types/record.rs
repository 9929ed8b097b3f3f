use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Fingerprint, JobId, JobPayload, LeaseToken, NewEvent};
use crate::cache::CacheTier;
use crate::config::Backoff;

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker (fresh submission or scheduled retry)
    Pending,

    /// Leased by a worker
    Active,

    /// Finished with a result
    Completed,

    /// Attempts exhausted or terminal error
    Failed,

    /// Cancelled before completion
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state (completed, failed, or cancelled)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result stored on a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// The artifact
    pub value: serde_json::Value,

    /// Tier that answered, when the artifact came from cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_from: Option<CacheTier>,

    /// Generation time the cache hit avoided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_ms: Option<u64>,
}

/// Job record - mutable runtime state stored by the job store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub queue: String,
    pub owner_id: String,
    pub payload: JobPayload,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,

    /// Number of times the job became active
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,

    pub result: Option<JobOutcome>,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Earliest time a worker may claim the job
    pub run_at: DateTime<Utc>,

    /// Current lease token (if active)
    pub lease_token: Option<LeaseToken>,

    /// When the current lease expires (if active)
    pub lease_until: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Closing stream event matching the stored outcome of a terminal job
    pub fn terminal_event(&self) -> Option<NewEvent> {
        match self.status {
            JobStatus::Completed => Some(match &self.result {
                Some(outcome) => match outcome.cached_from {
                    Some(tier) => NewEvent::cache_hit(outcome.value.clone(), tier.name(), outcome.saved_ms),
                    None => NewEvent::complete(outcome.value.clone()),
                },
                None => NewEvent::complete(serde_json::Value::Null),
            }),
            JobStatus::Failed => Some(NewEvent::error(
                self.error.as_deref().unwrap_or("job failed"),
                false,
                self.attempt,
            )),
            JobStatus::Cancelled => Some(NewEvent::error(crate::JobError::Cancelled.message(), false, self.attempt)),
            JobStatus::Pending | JobStatus::Active => None,
        }
    }

    /// Create a new pending job record
    pub fn new(
        queue: impl Into<String>,
        owner_id: impl Into<String>,
        payload: JobPayload,
        fingerprint: Fingerprint,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            queue: queue.into(),
            owner_id: owner_id.into(),
            payload,
            fingerprint,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts,
            backoff,
            result: None,
            error: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            run_at: now,
            lease_token: None,
            lease_until: None,
        }
    }

    /// Check if the job may be claimed at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Check if another attempt is allowed after the current one fails
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts && !self.status.is_terminal()
    }

    /// Check if the lease has expired
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.lease_until) {
            (JobStatus::Active, Some(lease_until)) => lease_until < now,
            _ => false,
        }
    }

    /// Start processing with a lease; counts as one attempt
    pub fn start_processing(&mut self, lease_token: LeaseToken, lease_until: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.lease_token = Some(lease_token);
        self.lease_until = Some(lease_until);
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Complete the job successfully
    pub fn complete(&mut self, outcome: JobOutcome) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.result = Some(outcome);
        self.completed_at = Some(now);
        self.clear_lease(now);
    }

    /// Fail the job permanently
    pub fn fail(&mut self, error: String) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.clear_lease(now);
    }

    /// Return the job to pending until `run_at`
    pub fn schedule_retry(&mut self, run_at: DateTime<Utc>, error: String) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.error = Some(error);
        self.run_at = run_at;
        self.clear_lease(now);
    }

    /// Cancel the job
    pub fn cancel(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.clear_lease(now);
    }

    fn clear_lease(&mut self, now: DateTime<Utc>) {
        self.lease_token = None;
        self.lease_until = None;
        self.updated_at = now;
    }

    /// Client-facing projection of the record
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id.clone(),
            queue: self.queue.clone(),
            status: self.status,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// A job that has been leased for processing
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The job record
    pub record: JobRecord,

    /// Lease token for acknowledgment
    pub lease_token: LeaseToken,

    /// When the lease expires
    pub lease_until: DateTime<Utc>,
}

impl LeasedJob {
    /// Get the job ID
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }
}

/// Answer to `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub queue: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Handle returned from submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: JobId,
    /// False when an idempotency key matched an existing job
    pub accepted: bool,
}
