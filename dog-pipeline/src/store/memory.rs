use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{EventLog, FailureDisposition, JobStore, QueueStats, ReapedLease};
use crate::config::RetentionPolicy;
use crate::{
    JobHandle, JobId, JobOutcome, JobRecord, JobStatus, LeaseToken, LeasedJob, NewEvent,
    PipelineError, PipelineResult, StreamEvent,
};

#[derive(Default)]
struct StoreState {
    /// Job records indexed by job_id
    jobs: HashMap<JobId, JobRecord>,

    /// Pending index: queue name -> job ids in submission order
    queues: HashMap<String, VecDeque<JobId>>,

    /// Owner index: owner_id -> job ids in submission order
    owners: HashMap<String, Vec<JobId>>,

    /// Idempotency tracking: (queue, key) -> job_id
    idempotency: HashMap<(String, String), JobId>,
}

/// In-memory job store and event log for tests and single-process deployments.
///
/// All job mutations happen under one write lock, which makes `claim_next`
/// the atomic dequeue workers rely on.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    events: RwLock<HashMap<JobId, Vec<StreamEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: expire a job's lease immediately
    #[cfg(test)]
    pub(crate) fn force_lease_expiry(&self, job_id: &JobId) {
        let mut state = self.state.write();
        if let Some(record) = state.jobs.get_mut(job_id) {
            record.lease_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Lease checks shared by `complete` and `release`, in cancel-wins order
fn check_lease(record: &JobRecord, lease: &LeaseToken, now: DateTime<Utc>) -> PipelineResult<()> {
    match record.status {
        JobStatus::Cancelled => return Err(PipelineError::JobCanceled),
        JobStatus::Completed | JobStatus::Failed => return Err(PipelineError::JobAlreadyTerminal),
        _ => {}
    }

    if record.lease_token.as_ref() != Some(lease) {
        return Err(PipelineError::InvalidLeaseToken);
    }

    if let Some(lease_until) = record.lease_until {
        if now > lease_until {
            return Err(PipelineError::LeaseExpired);
        }
    }

    Ok(())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, record: JobRecord) -> PipelineResult<JobHandle> {
        let mut state = self.state.write();

        // Check idempotency if key provided
        if let Some(key) = &record.idempotency_key {
            let scope = (record.queue.clone(), key.clone());
            if let Some(existing_id) = state.idempotency.get(&scope) {
                if let Some(existing) = state.jobs.get(existing_id) {
                    if !existing.status.is_terminal() {
                        return Ok(JobHandle {
                            job_id: existing_id.clone(),
                            accepted: false,
                        });
                    }
                }
            }
            state.idempotency.insert(scope, record.job_id.clone());
        }

        let job_id = record.job_id.clone();
        state
            .queues
            .entry(record.queue.clone())
            .or_default()
            .push_back(job_id.clone());
        state
            .owners
            .entry(record.owner_id.clone())
            .or_default()
            .push(job_id.clone());
        state.jobs.insert(job_id.clone(), record);

        Ok(JobHandle { job_id, accepted: true })
    }

    async fn get(&self, job_id: &JobId) -> PipelineResult<JobRecord> {
        self.state
            .read()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    async fn claim_next(&self, queue: &str, lease_duration: Duration) -> PipelineResult<Option<LeasedJob>> {
        let now = Utc::now();
        let mut guard = self.state.write();
        let StoreState { jobs, queues, .. } = &mut *guard;

        let Some(pending) = queues.get_mut(queue) else {
            return Ok(None);
        };

        // Drop index entries that are no longer pending (cancelled while queued)
        pending.retain(|job_id| {
            jobs.get(job_id)
                .map(|record| record.status == JobStatus::Pending)
                .unwrap_or(false)
        });

        let position = pending
            .iter()
            .position(|job_id| jobs.get(job_id).map(|r| r.is_eligible(now)).unwrap_or(false));

        let Some(job_id) = position.and_then(|index| pending.remove(index)) else {
            return Ok(None);
        };

        let Some(record) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let lease_token = LeaseToken::new();
        let lease_until = now + chrono_duration(lease_duration);
        record.start_processing(lease_token.clone(), lease_until);

        Ok(Some(LeasedJob {
            record: record.clone(),
            lease_token,
            lease_until,
        }))
    }

    async fn complete(&self, job_id: &JobId, lease: &LeaseToken, outcome: JobOutcome) -> PipelineResult<()> {
        let now = Utc::now();
        let mut state = self.state.write();
        let record = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        check_lease(record, lease, now)?;
        record.complete(outcome);
        Ok(())
    }

    async fn release(
        &self,
        job_id: &JobId,
        lease: &LeaseToken,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> PipelineResult<FailureDisposition> {
        let now = Utc::now();
        let mut guard = self.state.write();
        let StoreState { jobs, queues, .. } = &mut *guard;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        check_lease(record, lease, now)?;

        match retry_at {
            Some(run_at) if record.can_retry() => {
                record.schedule_retry(run_at, error);
                queues
                    .entry(record.queue.clone())
                    .or_default()
                    .push_back(job_id.clone());
                Ok(FailureDisposition::Retrying { run_at })
            }
            _ => {
                record.fail(error);
                Ok(FailureDisposition::Failed)
            }
        }
    }

    async fn cancel(&self, job_id: &JobId) -> PipelineResult<Option<JobStatus>> {
        let mut state = self.state.write();
        let record = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        if record.status.is_terminal() {
            return Ok(None);
        }

        let previous = record.status;
        record.cancel();
        Ok(Some(previous))
    }

    async fn is_cancelled(&self, job_id: &JobId) -> PipelineResult<bool> {
        self.state
            .read()
            .jobs
            .get(job_id)
            .map(|record| record.status == JobStatus::Cancelled)
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> PipelineResult<Vec<ReapedLease>> {
        let mut guard = self.state.write();
        let StoreState { jobs, queues, .. } = &mut *guard;
        let mut reaped = Vec::new();

        for record in jobs.values_mut().filter(|record| record.lease_expired(now)) {
            let disposition = if record.can_retry() {
                let run_at = now + chrono_duration(record.backoff.delay_for_attempt(record.attempt));
                record.schedule_retry(run_at, "lease expired".to_string());
                queues
                    .entry(record.queue.clone())
                    .or_default()
                    .push_back(record.job_id.clone());
                FailureDisposition::Retrying { run_at }
            } else {
                record.fail("lease expired".to_string());
                FailureDisposition::Failed
            };

            reaped.push(ReapedLease {
                job_id: record.job_id.clone(),
                queue: record.queue.clone(),
                attempt: record.attempt,
                disposition,
            });
        }

        Ok(reaped)
    }

    async fn purge(&self, queue: &str, policy: &RetentionPolicy, now: DateTime<Utc>) -> PipelineResult<Vec<JobId>> {
        let mut state = self.state.write();
        let mut purged = Vec::new();
        let mut completed: Vec<(DateTime<Utc>, JobId)> = Vec::new();

        for record in state.jobs.values().filter(|r| r.queue == queue) {
            let finished = record.completed_at.unwrap_or(record.updated_at);
            match record.status {
                JobStatus::Completed => {
                    if finished + chrono_duration(policy.completed_age) < now {
                        purged.push(record.job_id.clone());
                    } else {
                        completed.push((finished, record.job_id.clone()));
                    }
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    if finished + chrono_duration(policy.failed_age) < now {
                        purged.push(record.job_id.clone());
                    }
                }
                _ => {}
            }
        }

        if completed.len() > policy.completed_count {
            completed.sort();
            let excess = completed.len() - policy.completed_count;
            purged.extend(completed.into_iter().take(excess).map(|(_, id)| id));
        }

        for job_id in &purged {
            if let Some(record) = state.jobs.remove(job_id) {
                if let Some(ids) = state.owners.get_mut(&record.owner_id) {
                    ids.retain(|id| id != job_id);
                    if ids.is_empty() {
                        state.owners.remove(&record.owner_id);
                    }
                }
                if let Some(key) = record.idempotency_key {
                    let scope = (record.queue, key);
                    if state.idempotency.get(&scope) == Some(job_id) {
                        state.idempotency.remove(&scope);
                    }
                }
            }
        }

        if !purged.is_empty() {
            debug!(queue, count = purged.len(), "purged terminal jobs");
        }
        Ok(purged)
    }

    async fn list_by_owner(&self, owner_id: &str) -> PipelineResult<Vec<JobRecord>> {
        let state = self.state.read();
        Ok(state
            .owners
            .get(owner_id)
            .map(|ids| ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn queue_stats(&self, queue: &str) -> PipelineResult<QueueStats> {
        let state = self.state.read();
        let mut stats = QueueStats::default();
        for record in state.jobs.values().filter(|r| r.queue == queue) {
            stats.count(record.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, job_id: &JobId, event: NewEvent) -> PipelineResult<StreamEvent> {
        let mut events = self.events.write();
        let log = events.entry(job_id.clone()).or_default();
        let sequence = log.last().map(|e| e.sequence).unwrap_or(0) + 1;
        let event = StreamEvent::new(job_id.clone(), sequence, event);
        log.push(event.clone());
        Ok(event)
    }

    async fn events_after(&self, job_id: &JobId, after: u64) -> PipelineResult<Vec<StreamEvent>> {
        let events = self.events.read();
        Ok(events
            .get(job_id)
            .map(|log| {
                let start = log.partition_point(|e| e.sequence <= after);
                log[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn last_sequence(&self, job_id: &JobId) -> PipelineResult<u64> {
        let events = self.events.read();
        Ok(events
            .get(job_id)
            .and_then(|log| log.last())
            .map(|e| e.sequence)
            .unwrap_or(0))
    }

    async fn last_event(&self, job_id: &JobId) -> PipelineResult<Option<StreamEvent>> {
        let events = self.events.read();
        Ok(events.get(job_id).and_then(|log| log.last()).cloned())
    }

    async fn remove(&self, job_id: &JobId) -> PipelineResult<()> {
        self.events.write().remove(job_id);
        Ok(())
    }
}
