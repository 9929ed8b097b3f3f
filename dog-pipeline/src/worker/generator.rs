use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{JobError, JobId, JobPayload, Phase};

/// Progress reported by a generator while it runs
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationUpdate {
    Phase { phase: Phase, percent: Option<u8> },
    Section(Value),
}

/// External collaborator that produces the artifact.
///
/// Progress goes through `progress` as it happens; the worker turns each
/// update into a stream event. Return `JobError::Transient` for failures
/// worth retrying and `JobError::Terminal` for the rest.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, payload: &JobPayload, progress: ProgressSender) -> Result<Value, JobError>;
}

/// Cooperative cancellation flag shared between a job's worker and the scheduler
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Flags of jobs currently executing
#[derive(Debug, Default)]
pub struct CancelRegistry {
    flags: DashMap<JobId, CancellationFlag>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job for the lifetime of the returned guard
    pub fn register(self: &Arc<Self>, job_id: &JobId) -> CancelGuard {
        let flag = CancellationFlag::default();
        self.flags.insert(job_id.clone(), flag.clone());
        CancelGuard {
            registry: self.clone(),
            job_id: job_id.clone(),
            flag,
        }
    }

    /// Raise the flag of an executing job; false when it is not executing here
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.flags.get(job_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct CancelGuard {
    registry: Arc<CancelRegistry>,
    job_id: JobId,
    flag: CancellationFlag,
}

impl CancelGuard {
    pub fn flag(&self) -> &CancellationFlag {
        &self.flag
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.registry.flags.remove(&self.job_id);
    }
}

/// Handle given to a generator for reporting progress
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<GenerationUpdate>,
    cancelled: CancellationFlag,
}

impl ProgressSender {
    pub fn new(tx: mpsc::UnboundedSender<GenerationUpdate>, cancelled: CancellationFlag) -> Self {
        Self { tx, cancelled }
    }

    pub fn phase(&self, phase: Phase) {
        let _ = self.tx.send(GenerationUpdate::Phase { phase, percent: None });
    }

    pub fn phase_with_percent(&self, phase: Phase, percent: u8) {
        let _ = self.tx.send(GenerationUpdate::Phase {
            phase,
            percent: Some(percent),
        });
    }

    /// Emit one content unit. Fails once the job has been cancelled so the
    /// generator can stop early.
    pub fn section(&self, content: Value) -> Result<(), JobError> {
        if self.cancelled.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let _ = self.tx.send(GenerationUpdate::Section(content));
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }
}
