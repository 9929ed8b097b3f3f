//! # dog-pipeline: Asynchronous Artifact Generation
//!
//! **Durable jobs, bounded workers, tiered caching and resumable event streams**
//!
//! Callers submit a [`JobPayload`] to a named queue and get a job id back at
//! once. A per-queue worker pool leases the job, answers it from the cache
//! when the same request was generated recently, and otherwise runs the
//! [`ArtifactGenerator`](worker::ArtifactGenerator) while relaying its
//! progress as sequenced stream events.
//!
//! ## Guarantees
//!
//! - **Leases**: claims are atomic; a crashed worker's lease expires and the
//!   job is retried or failed by the reaper. Cancel wins over late completion.
//! - **Bounded execution**: active jobs per queue never exceed its concurrency;
//!   dequeues respect a sliding-window rate limit.
//! - **Cache tiers**: L1 in-process LRU, L2 distributed, L3 compute, with at
//!   most one concurrent build per key. L2 outages degrade, never fail.
//! - **Streams**: per-job sequences start at 1 with no gaps; resubscribing
//!   with the last seen sequence never re-delivers it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_pipeline::prelude::*;
//! use serde_json::{json, Value};
//!
//! struct Writer;
//!
//! #[async_trait]
//! impl ArtifactGenerator for Writer {
//!     async fn generate(&self, _payload: &JobPayload, progress: ProgressSender) -> Result<Value, JobError> {
//!         progress.phase(Phase::Generating);
//!         progress.section(json!("Dear hiring manager,"))?;
//!         Ok(json!({ "letter": "Dear hiring manager," }))
//!     }
//! }
//!
//! # async fn run() -> PipelineResult<()> {
//! let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(Writer)).start()?;
//!
//! let payload = JobPayload::FactLearning(FactLearning {
//!     user_id: "user-1".into(),
//!     source_text: "I moved to Lisbon last year".into(),
//! });
//! let job = pipeline.submit("lightweight", payload, JobOptions::new()).await?;
//! let mut events = pipeline.subscribe(&job.job_id, None).await?;
//! while let Some(event) = events.next().await {
//!     println!("{} {}", event.sequence, event.kind);
//! }
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(feature = "http")]
pub mod http;

pub use error::{CacheTierError, JobError, PipelineError, PipelineResult, StreamTransportError};
pub use types::{
    BatchApiCall, DocumentGeneration, EventKind, FactLearning, Fingerprint, JobHandle, JobId, JobOutcome,
    JobPayload, JobRecord, JobStatus, JobStatusView, LeaseToken, LeasedJob, NewEvent, Phase, RejectionAnalysis,
    StreamEvent,
};

pub use cache::{CacheTier, TieredCache};
pub use client::{ReconnectPolicy, ReconnectingSubscriber, SubscriberError};
pub use config::PipelineConfig;
pub use gateway::EventGateway;
pub use pipeline::{Pipeline, PipelineHandle};
pub use queue::{JobOptions, Scheduler};
pub use store::{EventLog, JobStore, MemoryStore};

#[cfg(feature = "redis")]
pub use cache::RedisCache;

/// Everything needed to run a pipeline and implement a generator
pub mod prelude {
    pub use crate::{
        JobError, JobHandle, JobId, JobOptions, JobPayload, JobStatus, Phase, Pipeline, PipelineConfig,
        PipelineError, PipelineHandle, PipelineResult, StreamEvent,
    };

    pub use crate::{BatchApiCall, DocumentGeneration, FactLearning, RejectionAnalysis};

    pub use crate::worker::{ArtifactGenerator, ProgressSender};

    pub use async_trait::async_trait;
    pub use futures::StreamExt;
}
