use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use dog_pipeline::cache::CacheTier;
use dog_pipeline::config::{Backoff, PipelineConfig, QueueConfig, ReaperConfig};
use dog_pipeline::worker::{ArtifactGenerator, ProgressSender};
use dog_pipeline::{
    DocumentGeneration, EventKind, FactLearning, JobError, JobId, JobOptions, JobPayload, JobStatus, Phase,
    Pipeline, PipelineHandle, StreamEvent, SubscriberError,
};

/// Test factory functions
fn cover_letter(subject: &str) -> JobPayload {
    JobPayload::DocumentGeneration(DocumentGeneration {
        document_kind: "cover_letter".to_string(),
        subject_id: subject.to_string(),
        template: Some("formal".to_string()),
        inputs: json!({ "company": "Acme", "role": "Engineer" }),
    })
}

fn fact(user: &str) -> JobPayload {
    JobPayload::FactLearning(FactLearning {
        user_id: user.to_string(),
        source_text: "I speak Portuguese".to_string(),
    })
}

fn single_queue(queue: QueueConfig) -> PipelineConfig {
    PipelineConfig::empty().with_queue(queue.with_poll_interval(Duration::from_millis(10)))
}

async fn collect_events(handle: &PipelineHandle, job_id: &JobId) -> Vec<StreamEvent> {
    let stream = handle.subscribe(job_id, None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("Timeout waiting for terminal event")
}

async fn wait_for_status(handle: &PipelineHandle, job_id: &JobId, wanted: JobStatus) {
    for _ in 0..500 {
        if handle.get_status(job_id).await.unwrap().status == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", job_id, wanted);
}

/// Reports four phases and two sections, then returns a letter
struct LetterWriter {
    calls: AtomicUsize,
}

#[async_trait]
impl ArtifactGenerator for LetterWriter {
    async fn generate(&self, _payload: &JobPayload, progress: ProgressSender) -> Result<Value, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.phase(Phase::Initializing);
        progress.phase_with_percent(Phase::Generating, 50);
        progress.section(json!("Dear hiring manager,"))?;
        progress.section(json!("I would love to join Acme."))?;
        progress.phase(Phase::Formatting);
        progress.phase(Phase::Completed);
        Ok(json!({ "letter": "Dear hiring manager, I would love to join Acme." }))
    }
}

/// A1. Cache Miss Streams Progress Then Cache Hit Replays Result
#[tokio::test]
async fn test_cache_miss_then_cache_hit() {
    let writer = Arc::new(LetterWriter {
        calls: AtomicUsize::new(0),
    });
    let handle = Pipeline::new(single_queue(QueueConfig::new("generation")), writer.clone())
        .start()
        .unwrap();

    // Arrange: first submission
    let first = handle
        .submit("generation", cover_letter("app-1"), JobOptions::new())
        .await
        .unwrap();

    // Act: follow the stream to its end
    let events = collect_events(&handle, &first.job_id).await;

    // Assert: 4 progress + 2 section + complete, sequences 1..7
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=7).collect::<Vec<_>>());
    let count = |kind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::Progress), 4);
    assert_eq!(count(EventKind::Section), 2);
    assert_eq!(events[6].kind, EventKind::Complete);
    let result = events[6].data["result"].clone();

    // Act: identical request
    let second = handle
        .submit("generation", cover_letter("app-1"), JobOptions::new())
        .await
        .unwrap();
    let events = collect_events(&handle, &second.job_id).await;

    // Assert: a single cache-hit carrying the identical result
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::CacheHit);
    assert_eq!(events[0].sequence, 1);
    assert_eq!(events[0].data["result"], result);
    assert_eq!(writer.calls.load(Ordering::SeqCst), 1);

    wait_for_status(&handle, &second.job_id, JobStatus::Completed).await;
    let view = handle.get_status(&second.job_id).await.unwrap();
    assert_eq!(view.result.unwrap().cached_from, Some(CacheTier::L1));

    handle.shutdown().await.unwrap();
}

/// Sleeps while tracking how many calls overlap
struct SlowCounter {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ArtifactGenerator for SlowCounter {
    async fn generate(&self, payload: &JobPayload, _progress: ProgressSender) -> Result<Value, JobError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "class": payload.job_class() }))
    }
}

/// A2. Active Jobs Never Exceed Concurrency
#[tokio::test]
async fn test_concurrency_bound() {
    let generator = Arc::new(SlowCounter {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let handle = Pipeline::new(single_queue(QueueConfig::new("generation").with_concurrency(2)), generator.clone())
        .start()
        .unwrap();

    // Arrange: more distinct jobs than workers
    let mut jobs = Vec::new();
    for i in 0..8 {
        let job = handle
            .submit("generation", fact(&format!("user-{}", i)), JobOptions::new())
            .await
            .unwrap();
        jobs.push(job.job_id);
    }

    // Act
    for job_id in &jobs {
        wait_for_status(&handle, job_id, JobStatus::Completed).await;
    }

    // Assert
    assert!(generator.peak.load(Ordering::SeqCst) <= 2);
    let metrics = handle.metrics();
    let gauge = metrics.queues.iter().find(|q| q.queue == "generation").unwrap();
    assert!(gauge.peak <= 2);
    assert_eq!(metrics.jobs_completed, 8);

    handle.shutdown().await.unwrap();
}

struct AlwaysFails {
    terminal: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl ArtifactGenerator for AlwaysFails {
    async fn generate(&self, _payload: &JobPayload, _progress: ProgressSender) -> Result<Value, JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.terminal {
            Err(JobError::terminal("prompt rejected"))
        } else {
            Err(JobError::transient(format!("upstream timeout #{}", call)))
        }
    }
}

/// A3. Transient Errors Retry Until Attempts Are Exhausted
#[tokio::test]
async fn test_transient_errors_exhaust_attempts() {
    let generator = Arc::new(AlwaysFails {
        terminal: false,
        calls: AtomicUsize::new(0),
    });
    let queue = QueueConfig::new("generation")
        .with_attempts(3)
        .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(40)));
    let handle = Pipeline::new(single_queue(queue), generator.clone()).start().unwrap();

    // Act
    let job = handle
        .submit("generation", fact("user-1"), JobOptions::new())
        .await
        .unwrap();
    let events = collect_events(&handle, &job.job_id).await;

    // Assert: two retryable errors then a final one
    let retryable: Vec<Value> = events.iter().map(|e| e.data["retryable"].clone()).collect();
    assert_eq!(retryable, vec![json!(true), json!(true), json!(false)]);
    assert!(events.iter().all(|e| e.kind == EventKind::Error));

    wait_for_status(&handle, &job.job_id, JobStatus::Failed).await;
    let view = handle.get_status(&job.job_id).await.unwrap();
    assert_eq!(view.attempt, 3);
    assert_eq!(view.max_attempts, 3);
    assert_eq!(view.error.as_deref(), Some("upstream timeout #3"));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);

    handle.shutdown().await.unwrap();
}

/// A4. Terminal Error Fails Immediately
#[tokio::test]
async fn test_terminal_error_fails_immediately() {
    let generator = Arc::new(AlwaysFails {
        terminal: true,
        calls: AtomicUsize::new(0),
    });
    let handle = Pipeline::new(single_queue(QueueConfig::new("generation").with_attempts(5)), generator.clone())
        .start()
        .unwrap();

    let job = handle
        .submit("generation", fact("user-1"), JobOptions::new())
        .await
        .unwrap();
    let events = collect_events(&handle, &job.job_id).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["retryable"], json!(false));
    wait_for_status(&handle, &job.job_id, JobStatus::Failed).await;
    assert_eq!(handle.get_status(&job.job_id).await.unwrap().attempt, 1);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    handle.shutdown().await.unwrap();
}

/// Emits sections until cancelled
struct Endless;

#[async_trait]
impl ArtifactGenerator for Endless {
    async fn generate(&self, _payload: &JobPayload, progress: ProgressSender) -> Result<Value, JobError> {
        let mut index = 0;
        loop {
            progress.section(json!(index))?;
            index += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// A5. Cancelling An Active Job Stops It And Closes Its Stream
#[tokio::test]
async fn test_cancel_active_job() {
    let handle = Pipeline::new(single_queue(QueueConfig::new("generation")), Arc::new(Endless))
        .start()
        .unwrap();

    let job = handle
        .submit("generation", fact("user-1"), JobOptions::new())
        .await
        .unwrap();
    wait_for_status(&handle, &job.job_id, JobStatus::Active).await;

    // Act
    assert!(handle.cancel(&job.job_id).await.unwrap());

    // Assert: stream ends with a non-retryable cancellation error
    let events = collect_events(&handle, &job.job_id).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.data["message"], json!("job cancelled"));
    assert_eq!(last.data["retryable"], json!(false));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.get_status(&job.job_id).await.unwrap().status, JobStatus::Cancelled);
    assert!(!handle.cancel(&job.job_id).await.unwrap());

    handle.shutdown().await.unwrap();
}

/// Stalls on its first call past the lease
struct StallsOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl ArtifactGenerator for StallsOnce {
    async fn generate(&self, _payload: &JobPayload, _progress: ProgressSender) -> Result<Value, JobError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(json!("artifact"))
    }
}

/// A6. Expired Lease Is Reclaimed And Retried
#[tokio::test]
async fn test_expired_lease_is_retried() {
    let queue = QueueConfig::new("generation")
        .with_lease_duration(Duration::from_millis(50))
        .with_backoff(Backoff::new(Duration::from_millis(5), Duration::from_millis(5)));
    let mut config = single_queue(queue);
    config.reaper = ReaperConfig {
        interval: Duration::from_millis(20),
        cleanup_interval: Duration::from_secs(60),
    };
    let handle = Pipeline::new(config, Arc::new(StallsOnce { calls: AtomicUsize::new(0) }))
        .start()
        .unwrap();

    let job = handle
        .submit("generation", fact("user-1"), JobOptions::new())
        .await
        .unwrap();

    // Assert: a retryable lease error, then the late result served from cache
    let events = collect_events(&handle, &job.job_id).await;
    assert_eq!(events[0].kind, EventKind::Error);
    assert_eq!(events[0].data["message"], json!("lease expired"));
    assert_eq!(events[0].data["retryable"], json!(true));
    assert_eq!(events.last().unwrap().kind, EventKind::CacheHit);

    wait_for_status(&handle, &job.job_id, JobStatus::Completed).await;
    assert_eq!(handle.get_status(&job.job_id).await.unwrap().attempt, 2);
    assert!(handle.metrics().leases_reaped >= 1);

    handle.shutdown().await.unwrap();
}

/// A7. Idempotency Key Returns The Existing Job
#[tokio::test]
async fn test_idempotent_submission() {
    let handle = Pipeline::new(single_queue(QueueConfig::new("generation")), Arc::new(Endless))
        .start()
        .unwrap();

    let options = JobOptions::new().with_idempotency_key("letter-app-1");
    let first = handle
        .submit("generation", cover_letter("app-1"), options.clone())
        .await
        .unwrap();
    let second = handle
        .submit("generation", cover_letter("app-1"), options)
        .await
        .unwrap();

    assert!(first.accepted);
    assert!(!second.accepted);
    assert_eq!(first.job_id, second.job_id);

    handle.cancel(&first.job_id).await.unwrap();
    handle.shutdown().await.unwrap();
}

/// A8. Late Subscriber Replays A Finished Job
#[tokio::test]
async fn test_resubscribe_after_completion() {
    let handle = Pipeline::new(
        single_queue(QueueConfig::new("generation")),
        Arc::new(LetterWriter {
            calls: AtomicUsize::new(0),
        }),
    )
    .start()
    .unwrap();

    let job = handle
        .submit("generation", cover_letter("app-9"), JobOptions::new())
        .await
        .unwrap();
    wait_for_status(&handle, &job.job_id, JobStatus::Completed).await;

    let stream = handle.subscribe(&job.job_id, Some(5)).await.unwrap();
    let sequences: Vec<u64> = stream.map(|e| e.sequence).collect().await;
    assert_eq!(sequences, vec![6, 7]);

    handle.shutdown().await.unwrap();
}

/// A9. Finished Job Still Replays After Its Live Channel Is Pruned
#[tokio::test]
async fn test_subscribe_after_channel_pruned() {
    // Arrange: channels pruned as soon as they close, sweeper every 50ms
    let mut config = single_queue(QueueConfig::new("generation"));
    config.gateway.event_retention = Duration::ZERO;
    config.reaper = ReaperConfig {
        interval: Duration::from_secs(30),
        cleanup_interval: Duration::from_millis(50),
    };
    let handle = Pipeline::new(
        config,
        Arc::new(LetterWriter {
            calls: AtomicUsize::new(0),
        }),
    )
    .start()
    .unwrap();

    let job = handle
        .submit("generation", cover_letter("app-12"), JobOptions::new())
        .await
        .unwrap();
    let live = collect_events(&handle, &job.job_id).await;
    assert_eq!(live.len(), 7);

    // Act: several sweeps later
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.get_status(&job.job_id).await.unwrap().status, JobStatus::Completed);
    let replayed = collect_events(&handle, &job.job_id).await;

    // Assert: the same finite stream, terminal event last
    assert_eq!(replayed, live);
    assert_eq!(replayed.last().unwrap().kind, EventKind::Complete);

    handle.shutdown().await.unwrap();
}

/// A10. Unknown Job Ids Fail Instead Of Opening A Stream
#[tokio::test]
async fn test_subscribe_unknown_job() {
    let handle = Pipeline::new(
        single_queue(QueueConfig::new("generation")),
        Arc::new(LetterWriter {
            calls: AtomicUsize::new(0),
        }),
    )
    .start()
    .unwrap();
    let missing = JobId::from("does-not-exist");

    // Act + Assert: direct subscription
    let err = handle.subscribe(&missing, None).await.err().unwrap();
    assert!(err.is_not_found());

    // Act + Assert: the reconnecting client stops at once
    let mut subscriber = handle.subscriber(missing.clone());
    let outcome = tokio::time::timeout(Duration::from_secs(1), subscriber.next_event())
        .await
        .expect("subscriber for unknown job must return");
    assert_eq!(outcome.unwrap_err(), SubscriberError::JobNotFound(missing));

    handle.shutdown().await.unwrap();
}
