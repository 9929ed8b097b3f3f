use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use dog_pipeline::client::{
    Clock, ConnectionState, FrameStream, GatewayTransport, ReconnectingSubscriber, StreamTransport,
    SubscriberError,
};
use dog_pipeline::config::GatewayConfig;
use dog_pipeline::gateway::{EventGateway, Frame};
use dog_pipeline::{JobId, MemoryStore, NewEvent, Phase, StreamEvent, StreamTransportError};

/// Records requested delays without sleeping
#[derive(Default)]
struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

impl RecordingClock {
    fn secs(&self) -> Vec<u64> {
        self.sleeps.lock().iter().map(|d| d.as_secs()).collect()
    }
}

/// One scripted connection: a refusal, an unknown job, or a batch of frames followed by a drop
enum Session {
    Refuse,
    Missing,
    Deliver(Vec<Frame>),
}

#[derive(Default)]
struct ScriptedTransport {
    sessions: Mutex<VecDeque<Session>>,
    opened_with: Mutex<Vec<Option<u64>>>,
}

impl ScriptedTransport {
    fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            opened_with: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, _job_id: &JobId, last_seen: Option<u64>) -> Result<FrameStream, StreamTransportError> {
        self.opened_with.lock().push(last_seen);
        match self.sessions.lock().pop_front() {
            Some(Session::Deliver(frames)) => Ok(Box::pin(futures::stream::iter(frames.into_iter().map(Ok)))),
            Some(Session::Missing) => Err(StreamTransportError::JobNotFound("job-1".to_string())),
            Some(Session::Refuse) | None => Err(StreamTransportError::Connect("connection refused".to_string())),
        }
    }
}

/// Test factory functions
fn job() -> JobId {
    JobId::from("job-1")
}

fn frame(sequence: u64) -> Frame {
    let event = if sequence == 6 {
        NewEvent::complete(json!("done"))
    } else {
        NewEvent::section(sequence as usize, json!(sequence))
    };
    Frame::from_event(&StreamEvent::new(job(), sequence, event)).unwrap()
}

fn heartbeat(last: u64) -> Frame {
    Frame::from_event(&StreamEvent::heartbeat(job(), last)).unwrap()
}

async fn drain(subscriber: &mut ReconnectingSubscriber) -> Result<Vec<u64>, SubscriberError> {
    let mut sequences = Vec::new();
    while let Some(event) = subscriber.next_event().await? {
        sequences.push(event.sequence);
    }
    Ok(sequences)
}

/// B1. Reconnect Resumes Without Gaps Or Duplicates
#[tokio::test]
async fn test_reconnect_resumes_from_last_seen() {
    // Arrange: drop after 2, refuse once, resend 2 with a heartbeat, drop after 4, then finish
    let transport = Arc::new(ScriptedTransport::new(vec![
        Session::Deliver(vec![frame(1), frame(2)]),
        Session::Refuse,
        Session::Deliver(vec![frame(2), heartbeat(2), frame(3), frame(4)]),
        Session::Deliver(vec![frame(5), frame(6)]),
    ]));
    let clock = Arc::new(RecordingClock::default());
    let mut subscriber = ReconnectingSubscriber::new(job(), transport.clone()).with_clock(clock.clone());

    // Act
    let sequences = drain(&mut subscriber).await.unwrap();

    // Assert
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(clock.secs(), vec![1, 2, 1]);
    assert_eq!(*transport.opened_with.lock(), vec![None, Some(2), Some(2), Some(4)]);
    assert_eq!(subscriber.last_seen(), Some(6));

    // Terminal event delivered: nothing more, no further connections
    assert!(subscriber.next_event().await.unwrap().is_none());
    assert_eq!(transport.opened_with.lock().len(), 4);
}

/// B2. Backoff Doubles Up To The Cap And Gives Up At The Ceiling
#[tokio::test]
async fn test_gives_up_after_ceiling() {
    let transport = Arc::new(ScriptedTransport::default());
    let clock = Arc::new(RecordingClock::default());
    let mut subscriber = ReconnectingSubscriber::new(job(), transport.clone()).with_clock(clock.clone());

    let err = subscriber.next_event().await.unwrap_err();

    assert_eq!(err, SubscriberError::ConnectionAbandoned { attempts: 10 });
    assert_eq!(subscriber.state(), ConnectionState::GivingUp);
    assert_eq!(clock.secs(), vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    assert_eq!(transport.opened_with.lock().len(), 11);
}

/// B3. Successful Open Resets The Backoff
#[tokio::test]
async fn test_successful_open_resets_backoff() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Session::Refuse,
        Session::Refuse,
        Session::Deliver(vec![frame(1)]),
        Session::Refuse,
        Session::Deliver(vec![frame(6)]),
    ]));
    let clock = Arc::new(RecordingClock::default());
    let mut subscriber = ReconnectingSubscriber::new(job(), transport).with_clock(clock.clone());

    let sequences = drain(&mut subscriber).await.unwrap();

    assert_eq!(sequences, vec![1, 6]);
    // 1, 2 before the good open; after its drop the count restarts at 1
    assert_eq!(clock.secs(), vec![1, 2, 1, 2]);
}

/// B4. Resume From A Previous Session Skips Seen Events
#[tokio::test]
async fn test_resume_from_skips_seen() {
    let transport = Arc::new(ScriptedTransport::new(vec![Session::Deliver(vec![
        frame(3),
        frame(4),
        frame(5),
        frame(6),
    ])]));
    let mut subscriber = ReconnectingSubscriber::new(job(), transport.clone())
        .with_clock(Arc::new(RecordingClock::default()))
        .resume_from(4);

    let sequences = drain(&mut subscriber).await.unwrap();

    assert_eq!(sequences, vec![5, 6]);
    assert_eq!(*transport.opened_with.lock(), vec![Some(4)]);
}

/// B5. Gateway Transport End To End
#[tokio::test]
async fn test_gateway_transport() {
    let gateway = Arc::new(EventGateway::new(Arc::new(MemoryStore::new()), GatewayConfig::default()));
    let job_id = job();
    gateway.publish(&job_id, NewEvent::progress(Phase::Initializing, None)).await.unwrap();

    let mut subscriber = ReconnectingSubscriber::new(job_id.clone(), Arc::new(GatewayTransport::new(gateway.clone())));
    let first = subscriber.next_event().await.unwrap().unwrap();
    assert_eq!(first.sequence, 1);

    gateway.publish(&job_id, NewEvent::complete(json!("ok"))).await.unwrap();
    let second = subscriber.next_event().await.unwrap().unwrap();
    assert_eq!(second.sequence, 2);
    assert!(subscriber.next_event().await.unwrap().is_none());
}

/// B6. Unknown Job Ends The Subscription Without Retrying
#[tokio::test]
async fn test_unknown_job_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![Session::Refuse, Session::Missing]));
    let clock = Arc::new(RecordingClock::default());
    let mut subscriber = ReconnectingSubscriber::new(job(), transport.clone()).with_clock(clock.clone());

    let err = subscriber.next_event().await.unwrap_err();

    assert_eq!(err, SubscriberError::JobNotFound(job()));
    assert_eq!(subscriber.state(), ConnectionState::GivingUp);
    assert_eq!(clock.secs(), vec![1]);
    assert_eq!(transport.opened_with.lock().len(), 2);

    // Stays failed without opening again
    assert_eq!(subscriber.next_event().await.unwrap_err(), SubscriberError::JobNotFound(job()));
    assert_eq!(transport.opened_with.lock().len(), 2);
}

/// B7. Gateway Transport Rejects Jobs It Has Never Seen
#[tokio::test]
async fn test_gateway_transport_unknown_job() {
    let gateway = Arc::new(EventGateway::new(Arc::new(MemoryStore::new()), GatewayConfig::default()));
    let mut subscriber = ReconnectingSubscriber::new(job(), Arc::new(GatewayTransport::new(gateway.clone())));

    let err = subscriber.next_event().await.unwrap_err();

    assert_eq!(err, SubscriberError::JobNotFound(job()));
    assert_eq!(gateway.channel_count(), 0);
}
