//! Reconnecting stream subscriber.
//!
//! Explicit state machine over an injectable [`StreamTransport`] and
//! [`Clock`]:
//!
//! ```text
//! Disconnected --open--> Connecting --ok--> Connected
//!      ^                     |                  |
//!      +---- delay(n) <------+-- failure -------+
//!      |
//!      +-- n > max_attempts --> GivingUp
//! ```
//!
//! After the n-th consecutive failure the subscriber waits
//! `min(base * 2^(n-1), max)` and resubscribes from the last delivered
//! sequence. A successful open resets n to zero. A job the server does not
//! know ends the subscription at once with [`SubscriberError::JobNotFound`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{EventGateway, EventStream, Frame};
use crate::{EventKind, JobId, StreamEvent, StreamTransportError};

/// Frames delivered by an open connection
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, StreamTransportError>> + Send + 'static>>;

/// Opens a stream connection for a job
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// `last_seen` is `None` on the very first connection
    async fn open(&self, job_id: &JobId, last_seen: Option<u64>) -> Result<FrameStream, StreamTransportError>;
}

/// Time source for reconnect delays
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `tokio::time`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Encode gateway events as wire frames
pub fn into_frames(events: EventStream) -> FrameStream {
    Box::pin(events.map(|event| Frame::from_event(&event).map_err(|e| StreamTransportError::Malformed(e.to_string()))))
}

/// In-process transport reading straight from an [`EventGateway`]
#[derive(Clone)]
pub struct GatewayTransport {
    gateway: Arc<EventGateway>,
}

impl GatewayTransport {
    pub fn new(gateway: Arc<EventGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl StreamTransport for GatewayTransport {
    async fn open(&self, job_id: &JobId, last_seen: Option<u64>) -> Result<FrameStream, StreamTransportError> {
        let events = self.gateway.subscribe(job_id, last_seen.unwrap_or(0)).await?;
        Ok(into_frames(events))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    GivingUp,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// The connection could not be re-established; the job itself may still succeed
    #[error("stream connection abandoned after {attempts} reconnect attempts")]
    ConnectionAbandoned { attempts: u32 },

    #[error("job not found: {0}")]
    JobNotFound(JobId),
}

/// Client side of a job stream that survives connection loss
pub struct ReconnectingSubscriber {
    job_id: JobId,
    transport: Arc<dyn StreamTransport>,
    clock: Arc<dyn Clock>,
    policy: ReconnectPolicy,

    state: ConnectionState,
    attempt: u32,
    last_seen: Option<u64>,
    stream: Option<FrameStream>,
    finished: bool,
    /// Set when a failure makes reconnecting pointless
    fatal: Option<SubscriberError>,
}

impl ReconnectingSubscriber {
    pub fn new(job_id: JobId, transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            job_id,
            transport,
            clock: Arc::new(TokioClock),
            policy: ReconnectPolicy::default(),
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_seen: None,
            stream: None,
            finished: false,
            fatal: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resume after a sequence delivered in an earlier session
    pub fn resume_from(mut self, last_seen: u64) -> Self {
        self.last_seen = Some(last_seen);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Next job event, `Ok(None)` once a terminal event has been delivered.
    ///
    /// Heartbeats and already-seen sequences are absorbed here.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, SubscriberError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            if self.state == ConnectionState::GivingUp {
                return Err(self.fatal.clone().unwrap_or(SubscriberError::ConnectionAbandoned {
                    attempts: self.policy.max_attempts,
                }));
            }

            let Some(stream) = self.stream.as_mut() else {
                self.connect().await;
                continue;
            };

            let received = stream.next().await;
            let failure = match received {
                Some(Ok(frame)) => match frame.into_event(&self.job_id) {
                    Ok(event) => {
                        if let Some(event) = self.accept(event) {
                            return Ok(Some(event));
                        }
                        if self.finished {
                            return Ok(None);
                        }
                        continue;
                    }
                    Err(err) => err,
                },
                Some(Err(err)) => err,
                None => StreamTransportError::Disconnected,
            };

            self.on_failure(failure);
        }
    }

    /// Filter an incoming event; `None` means nothing to hand out
    fn accept(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if event.kind == EventKind::Heartbeat {
            return None;
        }
        if self.last_seen.is_some_and(|seen| event.sequence <= seen) {
            return None;
        }
        self.last_seen = Some(event.sequence);
        if event.is_terminal() {
            self.finished = true;
            self.stream = None;
            self.state = ConnectionState::Disconnected;
        }
        Some(event)
    }

    async fn connect(&mut self) {
        if self.attempt > 0 {
            let delay = self.policy.delay_for(self.attempt);
            debug!(job_id = %self.job_id, attempt = self.attempt, ?delay, "waiting before reconnect");
            self.clock.sleep(delay).await;
        }

        self.state = ConnectionState::Connecting;
        match self.transport.open(&self.job_id, self.last_seen).await {
            Ok(stream) => {
                if self.attempt > 0 {
                    info!(job_id = %self.job_id, last_seen = ?self.last_seen, "stream reconnected");
                }
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                self.attempt = 0;
            }
            Err(err) => self.on_failure(err),
        }
    }

    fn on_failure(&mut self, err: StreamTransportError) {
        self.stream = None;
        if err.is_permanent() {
            warn!(job_id = %self.job_id, error = %err, "subscription cannot succeed, not reconnecting");
            self.fatal = Some(SubscriberError::JobNotFound(self.job_id.clone()));
            self.state = ConnectionState::GivingUp;
            return;
        }
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            warn!(job_id = %self.job_id, error = %err, "giving up on stream");
            self.state = ConnectionState::GivingUp;
        } else {
            debug!(job_id = %self.job_id, error = %err, attempt = self.attempt, "stream connection lost");
            self.state = ConnectionState::Disconnected;
        }
    }
}
