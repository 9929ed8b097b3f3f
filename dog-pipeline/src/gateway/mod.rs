//! Per-job event streams.
//!
//! Every published event is appended to the [`EventLog`] (which assigns its
//! sequence) and then broadcast to live subscribers. A subscriber replays the
//! log past its last-seen sequence before following the live channel, and
//! falls back to the log whenever the live channel lags or skips, so each
//! subscriber sees a gap-free, duplicate-free suffix.
//!
//! Live channels exist only for registered jobs ([`EventGateway::open`]) and
//! are pruned once closed. The log outlives the channel: a closed stream is
//! still replayed from it until the job itself is purged.

pub mod frame;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, trace};

use crate::config::GatewayConfig;
use crate::observability::PipelineMetrics;
use crate::store::EventLog;
use crate::{JobId, NewEvent, PipelineError, PipelineResult, StreamEvent};

pub use frame::Frame;

/// Boxed stream of events for one job
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'static>>;

/// Buffer between a subscription task and its consumer
const SUBSCRIBER_BUFFER: usize = 64;

struct ChannelParts {
    sender: broadcast::Sender<StreamEvent>,
    publish_lock: Arc<tokio::sync::Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl ChannelParts {
    fn of(channel: &JobChannel) -> Self {
        Self {
            sender: channel.sender.clone(),
            publish_lock: channel.publish_lock.clone(),
            closed: channel.closed.clone(),
        }
    }
}

struct JobChannel {
    sender: broadcast::Sender<StreamEvent>,
    /// Serializes append + broadcast so live order matches log order
    publish_lock: Arc<tokio::sync::Mutex<()>>,
    closed: Arc<AtomicBool>,
    closed_at: Option<Instant>,
}

impl JobChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            publish_lock: Arc::new(tokio::sync::Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
            closed_at: None,
        }
    }
}

/// Event stream gateway
pub struct EventGateway {
    log: Arc<dyn EventLog>,
    channels: DashMap<JobId, JobChannel>,
    config: GatewayConfig,
    metrics: Arc<PipelineMetrics>,
}

impl EventGateway {
    pub fn new(log: Arc<dyn EventLog>, config: GatewayConfig) -> Self {
        Self {
            log,
            channels: DashMap::new(),
            config,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Channel handles, creating the channel when missing. The flag is true
    /// for a freshly created channel.
    fn channel_parts(&self, job_id: &JobId) -> (ChannelParts, bool) {
        let mut fresh = false;
        let channel = self.channels.entry(job_id.clone()).or_insert_with(|| {
            fresh = true;
            JobChannel::new(self.config.channel_capacity)
        });
        (ChannelParts::of(&channel), fresh)
    }

    fn existing_parts(&self, job_id: &JobId) -> Option<ChannelParts> {
        self.channels.get(job_id).map(|channel| ChannelParts::of(&channel))
    }

    /// Register a job so clients can follow it before its first event
    pub fn open(&self, job_id: &JobId) {
        self.channel_parts(job_id);
    }

    /// Append an event to the job's log and relay it to live subscribers.
    /// Fails with `JobAlreadyTerminal` once the stream has closed.
    #[instrument(skip(self, job_id, event), fields(job_id = %job_id, kind = %event.kind))]
    pub async fn publish(&self, job_id: &JobId, event: NewEvent) -> PipelineResult<StreamEvent> {
        let (ChannelParts { sender, publish_lock, closed }, fresh) = self.channel_parts(job_id);
        let _guard = publish_lock.lock().await;
        // A pruned channel forgets it was closed; the log still knows
        if fresh && self.log.last_event(job_id).await?.is_some_and(|last| last.is_terminal()) {
            closed.store(true, Ordering::SeqCst);
            self.channels.remove(job_id);
        }
        if closed.load(Ordering::SeqCst) {
            debug!("stream already closed, event dropped");
            return Err(PipelineError::JobAlreadyTerminal);
        }

        let event = self.log.append(job_id, event).await?;
        self.metrics.increment_events_published();
        trace!(sequence = event.sequence, "event appended");

        // No receivers is fine: the log is the replay source
        let _ = sender.send(event.clone());

        if event.is_terminal() {
            closed.store(true, Ordering::SeqCst);
            if let Some(mut channel) = self.channels.get_mut(job_id) {
                channel.closed_at = Some(Instant::now());
            }
            debug!(sequence = event.sequence, "stream closed");
        }

        Ok(event)
    }

    /// Replay events after `last_seen`, then follow live events until a
    /// terminal event is delivered. Heartbeats carrying the latest delivered
    /// sequence are interleaved while the stream is idle.
    ///
    /// Without a live channel, a job whose log ends in a terminal event gets
    /// a finite replay; anything else fails with `JobNotFound`.
    pub async fn subscribe(&self, job_id: &JobId, last_seen: u64) -> PipelineResult<EventStream> {
        let Some(ChannelParts { sender, closed, .. }) = self.existing_parts(job_id) else {
            return match self.log.last_event(job_id).await? {
                Some(last) if last.is_terminal() => self.replay(job_id, last_seen).await,
                _ => Err(PipelineError::JobNotFound(job_id.to_string())),
            };
        };
        // Subscribe before reading the log so nothing falls between the two
        let live = sender.subscribe();

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let subscription = Subscription {
            job_id: job_id.clone(),
            last: last_seen,
            log: self.log.clone(),
            tx,
        };
        tokio::spawn(subscription.run(live, closed, self.config.heartbeat_interval));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Publish `event` unless the stream already closed. Returns whether it
    /// was published.
    pub async fn publish_if_open(&self, job_id: &JobId, event: NewEvent) -> PipelineResult<bool> {
        match self.publish(job_id, event).await {
            Ok(_) => Ok(true),
            Err(PipelineError::JobAlreadyTerminal) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Finite replay of logged events after `last_seen`, without live follow
    pub async fn replay(&self, job_id: &JobId, last_seen: u64) -> PipelineResult<EventStream> {
        let events = self.log.events_after(job_id, last_seen).await?;
        Ok(Box::pin(futures::stream::iter(events)))
    }

    /// Whether a terminal event has been published for the job
    pub fn is_closed(&self, job_id: &JobId) -> bool {
        self.channels
            .get(job_id)
            .map(|channel| channel.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Number of live subscribers for a job
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.channels
            .get(job_id)
            .map(|channel| channel.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop live channels of closed streams that have had no subscribers for
    /// longer than the retention window. Logs stay until the job is purged.
    pub fn prune(&self) -> usize {
        let retention = self.config.event_retention;
        let expired: Vec<JobId> = self
            .channels
            .iter()
            .filter(|entry| {
                let channel = entry.value();
                channel.sender.receiver_count() == 0
                    && channel.closed_at.map_or(false, |at| at.elapsed() >= retention)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for job_id in &expired {
            self.channels.remove(job_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "pruned closed event streams");
        }
        expired.len()
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Forget a job's live channel (its log is removed separately)
    pub fn forget(&self, job_id: &JobId) {
        self.channels.remove(job_id);
    }
}

/// Forwarding task state for one subscriber
struct Subscription {
    job_id: JobId,
    last: u64,
    log: Arc<dyn EventLog>,
    tx: mpsc::Sender<StreamEvent>,
}

enum Delivery {
    Continue,
    Done,
}

impl Subscription {
    async fn run(
        mut self,
        mut live: broadcast::Receiver<StreamEvent>,
        closed: Arc<AtomicBool>,
        heartbeat_interval: std::time::Duration,
    ) {
        if let Delivery::Done = self.catch_up().await {
            return;
        }
        // Closed between the first read and now, or already seen by a
        // previous connection: one more read flushes whatever is left
        if closed.load(Ordering::SeqCst) {
            let _ = self.catch_up().await;
            return;
        }

        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = live.recv() => {
                    let outcome = match received {
                        Ok(event) if event.sequence <= self.last => Delivery::Continue,
                        Ok(event) if event.sequence == self.last + 1 => self.deliver(event).await,
                        // Skipped ahead or lagged: the log has everything in order
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => self.catch_up().await,
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = self.catch_up().await;
                            Delivery::Done
                        }
                    };
                    if let Delivery::Done = outcome {
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = StreamEvent::heartbeat(self.job_id.clone(), self.last);
                    if self.tx.send(beat).await.is_err() {
                        return;
                    }
                }
                _ = self.tx.closed() => return,
            }
        }
    }

    async fn catch_up(&mut self) -> Delivery {
        let events = match self.log.events_after(&self.job_id, self.last).await {
            Ok(events) => events,
            Err(err) => {
                debug!(job_id = %self.job_id, error = %err, "event log read failed, closing subscription");
                return Delivery::Done;
            }
        };
        for event in events {
            if let Delivery::Done = self.deliver(event).await {
                return Delivery::Done;
            }
        }
        Delivery::Continue
    }

    async fn deliver(&mut self, event: StreamEvent) -> Delivery {
        self.last = event.sequence;
        let terminal = event.is_terminal();
        if self.tx.send(event).await.is_err() || terminal {
            Delivery::Done
        } else {
            Delivery::Continue
        }
    }
}
