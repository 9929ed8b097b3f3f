//! Pipeline configuration.
//!
//! Every section has a `Default` carrying the documented production values.
//! Deployments overlay environment variables with
//! [`PipelineConfig::apply_env`], using the `PREFIX__SECTION__KEY` convention:
//!
//! ```bash
//! export DOG_PIPELINE__CACHE__L1_CAPACITY=200
//! export DOG_PIPELINE__QUEUES__GENERATION__CONCURRENCY=4
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{PipelineError, PipelineResult};

/// Exponential retry curve: `min(base * 2^(attempt-1), max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

/// How long terminal jobs are kept before cleanup purges them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    /// Completed jobs kept per queue, oldest purged first
    pub completed_count: usize,
    /// Applies to failed and cancelled jobs
    pub failed_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(24 * 3600),
            completed_count: 1000,
            failed_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Sliding-window dequeue limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_minute(max: u32) -> Self {
        Self {
            max,
            window: Duration::from_secs(60),
        }
    }
}

/// Options applied to jobs that do not override them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub attempts: u32,
    pub backoff: Backoff,
    pub retention: RetentionPolicy,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Per-queue admission and execution policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,

    /// Number of worker tasks, and so the ceiling on active jobs
    pub concurrency: usize,

    pub rate_limit: Option<RateLimit>,
    pub default_job_options: JobDefaults,

    /// Visibility timeout for a leased job
    pub lease_duration: Duration,

    /// Idle re-check interval when no wake-up arrives
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            concurrency: 1,
            rate_limit: None,
            default_job_options: JobDefaults::default(),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.default_job_options.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.default_job_options.backoff = backoff;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::validation("queue name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::validation(format!(
                "queue {}: concurrency must be at least 1",
                self.name
            )));
        }
        if self.default_job_options.attempts == 0 {
            return Err(PipelineError::validation(format!(
                "queue {}: attempts must be at least 1",
                self.name
            )));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max == 0 || limit.window.is_zero() {
                return Err(PipelineError::validation(format!(
                    "queue {}: rate limit needs a positive max and window",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 100,
            default_ttl: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    /// Live broadcast buffer per job
    pub channel_capacity: usize,
    /// How long a closed stream's live channel outlives its last subscriber
    pub event_retention: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            channel_capacity: 256,
            event_retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Lease reaper tick
    pub interval: Duration,
    /// Retention cleanup tick
    pub cleanup_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queues: Vec<QueueConfig>,
    pub cache: CacheConfig,
    pub gateway: GatewayConfig,
    pub reaper: ReaperConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                QueueConfig::new("generation")
                    .with_concurrency(3)
                    .with_rate_limit(RateLimit::per_minute(10)),
                QueueConfig::new("lightweight").with_concurrency(5),
            ],
            cache: CacheConfig::default(),
            gateway: GatewayConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration with no queues; add them with [`PipelineConfig::with_queue`]
    pub fn empty() -> Self {
        Self {
            queues: Vec::new(),
            ..Self::default()
        }
    }

    /// Add or replace a queue by name
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.retain(|q| q.name != queue.name);
        self.queues.push(queue);
        self
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.cache.l1_capacity == 0 {
            return Err(PipelineError::validation("cache l1_capacity must be at least 1"));
        }
        if self.gateway.channel_capacity == 0 {
            return Err(PipelineError::validation("gateway channel_capacity must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.name.as_str()) {
                return Err(PipelineError::validation(format!("duplicate queue {}", queue.name)));
            }
        }
        Ok(())
    }

    /// Overlay process environment variables that start with `prefix`
    pub fn apply_env(&mut self, prefix: &str) -> PipelineResult<()> {
        self.apply_vars(prefix, std::env::vars())
    }

    /// Overlay `PREFIX__SECTION__KEY` pairs from any source
    pub fn apply_vars<I>(&mut self, prefix: &str, vars: I) -> PipelineResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let marker = format!("{}__", prefix);
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(&marker) else {
                continue;
            };
            let path: Vec<String> = stripped.to_lowercase().split("__").map(str::to_string).collect();
            let path: Vec<&str> = path.iter().map(String::as_str).collect();
            match path.as_slice() {
                ["cache", "l1_capacity"] => self.cache.l1_capacity = parse(&key, &value)?,
                ["cache", "default_ttl_secs"] => self.cache.default_ttl = secs(&key, &value)?,
                ["gateway", "heartbeat_interval_secs"] => {
                    self.gateway.heartbeat_interval = secs(&key, &value)?
                }
                ["gateway", "channel_capacity"] => self.gateway.channel_capacity = parse(&key, &value)?,
                ["gateway", "event_retention_secs"] => {
                    self.gateway.event_retention = secs(&key, &value)?
                }
                ["reaper", "interval_secs"] => self.reaper.interval = secs(&key, &value)?,
                ["reaper", "cleanup_interval_secs"] => {
                    self.reaper.cleanup_interval = secs(&key, &value)?
                }
                ["queues", name, field] => {
                    let queue = self.queue_mut_or_insert(name);
                    apply_queue_var(queue, field, &key, &value)?;
                }
                _ => debug!(key = %key, "ignoring unknown pipeline setting"),
            }
        }
        Ok(())
    }

    fn queue_mut_or_insert(&mut self, name: &str) -> &mut QueueConfig {
        let index = match self.queues.iter().position(|q| q.name == name) {
            Some(index) => index,
            None => {
                self.queues.push(QueueConfig::new(name));
                self.queues.len() - 1
            }
        };
        &mut self.queues[index]
    }
}

fn apply_queue_var(queue: &mut QueueConfig, field: &str, key: &str, value: &str) -> PipelineResult<()> {
    match field {
        "concurrency" => queue.concurrency = parse(key, value)?,
        "attempts" => queue.default_job_options.attempts = parse(key, value)?,
        "backoff_base_ms" => queue.default_job_options.backoff.base = millis(key, value)?,
        "backoff_max_ms" => queue.default_job_options.backoff.max = millis(key, value)?,
        "lease_duration_secs" => queue.lease_duration = secs(key, value)?,
        "poll_interval_ms" => queue.poll_interval = millis(key, value)?,
        "rate_limit_max" => {
            let max = parse(key, value)?;
            let window = queue.rate_limit.map(|l| l.window).unwrap_or(Duration::from_secs(60));
            queue.rate_limit = Some(RateLimit { max, window });
        }
        "rate_limit_window_ms" => {
            let window = millis(key, value)?;
            let max = queue.rate_limit.map(|l| l.max).unwrap_or(1);
            queue.rate_limit = Some(RateLimit { max, window });
        }
        _ => debug!(key = %key, "ignoring unknown queue setting"),
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> PipelineResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| PipelineError::validation(format!("{} has invalid value {:?}", key, value)))
}

fn secs(key: &str, value: &str) -> PipelineResult<Duration> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

fn millis(key: &str, value: &str) -> PipelineResult<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
