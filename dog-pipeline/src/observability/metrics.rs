use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::cache::CacheTier;

/// Live counters for the whole pipeline
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_cancelled: AtomicU64,
    leases_reaped: AtomicU64,

    cache_hits_l1: AtomicU64,
    cache_hits_l2: AtomicU64,
    cache_misses: AtomicU64,
    cache_l2_errors: AtomicU64,

    events_published: AtomicU64,

    queues: DashMap<String, Arc<QueueGauge>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_leases_reaped(&self) {
        self.leases_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, tier: CacheTier) {
        match tier {
            CacheTier::L1 => self.cache_hits_l1.fetch_add(1, Ordering::Relaxed),
            CacheTier::L2 => self.cache_hits_l2.fetch_add(1, Ordering::Relaxed),
            CacheTier::L3 => self.cache_misses.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_error(&self) {
        self.cache_l2_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Active-job gauge for a queue, created on first use
    pub fn queue_gauge(&self, queue: &str) -> Arc<QueueGauge> {
        self.queues.entry(queue.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut queues: Vec<QueueGaugeSnapshot> = self
            .queues
            .iter()
            .map(|entry| QueueGaugeSnapshot {
                queue: entry.key().clone(),
                active: entry.value().active(),
                peak: entry.value().peak(),
            })
            .collect();
        queues.sort_by(|a, b| a.queue.cmp(&b.queue));

        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            leases_reaped: self.leases_reaped.load(Ordering::Relaxed),
            cache_hits_l1: self.cache_hits_l1.load(Ordering::Relaxed),
            cache_hits_l2: self.cache_hits_l2.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_l2_errors: self.cache_l2_errors.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            queues,
        }
    }
}

/// Current and peak number of active jobs in one queue
#[derive(Debug, Default)]
pub struct QueueGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl QueueGauge {
    /// Count one more active job until the guard drops
    pub fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard { gauge: self.clone() }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ActiveGuard {
    gauge: Arc<QueueGauge>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueGaugeSnapshot {
    pub queue: String,
    pub active: usize,
    pub peak: usize,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_cancelled: u64,
    pub leases_reaped: u64,
    pub cache_hits_l1: u64,
    pub cache_hits_l2: u64,
    pub cache_misses: u64,
    pub cache_l2_errors: u64,
    pub events_published: u64,
    pub queues: Vec<QueueGaugeSnapshot>,
}
