//! Tiered get-or-compute cache.
//!
//! Tiers are consulted in ascending cost order: the in-process LRU (L1), the
//! shared distributed cache (L2), then the caller's compute function (L3).
//! A hit at L2 backfills L1; a computed value is written through L2 then L1.
//! L2 failures never reach callers: they are logged and the lookup degrades
//! to the next tier.

pub mod distributed;
pub mod l1;
pub mod pattern;

#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::CacheConfig;
use crate::observability::PipelineMetrics;

pub use distributed::{DistributedCache, MemoryDistributedCache};
pub use l1::L1Cache;

#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// Tier that answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
    /// Authoritative compute
    L3,
}

impl CacheTier {
    pub fn name(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }

    /// Whether the value came from a cache rather than a fresh compute
    pub fn is_cached(&self) -> bool {
        !matches!(self, Self::L3)
    }
}

/// Cached artifact plus the bookkeeping needed for the TTL law
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    /// How long the compute took, reported as time saved on later hits
    pub compute_ms: u64,
    pub written_at: DateTime<Utc>,
    /// Lifetime granted at write time, 0 when unknown
    #[serde(default)]
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn new(value: Value, compute_ms: u64) -> Self {
        Self {
            value,
            compute_ms,
            written_at: Utc::now(),
            ttl_ms: 0,
        }
    }

    /// Lifetime left before the entry expires everywhere
    fn remaining(&self, fallback: Duration) -> Duration {
        if self.ttl_ms == 0 {
            return fallback;
        }
        let age = (Utc::now() - self.written_at).to_std().unwrap_or(Duration::ZERO);
        Duration::from_millis(self.ttl_ms).saturating_sub(age)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Falls back to the configured default ttl
    pub ttl: Option<Duration>,
    pub skip_l1: bool,
    pub skip_l2: bool,
}

impl CacheOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: Value,
    pub tier: CacheTier,
    /// Compute time recorded with the entry
    pub compute_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmEntry {
    pub key: String,
    pub value: Value,
    #[serde(default, with = "optional_secs")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmReport {
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateReport {
    pub l1_removed: usize,
    /// `None` when L2 is absent or the delete failed
    pub l2_removed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Stats {
    pub size: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1: L1Stats,
}

/// Per-key build lock, released from the map when the last holder drops,
/// including a caller whose future was cancelled mid-build
struct InFlight<'a> {
    map: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // Map entry plus ours means nobody else is waiting
        self.map
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) <= 2);
    }
}

/// Layered cache manager
pub struct TieredCache {
    l1: Mutex<L1Cache>,
    l2: Option<Arc<dyn DistributedCache>>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    default_ttl: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl TieredCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            l1: Mutex::new(L1Cache::new(config.l1_capacity)),
            l2: None,
            in_flight: DashMap::new(),
            default_ttl: config.default_ttl,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_distributed(mut self, l2: Arc<dyn DistributedCache>) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Concurrent calls for one key serialize on an in-flight lock; callers
    /// that waited re-check the tiers and observe the first caller's value.
    #[instrument(skip(self, options, compute))]
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        options: CacheOptions,
        compute: F,
    ) -> Result<CacheLookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.lookup(key, &options).await {
            return Ok(hit);
        }

        let in_flight = InFlight {
            map: &self.in_flight,
            key,
            lock: self.in_flight.entry(key.to_string()).or_default().clone(),
        };
        let _build = in_flight.lock.lock().await;
        self.compute_locked(key, &options, compute).await
    }

    async fn compute_locked<F, Fut, E>(&self, key: &str, options: &CacheOptions, compute: F) -> Result<CacheLookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.lookup(key, options).await {
            return Ok(hit);
        }

        self.metrics.record_cache_miss();
        let started = tokio::time::Instant::now();
        let value = compute().await?;
        let compute_ms = started.elapsed().as_millis() as u64;

        let entry = CacheEntry::new(value, compute_ms);
        self.write_through(key, &entry, options).await;

        Ok(CacheLookup {
            value: entry.value,
            tier: CacheTier::L3,
            compute_ms,
        })
    }

    /// Consult L1 then L2 without computing
    pub async fn lookup(&self, key: &str, options: &CacheOptions) -> Option<CacheLookup> {
        if !options.skip_l1 {
            let cached = self.l1.lock().get(key);
            if let Some(entry) = cached {
                self.metrics.record_cache_hit(CacheTier::L1);
                return Some(CacheLookup {
                    value: entry.value,
                    tier: CacheTier::L1,
                    compute_ms: entry.compute_ms,
                });
            }
        }

        if options.skip_l2 {
            return None;
        }
        let l2 = self.l2.as_ref()?;

        let raw = match l2.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                self.metrics.record_l2_error();
                warn!(key, error = %err, "distributed cache read failed, falling through");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable distributed cache entry");
                return None;
            }
        };

        let remaining = entry.remaining(self.ttl(options));
        if remaining.is_zero() {
            return None;
        }
        if !options.skip_l1 {
            self.l1.lock().put(key, entry.clone(), remaining);
        }

        self.metrics.record_cache_hit(CacheTier::L2);
        debug!(key, "backfilled l1 from distributed cache");
        Some(CacheLookup {
            value: entry.value,
            tier: CacheTier::L2,
            compute_ms: entry.compute_ms,
        })
    }

    async fn write_through(&self, key: &str, entry: &CacheEntry, options: &CacheOptions) -> bool {
        let ttl = self.ttl(options);
        let mut entry = entry.clone();
        entry.ttl_ms = ttl.as_millis() as u64;
        let mut stored = true;

        if !options.skip_l2 {
            if let Some(l2) = &self.l2 {
                let written = match serde_json::to_string(&entry) {
                    Ok(raw) => l2.set_with_ttl(key, raw, ttl).await.map_err(|e| e.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(err) = written {
                    self.metrics.record_l2_error();
                    warn!(key, error = %err, "distributed cache write failed");
                    stored = false;
                }
            }
        }

        if !options.skip_l1 {
            self.l1.lock().put(key, entry, ttl);
        }

        stored
    }

    fn ttl(&self, options: &CacheOptions) -> Duration {
        options.ttl.unwrap_or(self.default_ttl)
    }

    /// Delete an exact key, or every key matching a glob (`*`, `?`), from both tiers
    #[instrument(skip(self))]
    pub async fn invalidate(&self, key_or_pattern: &str) -> InvalidateReport {
        let glob = pattern::is_pattern(key_or_pattern);

        let l1_removed = {
            let mut l1 = self.l1.lock();
            if glob {
                l1.remove_matching(key_or_pattern)
            } else {
                usize::from(l1.remove(key_or_pattern))
            }
        };

        let l2_removed = match &self.l2 {
            None => None,
            Some(l2) => {
                let result = if glob {
                    l2.delete_pattern(key_or_pattern).await
                } else {
                    l2.delete(key_or_pattern).await.map(u64::from)
                };
                match result {
                    Ok(removed) => Some(removed),
                    Err(err) => {
                        self.metrics.record_l2_error();
                        warn!(key = key_or_pattern, error = %err, "distributed cache invalidation failed");
                        None
                    }
                }
            }
        };

        InvalidateReport { l1_removed, l2_removed }
    }

    /// Preload entries; one failure never aborts the batch
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn warm(&self, entries: Vec<WarmEntry>) -> WarmReport {
        let mut report = WarmReport::default();
        for entry in entries {
            if entry.key.trim().is_empty() {
                report.failed += 1;
                continue;
            }
            let options = CacheOptions {
                ttl: entry.ttl,
                ..CacheOptions::default()
            };
            if self.write_through(&entry.key, &CacheEntry::new(entry.value, 0), &options).await {
                report.written += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    pub fn stats(&self) -> CacheStats {
        let l1 = self.l1.lock();
        CacheStats {
            l1: L1Stats {
                size: l1.len(),
                capacity: l1.capacity(),
            },
        }
    }
}

pub(crate) mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ttl) => serializer.serialize_some(&ttl.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
