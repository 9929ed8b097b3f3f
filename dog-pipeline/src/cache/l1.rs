use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use super::{pattern, CacheEntry};

struct Slot {
    entry: CacheEntry,
    expires_at: Instant,
}

/// Fixed-capacity, strict-LRU in-process tier.
///
/// Entries expire together with their distributed-tier copy, so a read past
/// the ttl misses here too.
pub struct L1Cache {
    entries: LruCache<String, Slot>,
}

impl L1Cache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up and refresh recency; expired entries are dropped
    pub fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let expired = match self.entries.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => return Some(slot.entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
        }
        None
    }

    pub fn put(&mut self, key: &str, entry: CacheEntry, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.put(key.to_string(), Slot { entry, expires_at });
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    /// Remove every key matching a glob pattern
    pub fn remove_matching(&mut self, glob: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| pattern::glob_match(glob, key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.entries.pop(key);
        }
        keys.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
