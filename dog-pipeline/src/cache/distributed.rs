use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::pattern;
use crate::CacheTierError;

/// Shared cache tier contract (L2).
///
/// Values are opaque strings; the tier manager owns their encoding.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheTierError>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheTierError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheTierError>;

    /// Delete every key matching a glob, returning how many were removed
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheTierError>;
}

/// In-memory L2 for tests and single-node development.
///
/// Expiry follows `tokio::time`, so paused-clock tests control it.
/// `set_available(false)` makes every call fail as a lost connection would.
#[derive(Default)]
pub struct MemoryDistributedCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|(_, expires)| *expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), CacheTierError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheTierError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheTierError> {
        self.check()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheTierError> {
        self.check()?;
        self.entries
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheTierError> {
        self.check()?;
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn delete_pattern(&self, glob: &str) -> Result<u64, CacheTierError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !pattern::glob_match(glob, key));
        Ok((before - entries.len()) as u64)
    }
}
