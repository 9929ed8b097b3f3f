use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::DistributedCache;
use crate::CacheTierError;

const SCAN_BATCH: usize = 200;

/// Redis-backed L2 tier.
///
/// Keys are namespaced with a prefix so pattern deletes never reach keys
/// owned by other applications sharing the server.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    /// Connect to `redis_url` (e.g. "redis://localhost:6379")
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, CacheTierError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheTierError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheTierError> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        let _: () = conn.pset_ex(self.key(key), value, millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheTierError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheTierError> {
        let mut conn = self.conn.clone();
        let pattern = self.key(pattern);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let count: u64 = conn.del(keys).await?;
                removed += count;
            }

            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}
