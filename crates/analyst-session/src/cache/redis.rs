//! Redis-backed cache store.
//!
//! Entries are stored as JSON under `cache:{key}`. The Redis TTL covers the
//! fresh and stale windows plus a margin so a stale value is still there to
//! serve when the upstream fails; HIT/STALE/MISS is decided from the
//! stored `created_at`, not from the Redis TTL.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use serde_json::Value;

use super::{CacheEntry, CacheRead, CacheStore};
use crate::SessionResult;
use crate::clock::SharedClock;
use crate::config::BackendKind;
use crate::keyspace::{CACHE_PREFIX, CACHE_TTL_MARGIN, cache_key};
use crate::persistent::RedisHandle;

/// Deletes `KEYS[1]` only if it still holds `ARGV[1]`, so an entry written
/// between our read and the delete survives.
const DELETE_IF_UNCHANGED: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const SCAN_BATCH: usize = 100;

pub struct RedisCacheStore {
    redis: RedisHandle,
    clock: SharedClock,
    delete_if_unchanged: redis::Script,
}

impl RedisCacheStore {
    pub fn new(redis: RedisHandle, clock: SharedClock) -> Self {
        Self {
            redis,
            clock,
            delete_if_unchanged: redis::Script::new(DELETE_IF_UNCHANGED),
        }
    }

    async fn delete_raw_if_unchanged(&self, key: &str, raw: &str) -> SessionResult<()> {
        let mut conn = self.redis.connection().await?;
        let _: i64 = self
            .redis
            .timed(
                "EVALSHA delete_if_unchanged",
                self.delete_if_unchanged
                    .key(key)
                    .arg(raw)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}

/// Redis expiry in whole seconds, never below one.
fn redis_ttl(ttl: Duration, max_stale: Duration) -> u64 {
    let total = ttl + max_stale + CACHE_TTL_MARGIN;
    (total.as_secs_f64().ceil() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> SessionResult<CacheRead> {
        let redis_key = cache_key(key);
        let mut conn = self.redis.connection().await?;
        let raw: Option<String> = self.redis.timed("GET", conn.get(&redis_key)).await?;
        drop(conn);

        let Some(raw) = raw else {
            return Ok(CacheRead::miss());
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "invalid cache entry, deleting");
                self.delete_raw_if_unchanged(&redis_key, &raw).await?;
                return Ok(CacheRead::miss());
            }
        };

        match entry.status_at(self.clock.now()) {
            Some(status) => Ok(CacheRead::found(entry.value, status)),
            None => {
                self.delete_raw_if_unchanged(&redis_key, &raw).await?;
                tracing::debug!(key = %key, "removed fully expired cache entry");
                Ok(CacheRead::miss())
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        max_stale: Duration,
    ) -> SessionResult<()> {
        let entry = CacheEntry::new(value, self.clock.now(), ttl, max_stale);
        let payload = serde_json::to_string(&entry)?;
        let expiry = redis_ttl(ttl, max_stale);

        let mut conn = self.redis.connection().await?;
        self.redis
            .timed("SETEX", conn.set_ex::<_, _, ()>(cache_key(key), payload, expiry))
            .await?;
        tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), expiry, "cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<()> {
        let mut conn = self.redis.connection().await?;
        self.redis
            .timed("DEL", conn.del::<_, ()>(cache_key(key)))
            .await
    }

    async fn clear(&self) -> SessionResult<()> {
        let pattern = format!("{CACHE_PREFIX}*");
        let mut conn = self.redis.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .redis
                .timed(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                self.redis
                    .timed("DEL", conn.del::<_, ()>(keys))
                    .await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::info!(removed, "cache cleared");
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Redis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_ttl_covers_stale_window() {
        assert_eq!(redis_ttl(Duration::from_secs(30), Duration::from_secs(300)), 331);
        assert_eq!(redis_ttl(Duration::from_millis(1500), Duration::ZERO), 3);
        assert_eq!(redis_ttl(Duration::ZERO, Duration::ZERO), 1);
    }
}
