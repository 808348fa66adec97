//! Process-local cache store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{CacheEntry, CacheRead, CacheStore};
use crate::SessionResult;
use crate::clock::SharedClock;
use crate::config::BackendKind;

/// In-memory cache backed by `DashMap`.
///
/// Reads and writes of one key are serialised by the shard lock holding it;
/// different keys proceed in parallel.
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    clock: SharedClock,
}

impl MemoryCacheStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> SessionResult<CacheRead> {
        let now = self.clock.now();

        {
            let Some(entry) = self.entries.get(key) else {
                return Ok(CacheRead::miss());
            };
            if let Some(status) = entry.status_at(now) {
                return Ok(CacheRead::found(entry.value.clone(), status));
            }
        }

        // Re-check under the write lock so a concurrent `set` is not lost.
        if self
            .entries
            .remove_if(key, |_, entry| entry.status_at(now).is_none())
            .is_some()
        {
            tracing::debug!(key = %key, "removed fully expired cache entry");
        }
        Ok(CacheRead::miss())
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        max_stale: Duration,
    ) -> SessionResult<()> {
        let entry = CacheEntry::new(value, self.clock.now(), ttl, max_stale);
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> SessionResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.status_at(now).is_some();
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStatus;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store() -> (MemoryCacheStore, ManualClock) {
        let clock = ManualClock::starting_now();
        (MemoryCacheStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_set_then_get_is_hit() {
        let (store, _clock) = store();
        store
            .set("k", Value::from("v"), Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        let read = store.get("k").await.unwrap();
        assert_eq!(read, CacheRead::found(Value::from("v"), CacheStatus::Hit));
    }

    #[tokio::test]
    async fn test_stale_then_miss_and_deleted() {
        let (store, clock) = store();
        store
            .set("k", Value::from("v"), Duration::from_secs(60), Duration::from_secs(1))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        let read = store.get("k").await.unwrap();
        assert_eq!(read.status, CacheStatus::Stale);
        assert_eq!(read.value, Some(Value::from("v")));

        // ttl + max_stale + 1s
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.get("k").await.unwrap(), CacheRead::miss());
        assert!(store.is_empty());
        assert_eq!(store.get("k").await.unwrap(), CacheRead::miss());
    }

    #[tokio::test]
    async fn test_zero_max_stale_goes_straight_to_miss() {
        let (store, clock) = store();
        store
            .set("k", Value::from(1), Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get("k").await.unwrap(), CacheRead::miss());
    }

    #[tokio::test]
    async fn test_set_replaces_existing_entry() {
        let (store, clock) = store();
        store
            .set("k", Value::from(1), Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        store
            .set("k", Value::from(2), Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));

        let read = store.get("k").await.unwrap();
        assert_eq!(read, CacheRead::found(Value::from(2), CacheStatus::Hit));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (store, _clock) = store();
        for key in ["a", "b", "c"] {
            store
                .set(key, Value::Null, Duration::from_secs(60), Duration::ZERO)
                .await
                .unwrap();
        }

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), CacheRead::miss());
        assert_eq!(store.len(), 2);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_only_drops_fully_expired() {
        let (store, clock) = store();
        store
            .set("short", Value::Null, Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();
        store
            .set("stale", Value::Null, Duration::from_secs(10), Duration::from_secs(100))
            .await
            .unwrap();
        store
            .set("fresh", Value::Null, Duration::from_secs(600), Duration::ZERO)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(20));
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.cleanup_expired(), 0);
    }
}
