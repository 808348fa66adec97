//! Response cache with stale-while-error.
//!
//! ## Read outcomes
//!
//! ```text
//! created_at ──── ttl ────▶ expires_at ── max_stale ──▶ stale_until
//!      │        HIT           │          STALE           │   MISS (deleted)
//! ```
//!
//! [`CacheService::get_or_set`] refetches on MISS or STALE. If the fetch
//! fails while a stale value is still inside its tolerance window, the stale
//! value is served instead of the error. A zero `max_stale` disables that.
//!
//! ## Backends
//!
//! - [`MemoryCacheStore`]: `DashMap`, per-key shard locking, single instance
//! - [`RedisCacheStore`]: JSON strings under `cache:{key}` with native TTL

mod memory;
mod redis;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::SessionResult;
use crate::config::BackendKind;

pub use self::memory::MemoryCacheStore;
pub use self::redis::RedisCacheStore;

/// Outcome of a cache read, surfaced to clients as the `X-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value with its freshness metadata. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default, with = "humantime_serde")]
    pub max_stale: Duration,
}

impl CacheEntry {
    pub fn new(value: Value, created_at: OffsetDateTime, ttl: Duration, max_stale: Duration) -> Self {
        Self {
            value,
            created_at,
            ttl,
            max_stale,
        }
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at + self.ttl
    }

    pub fn stale_until(&self) -> OffsetDateTime {
        self.expires_at() + self.max_stale
    }

    /// Returns `HIT` or `STALE`, or `None` once the entry is fully expired.
    pub fn status_at(&self, now: OffsetDateTime) -> Option<CacheStatus> {
        if now < self.expires_at() {
            Some(CacheStatus::Hit)
        } else if now < self.stale_until() {
            Some(CacheStatus::Stale)
        } else {
            None
        }
    }
}

/// Raw read result from a [`CacheStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub value: Option<Value>,
    pub status: CacheStatus,
}

impl CacheRead {
    pub fn miss() -> Self {
        Self {
            value: None,
            status: CacheStatus::Miss,
        }
    }

    pub fn found(value: Value, status: CacheStatus) -> Self {
        Self {
            value: Some(value),
            status,
        }
    }
}

/// Storage contract shared by the transient and persistent caches.
///
/// Values are opaque JSON. Every mutating call touches only its own key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Reads `key`. A fully expired entry is deleted and reported as MISS.
    async fn get(&self, key: &str) -> SessionResult<CacheRead>;

    /// Replaces any entry under `key`.
    async fn set(&self, key: &str, value: Value, ttl: Duration, max_stale: Duration)
    -> SessionResult<()>;

    async fn delete(&self, key: &str) -> SessionResult<()>;

    /// Removes every entry owned by the cache.
    async fn clear(&self) -> SessionResult<()>;

    /// Removes fully expired entries, returning how many were dropped.
    ///
    /// Default is a no-op for backends with native TTL.
    fn cleanup_expired(&self) -> usize {
        0
    }

    fn backend(&self) -> BackendKind;
}

/// Named `(ttl, max_stale)` pairs for the upstream-backed endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_stale: Duration,
}

impl CachePolicy {
    pub const PRICE: Self = Self::new(30, 300);
    pub const TRENDING: Self = Self::new(60, 600);
    pub const SEARCH: Self = Self::new(300, 1800);
    pub const MARKET_OVERVIEW: Self = Self::new(60, 600);
    pub const HISTORICAL: Self = Self::new(300, 3600);

    const fn new(ttl_secs: u64, max_stale_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            max_stale: Duration::from_secs(max_stale_secs),
        }
    }
}

/// Typed front end over a [`CacheStore`].
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn CacheStore>,
}

impl CacheService {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Reads and decodes `key`.
    ///
    /// A stored value that no longer decodes as `T` is treated as a corrupt
    /// record: it is deleted and reported as MISS.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> SessionResult<(Option<T>, CacheStatus)> {
        let read = self.store.get(key).await?;
        let Some(raw) = read.value else {
            return Ok((None, CacheStatus::Miss));
        };

        match serde_json::from_value(raw) {
            Ok(value) => Ok((Some(value), read.status)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached value does not decode, dropping entry");
                self.store.delete(key).await?;
                Ok((None, CacheStatus::Miss))
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        max_stale: Duration,
    ) -> SessionResult<()> {
        let value = serde_json::to_value(value)?;
        self.store.set(key, value, ttl, max_stale).await
    }

    pub async fn delete(&self, key: &str) -> SessionResult<()> {
        self.store.delete(key).await
    }

    pub async fn clear(&self) -> SessionResult<()> {
        self.store.clear().await
    }

    /// Returns the cached value, or fetches, stores and returns a fresh one.
    ///
    /// - HIT: cached value, `fetch` is not called.
    /// - fetch succeeds: fresh value with `MISS`.
    /// - fetch fails after a STALE read: stale value with `STALE`.
    /// - fetch fails with nothing stale: the fetch error.
    ///
    /// Cache backend failures never fail the call. A read failure counts as
    /// MISS and a write failure still returns the fresh value.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        max_stale: Duration,
        fetch: F,
    ) -> Result<(T, CacheStatus), E>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (cached, status) = match self.get::<T>(key).await {
            Ok(read) => read,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed, treating as miss");
                (None, CacheStatus::Miss)
            }
        };

        if status == CacheStatus::Hit {
            if let Some(value) = cached {
                tracing::debug!(key = %key, "cache hit");
                return Ok((value, CacheStatus::Hit));
            }
        }

        match fetch().await {
            Ok(fresh) => {
                if let Err(e) = self.set(key, &fresh, ttl, max_stale).await {
                    tracing::warn!(key = %key, error = %e, "cache write failed, returning uncached value");
                }
                tracing::debug!(key = %key, "cache miss, stored fresh value");
                Ok((fresh, CacheStatus::Miss))
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to fetch fresh data");
                match (status, cached) {
                    (CacheStatus::Stale, Some(stale)) => {
                        tracing::info!(key = %key, "serving stale data");
                        Ok((stale, CacheStatus::Stale))
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// [`get_or_set`](Self::get_or_set) with a preset policy.
    pub async fn get_or_set_with<T, E, F, Fut>(
        &self,
        key: &str,
        policy: CachePolicy,
        fetch: F,
    ) -> Result<(T, CacheStatus), E>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_set(key, policy.ttl, policy.max_stale, fetch).await
    }

    /// Sweeps fully expired entries from a transient store.
    pub fn cleanup_expired(&self) -> usize {
        self.store.cleanup_expired()
    }

    pub fn backend(&self) -> BackendKind {
        self.store.backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> (CacheService, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = MemoryCacheStore::new(Arc::new(clock.clone()));
        (CacheService::new(Arc::new(store)), clock)
    }

    #[test]
    fn test_entry_status_boundaries() {
        let t0 = OffsetDateTime::now_utc();
        let entry = CacheEntry::new(
            Value::from(1),
            t0,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );

        assert_eq!(entry.status_at(t0), Some(CacheStatus::Hit));
        assert_eq!(
            entry.status_at(t0 + Duration::from_secs(60)),
            Some(CacheStatus::Stale)
        );
        assert_eq!(
            entry.status_at(t0 + Duration::from_secs(89)),
            Some(CacheStatus::Stale)
        );
        assert_eq!(entry.status_at(t0 + Duration::from_secs(90)), None);
    }

    #[test]
    fn test_cache_status_wire_format() {
        assert_eq!(CacheStatus::Hit.to_string(), "HIT");
        assert_eq!(serde_json::to_string(&CacheStatus::Stale).unwrap(), "\"STALE\"");
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let (cache, _clock) = service();
        cache
            .set("k", &vec![1, 2, 3], Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        let (value, status) = cache.get::<Vec<i32>>("k").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert_eq!(status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_dropped() {
        let (cache, _clock) = service();
        cache
            .set("k", &"not a number", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        let (value, status) = cache.get::<u64>("k").await.unwrap();
        assert_eq!(value, None);
        assert_eq!(status, CacheStatus::Miss);

        let (value, _) = cache.get::<String>("k").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_get_or_set_hit_skips_fetch() {
        let (cache, _clock) = service();
        cache
            .set("k", &"cached", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let (value, status) = cache
            .get_or_set("k", Duration::from_secs(60), Duration::ZERO, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("fresh".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "cached");
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_or_set_miss_fetches_and_stores() {
        let (cache, _clock) = service();

        let (value, status) = cache
            .get_or_set("k", Duration::from_secs(60), Duration::ZERO, || async {
                Ok::<_, String>(42u64)
            })
            .await
            .unwrap();
        assert_eq!((value, status), (42, CacheStatus::Miss));

        let (value, status) = cache.get::<u64>("k").await.unwrap();
        assert_eq!((value, status), (Some(42), CacheStatus::Hit));
    }

    #[tokio::test]
    async fn test_get_or_set_serves_stale_on_fetch_failure() {
        let (cache, clock) = service();
        cache
            .set("price", &100u64, Duration::from_secs(60), Duration::from_secs(300))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));

        let (value, status) = cache
            .get_or_set("price", Duration::from_secs(60), Duration::from_secs(300), || async {
                Err::<u64, _>("upstream unavailable")
            })
            .await
            .unwrap();

        assert_eq!(value, 100);
        assert_eq!(status, CacheStatus::Stale);
    }

    #[tokio::test]
    async fn test_get_or_set_refreshes_stale_on_success() {
        let (cache, clock) = service();
        cache
            .set("price", &100u64, Duration::from_secs(60), Duration::from_secs(300))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));

        let (value, status) = cache
            .get_or_set_with("price", CachePolicy::PRICE, || async { Ok::<_, String>(101u64) })
            .await
            .unwrap();
        assert_eq!((value, status), (101, CacheStatus::Miss));

        let (value, status) = cache.get::<u64>("price").await.unwrap();
        assert_eq!((value, status), (Some(101), CacheStatus::Hit));
    }

    #[tokio::test]
    async fn test_get_or_set_propagates_without_stale() {
        let (cache, _clock) = service();

        let err = cache
            .get_or_set("k", Duration::from_secs(60), Duration::ZERO, || async {
                Err::<u64, _>("upstream unavailable".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err, "upstream unavailable");
    }

    #[tokio::test]
    async fn test_get_or_set_propagates_after_stale_window() {
        let (cache, clock) = service();
        cache
            .set("k", &1u64, Duration::from_secs(60), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(71));

        let result = cache
            .get_or_set("k", Duration::from_secs(60), Duration::from_secs(10), || async {
                Err::<u64, _>("down")
            })
            .await;
        assert_eq!(result.unwrap_err(), "down");
    }

    #[test]
    fn test_presets() {
        assert_eq!(CachePolicy::PRICE.ttl, Duration::from_secs(30));
        assert_eq!(CachePolicy::PRICE.max_stale, Duration::from_secs(300));
        assert_eq!(CachePolicy::HISTORICAL.max_stale, Duration::from_secs(3600));
    }
}
