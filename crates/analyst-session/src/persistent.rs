//! Shared Redis connection handle.
//!
//! All persistent-backend services share one [`RedisHandle`]: a
//! `deadpool_redis` pool plus the per-round-trip timeout. Every command goes
//! through [`RedisHandle::timed`], so a stalled Redis surfaces as
//! [`SessionError::Timeout`] instead of hanging the request.

use std::future::Future;
use std::time::Duration;

use deadpool_redis::{Connection, Pool};

use crate::SessionResult;
use crate::config::RedisConfig;
use crate::error::SessionError;

#[derive(Clone)]
pub struct RedisHandle {
    pool: Pool,
    timeout: Duration,
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisHandle")
            .field("pool_size", &status.size)
            .field("available", &status.available)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisHandle {
    /// Builds the pool and verifies connectivity with a `PING`.
    ///
    /// Unlike the request path, start-up does not degrade: if Redis was
    /// configured and cannot be reached, the process should not come up on a
    /// different backend than the rest of the fleet.
    pub async fn connect(config: &RedisConfig) -> SessionResult<Self> {
        tracing::info!(url = %redact_url(&config.url), "Connecting to Redis");

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = config.pool_size;
            pool_config.timeouts.wait = Some(config.timeout);
            pool_config.timeouts.create = Some(config.timeout);
            pool_config.timeouts.recycle = Some(config.timeout);
        } else {
            let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
            pool_config.timeouts.wait = Some(config.timeout);
            pool_config.timeouts.create = Some(config.timeout);
            pool_config.timeouts.recycle = Some(config.timeout);
            redis_config.pool = Some(pool_config);
        }

        let pool = redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        let handle = Self {
            pool,
            timeout: config.timeout,
        };

        handle.ping().await?;
        tracing::info!("Connected to Redis");
        Ok(handle)
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Checks out a pooled connection.
    pub async fn connection(&self) -> SessionResult<Connection> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(SessionError::Timeout {
                operation: "pool checkout",
                after: self.timeout,
            }),
        }
    }

    /// Runs one round trip under the configured timeout.
    pub async fn timed<T, F>(&self, operation: &'static str, fut: F) -> SessionResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                tracing::warn!(operation, error = %e, "Redis command failed");
                SessionError::from(e)
            }),
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.timeout, "Redis command timed out");
                Err(SessionError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    pub async fn ping(&self) -> SessionResult<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .timed("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    /// Returns `true` if a connection can be checked out and answers `PING`.
    pub async fn is_available(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Stops handing out connections and drops idle ones.
    pub fn close(&self) {
        self.pool.close();
        tracing::info!("Redis pool closed");
    }
}

/// Strips credentials from a Redis URL for logging.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
