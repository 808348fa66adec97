//! Process-wide service singletons.
//!
//! A [`ServiceRegistry`] is built once at start-up from [`SessionConfig`].
//! Every service in it shares the same backend kind, the same clock and,
//! for Redis, the same connection pool. Clones are cheap handles onto the
//! same services.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::SessionResult;
use crate::cache::{CacheService, CacheStore, MemoryCacheStore, RedisCacheStore};
use crate::clock::SharedClock;
use crate::config::{BackendKind, SessionConfig};
use crate::error::SessionError;
use crate::persistent::RedisHandle;
use crate::rate_limit::{MemoryRateLimitStore, RateLimitStore, RateLimiter, RedisRateLimitStore};
use crate::token::{MemoryTokenStore, RedisTokenStore, RefreshFlow, TokenStore};

#[derive(Clone)]
pub struct ServiceRegistry {
    config: Arc<SessionConfig>,
    redis: Option<RedisHandle>,
    cache: CacheService,
    rate_limiter: RateLimiter,
    tokens: Arc<dyn TokenStore>,
}

impl ServiceRegistry {
    /// Builds all three services on the configured backend.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the configuration does not validate, or a
    /// backend error if `backend = "redis"` and Redis cannot be reached.
    pub async fn from_config(config: &SessionConfig, clock: SharedClock) -> SessionResult<Self> {
        config
            .validate()
            .map_err(|e| SessionError::configuration(e.to_string()))?;

        let redis = match config.backend {
            BackendKind::Memory => None,
            BackendKind::Redis => Some(RedisHandle::connect(&config.redis).await?),
        };

        let cache_store: Arc<dyn CacheStore> = match &redis {
            Some(redis) => Arc::new(RedisCacheStore::new(redis.clone(), clock.clone())),
            None => Arc::new(MemoryCacheStore::new(clock.clone())),
        };
        let rate_store: Arc<dyn RateLimitStore> = match &redis {
            Some(redis) => Arc::new(RedisRateLimitStore::new(redis.clone(), clock.clone())),
            None => Arc::new(MemoryRateLimitStore::new(clock.clone())),
        };
        let token_store: Arc<dyn TokenStore> = match &redis {
            Some(redis) => Arc::new(RedisTokenStore::new(redis.clone(), config.tokens, clock)),
            None => Arc::new(MemoryTokenStore::new(config.tokens, clock)),
        };

        let registry = Self {
            config: Arc::new(config.clone()),
            redis,
            cache: CacheService::new(cache_store),
            rate_limiter: RateLimiter::new(rate_store, config.rate_limit.clone())?,
            tokens: token_store,
        };

        tracing::info!(backend = config.backend.as_str(), "session services initialized");
        Ok(registry)
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// Refresh protocol over the registry's token store.
    pub fn refresh_flow(&self) -> RefreshFlow {
        RefreshFlow::new(Arc::clone(&self.tokens))
    }

    pub fn backend(&self) -> BackendKind {
        self.config.backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// `true` for the memory backend, otherwise whether Redis answers.
    pub async fn is_healthy(&self) -> bool {
        match &self.redis {
            Some(redis) => redis.is_available().await,
            None => true,
        }
    }

    /// Starts the periodic sweep of transient state.
    ///
    /// Returns `None` when maintenance is disabled. Redis-backed services
    /// expire their keys natively, so the sweep is a no-op for them.
    pub fn spawn_maintenance(&self) -> Option<MaintenanceHandle> {
        if !self.config.maintenance.enabled {
            return None;
        }

        let cache = self.cache.clone();
        let rate_limiter = self.rate_limiter.clone();
        let tokens = Arc::clone(&self.tokens);
        let cache_every = self.config.cache.sweep_interval;
        let sweep_every = self.config.maintenance.interval;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut cache_tick = tokio::time::interval(cache_every);
            let mut sweep_tick = tokio::time::interval(sweep_every);
            cache_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = cache_tick.tick() => {
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "cache sweep completed");
                        }
                    }
                    _ = sweep_tick.tick() => {
                        let keys = rate_limiter.cleanup();
                        let expired_tokens = tokens.cleanup_expired();
                        if keys > 0 || expired_tokens > 0 {
                            tracing::debug!(keys, tokens = expired_tokens, "session sweep completed");
                        }
                    }
                }
            }
            tracing::debug!("maintenance task stopped");
        });

        tracing::info!(
            cache_interval = ?cache_every,
            interval = ?sweep_every,
            "maintenance task started"
        );
        Some(MaintenanceHandle {
            stop: Some(stop_tx),
            task,
        })
    }

    /// Releases backend resources. Services must not be used afterwards.
    pub fn shutdown(&self) {
        if let Some(redis) = &self.redis {
            redis.close();
        }
        tracing::info!("session services shut down");
    }
}

/// Handle to the task started by [`ServiceRegistry::spawn_maintenance`].
///
/// Dropping the handle also stops the task.
pub struct MaintenanceHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signals the task and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "maintenance task ended abnormally");
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
