//! Configuration for the session services.
//!
//! The backend is an explicit deployment choice. There is no runtime probe
//! that silently downgrades to memory when Redis is missing: `backend =
//! "redis"` either connects or fails start-up.
//!
//! # Example (TOML)
//!
//! ```toml
//! [session]
//! backend = "redis"
//!
//! [session.redis]
//! url = "redis://cache.internal:6379"
//! timeout = "2s"
//!
//! [session.rate_limit]
//! trusted_proxies = ["10.0.0.0/8"]
//! failure_policy = "fail_closed"
//!
//! [session.rate_limit.authenticated]
//! limit = 100
//! window = "60s"
//!
//! [session.tokens]
//! absolute_lifetime = "30days"
//! sliding_window = "7days"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::TrustedProxies;

/// Which implementation backs every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local state. Only correct when one instance serves all traffic.
    #[default]
    Memory,
    /// Shared Redis store, safe for horizontally scaled deployments.
    Redis,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

/// Root configuration of the session services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend used by all three services.
    pub backend: BackendKind,
    /// Redis connection settings, used when `backend = "redis"`.
    pub redis: RedisConfig,
    /// Cache service settings.
    pub cache: CacheConfig,
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Refresh token lifetimes.
    pub tokens: TokenConfig,
    /// Periodic cleanup task.
    pub maintenance: MaintenanceConfig,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379").
    pub url: String,

    /// Connection pool size.
    pub pool_size: usize,

    /// Bound on a single round trip, including waiting for a pooled
    /// connection.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Transient store: a fully expired entry is removed on read or by the
    /// periodic sweep, whichever comes first.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Limit and window for one caller tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Maximum admitted requests inside the window.
    pub limit: u32,
    /// Length of the trailing window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Behaviour of the rate limiter when the backend cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the request.
    #[default]
    FailClosed,
    /// Admit the request without recording it.
    FailOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests carrying an authenticated user id, keyed by that id.
    pub authenticated: TierLimit,
    /// Requests without a user, keyed by client address.
    pub anonymous: TierLimit,
    /// What `check_identity` does when the backend is unavailable.
    pub failure_policy: FailurePolicy,
    /// Reverse proxies (IP or CIDR) whose `X-Forwarded-For` is honoured.
    pub trusted_proxies: Vec<String>,
    /// Transient store: timestamps older than this are dropped by cleanup.
    #[serde(with = "humantime_serde")]
    pub cleanup_max_age: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            authenticated: TierLimit {
                limit: 100,
                window: Duration::from_secs(60),
            },
            anonymous: TierLimit {
                limit: 30,
                window: Duration::from_secs(60),
            },
            failure_policy: FailurePolicy::FailClosed,
            trusted_proxies: Vec::new(),
            cleanup_max_age: Duration::from_secs(300),
        }
    }
}

/// Refresh token lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Ceiling measured from issuance, never extended.
    #[serde(with = "humantime_serde")]
    pub absolute_lifetime: Duration,
    /// Validity measured from the last use.
    #[serde(with = "humantime_serde")]
    pub sliding_window: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            absolute_lifetime: Duration::from_secs(30 * 24 * 3600),
            sliding_window: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
        }
    }
}

/// Errors produced by [`SessionConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl SessionConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - a rate-limit tier has a zero limit or window
    /// - a trusted proxy entry is not an IP address or CIDR block
    /// - the sliding window exceeds the absolute lifetime
    /// - a Redis value is unusable while `backend = "redis"`
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, tier) in [
            ("authenticated", &self.rate_limit.authenticated),
            ("anonymous", &self.rate_limit.anonymous),
        ] {
            if tier.limit == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "rate_limit.{name}.limit must be > 0"
                )));
            }
            if tier.window.is_zero() {
                return Err(ConfigError::InvalidValue(format!(
                    "rate_limit.{name}.window must be > 0"
                )));
            }
        }

        TrustedProxies::parse(self.rate_limit.trusted_proxies.as_slice())
            .map_err(|e| ConfigError::InvalidValue(format!("rate_limit.trusted_proxies: {e}")))?;

        if self.tokens.absolute_lifetime.is_zero() || self.tokens.sliding_window.is_zero() {
            return Err(ConfigError::InvalidValue(
                "token lifetimes must be > 0".to_string(),
            ));
        }
        if self.tokens.sliding_window > self.tokens.absolute_lifetime {
            return Err(ConfigError::InvalidValue(
                "tokens.sliding_window must be <= tokens.absolute_lifetime".to_string(),
            ));
        }

        if self.maintenance.enabled && self.maintenance.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "maintenance.interval must be > 0".to_string(),
            ));
        }
        if self.maintenance.enabled && self.cache.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "cache.sweep_interval must be > 0".to_string(),
            ));
        }

        if self.backend == BackendKind::Redis {
            if self.redis.url.is_empty() {
                return Err(ConfigError::Missing("redis.url".to_string()));
            }
            if self.redis.pool_size == 0 {
                return Err(ConfigError::InvalidValue(
                    "redis.pool_size must be > 0".to_string(),
                ));
            }
            if self.redis.timeout.is_zero() {
                return Err(ConfigError::InvalidValue(
                    "redis.timeout must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}
