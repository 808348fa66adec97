//! Sliding-window-log rate limiter.
//!
//! Each key holds the admission timestamps of the trailing window. A check
//! prunes timestamps at or before `now - window`, counts the rest, and
//! either rejects (`count >= limit`) or appends `now`. Prune, count and
//! append form one atomic unit per key: a shard lock in memory, a Lua
//! script in Redis. Two concurrent checks can never both take the last slot.
//!
//! Callers are split into two tiers:
//!
//! | Tier | Key | Default |
//! |------|-----|---------|
//! | authenticated | `user:{user_id}` | 100 / 60s |
//! | anonymous | `ip:{client_addr}` | 30 / 60s |

mod client_ip;
mod memory;
mod redis;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::SessionResult;
use crate::config::{BackendKind, FailurePolicy, RateLimitConfig, TierLimit};
use crate::error::SessionError;

pub use self::client_ip::TrustedProxies;
pub use self::memory::MemoryRateLimitStore;
pub use self::redis::RedisRateLimitStore;

/// Retry hint returned when the limiter fails closed on a backend outage.
pub const FAIL_CLOSED_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Admissions left in the current window after this one.
    pub remaining: u32,
    /// The limit the check ran against.
    pub limit: u32,
    /// Time until the oldest timestamp in the window expires.
    pub reset_after: Duration,
    /// Time to wait before retrying. Only set on rejection.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Builds the decision from the pre-check count and the time until the
    /// window's oldest timestamp exits.
    pub(crate) fn evaluate(admitted: bool, count: u32, limit: u32, oldest_exits_in: Duration) -> Self {
        if admitted {
            Self {
                allowed: true,
                remaining: limit.saturating_sub(count + 1),
                limit,
                reset_after: oldest_exits_in,
                retry_after: None,
            }
        } else {
            Self {
                allowed: false,
                remaining: 0,
                limit,
                reset_after: oldest_exits_in,
                retry_after: Some(oldest_exits_in),
            }
        }
    }

    /// `retry_after` rounded up to whole seconds, for the `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }

    /// `reset_after` rounded up to whole seconds.
    pub fn reset_after_secs(&self) -> u64 {
        ceil_secs(self.reset_after)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// Rejects arguments no window can satisfy.
pub(crate) fn validate_args(limit: u32, window: Duration) -> SessionResult<()> {
    if limit == 0 {
        return Err(SessionError::invalid_argument("rate limit must be > 0"));
    }
    if window.is_zero() {
        return Err(SessionError::invalid_argument("rate limit window must be > 0"));
    }
    Ok(())
}

/// Caller identity a rate limit is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Authenticated caller.
    User(String),
    /// Unauthenticated caller, by resolved client address.
    Ip(IpAddr),
}

impl RateLimitKey {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// Storage contract shared by the transient and persistent limiters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically prunes, counts and conditionally admits one request.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero `limit` or `window`; backend errors for
    /// the persistent store.
    async fn check(&self, key: &str, limit: u32, window: Duration) -> SessionResult<RateLimitDecision>;

    /// Drops every timestamp recorded for `key`.
    async fn reset(&self, key: &str) -> SessionResult<()>;

    /// Prunes timestamps older than `max_age` and removes emptied keys,
    /// returning how many keys were removed.
    ///
    /// Default is a no-op for backends with native TTL.
    fn cleanup(&self, _max_age: Duration) -> usize {
        0
    }

    fn backend(&self) -> BackendKind;
}

/// Tiered front end over a [`RateLimitStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
    trusted_proxies: TrustedProxies,
}

impl RateLimiter {
    /// # Errors
    ///
    /// Returns `Configuration` if a trusted proxy entry does not parse.
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> SessionResult<Self> {
        let trusted_proxies = TrustedProxies::parse(config.trusted_proxies.as_slice())?;
        Ok(Self {
            store,
            config,
            trusted_proxies,
        })
    }

    /// Runs a raw check against an explicit limit and window.
    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> SessionResult<RateLimitDecision> {
        self.store.check(key, limit, window).await
    }

    /// Administrative override: forget everything recorded for `key`.
    pub async fn reset(&self, key: &str) -> SessionResult<()> {
        self.store.reset(key).await?;
        tracing::info!(key = %key, "rate limit reset");
        Ok(())
    }

    /// Limit and window for an identity's tier.
    pub fn tier_for(&self, identity: &RateLimitKey) -> TierLimit {
        if identity.is_authenticated() {
            self.config.authenticated
        } else {
            self.config.anonymous
        }
    }

    /// Keys an authenticated request by user id, otherwise by client address.
    pub fn identify(
        &self,
        user_id: Option<&str>,
        peer: IpAddr,
        forwarded_for: Option<&str>,
    ) -> RateLimitKey {
        match user_id {
            Some(user) if !user.is_empty() => RateLimitKey::User(user.to_string()),
            _ => RateLimitKey::Ip(self.trusted_proxies.resolve_client_ip(peer, forwarded_for)),
        }
    }

    /// Checks an identity against its tier.
    ///
    /// A backend outage is resolved by the configured [`FailurePolicy`];
    /// other errors propagate.
    pub async fn check_identity(&self, identity: &RateLimitKey) -> SessionResult<RateLimitDecision> {
        let tier = self.tier_for(identity);
        let key = identity.to_string();

        match self.store.check(&key, tier.limit, tier.window).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(key = %key, retry_after = ?decision.retry_after, "rate limit exceeded");
                }
                Ok(decision)
            }
            Err(e) if e.is_backend_failure() => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    policy = ?self.config.failure_policy,
                    "rate limiter backend unavailable"
                );
                Ok(self.outage_decision(tier))
            }
            Err(e) => Err(e),
        }
    }

    fn outage_decision(&self, tier: TierLimit) -> RateLimitDecision {
        match self.config.failure_policy {
            FailurePolicy::FailClosed => RateLimitDecision {
                allowed: false,
                remaining: 0,
                limit: tier.limit,
                reset_after: FAIL_CLOSED_RETRY_AFTER,
                retry_after: Some(FAIL_CLOSED_RETRY_AFTER),
            },
            FailurePolicy::FailOpen => RateLimitDecision {
                allowed: true,
                remaining: tier.limit,
                limit: tier.limit,
                reset_after: tier.window,
                retry_after: None,
            },
        }
    }

    /// Prunes idle keys from a transient store.
    pub fn cleanup(&self) -> usize {
        self.store.cleanup(self.config.cleanup_max_age)
    }

    pub fn trusted_proxies(&self) -> &TrustedProxies {
        &self.trusted_proxies
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn backend(&self) -> BackendKind {
        self.store.backend()
    }
}
