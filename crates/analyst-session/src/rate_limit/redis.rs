//! Redis sliding-window limiter.
//!
//! Each key is a sorted set scored by admission time in fractional Unix
//! seconds. The check runs as one Lua script so prune, count and admit are
//! atomic across every instance sharing the Redis.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use uuid::Uuid;

use super::{RateLimitDecision, RateLimitStore, validate_args};
use crate::SessionResult;
use crate::clock::{SharedClock, unix_seconds};
use crate::config::BackendKind;
use crate::keyspace::{RATE_LIMIT_TTL_MARGIN, rate_limit_key};
use crate::persistent::RedisHandle;

/// KEYS[1] = window set
/// ARGV = now, window seconds, limit, member, expiry ms
///
/// Returns `{admitted, count_before, oldest_score}`.
const SLIDING_WINDOW: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local oldest = now
if count > 0 then
    local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    oldest = tonumber(first[2])
end

if count >= limit then
    return {0, count, tostring(oldest)}
end

redis.call('ZADD', KEYS[1], now, ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {1, count, tostring(oldest)}
";

pub struct RedisRateLimitStore {
    redis: RedisHandle,
    clock: SharedClock,
    script: redis::Script,
}

impl RedisRateLimitStore {
    pub fn new(redis: RedisHandle, clock: SharedClock) -> Self {
        Self {
            redis,
            clock,
            script: redis::Script::new(SLIDING_WINDOW),
        }
    }
}

/// Time until the oldest admission's score leaves the window.
fn oldest_exits_in(now: f64, oldest: f64, window: Duration) -> Duration {
    let remaining = oldest + window.as_secs_f64() - now;
    if remaining > 0.0 {
        Duration::try_from_secs_f64(remaining).unwrap_or(window)
    } else {
        Duration::ZERO
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> SessionResult<RateLimitDecision> {
        validate_args(limit, window)?;

        let now = unix_seconds(self.clock.now());
        // Unique per request so two admissions in the same instant both count.
        let member = format!("{now:.6}-{}", Uuid::new_v4());
        let expiry_ms = (window + RATE_LIMIT_TTL_MARGIN).as_millis() as u64;

        let mut conn = self.redis.connection().await?;
        let (admitted, count, oldest): (i64, i64, String) = self
            .redis
            .timed(
                "EVALSHA sliding_window",
                self.script
                    .key(rate_limit_key(key))
                    .arg(format!("{now:.6}"))
                    .arg(window.as_secs_f64())
                    .arg(limit)
                    .arg(member)
                    .arg(expiry_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        let oldest = oldest.parse::<f64>().unwrap_or(now);
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(RateLimitDecision::evaluate(
            admitted == 1,
            count,
            limit,
            oldest_exits_in(now, oldest, window),
        ))
    }

    async fn reset(&self, key: &str) -> SessionResult<()> {
        let mut conn = self.redis.connection().await?;
        self.redis
            .timed("DEL", conn.del::<_, ()>(rate_limit_key(key)))
            .await
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Redis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_exits_in() {
        let window = Duration::from_secs(60);
        assert_eq!(oldest_exits_in(100.0, 100.0, window), window);
        assert_eq!(oldest_exits_in(130.0, 100.0, window), Duration::from_secs(30));
        assert_eq!(oldest_exits_in(200.0, 100.0, window), Duration::ZERO);
    }
}
