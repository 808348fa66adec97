//! Process-local sliding-window limiter.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use super::{RateLimitDecision, RateLimitStore, validate_args};
use crate::SessionResult;
use crate::clock::{SharedClock, until};
use crate::config::BackendKind;

/// Admission timestamps of one key, oldest first, with the longest window
/// any check has applied to them.
#[derive(Debug, Default)]
struct Window {
    span: Duration,
    stamps: VecDeque<OffsetDateTime>,
}

/// Admission timestamps per key.
///
/// The whole prune/count/append sequence for a key runs while holding the
/// `DashMap` entry, so it is atomic with respect to other checks on the same
/// key.
pub struct MemoryRateLimitStore {
    windows: DashMap<String, Window>,
    clock: SharedClock,
}

impl MemoryRateLimitStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Drops timestamps at or before `cutoff`.
fn prune(window: &mut VecDeque<OffsetDateTime>, cutoff: OffsetDateTime) {
    while window.front().is_some_and(|t| *t <= cutoff) {
        window.pop_front();
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> SessionResult<RateLimitDecision> {
        validate_args(limit, window)?;

        let now = self.clock.now();
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let record = entry.value_mut();
        record.span = record.span.max(window);
        let timestamps = &mut record.stamps;

        prune(timestamps, now - window);
        let count = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        let oldest = timestamps.front().copied().unwrap_or(now);
        let oldest_exits_in = until(now, oldest + window);

        if count >= limit {
            return Ok(RateLimitDecision::evaluate(false, count, limit, oldest_exits_in));
        }

        timestamps.push_back(now);
        Ok(RateLimitDecision::evaluate(true, count, limit, oldest_exits_in))
    }

    async fn reset(&self, key: &str) -> SessionResult<()> {
        self.windows.remove(key);
        Ok(())
    }

    /// Never drops a timestamp still inside its key's window, even when
    /// `max_age` is shorter than that window.
    fn cleanup(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.windows.retain(|_, record| {
            prune(&mut record.stamps, now - record.span.max(max_age));
            let keep = !record.stamps.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!(removed, "pruned idle rate limit keys");
        }
        removed
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }
}
