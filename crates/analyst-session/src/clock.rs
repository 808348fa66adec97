//! Time source for expiry and window arithmetic.
//!
//! Every service asks a [`Clock`] for "now" instead of calling
//! `OffsetDateTime::now_utc()` directly, so TTL, sliding-window and
//! absolute-expiry behaviour can be tested without sleeping.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> OffsetDateTime;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same instant, so a test can hand one clone to a service
/// and keep another to advance time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Creates a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Shared clock handle held by the services.
pub type SharedClock = Arc<dyn Clock>;

/// Returns the span from `from` to `to`, clamped at zero.
pub(crate) fn until(from: OffsetDateTime, to: OffsetDateTime) -> Duration {
    let span = to - from;
    if span.is_negative() {
        Duration::ZERO
    } else {
        span.unsigned_abs()
    }
}

/// Fractional Unix seconds, the score format of the rate-limit sorted sets.
pub(crate) fn unix_seconds(at: OffsetDateTime) -> f64 {
    at.unix_timestamp_nanos() as f64 / 1_000_000_000.0
}

/// Unix milliseconds, the timestamp format of persisted token fields.
pub(crate) fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Inverse of [`unix_millis`]. Returns `None` for out-of-range values.
pub(crate) fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}
