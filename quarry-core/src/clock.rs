//! Injectable time source.
//!
//! Every TTL and refresh-interval decision reads the time through a
//! [`Clock`] so tests can freeze and advance it.

use chrono::{TimeDelta, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::Timestamp;

/// Source of "now".
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Clock shared between tiers, tracker and orchestrator.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// Frozen clock for tests. Only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    now_ms: AtomicI64,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// 2024-01-01 00:00:00 UTC
    pub const DEFAULT_BASE_MS: i64 = 1_704_067_200_000;

    pub fn new() -> Self {
        Self {
            now_ms: AtomicI64::new(Self::DEFAULT_BASE_MS),
        }
    }

    /// Clock pinned at `at`.
    pub fn frozen(at: Timestamp) -> Self {
        Self {
            now_ms: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.now_ms.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Timestamp {
        let ms = self.now_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
    }
}

/// Convert a std duration to a chrono delta, saturating on overflow.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `at + d`, saturating at the latest representable instant.
pub fn add_duration(at: Timestamp, d: Duration) -> Timestamp {
    at.checked_add_signed(to_delta(d))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

/// Time elapsed from `since` to `now`. A `since` in the future counts as zero.
pub fn elapsed(since: Timestamp, now: Timestamp) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
