//! Clock abstraction so cooldowns and schedules can be tested by simulating time.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn epoch_ms(&self) -> i64;
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Controllable clock for tests. Clones share the same time.
#[derive(Clone)]
pub struct FakeClock {
    epoch_ms: Arc<Mutex<i64>>,
}

impl FakeClock {
    /// 2026-01-05T09:00:00Z, a Monday.
    pub const DEFAULT_START_MS: i64 = 1_767_603_600_000;

    pub fn new() -> Self {
        Self::at(Self::DEFAULT_START_MS)
    }

    pub fn at(epoch_ms: i64) -> Self {
        Self {
            epoch_ms: Arc::new(Mutex::new(epoch_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.epoch_ms.lock() += duration.as_millis() as i64;
    }

    pub fn set_epoch_ms(&self, ms: i64) {
        *self.epoch_ms.lock() = ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn epoch_ms(&self) -> i64 {
        *self.epoch_ms.lock()
    }
}

/// UTC calendar date (`YYYY-MM-DD`) for an epoch-ms timestamp.
pub fn date_bucket(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

/// Date buckets for the seven days ending on (and including) `epoch_ms`, oldest first.
pub fn week_buckets(epoch_ms: i64) -> Vec<String> {
    let today = DateTime::<Utc>::from_timestamp_millis(epoch_ms).unwrap_or_default();
    (0..7)
        .rev()
        .map(|days_back| {
            (today - ChronoDuration::days(days_back))
                .format("%Y-%m-%d")
                .to_string()
        })
        .collect()
}

/// Human-readable duration for alerts and CLI output, e.g. `1h 5m`, `45s`.
pub fn format_duration_ms(ms: i64) -> String {
    let secs = (ms.max(0) + 999) / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m", m)
    } else {
        format!("{}s", s)
    }
}
