// src/clock.rs

//! Time source abstraction
//!
//! Every timing decision (check interval, lock staleness, rate-limit
//! windows) reads the clock through this trait so tests can move time
//! explicitly instead of sleeping.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

/// Provides the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as Unix seconds
    fn unix_now(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the given Unix timestamp
    pub fn at_unix(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = Duration::from_std(by).unwrap_or(Duration::zero());
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Format Unix seconds as `YYYY-MM-DD HH:MM:SS` (UTC)
pub fn format_unix(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}
