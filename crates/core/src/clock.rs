//! Wall clocks used to timestamp activation and firing instants.

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Uncorrected local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Local time shifted by a fixed offset (computed once from NTP, read-only after).
#[derive(Debug, Clone, Copy)]
pub struct OffsetClock {
    offset: Duration,
}

impl OffsetClock {
    pub fn new(offset: Duration) -> Self { Self { offset } }
    pub fn uncorrected() -> Self { Self { offset: Duration::zero() } }
    pub fn offset(&self) -> Duration { self.offset }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        now.checked_add_signed(self.offset).unwrap_or(now)
    }
}

/// Seconds since the Unix epoch; the persisted form of activation/firing instants.
pub fn unix_secs(t: DateTime<Utc>) -> i64 { t.timestamp() }

/// Inverse of [`unix_secs`]; 0 is the "not set" sentinel and maps to `None`.
pub fn from_unix_secs(secs: i64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}
