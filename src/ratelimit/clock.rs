//! Time sources for admission checks.
//!
//! Every engine works on explicit [`Timestamp`]s so that decisions are a pure
//! function of counter state, policy and time. The [`Clock`] trait supplies
//! "now" when a caller does not, and [`FakeClock`] allows tests to move time
//! forward deterministically.

use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time, in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis * 1_000_000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs * 1_000_000_000)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Time elapsed since `earlier`, saturating at zero.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// A timestamp `duration` in the past, saturating at the epoch.
    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Convert to a UTC datetime for display and policy time bounds.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.0.min(i64::MAX as u64) as i64)
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_nanos_opt().unwrap_or(0).max(0) as u64)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_nanos(rhs)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// Nanoseconds in a duration, clamped to `u64`.
pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// A time source used by the decision coordinator.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(duration_nanos(since_epoch))
    }
}

/// A mock clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the coordinator and advance another.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start.as_nanos())),
        }
    }

    /// Advances the fake clock by the given amount.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_nanos(by), Ordering::AcqRel);
    }

    /// Jumps the fake clock to an absolute time.
    pub fn set(&self, to: Timestamp) {
        self.now.store(to.as_nanos(), Ordering::Release);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(1500);
        assert_eq!(t + Duration::from_millis(500), Timestamp::from_secs(2));
        assert_eq!(t.saturating_sub(Duration::from_secs(5)), Timestamp::ZERO);
        assert_eq!(
            Timestamp::from_secs(2).duration_since(t),
            Duration::from_millis(500)
        );
        assert_eq!(t.duration_since(Timestamp::from_secs(2)), Duration::ZERO);
    }

    #[test]
    fn test_fake_clock_shared_between_clones() {
        let clock = FakeClock::default();
        let other = clock.clone();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp::from_millis(250));

        clock.set(Timestamp::from_secs(10));
        assert_eq!(other.now(), Timestamp::from_secs(10));
    }

    #[test]
    fn test_datetime_conversion() {
        let t = Timestamp::from_secs(1_704_067_200);
        assert_eq!(t.to_datetime().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(Timestamp::from_datetime(t.to_datetime()), t);
    }
}
