//! Time sources for span timing.
//!
//! Span start/end times are taken from a monotonic-derived [`Clock`] rather
//! than the wall clock, so that durations survive NTP adjustments and
//! suspend/resume. The clock pins a wall-clock origin at construction and
//! converts back to absolute unix nanoseconds only at wire-encoding time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Nanoseconds elapsed since the owning clock's origin.
///
/// A `Timestamp` is only meaningful relative to the clock that produced it;
/// use [`Clock::to_unix_nanos`] to obtain an absolute time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The clock origin itself.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Construct from nanoseconds since the clock origin.
    pub fn from_nanos(nanos: u64) -> Timestamp {
        Timestamp(nanos)
    }

    /// Nanoseconds since the clock origin.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier`, saturating to zero when `earlier` is
    /// actually later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// This timestamp advanced by `duration`, saturating at the maximum
    /// representable value.
    pub fn saturating_add(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_nanos() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// A caller-supplied instant for explicit span start/end times.
///
/// Producers that already hold a clock-relative [`Timestamp`] (e.g. captured
/// from an earlier `now()`) pass it through unchanged; wall-clock times are
/// converted against the clock origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Time {
    /// A value previously obtained from [`Clock::now`].
    Timestamp(Timestamp),
    /// A wall-clock time, converted via the clock's origin.
    Wall(SystemTime),
}

impl From<Timestamp> for Time {
    fn from(value: Timestamp) -> Self {
        Time::Timestamp(value)
    }
}

impl From<SystemTime> for Time {
    fn from(value: SystemTime) -> Self {
        Time::Wall(value)
    }
}

/// Monotonic-safe time source correlated with the wall clock.
///
/// Implementations never fail; they only degrade precision. `now()` must be
/// non-decreasing across calls even if the underlying source regresses.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Current time relative to the clock origin. Non-decreasing.
    fn now(&self) -> Timestamp;

    /// Current wall-clock time, consistent with `now()` through the origin
    /// pair cached at construction.
    fn date(&self) -> SystemTime;

    /// Convert a clock-relative timestamp to absolute unix nanoseconds.
    fn to_unix_nanos(&self, timestamp: Timestamp) -> u64;

    /// Convert a wall-clock time to a clock-relative timestamp. Returns
    /// `None` for times predating the clock origin, which callers treat as
    /// "unspecified".
    fn convert(&self, wall: SystemTime) -> Option<Timestamp>;

    /// Resolve a caller-supplied [`Time`] to a clock-relative timestamp.
    fn resolve(&self, time: Time) -> Option<Timestamp> {
        match time {
            Time::Timestamp(timestamp) => Some(timestamp),
            Time::Wall(wall) => self.convert(wall),
        }
    }
}

/// Production clock: `Instant` for elapsed time, `SystemTime` captured once
/// at construction for the wall-clock origin.
pub struct MonotonicClock {
    origin: Instant,
    // Unix nanoseconds at `origin`. A pre-epoch system clock collapses to 0
    // rather than failing.
    wall_origin_nanos: u64,
    // Highest value handed out so far; `now()` never goes backwards even if
    // the platform source does.
    last_returned: AtomicU64,
}

impl MonotonicClock {
    /// A clock whose origin is the moment of this call.
    pub fn new() -> MonotonicClock {
        let origin = Instant::now();
        let wall_origin_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        MonotonicClock {
            origin,
            wall_origin_nanos,
            last_returned: AtomicU64::new(0),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("wall_origin_nanos", &self.wall_origin_nanos)
            .finish()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.origin.elapsed().as_nanos() as u64;
        let prev = self.last_returned.fetch_max(elapsed, Ordering::Relaxed);
        Timestamp(prev.max(elapsed))
    }

    fn date(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.to_unix_nanos(self.now()))
    }

    fn to_unix_nanos(&self, timestamp: Timestamp) -> u64 {
        self.wall_origin_nanos.saturating_add(timestamp.as_nanos())
    }

    fn convert(&self, wall: SystemTime) -> Option<Timestamp> {
        let unix_nanos = wall.duration_since(UNIX_EPOCH).ok()?.as_nanos() as u64;
        unix_nanos
            .checked_sub(self.wall_origin_nanos)
            .map(Timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_non_decreasing() {
        let clock = MonotonicClock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let current = clock.now();
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn unix_nanos_tracks_wall_clock() {
        let clock = MonotonicClock::new();
        let reported = clock.to_unix_nanos(clock.now());
        let actual = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;

        // Within a second of the real wall clock.
        assert!(actual.abs_diff(reported) < Duration::from_secs(1).as_nanos() as u64);
    }

    #[test]
    fn date_is_consistent_with_now() {
        let clock = MonotonicClock::new();
        let date = clock.date();
        let converted = clock.convert(date).expect("date is after origin");
        let now = clock.now();
        assert!(now.duration_since(converted) < Duration::from_secs(1));
    }

    #[test]
    fn convert_rejects_times_before_origin() {
        let clock = MonotonicClock::new();
        let stale = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(clock.convert(stale), None);
    }

    #[test]
    fn resolve_passes_timestamps_through() {
        let clock = MonotonicClock::new();
        let timestamp = Timestamp::from_nanos(42);
        assert_eq!(clock.resolve(Time::Timestamp(timestamp)), Some(timestamp));
    }

    #[test]
    fn duration_since_saturates() {
        let earlier = Timestamp::from_nanos(100);
        let later = Timestamp::from_nanos(400);
        assert_eq!(later.duration_since(earlier), Duration::from_nanos(300));
        assert_eq!(earlier.duration_since(later), Duration::ZERO);
    }
}
