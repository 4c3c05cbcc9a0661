//! Controllable clock
//!
//! The clock is the only source of "now" in the engine. Production uses the
//! wall clock; tests and administrative tooling advance a virtual one.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

/// Source of the current time
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Virtual clock that only moves when told to
///
/// # Example
///
/// ```
/// use conductor_engine::{Clock, ControlledClock};
/// use std::time::Duration;
///
/// let clock = ControlledClock::default();
/// let before = clock.now();
/// clock.advance(Duration::from_secs(3));
/// assert_eq!((clock.now() - before).num_seconds(), 3);
/// ```
#[derive(Debug)]
pub struct ControlledClock {
    current: RwLock<DateTime<Utc>>,
}

impl ControlledClock {
    /// Create a clock pinned at the given instant
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.write();
        *current = add_duration(*current, duration);
    }

    /// Pin the clock to an instant; moving backwards is ignored
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut current = self.current.write();
        if instant > *current {
            *current = instant;
        }
    }
}

impl Default for ControlledClock {
    /// Starts at 2024-01-01T00:00:00Z so tests do not depend on the wall clock
    fn default() -> Self {
        Self::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        )
    }
}

impl Clock for ControlledClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

/// Saturating `instant + duration`
pub(crate) fn add_duration(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controlled_clock_advances() {
        let clock = ControlledClock::default();
        let start = clock.now();

        clock.advance(Duration::from_millis(1500));

        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn test_controlled_clock_is_monotonic() {
        let clock = ControlledClock::default();
        let start = clock.now();

        clock.set(start - chrono::Duration::seconds(10));
        assert_eq!(clock.now(), start);

        clock.set(start + chrono::Duration::seconds(10));
        assert_eq!((clock.now() - start).num_seconds(), 10);
    }

    #[test]
    fn test_add_duration_saturates() {
        let result = add_duration(DateTime::<Utc>::MAX_UTC, Duration::from_secs(1));
        assert_eq!(result, DateTime::<Utc>::MAX_UTC);
    }
}
