//! Time abstraction: monotonic instants, wall time, and zone-aware wall
//! time, injectable so day-boundary and circuit-breaker timeout logic can
//! be driven deterministically in tests.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::Instant;

/// A source of time. Production code uses [`SystemClock`]; tests substitute
/// a fixed or steppable implementation.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// A monotonic instant, used for measuring elapsed durations
    /// (circuit-breaker timeouts, query latency) unaffected by wall-clock
    /// adjustments.
    fn monotonic(&self) -> Instant;

    /// Current wall-clock time projected into `tz`.
    fn now_in(&self, tz: Tz) -> DateTime<Tz> {
        self.now_utc().with_timezone(&tz)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose wall time is set explicitly. Visible crate-wide (not just
/// within this module's own test block) so other modules' tests can drive
/// day-boundary and breaker-timeout scenarios deterministically.
#[cfg(test)]
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    started: Instant,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
            started: Instant::now(),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += delta;
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn system_clock_now_in_projects_timezone() {
        let clock = SystemClock;
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let projected = clock.now_in(berlin);
        assert_eq!(projected.timezone(), berlin);
    }

    #[test]
    fn fixed_clock_reports_set_time() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::new(t);
        assert_eq!(clock.now_utc(), t);
    }

    #[test]
    fn fixed_clock_advance_moves_forward() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 22, 59, 0).unwrap();
        let clock = FixedClock::new(t);
        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(clock.now_utc(), t + chrono::Duration::minutes(2));
    }

    #[test]
    fn fixed_clock_projects_into_configured_zone() {
        // 22:00 UTC on 2026-01-01 is 23:00 in Europe/Berlin (winter, UTC+1).
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 22, 0, 0).unwrap();
        let clock = FixedClock::new(t);
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let local = clock.now_in(berlin);
        assert_eq!(local.hour(), 23);
    }
}
