//! Schedule evaluation.
//!
//! A schedule is an absolute UTC instant written as `YYYY-MM-DDTHH:MM:SSZ`.
//! Evaluating it yields the signed time left until that instant; overdue
//! schedules give a negative duration.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{Error, Result};

/// Wire format of a schedule.
pub const SCHEDULE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Move the clock forward (or backward, for negative deltas).
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse a schedule string.
///
/// The input must match `YYYY-MM-DDTHH:MM:SSZ` exactly: no fractional seconds,
/// no numeric offsets, no surrounding whitespace.
///
/// # Errors
///
/// Returns [`Error::ScheduleParse`] when the string does not match the format
/// or names an instant that does not exist (e.g. February 30th).
pub fn parse_schedule(schedule: &str) -> Result<DateTime<Utc>> {
    if !has_schedule_shape(schedule) {
        return Err(Error::schedule_parse(
            schedule,
            "expected format YYYY-MM-DDTHH:MM:SSZ",
        ));
    }

    NaiveDateTime::parse_from_str(schedule, SCHEDULE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::schedule_parse(schedule, e.to_string()))
}

/// Render an instant in schedule format, truncated to whole seconds.
pub fn format_schedule(instant: DateTime<Utc>) -> String {
    instant.format(SCHEDULE_FORMAT).to_string()
}

/// Signed duration from `now` until the schedule elapses.
///
/// # Errors
///
/// Returns [`Error::ScheduleParse`] for malformed schedules.
pub fn time_until(schedule: &str, now: DateTime<Utc>) -> Result<Duration> {
    parse_schedule(schedule).map(|target| target - now)
}

/// Signed duration until the schedule elapses, sampling `clock` once.
///
/// # Errors
///
/// Returns [`Error::ScheduleParse`] for malformed schedules.
pub fn time_until_schedule(schedule: &str, clock: &dyn Clock) -> Result<Duration> {
    time_until(schedule, clock.now())
}

fn has_schedule_shape(schedule: &str) -> bool {
    const SHAPE: &[u8; 20] = b"dddd-dd-ddTdd:dd:ddZ";

    let bytes = schedule.as_bytes();
    bytes.len() == SHAPE.len()
        && bytes.iter().zip(SHAPE.iter()).all(|(&b, &expected)| {
            if expected == b'd' {
                b.is_ascii_digit()
            } else {
                b == expected
            }
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_valid_schedule() {
        let parsed = parse_schedule("2021-07-04T12:30:05Z").unwrap();
        assert_eq!(parsed, instant(2021, 7, 4, 12, 30, 5));
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for bad in [
            "",
            "now",
            "2021-07-04",
            "2021-07-04T12:30:05",
            "2021-07-04T12:30:05+00:00",
            "2021-07-04T12:30:05.123Z",
            " 2021-07-04T12:30:05Z",
            "2021-07-04T12:30:05Z ",
            "2021-07-04t12:30:05Z",
            "2021-7-04T12:30:05ZZ",
        ] {
            assert!(
                matches!(parse_schedule(bad), Err(Error::ScheduleParse { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_impossible_dates() {
        assert!(parse_schedule("2021-02-30T00:00:00Z").is_err());
        assert!(parse_schedule("2021-01-01T24:00:00Z").is_err());
    }

    #[test]
    fn test_time_until_future_and_past() {
        let now = instant(2021, 7, 4, 12, 0, 0);
        assert_eq!(
            time_until("2021-07-04T12:00:02Z", now).unwrap(),
            Duration::seconds(2)
        );
        assert_eq!(
            time_until("2021-07-04T11:59:00Z", now).unwrap(),
            Duration::seconds(-60)
        );
        assert_eq!(
            time_until("2021-07-04T12:00:00Z", now).unwrap(),
            Duration::zero()
        );
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(instant(2021, 7, 4, 12, 0, 0));
        let before = time_until_schedule("2021-07-04T12:00:10Z", &clock).unwrap();
        clock.advance(Duration::seconds(10));
        let after = time_until_schedule("2021-07-04T12:00:10Z", &clock).unwrap();

        assert_eq!(before, Duration::seconds(10));
        assert_eq!(after, Duration::zero());
    }

    #[test]
    fn test_format_schedule_truncates() {
        let at = instant(2021, 7, 4, 12, 0, 0) + Duration::milliseconds(750);
        assert_eq!(format_schedule(at), "2021-07-04T12:00:00Z");
        assert!(parse_schedule(&format_schedule(at)).is_ok());
    }
}
