use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::model::{Minute, Ms};

/// Source of "now" as unix milliseconds.
///
/// Expiry, the cancellation cut-off and "today" all read the clock through
/// this trait so tests can move time deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Facility wall-clock time for a unix timestamp.
pub fn local_datetime(now: Ms, offset: FixedOffset) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(now)
        .unwrap_or_default()
        .with_timezone(&offset)
        .naive_local()
}

/// Wall-clock instant of `minute` on `date`.
pub fn wall_clock(date: NaiveDate, minute: Minute) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(minute))
}

/// Unix ms of a facility wall-clock instant.
pub fn to_unix_ms(local: NaiveDateTime, offset: FixedOffset) -> Ms {
    (local - Duration::seconds(i64::from(offset.local_minus_utc())))
        .and_utc()
        .timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn local_datetime_applies_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let nine = wall_clock(date, 540);

        let ms = to_unix_ms(nine, utc);
        assert_eq!(local_datetime(ms, utc), nine);
        assert_eq!(local_datetime(ms, plus_two), wall_clock(date, 660));

        let ms_local = to_unix_ms(nine, plus_two);
        assert_eq!(ms - ms_local, 2 * 3_600_000);
        assert_eq!(local_datetime(ms_local, plus_two), nine);
    }

    #[test]
    fn wall_clock_minutes() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(wall_clock(date, 0), date.and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(wall_clock(date, 1439), date.and_hms_opt(23, 59, 0).unwrap());
    }
}
