//! Wall-clock `HH:MM` strings <-> minutes since midnight.
//!
//! Minutes in `[0, 1439]` are the canonical time representation everywhere
//! else in the crate.

use chrono::{NaiveTime, Timelike};

use crate::model::Minute;

/// Last representable minute of a day (23:59).
pub const MAX_MINUTE: Minute = 1439;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    InvalidTimeFormat(String),
    OutOfRange(i64),
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::InvalidTimeFormat(s) => write!(f, "invalid time format: {s:?} (expected HH:MM)"),
            TimeError::OutOfRange(m) => write!(f, "minute {m} out of range [0, {MAX_MINUTE}]"),
        }
    }
}

impl std::error::Error for TimeError {}

/// Parse `"HH:MM"` into minutes since midnight.
///
/// Exactly two digits, a colon, two digits. Hours above 23 or minutes above
/// 59 are rejected.
pub fn to_minutes(s: &str) -> Result<Minute, TimeError> {
    let bad = || TimeError::InvalidTimeFormat(s.to_string());
    // chrono alone would also take "9:00".
    let shape_ok = s.len() == 5
        && s.bytes()
            .enumerate()
            .all(|(i, b)| if i == 2 { b == b':' } else { b.is_ascii_digit() });
    if !shape_ok {
        return Err(bad());
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| bad())?;
    Ok((t.hour() * 60 + t.minute()) as Minute)
}

/// Format minutes since midnight as `"HH:MM"`.
pub fn to_formatted(minutes: impl Into<i64>) -> Result<String, TimeError> {
    let m = minutes.into();
    if !(0..=i64::from(MAX_MINUTE)).contains(&m) {
        return Err(TimeError::OutOfRange(m));
    }
    Ok(display(m as Minute))
}

/// Format without a range check. Values past 23:59 render as e.g. `24:00`.
pub fn display(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Accept either representation: an integer minute or an `HH:MM` string.
pub fn parse_minute(s: &str) -> Result<Minute, TimeError> {
    let s = s.trim();
    if s.contains(':') {
        return to_minutes(s);
    }
    let m: i64 = s
        .parse()
        .map_err(|_| TimeError::InvalidTimeFormat(s.to_string()))?;
    check_minute(m)
}

pub fn check_minute(m: i64) -> Result<Minute, TimeError> {
    if (0..=i64::from(MAX_MINUTE)).contains(&m) {
        Ok(m as Minute)
    } else {
        Err(TimeError::OutOfRange(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_times() {
        assert_eq!(to_minutes("00:00").unwrap(), 0);
        assert_eq!(to_minutes("09:00").unwrap(), 540);
        assert_eq!(to_minutes("18:00").unwrap(), 1080);
        assert_eq!(to_minutes("23:59").unwrap(), 1439);
    }

    #[test]
    fn rejects_malformed() {
        let malformed = [
            "9:00", "09:0", "0900", "09-00", "24:00", "12:60", "ab:cd", " 09:00", "09:00 ", "", "+9:00",
            "9:00 ", "09:-1", "1:000",
        ];
        for s in malformed {
            assert!(
                matches!(to_minutes(s), Err(TimeError::InvalidTimeFormat(_))),
                "{s:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_non_ascii_without_panicking() {
        assert!(to_minutes("0é:00").is_err());
    }

    #[test]
    fn formats_and_bounds() {
        assert_eq!(to_formatted(0u16).unwrap(), "00:00");
        assert_eq!(to_formatted(690u16).unwrap(), "11:30");
        assert_eq!(to_formatted(1439u16).unwrap(), "23:59");
        assert_eq!(to_formatted(1440i64), Err(TimeError::OutOfRange(1440)));
        assert_eq!(to_formatted(-1i64), Err(TimeError::OutOfRange(-1)));
    }

    #[test]
    fn round_trip_every_minute() {
        for m in 0..=MAX_MINUTE {
            let s = to_formatted(m).unwrap();
            assert_eq!(to_minutes(&s).unwrap(), m);
            assert_eq!(to_formatted(to_minutes(&s).unwrap()).unwrap(), s);
        }
    }

    #[test]
    fn parse_minute_accepts_both_forms() {
        assert_eq!(parse_minute("10:30").unwrap(), 630);
        assert_eq!(parse_minute("630").unwrap(), 630);
        assert_eq!(parse_minute("1440"), Err(TimeError::OutOfRange(1440)));
        assert!(parse_minute("ten").is_err());
    }
}
