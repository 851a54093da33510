use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{DayOfWeek, ReservationStatus, Span};
use crate::time::{self, TimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // input validation
    InvalidTimeFormat(String),
    TimeOutOfRange(i64),
    InvalidTimeRange {
        start: i64,
        end: i64,
    },
    InvalidTimeGranularity(Span),
    InvalidDuration(i64),
    InvalidDayOfWeek(i64),
    InvalidPrice(i64),
    // availability conflicts
    RuleConflict {
        rule_id: Ulid,
        day_of_week: DayOfWeek,
        span: Span,
    },
    BookingConflict {
        reservation_id: Ulid,
        span: Span,
    },
    TimeBlocked {
        blocked_id: Ulid,
        span: Span,
    },
    OutsideAvailability {
        requested: Span,
        uncovered: Vec<Span>,
    },
    NoAvailabilityRules(NaiveDate),
    // state machine
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    CannotCancelPastSlot(Ulid),
    CannotReservePast(NaiveDate, Span),
    NotOwner {
        court_id: Ulid,
        actor: Ulid,
    },
    HasReservations(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

fn fmt_span(span: &Span) -> String {
    format!("[{}, {})", time::display(span.start), time::display(span.end))
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTimeFormat(s) => {
                write!(f, "invalid time format: {s:?} (expected HH:MM)")
            }
            EngineError::TimeOutOfRange(m) => {
                write!(f, "minute {m} out of range [0, {}]", time::MAX_MINUTE)
            }
            EngineError::InvalidTimeRange { start, end } => {
                write!(f, "invalid time range: start {start} must be before end {end}, both within a day")
            }
            EngineError::InvalidTimeGranularity(span) => write!(
                f,
                "range {} is not aligned to {}-minute blocks",
                fmt_span(span),
                crate::model::BLOCK_MINUTES
            ),
            EngineError::InvalidDuration(d) => write!(
                f,
                "invalid duration {d}: must be a positive multiple of {} minutes",
                crate::model::BLOCK_MINUTES
            ),
            EngineError::InvalidDayOfWeek(d) => {
                write!(f, "invalid day of week {d}: expected 0 (Sunday) to 6 (Saturday)")
            }
            EngineError::InvalidPrice(p) => write!(f, "invalid price {p}"),
            EngineError::RuleConflict {
                rule_id,
                day_of_week,
                span,
            } => write!(
                f,
                "rule conflict: overlaps active rule {rule_id} on day {day_of_week} {}",
                fmt_span(span)
            ),
            EngineError::BookingConflict {
                reservation_id,
                span,
            } => write!(
                f,
                "booking conflict: overlaps reservation {reservation_id} {}",
                fmt_span(span)
            ),
            EngineError::TimeBlocked { blocked_id, span } => {
                write!(f, "time blocked: overlaps blocked range {blocked_id} {}", fmt_span(span))
            }
            EngineError::OutsideAvailability {
                requested,
                uncovered,
            } => {
                let gaps: Vec<String> = uncovered.iter().map(fmt_span).collect();
                write!(
                    f,
                    "range {} outside availability; uncovered: {}",
                    fmt_span(requested),
                    gaps.join(", ")
                )
            }
            EngineError::NoAvailabilityRules(date) => {
                write!(f, "no availability rules apply on {date}")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for reservation {id}: {from} -> {to}")
            }
            EngineError::CannotCancelPastSlot(id) => {
                write!(f, "cannot cancel reservation {id}: its start has already passed")
            }
            EngineError::CannotReservePast(date, span) => {
                write!(f, "cannot reserve {date} {}: start is not in the future", fmt_span(span))
            }
            EngineError::NotOwner { court_id, actor } => {
                write!(f, "{actor} is not permitted to act on court {court_id}")
            }
            EngineError::HasReservations(id) => {
                write!(f, "cannot delete court {id}: it has reservations")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<TimeError> for EngineError {
    fn from(e: TimeError) -> Self {
        match e {
            TimeError::InvalidTimeFormat(s) => EngineError::InvalidTimeFormat(s),
            TimeError::OutOfRange(m) => EngineError::TimeOutOfRange(m),
        }
    }
}
