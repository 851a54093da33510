use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time::MAX_MINUTE;

use super::availability::uncovered;
use super::EngineError;

/// Ordered range of minutes within one day.
pub(crate) fn validate_span(start: i64, end: i64) -> Result<Span, EngineError> {
    let day = 0..=i64::from(MAX_MINUTE);
    if !day.contains(&start) || !day.contains(&end) || start >= end {
        return Err(EngineError::InvalidTimeRange { start, end });
    }
    Ok(Span::new(start as Minute, end as Minute))
}

/// A reservation range additionally sits on the 30-minute grid.
pub(crate) fn validate_reservation_span(start: i64, end: i64) -> Result<Span, EngineError> {
    let span = validate_span(start, end)?;
    if span.start % BLOCK_MINUTES != 0 || span.end % BLOCK_MINUTES != 0 {
        return Err(EngineError::InvalidTimeGranularity(span));
    }
    Ok(span)
}

pub(crate) fn validate_day(day: i64) -> Result<DayOfWeek, EngineError> {
    if (0..=6).contains(&day) {
        Ok(day as DayOfWeek)
    } else {
        Err(EngineError::InvalidDayOfWeek(day))
    }
}

pub(crate) fn validate_price(price: i64) -> Result<i64, EngineError> {
    if (0..=crate::limits::MAX_PRICE).contains(&price) {
        Ok(price)
    } else {
        Err(EngineError::InvalidPrice(price))
    }
}

/// Everything that takes a range out of availability on `date`: blocked
/// ranges plus live reservations. Unsorted.
pub(crate) fn exclusion_spans(cs: &CourtState, date: NaiveDate, now: Ms) -> Vec<Span> {
    cs.blocked_on(date)
        .iter()
        .map(|b| b.span)
        .chain(cs.live_reservations(date, now).map(|r| r.span))
        .collect()
}

/// Fails on the first live reservation or blocked range overlapping `span`.
/// Reservations are checked first so a double booking is reported as such.
pub(crate) fn check_range_free(
    cs: &CourtState,
    date: NaiveDate,
    span: &Span,
    now: Ms,
) -> Result<(), EngineError> {
    if let Some(r) = cs.live_reservations(date, now).find(|r| r.span.overlaps(span)) {
        return Err(EngineError::BookingConflict {
            reservation_id: r.id,
            span: r.span,
        });
    }
    if let Some(b) = cs.blocked_on(date).iter().find(|b| b.span.overlaps(span)) {
        return Err(EngineError::TimeBlocked {
            blocked_id: b.id,
            span: b.span,
        });
    }
    Ok(())
}

/// Active rules for `date`'s weekday that intersect `span`.
pub(crate) fn covering_rules<'a>(
    cs: &'a CourtState,
    date: NaiveDate,
    span: &'a Span,
) -> impl Iterator<Item = &'a Rule> + 'a {
    cs.active_rules_for_day(day_of_week(date))
        .filter(move |r| r.span.overlaps(span))
}

/// `span` must be fully covered by the union of the day's active rules.
pub(crate) fn check_covered(cs: &CourtState, date: NaiveDate, span: &Span) -> Result<(), EngineError> {
    let coverage: Vec<Span> = covering_rules(cs, date, span).map(|r| r.span).collect();
    let gaps = uncovered(span, &coverage);
    if gaps.is_empty() {
        Ok(())
    } else {
        Err(EngineError::OutsideAvailability {
            requested: *span,
            uncovered: gaps,
        })
    }
}

/// Price of a covered range. Each minute is charged at the hourly rate of
/// the rule covering it (its override, else the court base price).
pub(crate) fn compute_price(cs: &CourtState, date: NaiveDate, span: &Span) -> i64 {
    let total: i64 = covering_rules(cs, date, span)
        .map(|r| {
            let rate = r.price_override.unwrap_or(cs.base_price);
            i64::from(r.span.overlap_minutes(span)) * rate
        })
        .sum();
    total / 60
}

/// No two active rules on one court and weekday may overlap. `exclude` is
/// the rule being edited.
pub(crate) fn check_rule_overlap(
    cs: &CourtState,
    day: DayOfWeek,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match cs
        .active_rules_for_day(day)
        .filter(|r| Some(r.id) != exclude)
        .find(|r| r.span.overlaps(span))
    {
        Some(r) => Err(EngineError::RuleConflict {
            rule_id: r.id,
            day_of_week: day,
            span: r.span,
        }),
        None => Ok(()),
    }
}
