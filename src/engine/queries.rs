use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{check_duration, compose_multiple, compose_slots, filter_blocks, generate_base_blocks};
use super::conflict::exclusion_spans;
use super::{Engine, EngineError, SharedCourtState};

/// Base blocks, free blocks and optional slots for one date. A weekday with
/// no active rule is reported as closed rather than as an error.
fn day_availability(
    cs: &CourtState,
    date: NaiveDate,
    now: Ms,
    duration: Option<Minute>,
) -> Result<DayAvailability, EngineError> {
    let base_blocks = match generate_base_blocks(&cs.rules, date) {
        Ok(blocks) => blocks,
        Err(EngineError::NoAvailabilityRules(_)) => {
            return Ok(DayAvailability {
                date,
                closed: true,
                base_blocks: Vec::new(),
                free_blocks: Vec::new(),
                slots: duration.map(|_| Vec::new()),
            });
        }
        Err(e) => return Err(e),
    };
    let free_blocks = filter_blocks(&base_blocks, &exclusion_spans(cs, date, now));
    let slots = duration.map(|d| compose_slots(&free_blocks, d)).transpose()?;
    Ok(DayAvailability {
        date,
        closed: false,
        base_blocks,
        free_blocks,
        slots,
    })
}

fn check_optional_duration(duration: Option<i64>) -> Result<Option<Minute>, EngineError> {
    duration.map(check_duration).transpose()
}

impl Engine {
    fn court(&self, id: &Ulid) -> Result<SharedCourtState, EngineError> {
        self.get_court(id).ok_or(EngineError::NotFound(*id))
    }

    // ── Collaborator lookups ─────────────────────────────

    pub fn court_exists(&self, id: &Ulid) -> bool {
        self.state.contains_key(id)
    }

    pub async fn owner_of(&self, id: &Ulid) -> Option<Ulid> {
        let cs = self.get_court(id)?;
        let guard = cs.read().await;
        Some(guard.owner_id)
    }

    pub async fn base_price(&self, id: &Ulid) -> Option<i64> {
        let cs = self.get_court(id)?;
        let guard = cs.read().await;
        Some(guard.base_price)
    }

    // ── Listings ─────────────────────────────────────────

    pub async fn list_courts(&self) -> Vec<CourtInfo> {
        let courts: Vec<SharedCourtState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(courts.len());
        for cs in courts {
            let guard = cs.read().await;
            out.push(CourtInfo {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                base_price: guard.base_price,
            });
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn court_info(&self, id: Ulid) -> Result<CourtInfo, EngineError> {
        let cs = self.court(&id)?;
        let guard = cs.read().await;
        Ok(CourtInfo {
            id: guard.id,
            owner_id: guard.owner_id,
            name: guard.name.clone(),
            base_price: guard.base_price,
        })
    }

    /// Rules ordered by `(day_of_week, start)`.
    pub async fn list_rules(&self, court_id: Ulid, active_only: bool) -> Result<Vec<Rule>, EngineError> {
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        Ok(guard
            .rules
            .iter()
            .flatten()
            .filter(|r| !active_only || r.active)
            .cloned()
            .collect())
    }

    pub async fn get_rule(&self, id: Ulid) -> Result<Rule, EngineError> {
        let court_id = self.get_court_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        guard.rule(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn list_blocked_ranges(
        &self,
        court_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<BlockedRange>, EngineError> {
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        Ok(match date {
            Some(d) => guard.blocked_on(d).to_vec(),
            None => guard.blocked.values().flatten().cloned().collect(),
        })
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let court_id = self.get_court_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Reservations ordered by `(date, start)`.
    pub async fn list_reservations(
        &self,
        court_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        Ok(match date {
            Some(d) => guard.reservations_on(d).to_vec(),
            None => guard.all_reservations().cloned().collect(),
        })
    }

    pub async fn opening_hours(&self) -> OpeningHours {
        *self.opening_hours.read().await
    }

    // ── Availability ─────────────────────────────────────

    /// Rule-derived 30-minute blocks for `date`, before exclusions.
    pub async fn base_blocks(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<TimeBlock>, EngineError> {
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        generate_base_blocks(&guard.rules, date)
    }

    pub async fn availability_for_date(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        duration: Option<i64>,
    ) -> Result<DayAvailability, EngineError> {
        let duration = check_optional_duration(duration)?;
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        day_availability(&guard, date, self.now_ms(), duration)
    }

    /// One entry per date in `[start, end]`. Dates before today are skipped
    /// and nothing past `MAX_RANGE_DAYS` from today is returned. All dates
    /// come from the same snapshot of the court.
    pub async fn availability_for_range(
        &self,
        court_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        duration: Option<i64>,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        let duration = check_optional_duration(duration)?;
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;

        let now = self.now_ms();
        let today = self.today();
        let horizon = today
            .checked_add_days(Days::new((MAX_RANGE_DAYS - 1) as u64))
            .unwrap_or(NaiveDate::MAX);
        let first = start.max(today);
        let last = end.min(horizon);

        let mut days = Vec::new();
        for date in first.iter_days().take_while(|d| *d <= last) {
            days.push(day_availability(&guard, date, now, duration)?);
        }
        Ok(days)
    }

    /// Slots for several durations on one date, keyed by duration.
    pub async fn slots_for_durations(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        durations: &[i64],
    ) -> Result<BTreeMap<Minute, Vec<Slot>>, EngineError> {
        if durations.len() > MAX_DURATIONS_PER_QUERY {
            return Err(EngineError::LimitExceeded("too many durations"));
        }
        let durations = durations
            .iter()
            .map(|d| check_duration(*d))
            .collect::<Result<Vec<_>, _>>()?;
        let cs = self.court(&court_id)?;
        let guard = cs.read().await;
        let day = day_availability(&guard, date, self.now_ms(), None)?;
        compose_multiple(&day.free_blocks, &durations)
    }
}
