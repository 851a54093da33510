use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for expiry and audit timestamps.
pub type Ms = i64;

/// Minutes since midnight, `0..=1439` for stored values.
pub type Minute = u16;

/// Width of a base block and the reservation granularity.
pub const BLOCK_MINUTES: Minute = 30;

/// Day of week, Sunday = 0.
pub type DayOfWeek = u8;

pub fn day_of_week(date: NaiveDate) -> DayOfWeek {
    date.weekday().num_days_from_sunday() as DayOfWeek
}

/// Half-open minute range `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Minutes shared with `other`, zero when disjoint.
    pub fn overlap_minutes(&self, other: &Span) -> Minute {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        end.saturating_sub(start)
    }
}

/// A free base block, before or after exclusions. Never persisted.
pub type TimeBlock = Span;

/// A composed candidate window of `duration` minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Minute,
    pub end: Minute,
    pub duration: Minute,
}

/// Weekly availability rule for one court.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Ulid,
    pub court_id: Ulid,
    pub day_of_week: DayOfWeek,
    pub span: Span,
    /// Per-hour price that replaces the court's base price inside this rule.
    pub price_override: Option<i64>,
    pub active: bool,
}

/// Partial rule update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePatch {
    pub day_of_week: Option<DayOfWeek>,
    pub start: Option<Minute>,
    pub end: Option<Minute>,
    pub price_override: Option<Option<i64>>,
}

/// Administrative closure of a range on a specific date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedRange {
    pub id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
    Completed,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "rejected" => Some(ReservationStatus::Rejected),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "completed" => Some(ReservationStatus::Completed),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    /// The legal transition table.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Rejected | Expired | Cancelled)
                | (Confirmed, Cancelled | Completed)
        )
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub court_id: Ulid,
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: ReservationStatus,
    /// Set only while pending.
    pub expires_at: Option<Ms>,
    pub price: i64,
    pub reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    /// Live reservations hold their range: confirmed ones, and pending ones
    /// whose hold has not lapsed (`expires_at >= now`).
    pub fn is_live(&self, now: Ms) -> bool {
        match self.status {
            ReservationStatus::Confirmed => true,
            ReservationStatus::Pending => self.expires_at.is_some_and(|at| at >= now),
            _ => false,
        }
    }
}

/// In-memory state of one court: rules indexed by weekday, plus blocked
/// ranges and reservations indexed by date.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: Option<String>,
    /// Per-hour price in minor currency units.
    pub base_price: i64,
    /// Slot `d` holds the rules for weekday `d`, sorted by `span.start`.
    pub rules: [Vec<Rule>; 7],
    pub blocked: BTreeMap<NaiveDate, Vec<BlockedRange>>,
    /// Sorted by `span.start` within each date.
    pub reservations: BTreeMap<NaiveDate, Vec<Reservation>>,
    blocked_dates: HashMap<Ulid, NaiveDate>,
    reservation_dates: HashMap<Ulid, NaiveDate>,
    /// Ids of pending or confirmed reservations.
    open: BTreeSet<Ulid>,
    /// Ids of pending reservations, the reaper's work list.
    pending: BTreeSet<Ulid>,
}

impl CourtState {
    pub fn new(id: Ulid, owner_id: Ulid, name: Option<String>, base_price: i64) -> Self {
        Self {
            id,
            owner_id,
            name,
            base_price,
            rules: Default::default(),
            blocked: BTreeMap::new(),
            reservations: BTreeMap::new(),
            blocked_dates: HashMap::new(),
            reservation_dates: HashMap::new(),
            open: BTreeSet::new(),
            pending: BTreeSet::new(),
        }
    }

    // ── Rules ────────────────────────────────────────────────

    pub fn rule_count(&self) -> usize {
        self.rules.iter().map(Vec::len).sum()
    }

    pub fn rules_for_day(&self, day: DayOfWeek) -> &[Rule] {
        &self.rules[usize::from(day % 7)]
    }

    pub fn active_rules_for_day(&self, day: DayOfWeek) -> impl Iterator<Item = &Rule> {
        self.rules_for_day(day).iter().filter(|r| r.active)
    }

    pub fn rule(&self, id: &Ulid) -> Option<&Rule> {
        self.rules.iter().flatten().find(|r| r.id == *id)
    }

    /// Insert or replace a rule, keeping each weekday sorted by start.
    pub fn upsert_rule(&mut self, rule: Rule) {
        self.remove_rule(&rule.id);
        let day = &mut self.rules[usize::from(rule.day_of_week % 7)];
        let pos = day.partition_point(|r| r.span.start <= rule.span.start);
        day.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: &Ulid) -> Option<Rule> {
        for day in self.rules.iter_mut() {
            if let Some(pos) = day.iter().position(|r| r.id == *id) {
                return Some(day.remove(pos));
            }
        }
        None
    }

    pub fn set_rule_active(&mut self, id: &Ulid, active: bool) -> bool {
        match self.rules.iter_mut().flatten().find(|r| r.id == *id) {
            Some(rule) => {
                rule.active = active;
                true
            }
            None => false,
        }
    }

    // ── Blocked ranges ───────────────────────────────────────

    pub fn blocked_on(&self, date: NaiveDate) -> &[BlockedRange] {
        self.blocked.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked_dates.len()
    }

    pub fn blocked_range(&self, id: &Ulid) -> Option<&BlockedRange> {
        let date = self.blocked_dates.get(id)?;
        self.blocked.get(date)?.iter().find(|b| b.id == *id)
    }

    pub fn insert_blocked(&mut self, range: BlockedRange) {
        self.blocked_dates.insert(range.id, range.date);
        let day = self.blocked.entry(range.date).or_default();
        let pos = day.partition_point(|b| b.span.start <= range.span.start);
        day.insert(pos, range);
    }

    pub fn remove_blocked(&mut self, id: &Ulid) -> Option<BlockedRange> {
        let date = self.blocked_dates.remove(id)?;
        let day = self.blocked.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == *id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.blocked.remove(&date);
        }
        Some(removed)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Every reservation ever placed, terminal ones included.
    pub fn reservation_count(&self) -> usize {
        self.reservation_dates.len()
    }

    /// Reservations still pending or confirmed.
    pub fn open_reservation_count(&self) -> usize {
        self.open.len()
    }

    pub fn pending_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.pending.iter().filter_map(|id| self.reservation(id))
    }

    pub fn reservations_on(&self, date: NaiveDate) -> &[Reservation] {
        self.reservations.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn live_reservations(&self, date: NaiveDate, now: Ms) -> impl Iterator<Item = &Reservation> {
        self.reservations_on(date).iter().filter(move |r| r.is_live(now))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        let date = self.reservation_dates.get(id)?;
        self.reservations.get(date)?.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        let date = self.reservation_dates.get(id)?;
        self.reservations.get_mut(date)?.iter_mut().find(|r| r.id == *id)
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        self.reservation_dates.insert(reservation.id, reservation.date);
        self.index_status(reservation.id, reservation.status);
        let day = self.reservations.entry(reservation.date).or_default();
        let pos = day.partition_point(|r| r.span.start <= reservation.span.start);
        day.insert(pos, reservation);
    }

    pub fn all_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().flatten()
    }

    /// Move a reservation to `status`. Clears the hold deadline.
    pub fn set_reservation_status(
        &mut self,
        id: &Ulid,
        status: ReservationStatus,
        reason: Option<String>,
        at: Ms,
    ) -> bool {
        let Some(r) = self.reservation_mut(id) else {
            return false;
        };
        r.status = status;
        r.expires_at = None;
        r.updated_at = at;
        if reason.is_some() {
            r.reason = reason;
        }
        self.index_status(*id, status);
        true
    }

    fn index_status(&mut self, id: Ulid, status: ReservationStatus) {
        match status {
            ReservationStatus::Pending => {
                self.open.insert(id);
                self.pending.insert(id);
            }
            ReservationStatus::Confirmed => {
                self.open.insert(id);
                self.pending.remove(&id);
            }
            _ => {
                self.open.remove(&id);
                self.pending.remove(&id);
            }
        }
    }
}

/// Facility opening hours, slot `d` is weekday `d`. Seeds the rules of
/// newly created courts.
pub type OpeningHours = [Option<Span>; 7];

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OpeningHoursSet {
        day_of_week: DayOfWeek,
        span: Option<Span>,
    },
    CourtCreated {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        base_price: i64,
        /// Rules seeded from opening hours, committed with the court.
        rules: Vec<Rule>,
    },
    CourtUpdated {
        id: Ulid,
        name: Option<String>,
        base_price: i64,
    },
    CourtDeleted {
        id: Ulid,
    },
    RuleAdded {
        rule: Rule,
    },
    RuleUpdated {
        rule: Rule,
    },
    RuleDeactivated {
        id: Ulid,
        court_id: Ulid,
    },
    BlockAdded {
        range: BlockedRange,
    },
    BlockRemoved {
        id: Ulid,
        court_id: Ulid,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        court_id: Ulid,
        at: Ms,
    },
    ReservationRejected {
        id: Ulid,
        court_id: Ulid,
        reason: Option<String>,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        court_id: Ulid,
        reason: Option<String>,
        at: Ms,
    },
    ReservationCompleted {
        id: Ulid,
        court_id: Ulid,
        at: Ms,
    },
    ReservationExpired {
        id: Ulid,
        court_id: Ulid,
        at: Ms,
    },
}

impl Event {
    /// Court the event applies to; `None` for facility-level events.
    pub fn court_id(&self) -> Option<Ulid> {
        match self {
            Event::OpeningHoursSet { .. } => None,
            Event::CourtCreated { id, .. }
            | Event::CourtUpdated { id, .. }
            | Event::CourtDeleted { id } => Some(*id),
            Event::RuleAdded { rule } | Event::RuleUpdated { rule } => Some(rule.court_id),
            Event::BlockAdded { range } => Some(range.court_id),
            Event::ReservationPlaced { reservation } => Some(reservation.court_id),
            Event::RuleDeactivated { court_id, .. }
            | Event::BlockRemoved { court_id, .. }
            | Event::ReservationConfirmed { court_id, .. }
            | Event::ReservationRejected { court_id, .. }
            | Event::ReservationCancelled { court_id, .. }
            | Event::ReservationCompleted { court_id, .. }
            | Event::ReservationExpired { court_id, .. } => Some(*court_id),
        }
    }

    /// Reservation id and resulting status, for reservation lifecycle events.
    pub fn reservation_transition(&self) -> Option<(Ulid, ReservationStatus)> {
        match self {
            Event::ReservationPlaced { reservation } => {
                Some((reservation.id, ReservationStatus::Pending))
            }
            Event::ReservationConfirmed { id, .. } => Some((*id, ReservationStatus::Confirmed)),
            Event::ReservationRejected { id, .. } => Some((*id, ReservationStatus::Rejected)),
            Event::ReservationCancelled { id, .. } => Some((*id, ReservationStatus::Cancelled)),
            Event::ReservationCompleted { id, .. } => Some((*id, ReservationStatus::Completed)),
            Event::ReservationExpired { id, .. } => Some((*id, ReservationStatus::Expired)),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: Option<String>,
    pub base_price: i64,
}

/// Availability of one court on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    /// No active rule applies to the weekday.
    pub closed: bool,
    pub base_blocks: Vec<TimeBlock>,
    pub free_blocks: Vec<TimeBlock>,
    /// Present when a duration was requested.
    pub slots: Option<Vec<Slot>>,
}

/// A reservation state change, published to subscribers of the court.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChange {
    pub reservation_id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub start: Minute,
    pub end: Minute,
    pub status: ReservationStatus,
}

impl From<&Reservation> for ReservationChange {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            court_id: r.court_id,
            date: r.date,
            start: r.span.start,
            end: r.span.end,
            status: r.status,
        }
    }
}
