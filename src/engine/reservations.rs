use chrono::NaiveDate;
use ulid::Ulid;

use crate::clock;
use crate::model::*;
use crate::observability;

use super::conflict::{check_covered, check_range_free, compute_price, validate_reservation_span};
use super::mutations::check_reason;
use super::{Engine, EngineError};

fn check_transition(r: &Reservation, to: ReservationStatus) -> Result<(), EngineError> {
    if r.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            id: r.id,
            from: r.status,
            to,
        })
    }
}

fn record_reserve_failure(e: &EngineError) {
    let kind = match e {
        EngineError::BookingConflict { .. } => "booking_conflict",
        EngineError::TimeBlocked { .. } => "time_blocked",
        EngineError::OutsideAvailability { .. } => "outside_availability",
        _ => return,
    };
    metrics::counter!(observability::RESERVE_CONFLICTS_TOTAL, "kind" => kind).increment(1);
}

impl Engine {
    /// Place a pending reservation.
    ///
    /// Everything after range validation runs under the court's write lock:
    /// the overlap check, the coverage check, pricing and the WAL append. Two
    /// concurrent requests for overlapping ranges therefore resolve as one
    /// success and one `BookingConflict`.
    pub async fn reserve(
        &self,
        id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        start: i64,
        end: i64,
        requester_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let span = validate_reservation_span(start, end)?;
        let mut guard = self.write_court(&court_id).await?;
        if guard.open_reservation_count() >= self.settings.max_open_reservations {
            return Err(EngineError::LimitExceeded("too many reservations on court"));
        }
        if self.entity_to_court.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = self.now_ms();
        let local_now = clock::local_datetime(now, self.settings.utc_offset);
        if clock::wall_clock(date, span.start) <= local_now {
            return Err(EngineError::CannotReservePast(date, span));
        }
        check_range_free(&guard, date, &span, now).inspect_err(record_reserve_failure)?;
        check_covered(&guard, date, &span).inspect_err(record_reserve_failure)?;

        let reservation = Reservation {
            id,
            court_id,
            requester_id,
            date,
            span,
            status: ReservationStatus::Pending,
            expires_at: Some(now + self.settings.pending_ttl_ms),
            price: compute_price(&guard, date, &span),
            reason: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationPlaced {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("reservation {id} placed on court {court_id} {date} [{}, {})", span.start, span.end);
        Ok(reservation)
    }

    /// Owner accepts a pending reservation. A pending reservation whose hold
    /// already lapsed can no longer be confirmed.
    pub async fn confirm(&self, id: Ulid, actor: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let r = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if actor != guard.owner_id {
            return Err(EngineError::NotOwner {
                court_id: guard.id,
                actor,
            });
        }
        check_transition(&r, ReservationStatus::Confirmed)?;
        let now = self.now_ms();
        if !r.is_live(now) {
            return Err(EngineError::InvalidTransition {
                id,
                from: r.status,
                to: ReservationStatus::Confirmed,
            });
        }
        let event = Event::ReservationConfirmed {
            id,
            court_id: guard.id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Owner declines a pending reservation, freeing its range.
    pub async fn reject(
        &self,
        id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        check_reason(&reason)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let r = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if actor != guard.owner_id {
            return Err(EngineError::NotOwner {
                court_id: guard.id,
                actor,
            });
        }
        check_transition(&r, ReservationStatus::Rejected)?;
        let event = Event::ReservationRejected {
            id,
            court_id: guard.id,
            reason,
            at: self.now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Requester or owner withdraws a reservation whose range has not started.
    pub async fn cancel(
        &self,
        id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        check_reason(&reason)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let r = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if actor != r.requester_id && actor != guard.owner_id {
            return Err(EngineError::NotOwner {
                court_id: guard.id,
                actor,
            });
        }
        check_transition(&r, ReservationStatus::Cancelled)?;
        let now = self.now_ms();
        if clock::wall_clock(r.date, r.span.start) <= clock::local_datetime(now, self.settings.utc_offset) {
            return Err(EngineError::CannotCancelPastSlot(id));
        }
        let event = Event::ReservationCancelled {
            id,
            court_id: guard.id,
            reason,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Mark a confirmed reservation as played once its range has ended.
    pub async fn complete(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let r = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        check_transition(&r, ReservationStatus::Completed)?;
        let now = self.now_ms();
        if clock::wall_clock(r.date, r.span.end) > clock::local_datetime(now, self.settings.utc_offset) {
            return Err(EngineError::InvalidTransition {
                id,
                from: r.status,
                to: ReservationStatus::Completed,
            });
        }
        let event = Event::ReservationCompleted {
            id,
            court_id: guard.id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Expire every pending reservation with `expires_at < now`. Running it
    /// twice expires nothing new.
    pub async fn reap_expired(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let courts: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut reaped = Vec::new();
        for court_id in courts {
            let Ok(mut guard) = self.write_court(&court_id).await else {
                continue;
            };
            let lapsed: Vec<Ulid> = guard
                .pending_reservations()
                .filter(|r| r.expires_at.is_some_and(|at| at < now))
                .map(|r| r.id)
                .collect();
            for id in lapsed {
                let event = Event::ReservationExpired { id, court_id, at: now };
                self.persist_and_apply(&mut guard, &event).await?;
                reaped.push(id);
            }
        }
        Ok(reaped)
    }

    /// Complete every confirmed reservation whose range ended by `now`.
    pub async fn complete_elapsed(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let local_now = clock::local_datetime(now, self.settings.utc_offset);
        let today = local_now.date();
        let courts: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut completed = Vec::new();
        for court_id in courts {
            let Ok(mut guard) = self.write_court(&court_id).await else {
                continue;
            };
            let elapsed: Vec<Ulid> = guard
                .reservations
                .range(..=today)
                .flat_map(|(_, day)| day.iter())
                .filter(|r| r.status == ReservationStatus::Confirmed)
                .filter(|r| clock::wall_clock(r.date, r.span.end) <= local_now)
                .map(|r| r.id)
                .collect();
            for id in elapsed {
                let event = Event::ReservationCompleted { id, court_id, at: now };
                self.persist_and_apply(&mut guard, &event).await?;
                completed.push(id);
            }
        }
        Ok(completed)
    }
}
