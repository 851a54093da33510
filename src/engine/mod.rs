mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reservations;

pub use availability::{
    check_duration, compose_multiple, compose_slots, filter_blocks, generate_base_blocks,
    merge_overlapping, subtract_intervals, uncovered,
};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{self, Clock, SystemClock};
use crate::limits::MAX_RESERVATIONS_PER_COURT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedCourtState = Arc<RwLock<CourtState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued (the batch window).
/// 3. One flush_sync for the whole batch, then answer every sender.
///
/// A non-append command ends the batch; the batch is flushed before it runs.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut pending = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    pending = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = pending {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes do not leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// Facility-wide knobs that are not part of the persisted state.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long a pending reservation holds its range.
    pub pending_ttl_ms: Ms,
    /// Offset of the facility's wall clock from UTC.
    pub utc_offset: FixedOffset,
    /// Cap on pending plus confirmed reservations per court.
    pub max_open_reservations: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pending_ttl_ms: 24 * 3_600_000,
            utc_offset: Utc.fix(),
            max_open_reservations: MAX_RESERVATIONS_PER_COURT,
        }
    }
}

/// In-memory state of one facility, rebuilt from its WAL on startup.
pub struct Engine {
    pub state: DashMap<Ulid, SharedCourtState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: rule / blocked range / reservation id -> court id.
    pub(super) entity_to_court: DashMap<Ulid, Ulid>,
    pub(super) opening_hours: RwLock<OpeningHours>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
}

/// Build a court from its creation event. Seeded rules are indexed too.
fn new_court(
    id: Ulid,
    owner_id: Ulid,
    name: Option<String>,
    base_price: i64,
    rules: &[Rule],
    entity_map: &DashMap<Ulid, Ulid>,
) -> CourtState {
    let mut cs = CourtState::new(id, owner_id, name, base_price);
    for rule in rules {
        entity_map.insert(rule.id, id);
        cs.upsert_rule(rule.clone());
    }
    cs
}

/// Apply an event to one court (no locking, the caller holds the lock).
fn apply_to_court(cs: &mut CourtState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::CourtUpdated { name, base_price, .. } => {
            cs.name = name.clone();
            cs.base_price = *base_price;
        }
        Event::RuleAdded { rule } | Event::RuleUpdated { rule } => {
            entity_map.insert(rule.id, rule.court_id);
            cs.upsert_rule(rule.clone());
        }
        Event::RuleDeactivated { id, .. } => {
            cs.set_rule_active(id, false);
        }
        Event::BlockAdded { range } => {
            entity_map.insert(range.id, range.court_id);
            cs.insert_blocked(range.clone());
        }
        Event::BlockRemoved { id, .. } => {
            cs.remove_blocked(id);
            entity_map.remove(id);
        }
        Event::ReservationPlaced { reservation } => {
            entity_map.insert(reservation.id, reservation.court_id);
            cs.insert_reservation(reservation.clone());
        }
        Event::ReservationConfirmed { id, at, .. } => {
            cs.set_reservation_status(id, ReservationStatus::Confirmed, None, *at);
        }
        Event::ReservationRejected { id, reason, at, .. } => {
            cs.set_reservation_status(id, ReservationStatus::Rejected, reason.clone(), *at);
        }
        Event::ReservationCancelled { id, reason, at, .. } => {
            cs.set_reservation_status(id, ReservationStatus::Cancelled, reason.clone(), *at);
        }
        Event::ReservationCompleted { id, at, .. } => {
            cs.set_reservation_status(id, ReservationStatus::Completed, None, *at);
        }
        Event::ReservationExpired { id, at, .. } => {
            cs.set_reservation_status(id, ReservationStatus::Expired, None, *at);
        }
        // Facility-level and court lifecycle events are applied by the engine.
        Event::OpeningHoursSet { .. } | Event::CourtCreated { .. } | Event::CourtDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_settings(wal_path, notify, EngineSettings::default(), Arc::new(SystemClock))
    }

    pub fn with_settings(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let entity_to_court = DashMap::new();
        let mut hours: OpeningHours = Default::default();
        let mut courts: HashMap<Ulid, CourtState> = HashMap::new();

        for event in &events {
            match event {
                Event::OpeningHoursSet { day_of_week, span } => {
                    hours[usize::from(*day_of_week % 7)] = *span;
                }
                Event::CourtCreated { id, owner_id, name, base_price, rules } => {
                    let cs = new_court(*id, *owner_id, name.clone(), *base_price, rules, &entity_to_court);
                    courts.insert(*id, cs);
                }
                Event::CourtDeleted { id } => {
                    entity_to_court.retain(|_, court| court != id);
                    courts.remove(id);
                }
                other => {
                    if let Some(court_id) = other.court_id()
                        && let Some(cs) = courts.get_mut(&court_id) {
                            apply_to_court(cs, other, &entity_to_court);
                        }
                }
            }
        }

        let state = DashMap::new();
        for (id, cs) in courts {
            state.insert(id, Arc::new(RwLock::new(cs)));
        }
        tracing::debug!(
            "replayed {} events from {}: {} courts",
            events.len(),
            wal_path.display(),
            state.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            state,
            wal_tx,
            notify,
            entity_to_court,
            opening_hours: RwLock::new(hours),
            clock,
            settings,
        })
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Facility wall-clock time.
    pub fn local_now(&self) -> NaiveDateTime {
        clock::local_datetime(self.now_ms(), self.settings.utc_offset)
    }

    pub fn today(&self) -> NaiveDate {
        self.local_now().date()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_court(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_court_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_court.get(entity_id).map(|e| *e.value())
    }

    /// Exclusive lock on a court. Fails if the court was deleted while we
    /// waited for the lock.
    pub(super) async fn write_court(
        &self,
        court_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<CourtState>, EngineError> {
        let cs = self.get_court(court_id).ok_or(EngineError::NotFound(*court_id))?;
        let guard = cs.write_owned().await;
        if !self.state.contains_key(court_id) {
            return Err(EngineError::NotFound(*court_id));
        }
        Ok(guard)
    }

    /// Lookup entity -> court and acquire the court's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<CourtState>, EngineError> {
        let court_id = self
            .get_court_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.write_court(&court_id).await
    }

    /// WAL append, then apply, then publish. Nothing is applied when the
    /// append fails.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CourtState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_court(cs, event, &self.entity_to_court);
        if let Some((id, status)) = event.reservation_transition() {
            metrics::counter!(observability::RESERVATION_TRANSITIONS_TOTAL, "status" => status.as_str())
                .increment(1);
            if let Some(r) = cs.reservation(&id) {
                self.notify.send(cs.id, ReservationChange::from(r));
            }
        }
        Ok(())
    }
}
