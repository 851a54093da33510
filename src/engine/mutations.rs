use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_rule_overlap, validate_day, validate_price, validate_span};
use super::{new_court, Engine, EngineError, WalCommand};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
    Ok(())
}

pub(super) fn check_reason(reason: &Option<String>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
    Ok(())
}

impl Engine {
    // ── Courts ───────────────────────────────────────────

    /// Create a court. Its first rules are seeded from the facility opening
    /// hours and committed together with the court.
    pub async fn create_court(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        base_price: i64,
    ) -> Result<Vec<Rule>, EngineError> {
        if self.state.len() >= MAX_COURTS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        check_name(&name)?;
        validate_price(base_price)?;

        // Serializes court creation with opening-hour edits and compaction.
        let hours = self.opening_hours.write().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rules: Vec<Rule> = hours
            .iter()
            .enumerate()
            .filter_map(|(day, span)| {
                span.map(|span| Rule {
                    id: Ulid::new(),
                    court_id: id,
                    day_of_week: day as DayOfWeek,
                    span,
                    price_override: None,
                    active: true,
                })
            })
            .collect();

        let event = Event::CourtCreated {
            id,
            owner_id,
            name: name.clone(),
            base_price,
            rules: rules.clone(),
        };
        self.wal_append(&event).await?;
        let cs = new_court(id, owner_id, name, base_price, &rules, &self.entity_to_court);
        self.state.insert(id, Arc::new(RwLock::new(cs)));
        drop(hours);
        tracing::debug!("created court {id} with {} seeded rules", rules.len());
        Ok(rules)
    }

    /// Rename or reprice a court. `None` keeps the current value.
    pub async fn update_court(
        &self,
        id: Ulid,
        name: Option<String>,
        base_price: Option<i64>,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        if let Some(p) = base_price {
            validate_price(p)?;
        }
        let mut guard = self.write_court(&id).await?;
        let event = Event::CourtUpdated {
            id,
            name: name.or_else(|| guard.name.clone()),
            base_price: base_price.unwrap_or(guard.base_price),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a court that never took a reservation.
    pub async fn delete_court(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.write_court(&id).await?;
        if guard.reservation_count() > 0 {
            return Err(EngineError::HasReservations(id));
        }
        let event = Event::CourtDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        self.entity_to_court.retain(|_, court| *court != id);
        self.notify.remove(&id);
        drop(guard);
        Ok(())
    }

    // ── Opening hours ────────────────────────────────────

    /// Set or clear one weekday of the facility opening hours. Existing
    /// courts keep their rules; only courts created later are seeded.
    pub async fn set_opening_hours(
        &self,
        day_of_week: i64,
        span: Option<(i64, i64)>,
    ) -> Result<(), EngineError> {
        let day = validate_day(day_of_week)?;
        let span = span.map(|(s, e)| validate_span(s, e)).transpose()?;
        let mut hours = self.opening_hours.write().await;
        let event = Event::OpeningHoursSet {
            day_of_week: day,
            span,
        };
        self.wal_append(&event).await?;
        hours[usize::from(day)] = span;
        Ok(())
    }

    // ── Rules ────────────────────────────────────────────

    pub async fn create_rule(
        &self,
        id: Ulid,
        court_id: Ulid,
        day_of_week: i64,
        start: i64,
        end: i64,
        price_override: Option<i64>,
    ) -> Result<Rule, EngineError> {
        let day = validate_day(day_of_week)?;
        let span = validate_span(start, end)?;
        if let Some(p) = price_override {
            validate_price(p)?;
        }
        let mut guard = self.write_court(&court_id).await?;
        if guard.rule_count() >= MAX_RULES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many rules on court"));
        }
        if self.entity_to_court.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        check_rule_overlap(&guard, day, &span, None)?;

        let rule = Rule {
            id,
            court_id,
            day_of_week: day,
            span,
            price_override,
            active: true,
        };
        let event = Event::RuleAdded { rule: rule.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(rule)
    }

    /// Merge `patch` into the rule and re-check overlap against the other
    /// active rules. The result is always active.
    pub async fn update_rule(&self, id: Ulid, patch: RulePatch) -> Result<Rule, EngineError> {
        if let Some(Some(p)) = patch.price_override {
            validate_price(p)?;
        }
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.rule(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let day = match patch.day_of_week {
            Some(d) => validate_day(i64::from(d))?,
            None => current.day_of_week,
        };
        let span = validate_span(
            i64::from(patch.start.unwrap_or(current.span.start)),
            i64::from(patch.end.unwrap_or(current.span.end)),
        )?;
        check_rule_overlap(&guard, day, &span, Some(id))?;

        let rule = Rule {
            day_of_week: day,
            span,
            price_override: patch.price_override.unwrap_or(current.price_override),
            active: true,
            ..current
        };
        let event = Event::RuleUpdated { rule: rule.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(rule)
    }

    /// Deactivate a rule. Rules are never physically removed. Deleting an
    /// inactive rule is a no-op.
    pub async fn delete_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let rule = guard.rule(&id).ok_or(EngineError::NotFound(id))?;
        let court_id = rule.court_id;
        if rule.active {
            let event = Event::RuleDeactivated { id, court_id };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        Ok(court_id)
    }

    // ── Blocked ranges ───────────────────────────────────

    pub async fn create_blocked_range(
        &self,
        id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        start: i64,
        end: i64,
        reason: Option<String>,
    ) -> Result<BlockedRange, EngineError> {
        let span = validate_span(start, end)?;
        check_reason(&reason)?;
        let mut guard = self.write_court(&court_id).await?;
        if guard.blocked_count() >= MAX_BLOCKED_RANGES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many blocked ranges on court"));
        }
        if self.entity_to_court.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let range = BlockedRange {
            id,
            court_id,
            date,
            span,
            reason,
        };
        let event = Event::BlockAdded {
            range: range.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(range)
    }

    pub async fn delete_blocked_range(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if guard.blocked_range(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let court_id = guard.id;
        let event = Event::BlockRemoved { id, court_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(court_id)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Every court and the opening hours stay locked until the new
    /// file is in place, so no append can slip in between.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let hours = self.opening_hours.write().await;
        let mut events: Vec<Event> = hours
            .iter()
            .enumerate()
            .filter_map(|(day, span)| {
                span.map(|span| Event::OpeningHoursSet {
                    day_of_week: day as DayOfWeek,
                    span: Some(span),
                })
            })
            .collect();

        let courts: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(courts.len());
        for cs in courts {
            guards.push(cs.read_owned().await);
        }
        for cs in &guards {
            events.push(Event::CourtCreated {
                id: cs.id,
                owner_id: cs.owner_id,
                name: cs.name.clone(),
                base_price: cs.base_price,
                rules: cs.rules.iter().flatten().cloned().collect(),
            });
            for range in cs.blocked.values().flatten() {
                events.push(Event::BlockAdded {
                    range: range.clone(),
                });
            }
            // Placed carries the current status, so history survives as-is.
            for r in cs.all_reservations() {
                events.push(Event::ReservationPlaced {
                    reservation: r.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(hours);
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
