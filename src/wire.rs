use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::auth::CourtdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::facility::FacilityManager;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, DateFilter, Lookup, SqlError};
use crate::time;

/// Channel name prefix for `LISTEN court_<id>`.
const CHANNEL_PREFIX: &str = "court_";

struct Subscription {
    /// Channel name as the client spelled it.
    channel: String,
    rx: broadcast::Receiver<ReservationChange>,
}

/// Query handler for one client connection. Holds the connection's LISTEN
/// subscriptions.
pub struct CourtdHandler {
    facilities: Arc<FacilityManager>,
    query_parser: Arc<CourtdQueryParser>,
    subscriptions: Mutex<HashMap<Ulid, Subscription>>,
}

impl CourtdHandler {
    pub fn new(facilities: Arc<FacilityManager>) -> Self {
        Self {
            facilities,
            query_parser: Arc::new(CourtdQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.facilities.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("facility error: {e}"))
        })
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<Ulid, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse, execute and time one statement, then flush pending
    /// notifications ahead of its response.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(&*client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        self.deliver_notifications(client).await?;
        result
    }

    /// Drain every subscription and forward what arrived as
    /// `NotificationResponse` messages.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut subs = self.subscriptions();
            let mut closed = Vec::new();
            for (court_id, sub) in subs.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(change) => match serde_json::to_string(&change) {
                            Ok(payload) => pending.push((sub.channel.clone(), payload)),
                            Err(e) => tracing::warn!("cannot encode notification: {e}"),
                        },
                        Err(TryRecvError::Lagged(n)) => {
                            tracing::warn!("listener on {} lagged, {n} changes dropped", sub.channel);
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => {
                            closed.push(*court_id);
                            break;
                        }
                    }
                }
            }
            for court_id in closed {
                subs.remove(&court_id);
            }
        }

        for (channel, payload) in pending {
            let message = NotificationResponse::new(0, channel, payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let response = match cmd {
            // ── Courts ───────────────────────────────────────
            Command::InsertCourt {
                id,
                owner_id,
                name,
                base_price,
            } => {
                engine
                    .create_court(id, owner_id, name, base_price)
                    .await
                    .map_err(engine_err)?;
                execution("INSERT", 1)
            }
            Command::UpdateCourt {
                id,
                name,
                base_price,
            } => {
                engine.update_court(id, name, base_price).await.map_err(engine_err)?;
                execution("UPDATE", 1)
            }
            Command::DeleteCourt { id } => {
                engine.delete_court(id).await.map_err(engine_err)?;
                execution("DELETE", 1)
            }
            Command::SelectCourts { id } => {
                let courts = match id {
                    Some(id) => vec![engine.court_info(id).await.map_err(engine_err)?],
                    None => engine.list_courts().await,
                };
                query_response(court_schema(), courts, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.owner_id.to_string())?;
                    enc.encode_field(&c.name)?;
                    enc.encode_field(&c.base_price)
                })
            }

            // ── Opening hours ────────────────────────────────
            Command::SetOpeningHours {
                day_of_week,
                start,
                end,
            } => {
                engine
                    .set_opening_hours(day_of_week, Some((start, end)))
                    .await
                    .map_err(engine_err)?;
                execution("INSERT", 1)
            }
            Command::ClearOpeningHours { day_of_week } => {
                engine
                    .set_opening_hours(day_of_week, None)
                    .await
                    .map_err(engine_err)?;
                execution("DELETE", 1)
            }
            Command::SelectOpeningHours => {
                let hours = engine.opening_hours().await;
                query_response(opening_hours_schema(), hours.into_iter().enumerate(), |enc, (day, span)| {
                    enc.encode_field(&(day as i32))?;
                    encode_optional_span(enc, span)
                })
            }

            // ── Rules ────────────────────────────────────────
            Command::InsertRule {
                id,
                court_id,
                day_of_week,
                start,
                end,
                price_override,
            } => {
                engine
                    .create_rule(id, court_id, day_of_week, start, end, price_override)
                    .await
                    .map_err(engine_err)?;
                execution("INSERT", 1)
            }
            Command::UpdateRule {
                id,
                day_of_week,
                start,
                end,
                price_override,
            } => {
                let patch = rule_patch(day_of_week, start, end, price_override).map_err(engine_err)?;
                engine.update_rule(id, patch).await.map_err(engine_err)?;
                execution("UPDATE", 1)
            }
            Command::DeleteRule { id } => {
                engine.delete_rule(id).await.map_err(engine_err)?;
                execution("DELETE", 1)
            }
            Command::SelectRules {
                lookup,
                active_only,
            } => {
                let rules = match lookup {
                    Lookup::Id(id) => vec![engine.get_rule(id).await.map_err(engine_err)?],
                    Lookup::Court(court_id) => engine
                        .list_rules(court_id, active_only)
                        .await
                        .map_err(engine_err)?,
                };
                query_response(rule_schema(), rules, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.court_id.to_string())?;
                    enc.encode_field(&i32::from(r.day_of_week))?;
                    encode_span(enc, &r.span)?;
                    enc.encode_field(&r.price_override)?;
                    enc.encode_field(&r.active)
                })
            }

            // ── Blocked ranges ───────────────────────────────
            Command::InsertBlockedRange {
                id,
                court_id,
                date,
                start,
                end,
                reason,
            } => {
                engine
                    .create_blocked_range(id, court_id, date, start, end, reason)
                    .await
                    .map_err(engine_err)?;
                execution("INSERT", 1)
            }
            Command::DeleteBlockedRange { id } => {
                engine.delete_blocked_range(id).await.map_err(engine_err)?;
                execution("DELETE", 1)
            }
            Command::SelectBlockedRanges { court_id, date } => {
                let ranges = engine
                    .list_blocked_ranges(court_id, date)
                    .await
                    .map_err(engine_err)?;
                query_response(blocked_range_schema(), ranges, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.court_id.to_string())?;
                    enc.encode_field(&b.date.to_string())?;
                    encode_span(enc, &b.span)?;
                    enc.encode_field(&b.reason)
                })
            }

            // ── Reservations ─────────────────────────────────
            Command::InsertReservation {
                id,
                court_id,
                date,
                start,
                end,
                requester_id,
            } => {
                engine
                    .reserve(id, court_id, date, start, end, requester_id)
                    .await
                    .map_err(engine_err)?;
                execution("INSERT", 1)
            }
            Command::UpdateReservationStatus {
                id,
                status,
                actor_id,
                reason,
            } => {
                let actor = || actor_id.ok_or_else(|| sql_err(SqlError::MissingValue("actor_id")));
                let result = match status {
                    ReservationStatus::Confirmed => engine.confirm(id, actor()?).await,
                    ReservationStatus::Rejected => engine.reject(id, actor()?, reason).await,
                    ReservationStatus::Cancelled => engine.cancel(id, actor()?, reason).await,
                    ReservationStatus::Completed => engine.complete(id).await,
                    ReservationStatus::Pending | ReservationStatus::Expired => {
                        return Err(sql_err(SqlError::Unsupported(format!(
                            "status can not be set to {status}"
                        ))));
                    }
                };
                result.map_err(engine_err)?;
                execution("UPDATE", 1)
            }
            Command::SelectReservations { lookup, date } => {
                let reservations = match lookup {
                    Lookup::Id(id) => vec![engine.get_reservation(id).await.map_err(engine_err)?],
                    Lookup::Court(court_id) => engine
                        .list_reservations(court_id, date)
                        .await
                        .map_err(engine_err)?,
                };
                query_response(reservation_schema(), reservations, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.court_id.to_string())?;
                    enc.encode_field(&r.requester_id.to_string())?;
                    enc.encode_field(&r.date.to_string())?;
                    encode_span(enc, &r.span)?;
                    enc.encode_field(&r.status.as_str())?;
                    enc.encode_field(&r.price)?;
                    enc.encode_field(&r.expires_at)?;
                    enc.encode_field(&r.reason)
                })
            }

            // ── Availability ─────────────────────────────────
            Command::SelectAvailability { court_id, dates } => {
                let days = match dates {
                    DateFilter::On(date) => vec![
                        engine
                            .availability_for_date(court_id, date, None)
                            .await
                            .map_err(engine_err)?,
                    ],
                    DateFilter::Between(from, to) => engine
                        .availability_for_range(court_id, from, to, None)
                        .await
                        .map_err(engine_err)?,
                };
                // A closed day still yields one row so the caller can tell
                // it apart from a fully booked one.
                let rows = days.into_iter().flat_map(|day| {
                    let blocks: Vec<Option<TimeBlock>> = if day.closed {
                        vec![None]
                    } else {
                        day.free_blocks.iter().copied().map(Some).collect()
                    };
                    blocks.into_iter().map(move |block| (day.date, day.closed, block))
                });
                query_response(availability_schema(), rows, move |enc, (date, closed, block)| {
                    enc.encode_field(&court_id.to_string())?;
                    enc.encode_field(&date.to_string())?;
                    enc.encode_field(&closed)?;
                    encode_optional_span(enc, block)
                })
            }
            Command::SelectSlots {
                court_id,
                dates,
                durations,
            } => {
                let rows: Vec<(chrono::NaiveDate, Slot)> = match dates {
                    DateFilter::On(date) => engine
                        .slots_for_durations(court_id, date, &durations)
                        .await
                        .map_err(engine_err)?
                        .into_values()
                        .flatten()
                        .map(|slot| (date, slot))
                        .collect(),
                    DateFilter::Between(from, to) => {
                        let [duration] = durations.as_slice() else {
                            return Err(sql_err(SqlError::Unsupported(
                                "a date range takes exactly one duration".into(),
                            )));
                        };
                        engine
                            .availability_for_range(court_id, from, to, Some(*duration))
                            .await
                            .map_err(engine_err)?
                            .into_iter()
                            .flat_map(|day| {
                                let date = day.date;
                                day.slots.unwrap_or_default().into_iter().map(move |s| (date, s))
                            })
                            .collect()
                    }
                };
                query_response(slot_schema(), rows, move |enc, (date, slot)| {
                    enc.encode_field(&court_id.to_string())?;
                    enc.encode_field(&date.to_string())?;
                    enc.encode_field(&i32::from(slot.duration))?;
                    encode_span(enc, &Span::new(slot.start, slot.end))
                })
            }

            // ── LISTEN / UNLISTEN ────────────────────────────
            Command::Listen { channel } => {
                let court_id = parse_channel(&channel)?;
                if !engine.court_exists(&court_id) {
                    return Err(engine_err(EngineError::NotFound(court_id)));
                }
                let mut subs = self.subscriptions();
                subs.entry(court_id).or_insert_with(|| Subscription {
                    channel,
                    rx: engine.notify.subscribe(court_id),
                });
                Response::Execution(Tag::new("LISTEN"))
            }
            Command::Unlisten { channel } => {
                let court_id = parse_channel(&channel)?;
                self.subscriptions().remove(&court_id);
                Response::Execution(Tag::new("UNLISTEN"))
            }
            Command::UnlistenAll => {
                self.subscriptions().clear();
                Response::Execution(Tag::new("UNLISTEN"))
            }
        };
        Ok(vec![response])
    }
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Minutes as integers, then the same bounds as `HH:MM`.
fn encode_span(enc: &mut DataRowEncoder, span: &Span) -> PgWireResult<()> {
    enc.encode_field(&i32::from(span.start))?;
    enc.encode_field(&i32::from(span.end))?;
    enc.encode_field(&time::display(span.start))?;
    enc.encode_field(&time::display(span.end))
}

fn encode_optional_span(enc: &mut DataRowEncoder, span: Option<Span>) -> PgWireResult<()> {
    match span {
        Some(span) => encode_span(enc, &span),
        None => {
            enc.encode_field(&None::<i32>)?;
            enc.encode_field(&None::<i32>)?;
            enc.encode_field(&None::<String>)?;
            enc.encode_field(&None::<String>)
        }
    }
}

fn rule_patch(
    day_of_week: Option<i64>,
    start: Option<i64>,
    end: Option<i64>,
    price_override: Option<Option<i64>>,
) -> Result<RulePatch, EngineError> {
    let minute = |m: Option<i64>| m.map(time::check_minute).transpose().map_err(EngineError::from);
    Ok(RulePatch {
        day_of_week: day_of_week
            .map(|d| DayOfWeek::try_from(d).map_err(|_| EngineError::InvalidDayOfWeek(d)))
            .transpose()?,
        start: minute(start)?,
        end: minute(end)?,
        price_override,
    })
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let lower = channel.to_ascii_lowercase();
    let id = lower.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn span_fields() -> [FieldInfo; 4] {
    [
        field("start", Type::INT4),
        field("end", Type::INT4),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
    ]
}

fn court_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("base_price", Type::INT8),
    ]
}

fn opening_hours_schema() -> Vec<FieldInfo> {
    let mut fields = vec![field("day_of_week", Type::INT4)];
    fields.extend(span_fields());
    fields
}

fn rule_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        field("id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("day_of_week", Type::INT4),
    ];
    fields.extend(span_fields());
    fields.push(field("price_override", Type::INT8));
    fields.push(field("active", Type::BOOL));
    fields
}

fn blocked_range_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        field("id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
    ];
    fields.extend(span_fields());
    fields.push(field("reason", Type::VARCHAR));
    fields
}

fn reservation_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        field("id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
    ];
    fields.extend(span_fields());
    fields.extend([
        field("status", Type::VARCHAR),
        field("price", Type::INT8),
        field("expires_at", Type::INT8),
        field("reason", Type::VARCHAR),
    ]);
    fields
}

fn availability_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        field("court_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("closed", Type::BOOL),
    ];
    fields.extend(span_fields());
    fields
}

fn slot_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        field("court_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("duration", Type::INT4),
    ];
    fields.extend(span_fields());
    fields
}

/// Table named after `FROM` in a SELECT, lowercased.
fn select_target(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let mut words = lower.split_whitespace();
    if words.next()? != "select" {
        return None;
    }
    let table = words.skip_while(|w| *w != "from").nth(1)?;
    Some(table.trim_end_matches(';').to_string())
}

/// Row description for a statement, known before it runs.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_target(sql).as_deref() {
        Some("courts") => court_schema(),
        Some("opening_hours") => opening_hours_schema(),
        Some("rules") => rule_schema(),
        Some("blocked_ranges") => blocked_range_schema(),
        Some("reservations") => reservation_schema(),
        Some("availability") => availability_schema(),
        Some("slots") => slot_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtdQueryParser;

#[async_trait]
impl QueryParser for CourtdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtdHandler {
    type Statement = String;
    type QueryParser = CourtdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement. Text inside a bound value is never rescanned, and placeholders
/// with no matching parameter are kept as written.
fn inline_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..=pos + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, portal.parameters.as_slice())
}

// ── Factory ──────────────────────────────────────────────────────

/// Handlers for one connection.
pub struct CourtdFactory {
    handler: Arc<CourtdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CourtdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtdFactory {
    pub fn new(facilities: Arc<FacilityManager>, password: String) -> Self {
        Self {
            handler: Arc::new(CourtdHandler::new(facilities)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CourtdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects. Each connection gets its own
/// handler, so LISTEN subscriptions die with the socket.
pub async fn process_connection(
    socket: TcpStream,
    facilities: Arc<FacilityManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CourtdFactory::new(facilities, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidTimeFormat(_)
        | EngineError::TimeOutOfRange(_)
        | EngineError::InvalidTimeRange { .. }
        | EngineError::InvalidTimeGranularity(_)
        | EngineError::InvalidDuration(_)
        | EngineError::InvalidDayOfWeek(_)
        | EngineError::InvalidPrice(_) => "22007",
        EngineError::RuleConflict { .. }
        | EngineError::BookingConflict { .. }
        | EngineError::TimeBlocked { .. }
        | EngineError::OutsideAvailability { .. } => "23P01",
        EngineError::NoAvailabilityRules(_)
        | EngineError::InvalidTransition { .. }
        | EngineError::CannotCancelPastSlot(_)
        | EngineError::CannotReservePast(..)
        | EngineError::HasReservations(_) => "55000",
        EngineError::NotOwner { .. } => "42501",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "53400",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Time(_) | SqlError::InvalidDate(_) => "22007",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn sqlstates_by_error_class() {
        let id = Ulid::new();
        let span = Span::new(600, 660);
        assert_eq!(sqlstate(&EngineError::InvalidTimeFormat("9:00".into())), "22007");
        assert_eq!(sqlstate(&EngineError::InvalidTimeGranularity(span)), "22007");
        assert_eq!(
            sqlstate(&EngineError::BookingConflict {
                reservation_id: id,
                span
            }),
            "23P01"
        );
        assert_eq!(
            sqlstate(&EngineError::TimeBlocked {
                blocked_id: id,
                span
            }),
            "23P01"
        );
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                id,
                from: ReservationStatus::Cancelled,
                to: ReservationStatus::Confirmed
            }),
            "55000"
        );
        assert_eq!(
            sqlstate(&EngineError::CannotReservePast(
                NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
                span
            )),
            "55000"
        );
        assert_eq!(
            sqlstate(&EngineError::NotOwner {
                court_id: id,
                actor: id
            }),
            "42501"
        );
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "02000");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "53400");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn channel_names() {
        let id = Ulid::new();
        assert_eq!(parse_channel(&format!("court_{id}")).unwrap(), id);
        assert_eq!(
            parse_channel(&format!("COURT_{}", id.to_string().to_lowercase())).unwrap(),
            id
        );
        assert!(parse_channel(&format!("lobby_{id}")).is_err());
        assert!(parse_channel("court_nope").is_err());
    }

    #[test]
    fn rule_patch_conversion() {
        let patch = rule_patch(Some(3), Some(600), None, Some(None)).unwrap();
        assert_eq!(patch.day_of_week, Some(3));
        assert_eq!(patch.start, Some(600));
        assert_eq!(patch.end, None);
        assert_eq!(patch.price_override, Some(None));

        assert_eq!(
            rule_patch(Some(-1), None, None, None),
            Err(EngineError::InvalidDayOfWeek(-1))
        );
        assert_eq!(
            rule_patch(None, Some(1440), None, None),
            Err(EngineError::TimeOutOfRange(1440))
        );
    }

    #[test]
    fn result_schema_follows_table() {
        assert_eq!(result_schema("SELECT * FROM courts").len(), 4);
        assert_eq!(
            result_schema("select * from reservations where court_id = $1").len(),
            12
        );
        assert_eq!(result_schema("SELECT * FROM slots WHERE court_id = $1").len(), 7);
        assert!(result_schema("INSERT INTO courts (id, owner_id) VALUES ($1, $2)").is_empty());
    }

    #[test]
    fn params_counted() {
        assert_eq!(count_params("SELECT * FROM rules WHERE id = $1"), 1);
        assert_eq!(count_params("VALUES ($1, $2, $10)"), 10);
        assert_eq!(count_params("SELECT * FROM courts"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = [Some(b"O'Neil $2".to_vec()), Some(b"x".to_vec()), None];
        assert_eq!(
            inline_params("VALUES ($1, $2, $3, $10, $)", &params),
            "VALUES ('O''Neil $2', 'x', NULL, $10, $)"
        );
        let none: [Option<Vec<u8>>; 0] = [];
        assert_eq!(inline_params("SELECT * FROM courts", &none), "SELECT * FROM courts");
    }
}
