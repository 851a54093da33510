use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::ReservationStatus;
use crate::time::{self, TimeError};

/// Rows picked either by their own id or by the court they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Id(Ulid),
    Court(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    On(NaiveDate),
    /// Inclusive on both ends.
    Between(NaiveDate, NaiveDate),
}

/// Parsed command from SQL input. Minutes are carried as raw integers and
/// range-checked by the engine.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCourt {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        base_price: i64,
    },
    UpdateCourt {
        id: Ulid,
        name: Option<String>,
        base_price: Option<i64>,
    },
    DeleteCourt {
        id: Ulid,
    },
    SelectCourts {
        id: Option<Ulid>,
    },
    SetOpeningHours {
        day_of_week: i64,
        start: i64,
        end: i64,
    },
    ClearOpeningHours {
        day_of_week: i64,
    },
    SelectOpeningHours,
    InsertRule {
        id: Ulid,
        court_id: Ulid,
        day_of_week: i64,
        start: i64,
        end: i64,
        price_override: Option<i64>,
    },
    UpdateRule {
        id: Ulid,
        day_of_week: Option<i64>,
        start: Option<i64>,
        end: Option<i64>,
        /// `Some(None)` clears the override.
        price_override: Option<Option<i64>>,
    },
    DeleteRule {
        id: Ulid,
    },
    SelectRules {
        lookup: Lookup,
        active_only: bool,
    },
    InsertBlockedRange {
        id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        start: i64,
        end: i64,
        reason: Option<String>,
    },
    DeleteBlockedRange {
        id: Ulid,
    },
    SelectBlockedRanges {
        court_id: Ulid,
        date: Option<NaiveDate>,
    },
    InsertReservation {
        id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        start: i64,
        end: i64,
        requester_id: Ulid,
    },
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
        actor_id: Option<Ulid>,
        reason: Option<String>,
    },
    SelectReservations {
        lookup: Lookup,
        date: Option<NaiveDate>,
    },
    SelectAvailability {
        court_id: Ulid,
        dates: DateFilter,
    },
    SelectSlots {
        court_id: Ulid,
        dates: DateFilter,
        durations: Vec<i64>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_listen(trimmed) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `LISTEN chan`, `UNLISTEN chan` and `UNLISTEN *`.
fn parse_listen(stmt: &str) -> Option<Command> {
    let mut words = stmt.split_whitespace();
    let keyword = words.next()?.to_ascii_uppercase();
    let channel = words.next()?;
    if words.next().is_some() {
        return None;
    }
    let channel = channel.trim_matches('"').to_string();
    match keyword.as_str() {
        "LISTEN" => Some(Command::Listen { channel }),
        "UNLISTEN" if channel == "*" => Some(Command::UnlistenAll),
        "UNLISTEN" => Some(Command::Unlisten { channel }),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };
    let optional = |i: usize| values.get(i);

    match table.as_str() {
        "courts" => {
            arity(2)?;
            Ok(Command::InsertCourt {
                id: parse_ulid(&values[0])?,
                owner_id: parse_ulid(&values[1])?,
                name: optional(2).map(parse_string_or_null).transpose()?.flatten(),
                base_price: optional(3).map(parse_i64).transpose()?.unwrap_or(0),
            })
        }
        "opening_hours" => {
            arity(3)?;
            Ok(Command::SetOpeningHours {
                day_of_week: parse_i64(&values[0])?,
                start: parse_minute(&values[1])?,
                end: parse_minute(&values[2])?,
            })
        }
        "rules" => {
            arity(5)?;
            Ok(Command::InsertRule {
                id: parse_ulid(&values[0])?,
                court_id: parse_ulid(&values[1])?,
                day_of_week: parse_i64(&values[2])?,
                start: parse_minute(&values[3])?,
                end: parse_minute(&values[4])?,
                price_override: optional(5).map(parse_i64_or_null).transpose()?.flatten(),
            })
        }
        "blocked_ranges" => {
            arity(5)?;
            Ok(Command::InsertBlockedRange {
                id: parse_ulid(&values[0])?,
                court_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                start: parse_minute(&values[3])?,
                end: parse_minute(&values[4])?,
                reason: optional(5).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            arity(6)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                court_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                start: parse_minute(&values[3])?,
                end: parse_minute(&values[4])?,
                requester_id: parse_ulid(&values[5])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.clone())),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        set.push((assignment_column(assignment)?, &assignment.value));
    }

    match table.as_str() {
        "courts" => {
            let (mut name, mut base_price) = (None, None);
            for (col, value) in set {
                match col.as_str() {
                    "name" => name = parse_string_or_null(value)?,
                    "base_price" => base_price = Some(parse_i64(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateCourt { id, name, base_price })
        }
        "rules" => {
            let (mut day_of_week, mut start, mut end, mut price_override) = (None, None, None, None);
            for (col, value) in set {
                match col.as_str() {
                    "day_of_week" => day_of_week = Some(parse_i64(value)?),
                    "start" => start = Some(parse_minute(value)?),
                    "end" => end = Some(parse_minute(value)?),
                    "price_override" => price_override = Some(parse_i64_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateRule {
                id,
                day_of_week,
                start,
                end,
                price_override,
            })
        }
        "reservations" => {
            let (mut status, mut actor_id, mut reason) = (None, None, None);
            for (col, value) in set {
                match col.as_str() {
                    "status" => {
                        let s = parse_string(value)?;
                        status = Some(
                            ReservationStatus::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))?,
                        );
                    }
                    "actor_id" => actor_id = Some(parse_ulid(value)?),
                    "reason" => reason = parse_string_or_null(value)?,
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            let status = status.ok_or(SqlError::MissingValue("status"))?;
            if matches!(status, ReservationStatus::Pending | ReservationStatus::Expired) {
                return Err(SqlError::Unsupported(format!(
                    "status can not be set to {status}"
                )));
            }
            Ok(Command::UpdateReservationStatus {
                id,
                status,
                actor_id,
                reason,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "opening_hours" {
        let filters = Filters::from_selection(&delete.selection)?;
        let day = filters
            .eq("day_of_week")
            .ok_or(SqlError::MissingFilter("day_of_week"))?;
        return Ok(Command::ClearOpeningHours {
            day_of_week: parse_i64(day)?,
        });
    }

    let id = extract_where_id(&delete.selection)?;
    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt { id }),
        "rules" => Ok(Command::DeleteRule { id }),
        "blocked_ranges" => Ok(Command::DeleteBlockedRange { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts {
            id: filters.eq("id").map(parse_ulid).transpose()?,
        }),
        "opening_hours" => Ok(Command::SelectOpeningHours),
        "rules" => Ok(Command::SelectRules {
            lookup: filters.lookup()?,
            active_only: filters.eq("active").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "blocked_ranges" => Ok(Command::SelectBlockedRanges {
            court_id: filters.court_id()?,
            date: filters.eq("date").map(parse_date).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            lookup: filters.lookup()?,
            date: filters.eq("date").map(parse_date).transpose()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            court_id: filters.court_id()?,
            dates: filters.dates()?,
        }),
        "slots" => {
            let durations = filters.durations()?;
            if durations.is_empty() {
                return Err(SqlError::MissingFilter("duration"));
            }
            Ok(Command::SelectSlots {
                court_id: filters.court_id()?,
                dates: filters.dates()?,
                durations,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of simple `column <op> value` predicates.
#[derive(Default)]
struct Filters<'a> {
    preds: Vec<(String, Cmp, &'a Expr)>,
    lists: Vec<(String, &'a [Expr])>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let cmp = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => Cmp::Eq,
                    ast::BinaryOperator::GtEq => Cmp::GtEq,
                    ast::BinaryOperator::LtEq => Cmp::LtEq,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                self.preds.push((col, cmp, &**right));
                Ok(())
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                let col = expr_column_name(expr)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?;
                self.lists.push((col, list.as_slice()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    fn get(&self, col: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.preds
            .iter()
            .find(|(c, op, _)| c == col && *op == cmp)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, col: &str) -> Option<&'a Expr> {
        self.get(col, Cmp::Eq)
    }

    fn court_id(&self) -> Result<Ulid, SqlError> {
        parse_ulid(self.eq("court_id").ok_or(SqlError::MissingFilter("court_id"))?)
    }

    fn lookup(&self) -> Result<Lookup, SqlError> {
        if let Some(id) = self.eq("id") {
            return Ok(Lookup::Id(parse_ulid(id)?));
        }
        Ok(Lookup::Court(self.court_id()?))
    }

    fn dates(&self) -> Result<DateFilter, SqlError> {
        if let Some(date) = self.eq("date") {
            return Ok(DateFilter::On(parse_date(date)?));
        }
        match (self.get("date", Cmp::GtEq), self.get("date", Cmp::LtEq)) {
            (Some(from), Some(to)) => Ok(DateFilter::Between(parse_date(from)?, parse_date(to)?)),
            _ => Err(SqlError::MissingFilter("date")),
        }
    }

    fn durations(&self) -> Result<Vec<i64>, SqlError> {
        let mut out = Vec::new();
        if let Some(d) = self.eq("duration") {
            out.push(parse_i64(d)?);
        }
        for (col, list) in &self.lists {
            if col == "duration" {
                for d in list.iter() {
                    out.push(parse_i64(d)?);
                }
            }
        }
        Ok(out)
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "courts" => "courts",
        "opening_hours" => "opening_hours",
        "rules" => "rules",
        "blocked_ranges" => "blocked_ranges",
        "reservations" => "reservations",
        _ => "table",
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

/// The single row of an `INSERT ... VALUES (...)`.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = Filters::from_selection(selection)?;
    parse_ulid(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64(expr).map(Some)
    }
}

/// A minute of the day, either an integer or an `'HH:MM'` string.
fn parse_minute(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) if s.contains(':') => {
            Ok(i64::from(time::to_minutes(s)?))
        }
        _ => parse_i64(expr),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_string(expr).map(Some)
    }
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| SqlError::InvalidDate(s))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    InvalidDate(String),
    Time(TimeError),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::InvalidDate(s) => write!(f, "invalid date {s:?} (expected YYYY-MM-DD)"),
            SqlError::Time(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}

impl From<TimeError> for SqlError {
    fn from(e: TimeError) -> Self {
        SqlError::Time(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parse_insert_court() {
        let sql = format!(
            "INSERT INTO courts (id, owner_id, name, base_price) VALUES ('{A}', '{B}', 'Court 1', 1200)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCourt {
                id: ulid(A),
                owner_id: ulid(B),
                name: Some("Court 1".into()),
                base_price: 1200,
            }
        );
    }

    #[test]
    fn parse_insert_court_defaults() {
        let sql = format!("INSERT INTO courts (id, owner_id) VALUES ('{A}', '{B}')");
        match parse_sql(&sql).unwrap() {
            Command::InsertCourt { name, base_price, .. } => {
                assert_eq!(name, None);
                assert_eq!(base_price, 0);
            }
            cmd => panic!("expected InsertCourt, got {cmd:?}"),
        }
        let sql = format!("INSERT INTO courts (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("courts", 2, 1))));
    }

    #[test]
    fn parse_update_court() {
        let sql = format!("UPDATE courts SET name = 'Centre', base_price = 1500 WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateCourt {
                id: ulid(A),
                name: Some("Centre".into()),
                base_price: Some(1500),
            }
        );
    }

    #[test]
    fn parse_update_unknown_column() {
        let sql = format!("UPDATE courts SET colour = 'red' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));
    }

    #[test]
    fn parse_delete_court() {
        let sql = format!("DELETE FROM courts WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteCourt { id: ulid(A) });
    }

    #[test]
    fn parse_select_courts() {
        assert_eq!(
            parse_sql("SELECT * FROM courts").unwrap(),
            Command::SelectCourts { id: None }
        );
        let sql = format!("SELECT * FROM courts WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectCourts { id: Some(ulid(A)) });
    }

    #[test]
    fn parse_opening_hours() {
        let sql = r#"INSERT INTO opening_hours (day_of_week, start, "end") VALUES (1, '09:00', '18:00')"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SetOpeningHours {
                day_of_week: 1,
                start: 540,
                end: 1080,
            }
        );
        assert_eq!(
            parse_sql("DELETE FROM opening_hours WHERE day_of_week = 0").unwrap(),
            Command::ClearOpeningHours { day_of_week: 0 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM opening_hours").unwrap(),
            Command::SelectOpeningHours
        );
    }

    #[test]
    fn parse_insert_rule_with_minutes_and_times() {
        let sql = format!(
            r#"INSERT INTO rules (id, court_id, day_of_week, start, "end") VALUES ('{A}', '{B}', 1, 540, '18:00')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertRule {
                id: ulid(A),
                court_id: ulid(B),
                day_of_week: 1,
                start: 540,
                end: 1080,
                price_override: None,
            }
        );
    }

    #[test]
    fn parse_insert_rule_with_price_override() {
        let sql = format!(
            r#"INSERT INTO rules (id, court_id, day_of_week, start, "end", price_override) VALUES ('{A}', '{B}', 6, '08:00', '12:00', 2000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRule { price_override, .. } => assert_eq!(price_override, Some(2000)),
            cmd => panic!("expected InsertRule, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_rule_bad_time_format() {
        let sql = format!(
            r#"INSERT INTO rules (id, court_id, day_of_week, start, "end") VALUES ('{A}', '{B}', 1, '9:00', '18:00')"#
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::Time(TimeError::InvalidTimeFormat(s))) if s == "9:00"
        ));
    }

    #[test]
    fn parse_update_rule() {
        let sql = format!(
            r#"UPDATE rules SET start = '10:00', "end" = 1200, price_override = NULL WHERE id = '{A}'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateRule {
                id: ulid(A),
                day_of_week: None,
                start: Some(600),
                end: Some(1200),
                price_override: Some(None),
            }
        );
    }

    #[test]
    fn parse_delete_and_select_rules() {
        let sql = format!("DELETE FROM rules WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteRule { id: ulid(A) });

        let sql = format!("SELECT * FROM rules WHERE court_id = '{B}' AND active = true");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectRules {
                lookup: Lookup::Court(ulid(B)),
                active_only: true,
            }
        );
        let sql = format!("SELECT * FROM rules WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectRules {
                lookup: Lookup::Id(ulid(A)),
                active_only: false,
            }
        );
    }

    #[test]
    fn parse_blocked_ranges() {
        let sql = format!(
            r#"INSERT INTO blocked_ranges (id, court_id, date, start, "end", reason) VALUES ('{A}', '{B}', '2026-10-19', '10:00', '11:00', 'resurfacing')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBlockedRange {
                id: ulid(A),
                court_id: ulid(B),
                date: date(2026, 10, 19),
                start: 600,
                end: 660,
                reason: Some("resurfacing".into()),
            }
        );

        let sql = format!("SELECT * FROM blocked_ranges WHERE court_id = '{B}' AND date = '2026-10-19'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBlockedRanges {
                court_id: ulid(B),
                date: Some(date(2026, 10, 19)),
            }
        );

        let sql = format!("DELETE FROM blocked_ranges WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBlockedRange { id: ulid(A) });
    }

    #[test]
    fn parse_bad_date() {
        let sql = format!(
            r#"INSERT INTO blocked_ranges (id, court_id, date, start, "end") VALUES ('{A}', '{B}', '19/10/2026', 600, 660)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidDate(_))));
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            r#"INSERT INTO reservations (id, court_id, date, start, "end", requester_id) VALUES ('{A}', '{B}', '2026-10-19', 600, 690, '{A}')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation {
                id: ulid(A),
                court_id: ulid(B),
                date: date(2026, 10, 19),
                start: 600,
                end: 690,
                requester_id: ulid(A),
            }
        );
    }

    #[test]
    fn parse_update_reservation_status() {
        let sql = format!(
            "UPDATE reservations SET status = 'rejected', actor_id = '{B}', reason = 'maintenance' WHERE id = '{A}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReservationStatus {
                id: ulid(A),
                status: ReservationStatus::Rejected,
                actor_id: Some(ulid(B)),
                reason: Some("maintenance".into()),
            }
        );

        let sql = format!("UPDATE reservations SET status = 'completed' WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateReservationStatus { status, actor_id, .. } => {
                assert_eq!(status, ReservationStatus::Completed);
                assert_eq!(actor_id, None);
            }
            cmd => panic!("expected UpdateReservationStatus, got {cmd:?}"),
        }
    }

    #[test]
    fn reservation_status_must_be_settable() {
        let sql = format!("UPDATE reservations SET status = 'pending' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = format!("UPDATE reservations SET status = 'held' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
        let sql = format!("UPDATE reservations SET reason = 'x' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingValue("status"))));
    }

    #[test]
    fn parse_select_reservations() {
        let sql = format!("SELECT * FROM reservations WHERE court_id = '{B}' AND date = '2026-10-19'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations {
                lookup: Lookup::Court(ulid(B)),
                date: Some(date(2026, 10, 19)),
            }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE court_id = '{A}' AND date = '2026-10-19'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                court_id: ulid(A),
                dates: DateFilter::On(date(2026, 10, 19)),
            }
        );

        let sql = format!(
            "SELECT * FROM availability WHERE court_id = '{A}' AND date >= '2026-10-19' AND date <= '2026-10-25'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                court_id: ulid(A),
                dates: DateFilter::Between(date(2026, 10, 19), date(2026, 10, 25)),
            }
        );
    }

    #[test]
    fn availability_requires_filters() {
        let sql = "SELECT * FROM availability WHERE date = '2026-10-19'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("court_id"))));
        let sql = format!("SELECT * FROM availability WHERE court_id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE court_id = '{A}' AND date = '2026-10-19' AND duration IN (60, 90)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                court_id: ulid(A),
                dates: DateFilter::On(date(2026, 10, 19)),
                durations: vec![60, 90],
            }
        );

        let sql = format!("SELECT * FROM slots WHERE court_id = '{A}' AND date = '2026-10-19' AND duration = 60");
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { durations, .. } => assert_eq!(durations, vec![60]),
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }

        let sql = format!("SELECT * FROM slots WHERE court_id = '{A}' AND date = '2026-10-19'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("duration"))));
    }

    #[test]
    fn or_predicates_rejected() {
        let sql = format!("SELECT * FROM reservations WHERE court_id = '{A}' OR court_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_listen_and_unlisten() {
        let channel = format!("court_{A}");
        assert_eq!(
            parse_sql(&format!("LISTEN {channel};")).unwrap(),
            Command::Listen {
                channel: channel.clone()
            }
        );
        assert_eq!(
            parse_sql(&format!("unlisten {channel}")).unwrap(),
            Command::Unlisten { channel }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "foobar"));
    }

    #[test]
    fn multi_row_insert_rejected() {
        let sql = format!(
            "INSERT INTO courts (id, owner_id) VALUES ('{A}', '{B}'), ('{B}', '{A}')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
