use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// How a `SELECT ... FROM bookings` narrows its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Ticket(Ulid),
    Vehicle(Ulid),
    RequestedFor(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreateBooking {
        id: Ulid,
        start: Ms,
        end: Ms,
        vehicle_id: Option<Ulid>,
        requested_for: Option<Ulid>,
    },
    CreatePeriodBooking {
        id: Ulid,
        date: NaiveDate,
        period: Period,
        vehicle_id: Option<Ulid>,
        requested_for: Option<Ulid>,
    },
    Approve {
        booking_id: Ulid,
    },
    Reject {
        booking_id: Ulid,
        reason: Option<String>,
    },
    AssignVehicle {
        booking_id: Ulid,
        vehicle_id: Ulid,
    },
    AssignDriver {
        booking_id: Ulid,
        driver_id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectBlockedDates {
        vehicle_id: Option<Ulid>,
    },
    SelectCalendarMeta {
        vehicle_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let first = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [only] => only,
        many => return Err(SqlError::MultipleStatements(many.len())),
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Writable command tables and the column order assumed when an INSERT
/// names no columns.
const COMMAND_TABLES: &[(&str, &[&str])] = &[
    ("bookings", &["id", "start_at", "end_at", "vehicle_id", "requested_for"]),
    ("period_bookings", &["id", "date", "period", "vehicle_id", "requested_for"]),
    ("approvals", &["booking_id"]),
    ("rejections", &["booking_id", "reason"]),
    ("vehicle_assignments", &["booking_id", "vehicle_id"]),
    ("driver_assignments", &["booking_id", "driver_id"]),
];

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn optional_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        match self.get(column) {
            Some(expr) => parse_ulid_or_null(expr),
            None => Ok(None),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let &(table, defaults) = COMMAND_TABLES
        .iter()
        .find(|(t, _)| *t == name)
        .ok_or(SqlError::UnknownTable(name))?;
    let values = extract_single_row(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > defaults.len() {
            return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
        }
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        let named: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
        if values.len() != named.len() {
            return Err(SqlError::WrongArity(table, named.len(), values.len()));
        }
        named
    };
    let row = Row {
        table,
        cells: columns.into_iter().zip(values.iter()).collect(),
    };

    match table {
        "bookings" => Ok(Command::CreateBooking {
            id: row.ulid("id")?,
            start: parse_timestamp(row.required("start_at")?)?,
            end: parse_timestamp(row.required("end_at")?)?,
            vehicle_id: row.optional_ulid("vehicle_id")?,
            requested_for: row.optional_ulid("requested_for")?,
        }),
        "period_bookings" => Ok(Command::CreatePeriodBooking {
            id: row.ulid("id")?,
            date: parse_date(row.required("date")?)?,
            period: parse_string(row.required("period")?)?
                .parse()
                .map_err(SqlError::BadValue)?,
            vehicle_id: row.optional_ulid("vehicle_id")?,
            requested_for: row.optional_ulid("requested_for")?,
        }),
        "approvals" => Ok(Command::Approve {
            booking_id: row.ulid("booking_id")?,
        }),
        "rejections" => Ok(Command::Reject {
            booking_id: row.ulid("booking_id")?,
            reason: match row.get("reason") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            },
        }),
        "vehicle_assignments" => Ok(Command::AssignVehicle {
            booking_id: row.ulid("booking_id")?,
            vehicle_id: row.ulid("vehicle_id")?,
        }),
        "driver_assignments" => Ok(Command::AssignDriver {
            booking_id: row.ulid("booking_id")?,
            driver_id: row.ulid("driver_id")?,
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |column: &str| filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e);

    match table.as_str() {
        "bookings" => {
            let filter = if let Some(e) = filter("id") {
                BookingFilter::Id(parse_ulid(e)?)
            } else if let Some(e) = filter("ticket") {
                BookingFilter::Ticket(parse_ulid(e)?)
            } else if let Some(e) = filter("vehicle_id") {
                BookingFilter::Vehicle(parse_ulid(e)?)
            } else if let Some(e) = filter("requested_for") {
                BookingFilter::RequestedFor(parse_ulid(e)?)
            } else {
                return Err(SqlError::MissingFilter("id, ticket, vehicle_id or requested_for"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "blocked_dates" => Ok(Command::SelectBlockedDates {
            vehicle_id: filter("vehicle_id").map(parse_ulid).transpose()?,
        }),
        "calendar_meta" => Ok(Command::SelectCalendarMeta {
            vehicle_id: filter("vehicle_id").map(parse_ulid).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y` into `(column, value)` pairs. Anything else is refused.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// Commands act on one booking at a time, so only single-row VALUES.
fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::BadValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::BadValue(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::BadValue(format!("bad i64: {e}"))),
            _ => Err(SqlError::BadValue(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Unix milliseconds, or an RFC 3339 string such as `'2024-01-10T08:00:00Z'`.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::BadDatetime(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::BadDatetime(format!("bad date {s:?}: {e}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::BadValue(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    MultipleStatements(usize),
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// A literal of the wrong shape: bad ULID, number or period.
    BadValue(String),
    BadDatetime(String),
}

impl SqlError {
    /// Statement-shape problems are syntax errors. Bad or missing values
    /// report like any other validation failure.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::BadValue(_) | SqlError::MissingColumn(..) => "22023",
            SqlError::BadDatetime(_) => "22007",
            SqlError::Parse(_)
            | SqlError::Empty
            | SqlError::MultipleStatements(_)
            | SqlError::Unsupported(_)
            | SqlError::UnknownTable(_)
            | SqlError::WrongArity(..)
            | SqlError::MissingFilter(_) => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::MultipleStatements(n) => write!(f, "one statement per query, got {n}"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(s) => write!(f, "invalid value: {s}"),
            SqlError::BadDatetime(s) => write!(f, "invalid datetime: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
