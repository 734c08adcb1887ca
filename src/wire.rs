use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{login_refused, resolve_login, FleetAuthSource};
use crate::config::BookingHours;
use crate::engine::{Engine, EngineError, NewBooking};
use crate::model::*;
use crate::sql::{self, BookingFilter, Command};

pub struct FleetHandler {
    engine: Arc<Engine>,
    hours: BookingHours,
    query_parser: Arc<FleetQueryParser>,
}

impl FleetHandler {
    pub fn new(engine: Arc<Engine>, hours: BookingHours) -> Self {
        Self {
            engine,
            hours,
            query_parser: Arc::new(FleetQueryParser),
        }
    }

    /// The connection's login name is a user id. The role is looked up on
    /// every statement so registry changes apply to open sessions.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let login = client
            .metadata()
            .get(pgwire::api::METADATA_USER)
            .map(String::as_str)
            .unwrap_or_default();
        resolve_login(self.engine.registry.as_ref(), login).ok_or_else(|| login_refused(login))
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.run_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        let bookings = match cmd {
            Command::CreateBooking {
                id,
                start,
                end,
                vehicle_id,
                requested_for,
            } => vec![
                engine
                    .create_booking(
                        actor,
                        NewBooking {
                            id,
                            start,
                            end,
                            vehicle_id,
                            requested_for,
                        },
                    )
                    .await
                    .map_err(engine_err)?,
            ],
            Command::CreatePeriodBooking {
                id,
                date,
                period,
                vehicle_id,
                requested_for,
            } => vec![
                engine
                    .create_period_booking(actor, id, date, period, vehicle_id, requested_for)
                    .await
                    .map_err(engine_err)?,
            ],
            Command::Approve { booking_id } => {
                vec![engine.approve_booking(actor, booking_id).await.map_err(engine_err)?]
            }
            Command::Reject { booking_id, reason } => vec![
                engine
                    .reject_booking(actor, booking_id, reason)
                    .await
                    .map_err(engine_err)?,
            ],
            Command::AssignVehicle {
                booking_id,
                vehicle_id,
            } => vec![
                engine
                    .assign_vehicle(actor, booking_id, vehicle_id)
                    .await
                    .map_err(engine_err)?,
            ],
            Command::AssignDriver {
                booking_id,
                driver_id,
            } => vec![
                engine
                    .assign_driver(actor, booking_id, driver_id)
                    .await
                    .map_err(engine_err)?,
            ],
            Command::SelectBookings { filter } => match filter {
                BookingFilter::Id(id) => vec![engine.get_booking_as(actor, id).await.map_err(engine_err)?],
                BookingFilter::Ticket(t) => {
                    vec![engine.find_by_ticket_as(actor, t).await.map_err(engine_err)?]
                }
                BookingFilter::Vehicle(v) => engine.vehicle_bookings_as(actor, v).await.map_err(engine_err)?,
                BookingFilter::RequestedFor(u) => {
                    engine.bookings_for_user_as(actor, u).await.map_err(engine_err)?
                }
            },
            Command::SelectBlockedDates { vehicle_id } => {
                let dates = engine.blocked_dates(vehicle_id).await;
                return Ok(vec![blocked_dates_response(vehicle_id, &dates)?]);
            }
            Command::SelectCalendarMeta { vehicle_id } => {
                let dates = engine.blocked_dates(vehicle_id).await;
                return Ok(vec![calendar_meta_response(&self.hours, &dates)?]);
            }
        };
        Ok(vec![bookings_response(&bookings)?])
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("ticket", Type::VARCHAR),
        text_field("requester_id", Type::VARCHAR),
        text_field("requested_for", Type::VARCHAR),
        text_field("start_at", Type::INT8),
        text_field("end_at", Type::INT8),
        text_field("vehicle_id", Type::VARCHAR),
        text_field("driver_id", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("decided_by", Type::VARCHAR),
        text_field("decided_at", Type::INT8),
        text_field("reject_reason", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn blocked_dates_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
    ]
}

fn calendar_meta_schema() -> Vec<FieldInfo> {
    vec![
        text_field("open_time", Type::VARCHAR),
        text_field("close_time", Type::VARCHAR),
        text_field("blocked_dates", Type::VARCHAR),
    ]
}

/// Pick the row shape from the statement text. Works before parameters are bound.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("BLOCKED_DATES") {
        blocked_dates_schema()
    } else if upper.contains("CALENDAR_META") {
        calendar_meta_schema()
    } else {
        booking_schema()
    }
}

fn bookings_response(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let ulid_str = |id: Option<ulid::Ulid>| id.map(|v| v.to_string());
    let mut rows = Vec::with_capacity(bookings.len());
    for b in bookings {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&b.id.to_string())?;
        encoder.encode_field(&b.ticket.to_string())?;
        encoder.encode_field(&b.requester_id.to_string())?;
        encoder.encode_field(&b.requested_for_id.to_string())?;
        encoder.encode_field(&b.span.start)?;
        encoder.encode_field(&b.span.end)?;
        encoder.encode_field(&ulid_str(b.vehicle_id))?;
        encoder.encode_field(&ulid_str(b.driver_id))?;
        encoder.encode_field(&b.status.as_str())?;
        encoder.encode_field(&ulid_str(b.decided_by))?;
        encoder.encode_field(&b.decided_at)?;
        encoder.encode_field(&b.reject_reason)?;
        encoder.encode_field(&b.created_at)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn blocked_dates_response(
    vehicle_id: Option<ulid::Ulid>,
    dates: &[chrono::NaiveDate],
) -> PgWireResult<Response> {
    let schema = Arc::new(blocked_dates_schema());
    let vid = vehicle_id.map(|v| v.to_string());
    let mut rows = Vec::with_capacity(dates.len());
    for date in dates {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&vid)?;
        encoder.encode_field(&date.format("%Y-%m-%d").to_string())?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn calendar_meta_response(hours: &BookingHours, dates: &[chrono::NaiveDate]) -> PgWireResult<Response> {
    let schema = Arc::new(calendar_meta_schema());
    let joined = dates
        .iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&hours.open_str())?;
    encoder.encode_field(&hours.close_str())?;
    encoder.encode_field(&joined)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&actor, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let responses = self.execute_command(&actor, cmd).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("command produced no response".into()))
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(engine: Arc<Engine>, hours: BookingHours, password: String) -> Self {
        let auth_source = FleetAuthSource::new(password, engine.registry.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetHandler::new(engine, hours)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: FleetFactory,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    tracing::debug!(kind = e.kind().as_str(), "request refused: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
