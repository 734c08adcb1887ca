use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetbook_query_duration_seconds";

/// Counter: booking operations. Labels: op, outcome.
pub const BOOKING_OPS_TOTAL: &str = "fleetbook_booking_ops_total";

/// Counter: commits refused because the vehicle was already taken.
pub const CONFLICTS_DETECTED_TOTAL: &str = "fleetbook_conflicts_detected_total";

/// Counter: audit entries that could not be recorded.
pub const AUDIT_FAILURES_TOTAL: &str = "fleetbook_audit_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: bookings held in memory.
pub const BOOKINGS_LOADED: &str = "fleetbook_bookings_loaded";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetbook_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "fleetbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "fleetbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateBooking { .. } => "create_booking",
        Command::CreatePeriodBooking { .. } => "create_period_booking",
        Command::Approve { .. } => "approve",
        Command::Reject { .. } => "reject",
        Command::AssignVehicle { .. } => "assign_vehicle",
        Command::AssignDriver { .. } => "assign_driver",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBlockedDates { .. } => "select_blocked_dates",
        Command::SelectCalendarMeta { .. } => "select_calendar_meta",
    }
}
