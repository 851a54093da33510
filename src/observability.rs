use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtd_query_duration_seconds";

/// Counter: reservation state changes. Labels: status.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "courtd_reservation_transitions_total";

/// Counter: reserve attempts refused by a conflict. Labels: kind.
pub const RESERVE_CONFLICTS_TOTAL: &str = "courtd_reserve_conflicts_total";

/// Counter: pending reservations expired by the reaper.
pub const REAPER_EXPIRED_TOTAL: &str = "courtd_reaper_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtd_connections_rejected_total";

/// Gauge: facilities with a loaded engine.
pub const FACILITIES_ACTIVE: &str = "courtd_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtd_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None; a
/// failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCourt { .. } => "insert_court",
        Command::UpdateCourt { .. } => "update_court",
        Command::DeleteCourt { .. } => "delete_court",
        Command::SelectCourts { .. } => "select_courts",
        Command::SetOpeningHours { .. } => "set_opening_hours",
        Command::ClearOpeningHours { .. } => "clear_opening_hours",
        Command::SelectOpeningHours => "select_opening_hours",
        Command::InsertRule { .. } => "insert_rule",
        Command::UpdateRule { .. } => "update_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::SelectRules { .. } => "select_rules",
        Command::InsertBlockedRange { .. } => "insert_blocked_range",
        Command::DeleteBlockedRange { .. } => "delete_blocked_range",
        Command::SelectBlockedRanges { .. } => "select_blocked_ranges",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
