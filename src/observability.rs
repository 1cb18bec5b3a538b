use std::net::SocketAddr;

use crate::sql::Command;

// ── Request path ────────────────────────────────────────────────

/// Queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookend_queries_total";

/// Query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookend_query_duration_seconds";

// ── Server resources ────────────────────────────────────────────

/// Open client connections right now.
pub const CONNECTIONS_ACTIVE: &str = "bookend_connections_active";

/// Connections accepted since startup.
pub const CONNECTIONS_TOTAL: &str = "bookend_connections_total";

/// Connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookend_connections_rejected_total";

/// Tenant engines resident in memory.
pub const TENANTS_ACTIVE: &str = "bookend_tenants_active";

/// Duration of each WAL group-commit flush, in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookend_wal_flush_duration_seconds";

/// Records written per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookend_wal_flush_batch_size";

// ── Bookings and settlement ─────────────────────────────────────

/// Admissions turned away. Labels: kind
/// (slot_conflict, capacity, hold_expired, funds).
pub const ADMISSIONS_REJECTED: &str = "bookend_admissions_rejected_total";

/// Registration holds expired by the reaper.
pub const HOLDS_EXPIRED_TOTAL: &str = "bookend_holds_expired_total";

/// Payments settled. Labels: outcome (succeeded, failed).
pub const SETTLEMENTS_TOTAL: &str = "bookend_settlements_total";

/// Start the Prometheus scrape endpoint. Without a port this is a no-op.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("Prometheus exporter failed to start");
    tracing::info!("serving metrics at http://0.0.0.0:{port}/metrics");
}

/// Short, stable label naming a command in metric series.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCourt { .. } => "insert_court",
        Command::UpdateCourt { .. } => "update_court",
        Command::DeleteCourt { .. } => "delete_court",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::DeleteBlackout { .. } => "delete_blackout",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::InsertRegistration { .. } => "insert_registration",
        Command::CancelRegistration { .. } => "cancel_registration",
        Command::InsertPayment { .. } => "insert_payment",
        Command::ConfirmPayment { .. } => "confirm_payment",
        Command::InsertLedgerCredit { .. } => "insert_ledger_credit",
        Command::SelectCourts => "select_courts",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectEvents => "select_events",
        Command::SelectRegistrations { .. } => "select_registrations",
        Command::SelectPayments { .. } => "select_payments",
        Command::SelectBalance { .. } => "select_balance",
        Command::SelectLedger { .. } => "select_ledger",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
