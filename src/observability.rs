use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tavola_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tavola_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tavola_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tavola_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tavola_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "tavola_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tavola_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tavola_wal_flush_batch_size";

/// Counter: WAL compactions run by the maintenance task. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "tavola_wal_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking form submissions. Labels: decision (confirmed, review, or a rejection code).
pub const RESERVATIONS_TOTAL: &str = "tavola_reservations_total";

/// Counter: transactional emails attempted. Labels: template, status.
pub const EMAILS_TOTAL: &str = "tavola_emails_total";

/// Counter: push notifications attempted. Labels: outcome.
pub const PUSH_TOTAL: &str = "tavola_push_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertReservation { status: None, .. } => "submit_reservation",
        Command::InsertReservation { .. } => "staff_booking",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertClosure { .. } => "insert_closure",
        Command::DeleteClosure { .. } => "delete_closure",
        Command::SelectClosures => "select_closures",
        Command::InsertClients { .. } => "insert_clients",
        Command::DeleteClient { .. } => "delete_client",
        Command::SelectClients => "select_clients",
        Command::ImportClients { .. } => "import_clients",
        Command::SyncClients => "sync_clients",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::DeleteSubscription { .. } => "delete_subscription",
        Command::SelectSubscriptions => "select_subscriptions",
        Command::SelectEmailLog { .. } => "select_email_log",
        Command::InsertCheckout { .. } => "insert_checkout",
        Command::SelectCheckouts => "select_checkouts",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
