use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Requests ────────────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "canchas_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "canchas_query_duration_seconds";

/// Counter: bookings refused because the slot was taken on the cancha or a linked one.
pub const CONFLICTS_TOTAL: &str = "canchas_conflicts_total";

/// Counter: statements refused for the consumer login.
pub const PERMISSION_DENIED_TOTAL: &str = "canchas_permission_denied_total";

// ── Resources ───────────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "canchas_connections_active";
pub const CONNECTIONS_TOTAL: &str = "canchas_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "canchas_connections_rejected_total";

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "canchas_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "canchas_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "canchas_wal_compactions_total";

/// Serve Prometheus metrics on `port`. Does nothing when no port is configured.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCancha { .. } => "insert_cancha",
        Command::UpdateCancha { .. } => "update_cancha",
        Command::DeleteCancha { .. } => "delete_cancha",
        Command::SelectCanchas { .. } => "select_canchas",
        Command::InsertLink { .. } => "insert_link",
        Command::DeleteLink { .. } => "delete_link",
        Command::SelectLinks => "select_links",
        Command::InsertReserva(_) => "insert_reserva",
        Command::BatchInsertReservas(_) => "batch_insert_reservas",
        Command::UpdateReserva { .. } => "update_reserva",
        Command::DeleteReserva { .. } => "delete_reserva",
        Command::SelectReservas(_) => "select_reservas",
        Command::InsertFija(_) => "insert_fija",
        Command::UpdateFija { .. } => "update_fija",
        Command::DeleteFija { .. } => "delete_fija",
        Command::SelectFijas { .. } => "select_fijas",
        Command::RenewFija { .. } => "renew_fija",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFijaPreview { .. } => "select_fija_preview",
    }
}
