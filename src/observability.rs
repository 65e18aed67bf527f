use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "shiftbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "shiftbook_query_duration_seconds";

/// Counter: engine errors returned to clients. Labels: code.
pub const ENGINE_REJECTIONS_TOTAL: &str = "shiftbook_engine_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shiftbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shiftbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shiftbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "shiftbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shiftbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shiftbook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "shiftbook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertPosition { .. } => "insert_position",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertShift { .. } => "insert_shift",
        Command::UpdateShift { .. } => "update_shift",
        Command::InsertPositionRules { .. } => "insert_position_rules",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::AddOpenSlots { .. } => "add_open_slots",
        Command::RemoveSlots { .. } => "remove_slots",
        Command::AssignEmployee { .. } => "assign_employee",
        Command::RemoveAssignment { .. } => "remove_assignment",
        Command::UpdateAssignment { .. } => "update_assignment",
        Command::SelectShifts { .. } => "select_shifts",
        Command::SelectPositionRules { .. } => "select_position_rules",
        Command::SelectSchedules => "select_schedules",
        Command::SelectOccurrences { .. } => "select_occurrences",
        Command::SelectSlotCheck { .. } => "select_slot_check",
    }
}
