use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking writes. Labels: op, status.
pub const BOOKING_OPS_TOTAL: &str = "tablebook_booking_ops_total";

/// Histogram: booking write latency in seconds, retries included. Labels: op.
pub const BOOKING_OP_DURATION_SECONDS: &str = "tablebook_booking_op_duration_seconds";

/// Counter: writes rejected because the slot was full.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "tablebook_capacity_rejections_total";

/// Counter: units re-run after a concurrent conflict. Labels: op.
pub const CONFLICT_RETRIES_TOTAL: &str = "tablebook_conflict_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablebook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "tablebook_wal_compactions_total";

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
