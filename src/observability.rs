use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "interviewd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "interviewd_request_duration_seconds";

/// Counter: booking attempts by result. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "interviewd_bookings_total";

/// Histogram: time to compute per-interviewer free blocks for a range, in seconds.
pub const AVAILABILITY_DURATION_SECONDS: &str = "interviewd_availability_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "interviewd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "interviewd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "interviewd_connections_rejected_total";

/// Counter: WAL compactions run by the background compactor. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "interviewd_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "interviewd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "interviewd_wal_flush_batch_size";

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

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Availability { .. } => "availability",
        Request::Book { .. } => "book",
        Request::CreateInterviewer { .. } => "create_interviewer",
        Request::DeleteInterviewer { .. } => "delete_interviewer",
        Request::AddRule { .. } => "add_rule",
        Request::RemoveRule { .. } => "remove_rule",
        Request::AddBlackout { .. } => "add_blackout",
        Request::RemoveBlackout { .. } => "remove_blackout",
        Request::RegisterCandidate { .. } => "register_candidate",
        Request::CancelInterview { .. } => "cancel_interview",
        Request::ListInterviewers => "list_interviewers",
        Request::FreeBlocks { .. } => "free_blocks",
        Request::Interviews { .. } => "interviews",
    }
}
