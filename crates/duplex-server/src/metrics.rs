//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "duplex_connections_total";
/// Open WebSocket connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "duplex_connections_active";
/// Admission slots currently held (gauge).
pub const ADMISSION_SLOTS_ACTIVE: &str = "duplex_admission_slots_active";
/// Handshakes rejected (counter, labels: reason).
pub const HANDSHAKE_REJECTIONS_TOTAL: &str = "duplex_handshake_rejections_total";
/// Turns started (counter).
pub const TURNS_STARTED_TOTAL: &str = "duplex_turns_started_total";
/// Turns that completed normally (counter).
pub const TURNS_COMPLETED_TOTAL: &str = "duplex_turns_completed_total";
/// Turns cancelled by barge-in, cancel, end or shutdown (counter).
pub const TURNS_CANCELLED_TOTAL: &str = "duplex_turns_cancelled_total";
/// Turns that ended in an engine error (counter, labels: engine).
pub const TURNS_FAILED_TOTAL: &str = "duplex_turns_failed_total";
/// Messages rejected by a sliding window (counter, labels: category).
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "duplex_rate_limit_rejections_total";
/// Tool decisions that hit the hard timeout (counter).
pub const TOOL_GATE_TIMEOUTS_TOTAL: &str = "duplex_tool_gate_timeouts_total";
/// Turn start to first token frame (histogram, seconds).
pub const TTFT_SECONDS: &str = "duplex_ttft_seconds";
/// Turn start to `done` (histogram, seconds).
pub const TURN_DURATION_SECONDS: &str = "duplex_turn_duration_seconds";
