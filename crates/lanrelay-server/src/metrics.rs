//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Sessions admitted into the registry (counter).
pub const RELAY_SESSIONS_ADMITTED_TOTAL: &str = "relay_sessions_admitted_total";
/// Sessions retired from the registry (counter).
pub const RELAY_SESSIONS_RETIRED_TOTAL: &str = "relay_sessions_retired_total";
/// Sessions currently admitted (gauge).
pub const RELAY_SESSIONS_ACTIVE: &str = "relay_sessions_active";
/// Session lifetime in seconds (histogram).
pub const RELAY_SESSION_DURATION_SECONDS: &str = "relay_session_duration_seconds";
/// Upgrade requests rejected or failed before admission (counter).
pub const RELAY_ADMISSION_FAILURES_TOTAL: &str = "relay_admission_failures_total";
/// Text frames received from clients (counter).
pub const RELAY_FRAMES_RECEIVED_TOTAL: &str = "relay_frames_received_total";
/// Binary frames received and ignored (counter).
pub const RELAY_FRAMES_IGNORED_TOTAL: &str = "relay_frames_ignored_total";
/// Frames enqueued for a recipient (counter).
pub const RELAY_BROADCAST_DELIVERIES_TOTAL: &str = "relay_broadcast_deliveries_total";
/// Per-recipient write failures (counter, labels: reason).
pub const RELAY_BROADCAST_FAILURES_TOTAL: &str = "relay_broadcast_failures_total";
/// Recipients skipped by the liveness check or self-echo exclusion (counter).
pub const RELAY_BROADCAST_SKIPPED_TOTAL: &str = "relay_broadcast_skipped_total";
/// Sessions closed for missing the keep-alive window (counter).
pub const RELAY_HEARTBEAT_TIMEOUTS_TOTAL: &str = "relay_heartbeat_timeouts_total";
