//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::server::ServerState;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server answers.
    pub status: String,
    /// Server lifecycle state.
    pub state: ServerState,
    /// Seconds since the server was created.
    pub uptime_secs: u64,
    /// Sessions currently in the registry.
    pub sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, state: ServerState, sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        state,
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
    }
}
