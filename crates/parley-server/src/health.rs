//! `/health` endpoint.

use std::time::Instant;

use parley_signaling::RelayStats;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections, registered or not.
    pub connections: usize,
    /// Connections bound to a client identifier.
    pub registered_clients: usize,
    /// Live calls, ringing or connected.
    pub active_calls: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, stats: RelayStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        registered_clients: stats.registered_clients,
        active_calls: stats.active_calls(),
    }
}
