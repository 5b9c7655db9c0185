//! `/health` and `/status` bodies.

use std::time::Instant;

use duplex_core::CapacitySnapshot;
use serde::Serialize;

/// Liveness reported by `/health`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Accepting connections.
    Ok,
    /// Shutdown has begun; existing connections are being closed.
    Draining,
}

/// Unauthenticated `/health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `ok` or `draining`.
    pub status: Liveness,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connections holding an admission slot.
    pub connections: usize,
    /// Sessions in the store.
    pub sessions: usize,
}

/// Build a health body from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    sessions: usize,
    shutting_down: bool,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down {
            Liveness::Draining
        } else {
            Liveness::Ok
        },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        sessions,
    }
}

/// Authenticated `/status` body: the capacity snapshot plus shutdown state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Admission pool state.
    #[serde(flatten)]
    pub capacity: CapacitySnapshot,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
}
