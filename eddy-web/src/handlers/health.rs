//! Liveness endpoint.

use axum::extract::State;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::server::AppState;

/// Health check body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the server answers
    pub status: &'static str,
    /// Server start time
    pub started_at: DateTime<Utc>,
    /// Whole seconds since start
    pub uptime_secs: i64,
    /// Sessions holding a worker slot
    pub running: usize,
    /// Sessions waiting for one
    pub queued: usize,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.playback.stats();
    Json(HealthResponse {
        status: "ok",
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        running: stats.running,
        queued: stats.queued,
    })
}
