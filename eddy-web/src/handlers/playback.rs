//! Playback API handlers: decisions, session lifecycle and stats.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use eddy_core::PlaybackDecision;
use eddy_core::playback::DecideRequest;
use eddy_core::session::SessionStats;
use eddy_core::{SessionView, StartRequest, StartResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::server::AppState;

/// Body naming an existing session.
#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    /// Target session
    pub session_id: Uuid,
}

/// Body of a seek-ahead request.
#[derive(Debug, Deserialize)]
pub struct SeekAheadRequest {
    /// Session whose source and target are reused
    pub session_id: Uuid,
    /// Seconds into the source
    pub seek_position: f64,
}

/// Number of sessions a stop request affected.
#[derive(Debug, Serialize)]
pub struct StopResponse {
    /// Sessions moved to stopped
    pub stopped: usize,
}

/// `POST /playback/decide`
pub async fn decide(
    State(state): State<AppState>,
    Json(request): Json<DecideRequest>,
) -> Result<Json<PlaybackDecision>, ApiError> {
    Ok(Json(state.playback.decide(&request).await?))
}

/// `POST /playback/start`
///
/// Answers 200 with a completed session when the output is already stored,
/// 202 when work was admitted or queued.
pub async fn start_playback(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let response = state.playback.start(request).await?;
    Ok((status_for(&response), Json(response)))
}

/// `GET /playback/session/{id}`
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(state.playback.session(id)?))
}

/// `POST /playback/seek-ahead`
pub async fn seek_ahead(
    State(state): State<AppState>,
    Json(request): Json<SeekAheadRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let response = state
        .playback
        .seek_ahead(request.session_id, request.seek_position)
        .await?;
    Ok((status_for(&response), Json(response)))
}

/// `POST /playback/stop`
pub async fn stop_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<StopResponse>, ApiError> {
    let stopped = state.playback.stop(request.session_id)?;
    Ok(Json(StopResponse { stopped }))
}

/// `POST /playback/stop-all`
pub async fn stop_all_sessions(State(state): State<AppState>) -> Json<StopResponse> {
    Json(StopResponse {
        stopped: state.playback.stop_all(),
    })
}

/// `GET /playback/stats`
pub async fn stats(State(state): State<AppState>) -> Json<SessionStats> {
    Json(state.playback.stats())
}

fn status_for(response: &StartResponse) -> StatusCode {
    if response.session.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    }
}
