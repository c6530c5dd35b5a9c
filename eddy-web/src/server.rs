//! Router construction and the HTTP server loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use eddy_core::PlaybackService;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{
    content_file, decide, health, seek_ahead, session_status, start_playback, stats,
    stop_all_sessions, stop_session,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Playback entry point
    pub playback: Arc<PlaybackService>,
    /// When the server was constructed
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Creates state for a freshly started server.
    pub fn new(playback: Arc<PlaybackService>) -> Self {
        Self {
            playback,
            started_at: Utc::now(),
        }
    }
}

/// Errors that stop the server from running.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Accept loop failed
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Builds the API router. Every route lives under `/api/v1`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/playback/decide", post(decide))
        .route("/playback/start", post(start_playback))
        .route("/playback/session/{id}", get(session_status))
        .route("/playback/seek-ahead", post(seek_ahead))
        .route("/playback/stop", post(stop_session))
        .route("/playback/stop-all", post(stop_all_sessions))
        .route("/playback/stats", get(stats))
        .route("/content/{hash}/{*file}", get(content_file));

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` is cancelled, then stops all
/// sessions before returning.
///
/// # Errors
///
/// - `ServerError::Bind` - Address unavailable
/// - `ServerError::Serve` - Accept loop failed
pub async fn run_server(
    playback: Arc<PlaybackService>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = build_router(AppState::new(Arc::clone(&playback)));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(addr = %local, "Eddy playback server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve);

    info!("Server stopped, shutting down sessions");
    playback.shutdown().await;
    served
}
