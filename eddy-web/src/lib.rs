//! Eddy Web - playback and content HTTP API

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! JSON endpoints for playback decisions and transcode sessions, plus
//! byte-range serving of committed manifests and segments.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, ServerError, build_router, run_server};
