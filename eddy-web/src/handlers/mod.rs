//! HTTP handlers for the playback and content API

pub mod content;
pub mod health;
pub mod playback;
pub mod range;

pub use content::content_file;
pub use health::health;
pub use playback::{
    decide, seek_ahead, session_status, start_playback, stats, stop_all_sessions, stop_session,
};
