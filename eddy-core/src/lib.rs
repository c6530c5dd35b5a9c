//! Eddy Core - media playback decisions, transcoding and content storage
//!
//! Decides how a media file reaches a client, runs the encode and package
//! pipeline for files that need it, and keeps the output in a deduplicating
//! content-addressable store so repeated requests are served from disk.

pub mod config;
pub mod content;
pub mod decision;
pub mod media;
pub mod params;
pub mod pipeline;
pub mod playback;
pub mod process;
pub mod provider;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod tracing_setup;

use std::time::Duration;

use uuid::Uuid;

// Re-export main types for convenient access
pub use config::{ConfigError, EddyConfig};
pub use content::{ContentStore, ContentUrls, StorageError};
pub use decision::{DecisionEngine, DecisionError, DecisionKind, PlaybackDecision};
pub use media::{CatalogError, DeviceProfile, MediaProfile, ProbeError};
pub use params::{ContentHash, StreamingFormat, TranscodeParams};
pub use pipeline::{PipelineError, PipelineManager};
pub use playback::{PlaybackService, SessionView, StartRequest, StartResponse};
pub use provider::{ProviderError, ProviderRegistry};
pub use session::{RepositoryError, SessionError, SessionManager, SessionStatus, TranscodeSession};

/// Errors surfaced by playback operations.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    /// Media profile unusable for any kind of playback
    #[error("Decision error: {0}")]
    Decision(DecisionError),

    /// No provider matches the target; not retried against other providers
    #[error("{0}")]
    NoCapableProvider(ProviderError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Worker pool and queue are full
    #[error("Session limit reached ({queued} queued), retry after {}s", .retry_after.as_secs())]
    LimitExceeded { queued: usize, retry_after: Duration },

    #[error("Session {id} not found")]
    SessionNotFound { id: Uuid },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Media lookup failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Media probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Session store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Session error: {0}")]
    Session(SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DecisionError> for PlaybackError {
    fn from(error: DecisionError) -> Self {
        match error {
            DecisionError::Provider(e) => e.into(),
            other => PlaybackError::Decision(other),
        }
    }
}

impl From<ProviderError> for PlaybackError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::DuplicateProvider { .. } => PlaybackError::Config(ConfigError::Invalid {
                field: "providers",
                reason: error.to_string(),
            }),
            no_capable @ ProviderError::NoCapableProvider { .. } => {
                PlaybackError::NoCapableProvider(no_capable)
            }
        }
    }
}

impl From<SessionError> for PlaybackError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::SessionNotFound { id } => PlaybackError::SessionNotFound { id },
            SessionError::LimitExceeded {
                queued,
                retry_after,
            } => PlaybackError::LimitExceeded {
                queued,
                retry_after,
            },
            other => PlaybackError::Session(other),
        }
    }
}

impl PlaybackError {
    /// Returns a user-friendly error message suitable for display.
    ///
    /// Never includes subprocess diagnostics or file system paths.
    pub fn user_message(&self) -> String {
        match self {
            PlaybackError::Decision(e) => match e {
                DecisionError::NoStreams { .. } => "Media has no playable streams".to_string(),
                DecisionError::UnknownContainer { .. } => {
                    "Media format is not recognized".to_string()
                }
                DecisionError::Provider(_) => "No transcoder can produce this stream".to_string(),
            },
            PlaybackError::NoCapableProvider(_) => {
                "No transcoder can produce this stream".to_string()
            }
            PlaybackError::Pipeline(_) => "Transcoding failed".to_string(),
            PlaybackError::Storage(_) => "Storage error occurred".to_string(),
            PlaybackError::LimitExceeded { retry_after, .. } => format!(
                "Too many active streams, try again in {} seconds",
                retry_after.as_secs()
            ),
            PlaybackError::SessionNotFound { id } => format!("Session {id} not found"),
            PlaybackError::InvalidRequest { reason } => format!("Invalid request: {reason}"),
            PlaybackError::Catalog(CatalogError::NotFound { id }) => {
                format!("Media file {id} not found")
            }
            PlaybackError::Catalog(CatalogError::InvalidId { id, .. }) => {
                format!("Invalid media file id: {id}")
            }
            PlaybackError::Catalog(_) | PlaybackError::Probe(_) => {
                "Media file could not be read".to_string()
            }
            PlaybackError::Repository(_) | PlaybackError::Session(_) => {
                "Session error occurred".to_string()
            }
            PlaybackError::Config(_) => "Configuration error occurred".to_string(),
            PlaybackError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if the caller may succeed by retrying later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlaybackError::LimitExceeded { .. } => true,
            PlaybackError::Pipeline(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlaybackError::LimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Checks if this error is due to the request rather than the server.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PlaybackError::Decision(_)
                | PlaybackError::NoCapableProvider(_)
                | PlaybackError::InvalidRequest { .. }
                | PlaybackError::SessionNotFound { .. }
                | PlaybackError::Catalog(CatalogError::NotFound { .. } | CatalogError::InvalidId { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_provider_error_becomes_no_capable_provider() {
        let params = TranscodeParams::new("m", "mp4", StreamingFormat::Dash).with_video("av1", false);
        let error: PlaybackError = DecisionError::from(ProviderError::no_capable(&params)).into();
        assert!(matches!(error, PlaybackError::NoCapableProvider(_)));
        assert!(error.is_user_error());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_limit_exceeded_carries_retry_hint() {
        let error: PlaybackError = SessionError::LimitExceeded {
            queued: 20,
            retry_after: Duration::from_secs(30),
        }
        .into();
        assert!(error.is_retryable());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(30)));
        assert!(error.user_message().contains("30 seconds"));
    }

    #[test]
    fn test_pipeline_diagnostics_stay_out_of_user_message() {
        let error = PlaybackError::Pipeline(PipelineError::StageFailed {
            stage: pipeline::Stage::Encode,
            cause: "exit status 1".to_string(),
            diagnostics: "/secret/path: Invalid data found".to_string(),
            transient: false,
        });
        assert_eq!(error.user_message(), "Transcoding failed");
        assert!(!error.is_retryable());
    }
}
