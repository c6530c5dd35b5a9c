//! Transcode sessions: state machine, admission, persistence and cleanup.

pub mod cleanup;
pub mod events;
pub mod manager;
pub mod repository;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use cleanup::{CleanupReport, CleanupService};
pub use events::{EventBus, PlaybackEvent};
pub use manager::{SessionManager, SessionStats, SweepReport};
pub use repository::{
    InMemorySessionRepository, JsonFileSessionRepository, RepositoryError, SessionRepository,
};

use crate::params::{ContentHash, StreamingFormat, TranscodeParams};

/// Errors raised by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Unknown or already expired session id
    #[error("Session {id} not found")]
    SessionNotFound { id: Uuid },

    /// All worker slots busy and the queue is full
    #[error("Admission refused: {queued} sessions already queued")]
    LimitExceeded { queued: usize, retry_after: Duration },

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Lifecycle of a session.
///
/// `pending → running → {completed | failed | stopped}`; a pending session
/// may also be stopped, or failed when it cannot be started at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Stopped
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Stopped | Failed) | (Running, Completed | Failed | Stopped)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One playback request's transcode work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSession {
    pub id: Uuid,
    pub media_id: String,
    pub status: SessionStatus,
    pub provider_id: Option<String>,
    pub content_hash: ContentHash,
    pub format: StreamingFormat,
    /// Percent complete, 0 to 100
    pub progress: f64,
    /// Generic failure reason safe to show to clients
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last client interaction, drives orphan detection
    pub last_activity: DateTime<Utc>,
    pub params: TranscodeParams,
    pub input: PathBuf,
    pub source_duration_ms: Option<u64>,
}

impl TranscodeSession {
    pub fn new(input: PathBuf, params: TranscodeParams, source_duration: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            media_id: params.media_id.clone(),
            status: SessionStatus::Pending,
            provider_id: None,
            content_hash: params.content_hash(),
            format: params.format,
            progress: 0.0,
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            last_activity: now,
            params,
            input,
            source_duration_ms: source_duration.map(|d| d.as_millis() as u64),
        }
    }

    /// A session satisfied from the content store without running anything.
    pub fn already_completed(input: PathBuf, params: TranscodeParams) -> Self {
        let mut session = Self::new(input, params, None);
        session.status = SessionStatus::Completed;
        session.progress = 100.0;
        session.completed_at = Some(session.created_at);
        session
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn source_duration(&self) -> Option<Duration> {
        self.source_duration_ms.map(Duration::from_millis)
    }

    /// Moves to `next`, stamping the relevant timestamps.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidTransition` - `next` is not reachable from the current status
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), SessionError> {
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            SessionStatus::Running => self.started_at = Some(now),
            SessionStatus::Completed => {
                self.progress = 100.0;
                self.completed_at = Some(now);
            }
            SessionStatus::Failed | SessionStatus::Stopped => self.completed_at = Some(now),
            SessionStatus::Pending => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TranscodeSession {
        let params = TranscodeParams::new("m", "mp4", StreamingFormat::Dash).with_video("h264", false);
        TranscodeSession::new("/media/m.mkv".into(), params, Some(Duration::from_secs(90)))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        assert_eq!(s.status, SessionStatus::Pending);
        assert_eq!(s.source_duration(), Some(Duration::from_secs(90)));

        s.transition(SessionStatus::Running).unwrap();
        assert!(s.started_at.is_some());

        s.transition(SessionStatus::Completed).unwrap();
        assert_eq!(s.progress, 100.0);
        assert!(s.completed_at.is_some());
        assert!(s.is_terminal());
    }

    #[test]
    fn test_pending_can_be_stopped() {
        let mut s = session();
        s.transition(SessionStatus::Stopped).unwrap();
        assert!(s.started_at.is_none());
        assert!(s.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = session();
        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::Stopped).unwrap();

        for next in [
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Pending,
        ] {
            assert!(matches!(
                s.transition(next),
                Err(SessionError::InvalidTransition { .. })
            ));
        }
        assert_eq!(s.status, SessionStatus::Stopped);
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        assert!(!SessionStatus::Pending.can_transition_to(SessionStatus::Completed));
        let cached = TranscodeSession::already_completed("/m".into(), session().params);
        assert_eq!(cached.status, SessionStatus::Completed);
        assert_eq!(cached.progress, 100.0);
    }

    #[test]
    fn test_session_serializes_lowercase_status() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["format"], "dash");
        assert_eq!(json["content_hash"].as_str().map(str::len), Some(40));
    }
}
