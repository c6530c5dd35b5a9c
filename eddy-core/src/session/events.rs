//! Typed notifications for external subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::params::ContentHash;

/// Emitted as sessions move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybackEvent {
    SessionQueued {
        session_id: Uuid,
        position: usize,
    },
    SessionStarted {
        session_id: Uuid,
        provider_id: String,
    },
    SegmentReady {
        session_id: Uuid,
        content_hash: ContentHash,
        /// Path relative to the content entry
        file: String,
    },
    SessionCompleted {
        session_id: Uuid,
        content_hash: ContentHash,
    },
    SessionFailed {
        session_id: Uuid,
        error: String,
    },
    SessionStopped {
        session_id: Uuid,
    },
}

impl PlaybackEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            PlaybackEvent::SessionQueued { session_id, .. }
            | PlaybackEvent::SessionStarted { session_id, .. }
            | PlaybackEvent::SegmentReady { session_id, .. }
            | PlaybackEvent::SessionCompleted { session_id, .. }
            | PlaybackEvent::SessionFailed { session_id, .. }
            | PlaybackEvent::SessionStopped { session_id } => *session_id,
        }
    }
}

/// Broadcast channel of [`PlaybackEvent`]s.
///
/// Slow subscribers lose the oldest events rather than stalling sessions.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlaybackEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PlaybackEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
