//! Sidecar describing a committed entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::{ContentHash, StreamingFormat, TranscodeParams};

/// Persisted next to every committed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub hash: ContentHash,
    pub media_id: String,
    pub format: StreamingFormat,
    /// Total size of the packaged files
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

impl EntryMetadata {
    pub fn new(hash: ContentHash, params: &TranscodeParams, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            hash,
            media_id: params.media_id.clone(),
            format: params.format,
            size_bytes,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    pub fn record_access(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }
}
