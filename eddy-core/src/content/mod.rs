//! Content-addressable store for packaged playback output.
//!
//! Each entry lives at `{root}/{hash[0:2]}/{hash[2:4]}/{hash}/` and holds a
//! manifest, its media files and a metadata sidecar. An entry only exists
//! once its `.complete` marker has been written; anything else under the
//! root is leftover state that cleanup may remove.

pub mod metadata;
pub mod store;

use std::path::PathBuf;

pub use metadata::EntryMetadata;
pub use store::{CommitOutcome, ContentStore, RecoveryReport, StoreStats};

use crate::params::{ContentHash, StreamingFormat};

/// Marker whose presence makes an entry visible.
pub const COMPLETE_MARKER: &str = ".complete";

/// Per-entry metadata sidecar.
pub const METADATA_FILE: &str = ".metadata.json";

/// Errors raised by the content store.
///
/// I/O failures are fatal to the session that hit them and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No completed entry exists for the hash
    #[error("Content {hash} not found")]
    NotFound { hash: ContentHash },

    /// Requested file name escapes the entry or names internal state
    #[error("Invalid content path '{path}'")]
    InvalidPath { path: String },

    /// Underlying file system operation failed
    #[error("Storage I/O failed during {operation} on {}: {source}", .path.display())]
    Io {
        /// What the store was doing
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata sidecar could not be read or written
    #[error("Metadata for {hash} is unreadable: {reason}")]
    Metadata { hash: ContentHash, reason: String },
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StorageError::Io {
            operation,
            path,
            source,
        }
    }
}

/// Builds client-facing URLs for committed entries.
#[derive(Debug, Clone)]
pub struct ContentUrls {
    base: String,
}

impl ContentUrls {
    /// `base` is the public prefix the content route is mounted at, e.g. `/api/v1/content`.
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { base }
    }

    pub fn manifest_url(&self, hash: &ContentHash, format: StreamingFormat) -> String {
        self.file_url(hash, format.manifest_name())
    }

    pub fn file_url(&self, hash: &ContentHash, file: &str) -> String {
        format!("{}/{}/{}", self.base, hash, file)
    }
}
