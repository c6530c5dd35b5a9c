//! Sharded on-disk store with write-once commits.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{COMPLETE_MARKER, EntryMetadata, METADATA_FILE, StorageError};
use crate::params::{ContentHash, TranscodeParams};

const STAGING_SUFFIX: &str = ".staging";

/// Result of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Our output became the entry
    Committed,
    /// Another writer got there first; our output was discarded
    AlreadyExists,
}

/// What [`ContentStore::remove_incomplete`] cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub incomplete_removed: usize,
    pub staging_removed: usize,
}

/// Aggregate view over committed entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub by_format: BTreeMap<String, usize>,
}

/// Content-addressable store rooted at one directory.
///
/// Commits of the same hash are serialized by a per-hash lock; unrelated
/// hashes never contend.
pub struct ContentStore {
    root: PathBuf,
    locks: Mutex<HashMap<ContentHash, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContentStore {
    /// Opens the store, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the root cannot be created
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(StorageError::io("create root", &root))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic storage key for a set of parameters.
    pub fn hash(&self, params: &TranscodeParams) -> ContentHash {
        params.content_hash()
    }

    /// Directory an entry lives in, whether or not it exists yet.
    pub fn path(&self, hash: &ContentHash) -> PathBuf {
        let (first, second) = hash.shards();
        self.root.join(first).join(second).join(hash.as_str())
    }

    /// True only for entries whose commit finished.
    pub async fn exists(&self, hash: &ContentHash) -> bool {
        tokio::fs::try_exists(self.path(hash).join(COMPLETE_MARKER))
            .await
            .unwrap_or(false)
    }

    /// Moves a finished job directory into place.
    ///
    /// A second committer for the same hash finds the existing entry, deletes
    /// its own `source_dir` and reports [`CommitOutcome::AlreadyExists`]. An
    /// unfinished directory left by a crash is replaced.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Any file system failure; the entry is left absent
    pub async fn commit(
        &self,
        hash: &ContentHash,
        source_dir: &Path,
        params: &TranscodeParams,
    ) -> Result<CommitOutcome, StorageError> {
        let lock = self.hash_lock(hash);
        let outcome = {
            let _guard = lock.lock().await;
            self.commit_locked(hash, source_dir, params).await
        };
        self.release_lock(hash, lock);
        outcome
    }

    async fn commit_locked(
        &self,
        hash: &ContentHash,
        source_dir: &Path,
        params: &TranscodeParams,
    ) -> Result<CommitOutcome, StorageError> {
        if self.exists(hash).await {
            debug!(%hash, source = %source_dir.display(), "Entry already committed, discarding output");
            remove_dir_if_present(source_dir).await?;
            return Ok(CommitOutcome::AlreadyExists);
        }

        let target = self.path(hash);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            warn!(%hash, "Replacing unfinished entry");
            remove_dir_if_present(&target).await?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::io("create shard", parent))?;
        }

        let size = dir_size(source_dir).await?;
        let metadata = EntryMetadata::new(hash.clone(), params, size);
        write_metadata(source_dir, &metadata).await?;

        match tokio::fs::rename(source_dir, &target).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                self.copy_into_place(source_dir, &target).await?;
            }
            Err(e) => {
                return Err(StorageError::Io {
                    operation: "move into store",
                    path: target,
                    source: e,
                });
            }
        }

        let marker = target.join(COMPLETE_MARKER);
        write_synced(&marker, Utc::now().to_rfc3339().as_bytes())
            .await
            .map_err(StorageError::io("write marker", &marker))?;

        info!(%hash, size_bytes = size, path = %target.display(), "Committed content");
        Ok(CommitOutcome::Committed)
    }

    /// Cross-device fallback: copy to a staging sibling, then rename.
    async fn copy_into_place(&self, source: &Path, target: &Path) -> Result<(), StorageError> {
        let staging = staging_path(target);
        remove_dir_if_present(&staging).await?;
        copy_dir(source, &staging).await?;
        tokio::fs::rename(&staging, target)
            .await
            .map_err(StorageError::io("move staging", target))?;
        remove_dir_if_present(source).await
    }

    /// Path of a committed file, rejecting anything that is not a plain
    /// relative path or that names store-internal files.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidPath` - Traversal or internal file name
    /// - `StorageError::NotFound` - Entry or file does not exist
    pub async fn resolve_file(
        &self,
        hash: &ContentHash,
        relative: &str,
    ) -> Result<PathBuf, StorageError> {
        let rel = Path::new(relative);
        let valid = !relative.is_empty()
            && rel.components().all(|c| match c {
                Component::Normal(part) => !part.to_string_lossy().starts_with('.'),
                _ => false,
            });
        if !valid {
            return Err(StorageError::InvalidPath {
                path: relative.to_string(),
            });
        }

        if !self.exists(hash).await {
            return Err(StorageError::NotFound { hash: hash.clone() });
        }

        let path = self.path(hash).join(rel);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(StorageError::NotFound { hash: hash.clone() }),
        }
    }

    /// Reads the sidecar of a committed entry.
    pub async fn metadata(&self, hash: &ContentHash) -> Result<EntryMetadata, StorageError> {
        if !self.exists(hash).await {
            return Err(StorageError::NotFound { hash: hash.clone() });
        }
        read_metadata(&self.path(hash), hash).await
    }

    /// Records a client access for retention accounting.
    pub async fn touch(&self, hash: &ContentHash) -> Result<(), StorageError> {
        let lock = self.hash_lock(hash);
        let result = {
            let _guard = lock.lock().await;
            match self.metadata(hash).await {
                Ok(mut metadata) => {
                    metadata.record_access();
                    write_metadata(&self.path(hash), &metadata).await
                }
                Err(e) => Err(e),
            }
        };
        self.release_lock(hash, lock);
        result
    }

    /// Removes a committed entry. Returns false if it did not exist.
    pub async fn delete(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        let lock = self.hash_lock(hash);
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(hash).await
        };
        self.release_lock(hash, lock);
        result
    }

    async fn delete_locked(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        let dir = self.path(hash);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(false);
        }
        // Marker goes first so readers stop seeing the entry before files vanish
        let marker = dir.join(COMPLETE_MARKER);
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::Io {
                    operation: "remove marker",
                    path: marker,
                    source: e,
                });
            }
        }
        remove_dir_if_present(&dir).await?;
        info!(%hash, "Deleted content");
        Ok(true)
    }

    /// Deletes unfinished entries and staging leftovers.
    ///
    /// Each removal holds the hash lock, so an entry whose commit is in
    /// progress is skipped and no commit can start while it is being removed.
    pub async fn remove_incomplete(&self) -> Result<RecoveryReport, StorageError> {
        let mut report = RecoveryReport::default();

        for dir in self.entry_dirs().await? {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (stem, staging) = match name.strip_suffix(STAGING_SUFFIX) {
                Some(stem) => (stem, true),
                None => (name, false),
            };

            let Ok(hash) = ContentHash::parse(stem) else {
                if staging {
                    remove_dir_if_present(&dir).await?;
                    report.staging_removed += 1;
                }
                continue;
            };

            let lock = self.hash_lock(&hash);
            let removed = match lock.try_lock() {
                Ok(_guard) => self.remove_unfinished_locked(&hash, &dir, staging).await,
                Err(_) => Ok(false),
            };
            self.release_lock(&hash, lock);

            match (removed?, staging) {
                (true, true) => report.staging_removed += 1,
                (true, false) => report.incomplete_removed += 1,
                (false, _) => {}
            }
        }

        Ok(report)
    }

    async fn remove_unfinished_locked(
        &self,
        hash: &ContentHash,
        dir: &Path,
        staging: bool,
    ) -> Result<bool, StorageError> {
        if !staging {
            if self.exists(hash).await {
                return Ok(false);
            }
            warn!(%hash, "Removing unfinished content entry");
        }
        remove_dir_if_present(dir).await?;
        Ok(true)
    }

    /// Committed entries not accessed within `retention`.
    pub async fn expired(&self, retention: Duration) -> Result<Vec<ContentHash>, StorageError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(Vec::new());
        };
        let mut expired = Vec::new();

        for hash in self.list().await? {
            match read_metadata(&self.path(&hash), &hash).await {
                Ok(meta) if meta.last_accessed < cutoff => expired.push(hash),
                Ok(_) => {}
                Err(e) => warn!(%hash, error = %e, "Skipping entry with unreadable metadata"),
            }
        }
        Ok(expired)
    }

    /// Hashes of all committed entries.
    pub async fn list(&self) -> Result<Vec<ContentHash>, StorageError> {
        let mut hashes = Vec::new();
        for dir in self.entry_dirs().await? {
            let Some(hash) = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| ContentHash::parse(n).ok())
            else {
                continue;
            };
            if self.exists(&hash).await {
                hashes.push(hash);
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        let mut stats = StoreStats::default();
        for hash in self.list().await? {
            stats.entries += 1;
            if let Ok(meta) = read_metadata(&self.path(&hash), &hash).await {
                stats.total_bytes += meta.size_bytes;
                *stats
                    .by_format
                    .entry(meta.format.as_str().to_string())
                    .or_default() += 1;
            }
        }
        Ok(stats)
    }

    /// Every directory at entry depth (`root/xx/yy/*`).
    async fn entry_dirs(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut dirs = Vec::new();
        for first in child_dirs(&self.root).await? {
            for second in child_dirs(&first).await? {
                dirs.extend(child_dirs(&second).await?);
            }
        }
        Ok(dirs)
    }

    fn hash_lock(&self, hash: &ContentHash) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops the map entry once no other task holds or waits on it.
    fn release_lock(&self, hash: &ContentHash, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(hash);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

async fn child_dirs(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StorageError::Io {
                operation: "scan",
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(StorageError::io("scan", dir))?
    {
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn remove_dir_if_present(dir: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io {
            operation: "remove",
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

async fn dir_size(dir: &Path) -> Result<u64, StorageError> {
    let mut total = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(StorageError::io("measure", &current))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io("measure", &current))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(StorageError::io("measure", entry.path()))?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

async fn copy_dir(source: &Path, target: &Path) -> Result<(), StorageError> {
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to)
            .await
            .map_err(StorageError::io("copy", &to))?;
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .map_err(StorageError::io("copy", &from))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io("copy", &from))?
        {
            let dest = to.join(entry.file_name());
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if is_dir {
                pending.push((entry.path(), dest));
            } else {
                tokio::fs::copy(entry.path(), &dest)
                    .await
                    .map_err(StorageError::io("copy", &dest))?;
            }
        }
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn write_metadata(dir: &Path, metadata: &EntryMetadata) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(metadata).map_err(|e| StorageError::Metadata {
        hash: metadata.hash.clone(),
        reason: e.to_string(),
    })?;
    let path = dir.join(METADATA_FILE);
    let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
    write_synced(&tmp, &bytes)
        .await
        .map_err(StorageError::io("write metadata", &tmp))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(StorageError::io("write metadata", &path))
}

async fn read_metadata(dir: &Path, hash: &ContentHash) -> Result<EntryMetadata, StorageError> {
    let path = dir.join(METADATA_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(StorageError::io("read metadata", &path))?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Metadata {
        hash: hash.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::StreamingFormat;

    fn params(media: &str) -> TranscodeParams {
        TranscodeParams::new(media, "mp4", StreamingFormat::Dash)
            .with_video("h264", false)
            .with_audio("aac", true)
    }

    async fn job_output(dir: &Path, name: &str, marker: &[u8]) -> PathBuf {
        let out = dir.join(name);
        tokio::fs::create_dir_all(out.join("video")).await.unwrap();
        tokio::fs::write(out.join("manifest.mpd"), marker).await.unwrap();
        tokio::fs::write(out.join("video/seg-1.m4s"), b"segment").await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_sharded_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let hash = store.hash(&params("a"));
        let path = store.path(&hash);

        let h = hash.as_str();
        assert_eq!(
            path,
            dir.path().join("content").join(&h[0..2]).join(&h[2..4]).join(h)
        );
    }

    #[tokio::test]
    async fn test_commit_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let p = params("a");
        let hash = store.hash(&p);
        let out = job_output(dir.path(), "job-1", b"first").await;

        assert!(!store.exists(&hash).await);
        let outcome = store.commit(&hash, &out, &p).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(store.exists(&hash).await);
        assert!(!out.exists());
        assert!(store.path(&hash).join("video/seg-1.m4s").exists());

        let meta = store.metadata(&hash).await.unwrap();
        assert_eq!(meta.media_id, "a");
        assert_eq!(meta.size_bytes, 5 + 7);
        assert_eq!(store.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_second_commit_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let p = params("a");
        let hash = store.hash(&p);

        let first = job_output(dir.path(), "job-1", b"first").await;
        let second = job_output(dir.path(), "job-2", b"second").await;

        store.commit(&hash, &first, &p).await.unwrap();
        let outcome = store.commit(&hash, &second, &p).await.unwrap();

        assert_eq!(outcome, CommitOutcome::AlreadyExists);
        assert!(!second.exists());
        let manifest = tokio::fs::read(store.path(&hash).join("manifest.mpd")).await.unwrap();
        assert_eq!(manifest, b"first");
    }

    #[tokio::test]
    async fn test_unfinished_entry_is_invisible_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let p = params("a");
        let hash = store.hash(&p);

        // Crash between rename and marker write
        let partial = store.path(&hash);
        tokio::fs::create_dir_all(&partial).await.unwrap();
        tokio::fs::write(partial.join("manifest.mpd"), b"partial").await.unwrap();
        assert!(!store.exists(&hash).await);
        assert!(matches!(
            store.resolve_file(&hash, "manifest.mpd").await,
            Err(StorageError::NotFound { .. })
        ));

        let out = job_output(dir.path(), "job-1", b"fresh").await;
        assert_eq!(store.commit(&hash, &out, &p).await.unwrap(), CommitOutcome::Committed);
        let manifest = tokio::fs::read(partial.join("manifest.mpd")).await.unwrap();
        assert_eq!(manifest, b"fresh");
    }

    #[tokio::test]
    async fn test_remove_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();

        let done = params("done");
        let done_hash = store.hash(&done);
        let out = job_output(dir.path(), "job-1", b"ok").await;
        store.commit(&done_hash, &out, &done).await.unwrap();

        let broken_hash = store.hash(&params("broken"));
        tokio::fs::create_dir_all(store.path(&broken_hash)).await.unwrap();
        tokio::fs::create_dir_all(staging_path(&store.path(&broken_hash)))
            .await
            .unwrap();

        let report = store.remove_incomplete().await.unwrap();
        assert_eq!(report.incomplete_removed, 1);
        assert_eq!(report.staging_removed, 1);
        assert!(store.exists(&done_hash).await);
        assert!(!store.path(&broken_hash).exists());
        assert_eq!(store.list().await.unwrap(), vec![done_hash]);
        assert_eq!(store.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_incomplete_skips_entry_being_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let hash = store.hash(&params("busy"));
        let target = store.path(&hash);
        tokio::fs::create_dir_all(&target).await.unwrap();
        tokio::fs::create_dir_all(staging_path(&target)).await.unwrap();

        let lock = store.hash_lock(&hash);
        let guard = lock.lock().await;
        let report = store.remove_incomplete().await.unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert!(target.exists());
        assert!(staging_path(&target).exists());

        drop(guard);
        store.release_lock(&hash, lock);
        let report = store.remove_incomplete().await.unwrap();
        assert_eq!(report.incomplete_removed, 1);
        assert_eq!(report.staging_removed, 1);
        assert_eq!(store.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_file_rejects_traversal_and_internal_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let p = params("a");
        let hash = store.hash(&p);
        let out = job_output(dir.path(), "job-1", b"m").await;
        store.commit(&hash, &out, &p).await.unwrap();

        assert!(store.resolve_file(&hash, "manifest.mpd").await.is_ok());
        assert!(store.resolve_file(&hash, "video/seg-1.m4s").await.is_ok());
        for bad in ["../x", "/etc/passwd", ".complete", METADATA_FILE, "video/../../x", ""] {
            assert!(
                matches!(store.resolve_file(&hash, bad).await, Err(StorageError::InvalidPath { .. })),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(
            store.resolve_file(&hash, "missing.m4s").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_touch_expired_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("content")).await.unwrap();
        let p = params("a");
        let hash = store.hash(&p);
        let out = job_output(dir.path(), "job-1", b"m").await;
        store.commit(&hash, &out, &p).await.unwrap();

        store.touch(&hash).await.unwrap();
        assert_eq!(store.metadata(&hash).await.unwrap().access_count, 1);

        assert!(store.expired(Duration::from_secs(3600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.expired(Duration::from_millis(1)).await.unwrap(), vec![hash.clone()]);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.by_format.get("dash"), Some(&1));

        assert!(store.delete(&hash).await.unwrap());
        assert!(!store.exists(&hash).await);
        assert!(!store.delete(&hash).await.unwrap());
    }
}
