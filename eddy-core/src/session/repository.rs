//! Durable storage of session records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::TranscodeSession;

/// Errors raised by session persistence.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Session store I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for [`TranscodeSession`] records so that sessions left
/// behind by a crash can be reclaimed after restart.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save(&self, session: &TranscodeSession) -> Result<(), RepositoryError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError>;

    async fn load_all(&self) -> Result<Vec<TranscodeSession>, RepositoryError>;
}

/// Records kept in memory only.
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<Uuid, TranscodeSession>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(&self, session: &TranscodeSession) -> Result<(), RepositoryError> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.sessions.write().remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<TranscodeSession>, RepositoryError> {
        Ok(self.sessions.read().values().cloned().collect())
    }
}

/// One JSON file per session under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileSessionRepository {
    dir: PathBuf,
}

impl JsonFileSessionRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| RepositoryError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RepositoryError + '_ {
    move |source| RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl SessionRepository for JsonFileSessionRepository {
    async fn save(&self, session: &TranscodeSession) -> Result<(), RepositoryError> {
        let path = self.record_path(session.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_error(&path)(e)),
            _ => Ok(()),
        }
    }

    async fn load_all(&self) -> Result<Vec<TranscodeSession>, RepositoryError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(io_error(&path))?;
            match serde_json::from_slice::<TranscodeSession>(&bytes) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session record"),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{StreamingFormat, TranscodeParams};
    use crate::session::SessionStatus;

    fn session() -> TranscodeSession {
        let params = TranscodeParams::new("m", "mp4", StreamingFormat::Hls).with_audio("aac", false);
        TranscodeSession::new("/media/m.flac".into(), params, None)
    }

    #[tokio::test]
    async fn test_json_repository_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileSessionRepository::open(dir.path().join("sessions")).await.unwrap();

        let mut s = session();
        repo.save(&s).await.unwrap();
        s.transition(SessionStatus::Running).unwrap();
        repo.save(&s).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded, vec![s.clone()]);

        repo.delete(s.id).await.unwrap();
        repo.delete(s.id).await.unwrap();
        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_repository_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileSessionRepository::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{not json").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"ignored").await.unwrap();
        repo.save(&session()).await.unwrap();

        assert_eq!(repo.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_repository() {
        let repo = InMemorySessionRepository::new();
        let s = session();
        repo.save(&s).await.unwrap();
        assert_eq!(repo.load_all().await.unwrap().len(), 1);
        repo.delete(s.id).await.unwrap();
        assert!(repo.load_all().await.unwrap().is_empty());
    }
}
