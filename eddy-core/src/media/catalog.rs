//! Resolution of media file ids to files on disk.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

/// Errors raised while resolving a media file id.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Media file not found: {id}")]
    NotFound { id: String },

    #[error("Invalid media file id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Stable identity used in content hashes
    pub id: String,
    pub path: PathBuf,
}

/// Lookup of library records by id.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<MediaFile, CatalogError>;
}

/// Treats ids as paths relative to a library root.
#[derive(Debug, Clone)]
pub struct LibraryCatalog {
    root: PathBuf,
}

impl LibraryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl MediaCatalog for LibraryCatalog {
    async fn resolve(&self, id: &str) -> Result<MediaFile, CatalogError> {
        let relative = Path::new(id);
        if id.is_empty() {
            return Err(CatalogError::InvalidId {
                id: id.to_string(),
                reason: "empty",
            });
        }
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(CatalogError::InvalidId {
                id: id.to_string(),
                reason: "must be a relative path without '..'",
            });
        }

        let path = self.root.join(relative);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(MediaFile {
                id: id.to_string(),
                path,
            }),
            Ok(_) => Err(CatalogError::NotFound { id: id.to_string() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CatalogError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory id to path map.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    files: RwLock<HashMap<String, PathBuf>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.write().insert(id.into(), path.into());
    }
}

#[async_trait]
impl MediaCatalog for StaticCatalog {
    async fn resolve(&self, id: &str) -> Result<MediaFile, CatalogError> {
        self.files
            .read()
            .get(id)
            .map(|path| MediaFile {
                id: id.to_string(),
                path: path.clone(),
            })
            .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_library_catalog_resolves_relative_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("movies")).unwrap();
        std::fs::write(dir.path().join("movies/film.mkv"), b"x").unwrap();

        let catalog = LibraryCatalog::new(dir.path());
        let file = catalog.resolve("movies/film.mkv").await.unwrap();
        assert_eq!(file.path, dir.path().join("movies/film.mkv"));

        assert!(matches!(
            catalog.resolve("movies/missing.mkv").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.resolve("movies").await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_library_catalog_rejects_escapes() {
        let catalog = LibraryCatalog::new("/srv/media");
        for id in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(catalog.resolve(id).await, Err(CatalogError::InvalidId { .. })),
                "{id} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticCatalog::new();
        catalog.insert("42", "/tmp/clip.mp4");
        assert_eq!(catalog.resolve("42").await.unwrap().path, Path::new("/tmp/clip.mp4"));
        assert!(catalog.resolve("43").await.is_err());
    }
}
