//! In-process stand-ins for probing and transcoding, for tests of code
//! built on [`PlaybackService`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EddyConfig;
use crate::content::{ContentStore, ContentUrls};
use crate::decision::DecisionEngine;
use crate::media::{MediaProbe, MediaProfile, ProbeError, StaticCatalog};
use crate::params::{ContentHash, TranscodeParams};
use crate::pipeline::{JobObserver, JobRunner, PipelineError, PipelineJob, PipelineOutput};
use crate::playback::PlaybackService;
use crate::provider::{FfmpegProvider, ProviderRegistry};
use crate::session::{EventBus, InMemorySessionRepository, SessionManager};

/// Probe that reports the same profile for every path.
pub struct FixedProbe(pub MediaProfile);

#[async_trait]
impl MediaProbe for FixedProbe {
    async fn probe(&self, _path: &Path) -> Result<MediaProfile, ProbeError> {
        Ok(self.0.clone())
    }
}

/// Runner whose jobs never finish on their own; they end when cancelled.
pub struct IdleRunner {
    work_root: PathBuf,
}

impl IdleRunner {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }
}

#[async_trait]
impl JobRunner for IdleRunner {
    async fn run(
        &self,
        _job: PipelineJob,
        observer: Arc<dyn JobObserver>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        observer.provider_selected("idle");
        cancel.cancelled().await;
        Err(PipelineError::Cancelled)
    }

    fn work_dir(&self, job_id: Uuid) -> PathBuf {
        self.work_root.join(job_id.to_string())
    }
}

/// A playback service over a temporary directory with a software provider,
/// a static catalog and an idle runner.
pub struct TestPlayback {
    pub dir: tempfile::TempDir,
    pub config: EddyConfig,
    pub catalog: Arc<StaticCatalog>,
    pub store: Arc<ContentStore>,
    pub service: Arc<PlaybackService>,
}

impl TestPlayback {
    /// Every catalog entry probes as `profile`.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory or store cannot be created.
    pub async fn new(profile: MediaProfile) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = EddyConfig::for_testing(dir.path());

        let store = Arc::new(
            ContentStore::open(&config.content.root)
                .await
                .expect("open content store"),
        );
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register(Arc::new(FfmpegProvider::software("ffmpeg")))
            .expect("register software provider");

        let urls = ContentUrls::new(&config.server.content_base_url);
        let decisions = Arc::new(DecisionEngine::new(
            registry,
            Arc::clone(&store),
            urls.clone(),
            config.decision.default_format,
        ));
        let sessions = SessionManager::new(
            config.sessions.clone(),
            Arc::new(IdleRunner::new(&config.pipeline.temp_root)),
            Arc::new(InMemorySessionRepository::new()),
            EventBus::default(),
        );
        let catalog = Arc::new(StaticCatalog::new());
        let service = Arc::new(PlaybackService::new(
            catalog.clone(),
            Arc::new(FixedProbe(profile)),
            decisions,
            Arc::clone(&store),
            sessions,
            urls,
        ));

        Self {
            dir,
            config,
            catalog,
            store,
            service,
        }
    }

    /// Registers a catalog id backed by an empty file.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn add_media(&self, id: &str) -> PathBuf {
        let path = self.dir.path().join("media").join(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create media dir");
        }
        std::fs::write(&path, b"").expect("write media file");
        self.catalog.insert(id, &path);
        path
    }

    /// Commits `files` as the output for `params`.
    ///
    /// # Panics
    ///
    /// Panics if staging or committing fails.
    pub async fn commit(&self, params: &TranscodeParams, files: &[(&str, &[u8])]) -> ContentHash {
        let hash = params.content_hash();
        let staged = self.dir.path().join("staged").join(hash.as_str());
        for (name, data) in files {
            let path = staged.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.expect("create staged dir");
            }
            tokio::fs::write(&path, data).await.expect("write staged file");
        }
        self.store
            .commit(&hash, &staged, params)
            .await
            .expect("commit staged output");
        hash
    }
}
