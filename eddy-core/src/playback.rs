//! Playback control flow: resolve, probe, decide, then serve from the store
//! or admit a session.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::PlaybackError;
use crate::config::EddyConfig;
use crate::content::{ContentStore, ContentUrls, RecoveryReport};
use crate::decision::{DecideOptions, DecisionEngine, DecisionKind, PlaybackDecision};
use crate::media::{
    CachedProbe, DeviceProfile, FfprobeProbe, LibraryCatalog, MediaCatalog, MediaProbe,
    normalize_container,
};
use crate::params::{ContentHash, StreamingFormat};
use crate::pipeline::PipelineManager;
use crate::provider::ProviderRegistry;
use crate::session::{
    CleanupService, EventBus, InMemorySessionRepository, JsonFileSessionRepository,
    SessionManager, SessionRepository, SessionStats, SessionStatus, TranscodeSession,
};

const PROBE_CACHE_SIZE: usize = 512;

/// Body of a decide request.
#[derive(Debug, Clone, Deserialize)]
pub struct DecideRequest {
    /// Media file id, resolved through the catalog
    #[serde(alias = "media_file_id")]
    pub media_path: String,
    #[serde(default)]
    pub device_profile: DeviceProfile,
    #[serde(default)]
    pub format: Option<StreamingFormat>,
}

/// Body of a start request.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    #[serde(alias = "media_id")]
    pub media_file_id: String,
    /// Streaming format (`dash`, `hls`) or a preferred file container
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub device_profile: DeviceProfile,
    /// Seconds into the source
    #[serde(default)]
    pub seek_position: Option<f64>,
}

/// Client view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub media_id: String,
    pub status: SessionStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub content_hash: ContentHash,
    /// Present once the output is committed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    pub manifest_url: String,
    pub format: StreamingFormat,
    pub seek_offset_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn new(session: &TranscodeSession, urls: &ContentUrls) -> Self {
        let manifest_url = urls.manifest_url(&session.content_hash, session.format);
        Self {
            id: session.id,
            media_id: session.media_id.clone(),
            status: session.status,
            progress: session.progress,
            provider_id: session.provider_id.clone(),
            content_hash: session.content_hash.clone(),
            content_url: (session.status == SessionStatus::Completed)
                .then(|| manifest_url.clone()),
            manifest_url,
            format: session.format,
            seek_offset_ms: session.params.seek_offset_ms,
            error: session.error.clone(),
            created_at: session.created_at,
            started_at: session.started_at,
            updated_at: session.updated_at,
            completed_at: session.completed_at,
        }
    }
}

/// Result of a start or seek-ahead request.
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    #[serde(flatten)]
    pub session: SessionView,
    pub decision: DecisionKind,
    pub reason: String,
}

/// Entry point for every playback operation.
pub struct PlaybackService {
    catalog: Arc<dyn MediaCatalog>,
    probe: Arc<dyn MediaProbe>,
    decisions: Arc<DecisionEngine>,
    store: Arc<ContentStore>,
    sessions: SessionManager,
    urls: ContentUrls,
}

impl PlaybackService {
    pub fn new(
        catalog: Arc<dyn MediaCatalog>,
        probe: Arc<dyn MediaProbe>,
        decisions: Arc<DecisionEngine>,
        store: Arc<ContentStore>,
        sessions: SessionManager,
        urls: ContentUrls,
    ) -> Self {
        Self {
            catalog,
            probe,
            decisions,
            store,
            sessions,
            urls,
        }
    }

    /// Wires the production stack from validated configuration.
    ///
    /// Opens the content store and drops unfinished entries, registers the
    /// software encoder and any configured hardware encoders, and reloads
    /// persisted sessions.
    ///
    /// # Errors
    ///
    /// - `PlaybackError::Storage` - Content root unusable
    /// - `PlaybackError::Repository` - Session state directory unusable
    pub async fn from_config(config: &EddyConfig) -> Result<Self, PlaybackError> {
        let store = Arc::new(ContentStore::open(&config.content.root).await?);
        let recovered = store.remove_incomplete().await?;
        if recovered != RecoveryReport::default() {
            warn!(?recovered, "Removed unfinished content entries");
        }

        let registry = Arc::new(ProviderRegistry::from_config(&config.pipeline)?);

        let packager = PipelineManager::packager_from_config(&config.pipeline);
        let pipeline = Arc::new(PipelineManager::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            packager,
            config.pipeline.clone(),
        ));

        let repository: Arc<dyn SessionRepository> = match &config.sessions.state_dir {
            Some(dir) => Arc::new(JsonFileSessionRepository::open(dir).await?),
            None => Arc::new(InMemorySessionRepository::new()),
        };
        let sessions = SessionManager::new(
            config.sessions.clone(),
            pipeline,
            Arc::clone(&repository),
            EventBus::default(),
        );
        if let Err(e) = sessions.recover(repository.as_ref()).await {
            warn!(error = %e, "Failed to reload session records");
        }

        let urls = ContentUrls::new(&config.server.content_base_url);
        let decisions = Arc::new(DecisionEngine::new(
            registry,
            Arc::clone(&store),
            urls.clone(),
            config.decision.default_format,
        ));

        let capacity = NonZeroUsize::new(PROBE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        let probe = Arc::new(CachedProbe::new(
            FfprobeProbe::new(&config.pipeline.ffprobe_path),
            capacity,
        ));
        let catalog = Arc::new(LibraryCatalog::new(&config.server.library_root));

        info!(
            content_root = %config.content.root.display(),
            library_root = %config.server.library_root.display(),
            max_concurrent = config.sessions.max_concurrent,
            "Playback service ready"
        );
        Ok(Self::new(catalog, probe, decisions, store, sessions, urls))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn urls(&self) -> &ContentUrls {
        &self.urls
    }

    /// Cleanup over this service's sessions and store.
    pub fn cleanup_service(&self, retention: Option<std::time::Duration>) -> CleanupService {
        CleanupService::new(self.sessions.clone(), Arc::clone(&self.store), retention)
    }

    /// Decides without creating a session.
    ///
    /// # Errors
    ///
    /// - `PlaybackError::Catalog` / `Probe` - Source unusable
    /// - `PlaybackError::Decision` / `NoCapableProvider` - See [`DecisionEngine::decide`]
    pub async fn decide(&self, request: &DecideRequest) -> Result<PlaybackDecision, PlaybackError> {
        let media = self.catalog.resolve(&request.media_path).await?;
        let profile = self.probe.probe(&media.path).await?;
        let options = DecideOptions {
            format: request.format,
            seek_offset_ms: 0,
        };
        Ok(self
            .decisions
            .decide(&media.id, &profile, &request.device_profile, options)
            .await?)
    }

    /// Starts playback. Returns a completed session immediately when the
    /// output is already stored, otherwise an admitted session whose work
    /// runs in the background.
    ///
    /// # Errors
    ///
    /// - `PlaybackError::LimitExceeded` - Admission refused; retry later
    /// - `PlaybackError::InvalidRequest` - Bad seek position
    /// - Any error of [`decide`](Self::decide)
    pub async fn start(&self, request: StartRequest) -> Result<StartResponse, PlaybackError> {
        let seek_offset_ms = seek_ms(request.seek_position)?;
        let mut device = request.device_profile;
        let mut format = None;
        if let Some(container) = request.container.as_deref().filter(|c| !c.trim().is_empty()) {
            match container.parse::<StreamingFormat>() {
                Ok(requested) => format = Some(requested),
                Err(_) => device.preferred_container = Some(normalize_container(container)),
            }
        }

        let media = self.catalog.resolve(&request.media_file_id).await?;
        let profile = self.probe.probe(&media.path).await?;
        check_seek(seek_offset_ms, profile.duration_ms)?;

        let options = DecideOptions {
            format,
            seek_offset_ms,
        };
        let (decision, params) = self
            .decisions
            .decide_stream(&media.id, &profile, &device, options)
            .await?;

        let session = if decision.is_cached() {
            self.sessions.record_completed(media.path, params)
        } else {
            self.sessions.submit(media.path, params, profile.duration())?
        };
        info!(
            session_id = %session.id,
            media_id = %media.id,
            decision = %decision.kind,
            status = %session.status,
            "Playback started"
        );

        Ok(StartResponse {
            session: SessionView::new(&session, &self.urls),
            decision: decision.kind,
            reason: decision.reason,
        })
    }

    /// Starts a new session for the same source and target at another offset.
    ///
    /// The original session is left untouched; the new one has its own
    /// content hash.
    ///
    /// # Errors
    ///
    /// - `PlaybackError::SessionNotFound` - Unknown session
    /// - `PlaybackError::InvalidRequest` - Bad seek position
    /// - `PlaybackError::LimitExceeded` - Admission refused
    pub async fn seek_ahead(
        &self,
        session_id: Uuid,
        seek_position: f64,
    ) -> Result<StartResponse, PlaybackError> {
        let seek_offset_ms = seek_ms(Some(seek_position))?;
        let original = self.sessions.status(session_id)?;
        check_seek(seek_offset_ms, original.source_duration_ms)?;

        let params = original.params.clone().with_seek_offset(seek_offset_ms);
        let input = original.input.clone();
        let kind = if params.is_remux() {
            DecisionKind::Remux
        } else {
            DecisionKind::Transcode
        };

        let session = if self.store.exists(&params.content_hash()).await {
            self.sessions.record_completed(input, params)
        } else {
            self.sessions
                .submit(input, params, original.source_duration())?
        };
        info!(
            session_id = %session.id,
            from_session = %session_id,
            seek_offset_ms,
            "Seek-ahead session created"
        );

        Ok(StartResponse {
            session: SessionView::new(&session, &self.urls),
            decision: kind,
            reason: format!("seek ahead from session {session_id}"),
        })
    }

    /// Status poll; counts as client activity.
    pub fn session(&self, id: Uuid) -> Result<SessionView, PlaybackError> {
        let session = self.sessions.status(id)?;
        Ok(SessionView::new(&session, &self.urls))
    }

    /// Requests a stop; returns the number of sessions stopped (0 or 1).
    pub fn stop(&self, id: Uuid) -> Result<usize, PlaybackError> {
        Ok(usize::from(self.sessions.stop(id)?))
    }

    pub fn stop_all(&self) -> usize {
        self.sessions.stop_all()
    }

    pub fn stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

/// Converts a client seek position in seconds to whole milliseconds.
fn seek_ms(seconds: Option<f64>) -> Result<u64, PlaybackError> {
    match seconds {
        None => Ok(0),
        Some(s) if s.is_finite() && s >= 0.0 => Ok((s * 1000.0).round() as u64),
        Some(s) => Err(PlaybackError::InvalidRequest {
            reason: format!("invalid seek position {s}"),
        }),
    }
}

/// Rejects offsets at or past the end of a source of known length.
fn check_seek(offset_ms: u64, duration_ms: Option<u64>) -> Result<(), PlaybackError> {
    match duration_ms {
        Some(duration) if duration > 0 && offset_ms >= duration => {
            Err(PlaybackError::InvalidRequest {
                reason: format!("seek position {offset_ms} ms is past the end"),
            })
        }
        _ => Ok(()),
    }
}
