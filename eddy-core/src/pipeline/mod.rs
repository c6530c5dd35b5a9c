//! Two-stage encode → package pipeline.
//!
//! A job runs in a scratch directory under the configured temp root. The
//! encode stage writes an intermediate in the target container, the package stage turns
//! it into a manifest plus media files, manifests are forced into VOD form
//! and the result is committed to the [`ContentStore`]. Any failure removes
//! the scratch directory.

pub mod manifest;
pub mod packager;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use manifest::finalize_manifests;
pub use packager::{FfmpegPackager, PackageJob, Packager, ShakaPackager};

use crate::config::{PackagerKind, PipelineConfig};
use crate::content::{CommitOutcome, ContentStore, StorageError};
use crate::params::{ContentHash, TranscodeParams};
use crate::process::{ExitReport, ManagedProcess, ProcessError};
use crate::provider::{EncodeJob, ProviderError, ProviderRegistry};

/// Share of overall progress taken by the encode stage.
const ENCODE_WEIGHT: f64 = 0.9;

const INTERMEDIATE_STEM: &str = "encoded";
const PACKAGE_DIR: &str = "package";

/// stderr fragments that indicate resource contention rather than bad input.
const TRANSIENT_MARKERS: &[&str] = &[
    "resource temporarily unavailable",
    "cannot allocate memory",
    "out of memory",
    "device or resource busy",
];

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Encode,
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Encode => "encode",
            Stage::Package => "package",
        })
    }
}

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Subprocess exited unsuccessfully
    #[error("{stage} stage failed: {cause}")]
    StageFailed {
        stage: Stage,
        cause: String,
        /// Subprocess stderr tail, for operators only
        diagnostics: String,
        /// Failure looked like resource contention
        transient: bool,
    },

    /// Subprocess never started; not retried
    #[error("{stage} stage could not start: {source}")]
    Spawn {
        stage: Stage,
        #[source]
        source: ProcessError,
    },

    #[error("{stage} stage exceeded its {}s limit", .limit.as_secs())]
    Timeout { stage: Stage, limit: Duration },

    #[error("Job cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::StageFailed { stage, .. }
            | PipelineError::Spawn { stage, .. }
            | PipelineError::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            PipelineError::StageFailed { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::StageFailed { transient: true, .. })
    }
}

/// One unit of work for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    /// Also names the scratch directory
    pub id: Uuid,
    pub input: PathBuf,
    pub params: TranscodeParams,
    pub source_duration: Option<Duration>,
    /// Provider chosen at admission; selected by the pipeline when unset
    pub provider_id: Option<String>,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub content_hash: ContentHash,
    pub outcome: CommitOutcome,
    /// None when the content already existed and nothing ran
    pub provider_id: Option<String>,
}

/// Receives progress from a running job.
///
/// The session manager implements this to update its records; the pipeline
/// never touches session state directly.
pub trait JobObserver: Send + Sync {
    fn provider_selected(&self, provider_id: &str);

    /// Overall completion in `[0, 1]`.
    fn progress(&self, fraction: f64);

    /// A media file of the final output exists (path relative to the entry).
    fn segment_ready(&self, file: &str);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl JobObserver for NoopObserver {
    fn provider_selected(&self, _provider_id: &str) {}
    fn progress(&self, _fraction: f64) {}
    fn segment_ready(&self, _file: &str) {}
}

/// Executes jobs. Implemented by [`PipelineManager`]; tests substitute fakes.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        job: PipelineJob,
        observer: Arc<dyn JobObserver>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError>;

    /// Scratch directory a job uses.
    fn work_dir(&self, job_id: Uuid) -> PathBuf;
}

/// Runs encode and package subprocesses and commits their output.
pub struct PipelineManager {
    registry: Arc<ProviderRegistry>,
    store: Arc<ContentStore>,
    packager: Arc<dyn Packager>,
    config: PipelineConfig,
}

impl PipelineManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<ContentStore>,
        packager: Arc<dyn Packager>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            packager,
            config,
        }
    }

    /// Builds the packager named by the configuration.
    pub fn packager_from_config(config: &PipelineConfig) -> Arc<dyn Packager> {
        match config.packager {
            PackagerKind::Shaka => Arc::new(ShakaPackager::new(&config.packager_path)),
            PackagerKind::Ffmpeg => Arc::new(FfmpegPackager::new(&config.ffmpeg_path)),
        }
    }

    pub fn scratch_dir(&self, job_id: Uuid) -> PathBuf {
        self.config.temp_root.join(job_id.to_string())
    }

    /// Runs one job to completion, cancellation or failure.
    ///
    /// # Errors
    ///
    /// - `PipelineError::Provider` - No provider can produce the params
    /// - `PipelineError::Spawn` - A binary is missing (never retried)
    /// - `PipelineError::StageFailed` - A stage failed after its retries
    /// - `PipelineError::Timeout` - A stage exceeded its wall-clock limit
    /// - `PipelineError::Cancelled` - `cancel` fired
    /// - `PipelineError::Storage` - Commit failed
    pub async fn execute(
        &self,
        job: PipelineJob,
        observer: Arc<dyn JobObserver>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let hash = job.params.content_hash();
        if self.store.exists(&hash).await {
            debug!(job = %job.id, %hash, "Content already present, skipping pipeline");
            observer.progress(1.0);
            return Ok(PipelineOutput {
                content_hash: hash,
                outcome: CommitOutcome::AlreadyExists,
                provider_id: None,
            });
        }

        let work_dir = self.scratch_dir(job.id);
        let result = self.execute_in(&job, &hash, &work_dir, observer, cancel).await;

        if let Err(e) = remove_dir(&work_dir).await {
            warn!(job = %job.id, error = %e, "Failed to remove work directory");
        }
        match &result {
            Ok(output) => info!(job = %job.id, hash = %output.content_hash, outcome = ?output.outcome, "Pipeline finished"),
            Err(PipelineError::Cancelled) => info!(job = %job.id, "Pipeline cancelled"),
            Err(e) => warn!(
                job = %job.id,
                error = %e,
                diagnostics = e.diagnostics().unwrap_or_default(),
                "Pipeline failed"
            ),
        }
        result
    }

    async fn execute_in(
        &self,
        job: &PipelineJob,
        hash: &ContentHash,
        work_dir: &Path,
        observer: Arc<dyn JobObserver>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let provider = match &job.provider_id {
            Some(id) => match self.registry.get(id) {
                Some(provider) if provider.info().can_handle(&job.params) => provider,
                _ => self.registry.select(&job.params)?,
            },
            None => self.registry.select(&job.params)?,
        };
        let provider_id = provider.info().id.clone();
        observer.provider_selected(&provider_id);

        tokio::fs::create_dir_all(work_dir).await?;
        let encode_job = EncodeJob {
            input: job.input.clone(),
            output: work_dir.join(intermediate_name(&job.params.container)),
            params: job.params.clone(),
            source_duration: job.source_duration,
        };

        info!(job = %job.id, provider = %provider_id, %hash, "Encode stage starting");
        self.run_stage(
            Stage::Encode,
            self.config.encode_timeout,
            (0.0, ENCODE_WEIGHT),
            &observer,
            &cancel,
            || {
                let provider = Arc::clone(&provider);
                let encode_job = encode_job.clone();
                Box::pin(async move { provider.start_encode(&encode_job).await })
            },
        )
        .await?;

        let package_job = PackageJob {
            input: encode_job.output.clone(),
            output_dir: work_dir.join(PACKAGE_DIR),
            format: job.params.format,
            segment_duration: self.config.segment_duration,
            has_video: job.params.video_codec.is_some(),
            has_audio: job.params.audio_codec.is_some(),
        };

        info!(job = %job.id, packager = self.packager.name(), format = %job.params.format, "Package stage starting");
        self.run_stage(
            Stage::Package,
            self.config.package_timeout,
            (ENCODE_WEIGHT, 1.0),
            &observer,
            &cancel,
            || {
                let packager = Arc::clone(&self.packager);
                let package_job = package_job.clone();
                Box::pin(async move { packager.start_package(&package_job).await })
            },
        )
        .await?;

        let package_dir = &package_job.output_dir;
        let manifest = package_dir.join(job.params.format.manifest_name());
        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            return Err(PipelineError::StageFailed {
                stage: Stage::Package,
                cause: format!("packager produced no {}", job.params.format.manifest_name()),
                diagnostics: String::new(),
                transient: false,
            });
        }
        finalize_manifests(package_dir, job.params.format).await?;

        for file in media_files(package_dir).await? {
            observer.segment_ready(&file);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let outcome = self.store.commit(hash, package_dir, &job.params).await?;
        observer.progress(1.0);

        Ok(PipelineOutput {
            content_hash: hash.clone(),
            outcome,
            provider_id: Some(provider_id),
        })
    }

    /// Runs one stage with retries for transient failures.
    async fn run_stage<F>(
        &self,
        stage: Stage,
        limit: Duration,
        (start, end): (f64, f64),
        observer: &Arc<dyn JobObserver>,
        cancel: &CancellationToken,
        spawn: F,
    ) -> Result<ExitReport, PipelineError>
    where
        F: Fn() -> BoxFuture<'static, Result<ManagedProcess, ProcessError>>,
    {
        let mut attempt = 0;
        loop {
            let mut process = spawn()
                .await
                .map_err(|source| PipelineError::Spawn { stage, source })?;

            let forward = {
                let mut progress = process.progress();
                let observer = Arc::clone(observer);
                tokio::spawn(async move {
                    while progress.changed().await.is_ok() {
                        let fraction = *progress.borrow_and_update();
                        observer.progress(start + (end - start) * fraction);
                    }
                })
            };

            let result = self.supervise(stage, limit, &mut process, cancel).await;
            forward.abort();

            let report = result?;
            if report.success() {
                observer.progress(end);
                return Ok(report);
            }

            let transient = is_transient(&report);
            let failure = PipelineError::StageFailed {
                stage,
                cause: describe_exit(&report),
                diagnostics: report.diagnostics.clone(),
                transient,
            };
            if !transient || attempt >= self.config.max_retries {
                return Err(failure);
            }

            attempt += 1;
            let delay = self.backoff(attempt);
            warn!(%stage, attempt, delay_ms = delay.as_millis() as u64, error = %failure, "Transient failure, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            }
        }
    }

    /// Waits for exit, cancellation or timeout; the latter two tear the
    /// process tree down before returning.
    async fn supervise(
        &self,
        stage: Stage,
        limit: Duration,
        process: &mut ManagedProcess,
        cancel: &CancellationToken,
    ) -> Result<ExitReport, PipelineError> {
        enum Outcome {
            Exited(Result<ExitReport, ProcessError>),
            Cancelled,
            TimedOut,
        }

        let outcome = tokio::select! {
            result = process.wait() => Outcome::Exited(result),
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(limit) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Exited(result) => result.map_err(|source| PipelineError::Spawn { stage, source }),
            Outcome::Cancelled => {
                process.terminate(self.config.kill_grace).await.ok();
                Err(PipelineError::Cancelled)
            }
            Outcome::TimedOut => {
                warn!(%stage, limit_secs = limit.as_secs(), "Stage timed out, terminating");
                process.terminate(self.config.kill_grace).await.ok();
                Err(PipelineError::Timeout { stage, limit })
            }
        }
    }

    /// Exponential backoff with up to 20% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter = rand::rng().random_range(0.0..0.2);
        base.mul_f64(1.0 + jitter)
    }
}

#[async_trait]
impl JobRunner for PipelineManager {
    async fn run(
        &self,
        job: PipelineJob,
        observer: Arc<dyn JobObserver>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        self.execute(job, observer, cancel).await
    }

    fn work_dir(&self, job_id: Uuid) -> PathBuf {
        self.scratch_dir(job_id)
    }
}

fn is_transient(report: &ExitReport) -> bool {
    // Killed by a signal we did not send, typically the OOM killer
    if report.status.code().is_none() {
        return true;
    }
    let diagnostics = report.diagnostics.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| diagnostics.contains(m))
}

/// Intermediate file name for a target container; containers the packagers
/// cannot read fall back to MP4.
fn intermediate_name(container: &str) -> String {
    let extension = match container {
        "mkv" | "webm" | "ts" | "mov" => container,
        _ => "mp4",
    };
    format!("{INTERMEDIATE_STEM}.{extension}")
}

fn describe_exit(report: &ExitReport) -> String {
    match report.status.code() {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Media files of a package directory relative to it, manifests excluded.
async fn media_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    for extension in ["m4s", "mp4", "ts", "webm"] {
        for path in manifest::find_files(dir, extension).await? {
            if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn remove_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn report(code: i32, diagnostics: &str) -> ExitReport {
        use std::os::unix::process::ExitStatusExt;
        ExitReport {
            status: std::process::ExitStatus::from_raw(code << 8),
            diagnostics: diagnostics.to_string(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&report(1, "Error: Cannot allocate memory")));
        assert!(is_transient(&report(1, "OpenEncodeSessionEx failed: out of memory (10)")));
        assert!(!is_transient(&report(1, "Invalid data found when processing input")));
        assert!(!is_transient(&report(
            1,
            "av_interleaved_write_frame(): No space left on device"
        )));
        assert_eq!(describe_exit(&report(187, "")), "exited with status 187");
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_exit_is_transient() {
        use std::os::unix::process::ExitStatusExt;
        let killed = ExitReport {
            status: std::process::ExitStatus::from_raw(9),
            diagnostics: String::new(),
        };
        assert!(is_transient(&killed));
        assert_eq!(describe_exit(&killed), "terminated by signal");
    }

    #[test]
    fn test_intermediate_follows_container() {
        assert_eq!(intermediate_name("mkv"), "encoded.mkv");
        assert_eq!(intermediate_name("webm"), "encoded.webm");
        assert_eq!(intermediate_name("mp4"), "encoded.mp4");
        assert_eq!(intermediate_name("avi"), "encoded.mp4");
    }

    #[test]
    fn test_error_accessors() {
        let err = PipelineError::StageFailed {
            stage: Stage::Package,
            cause: "exited with status 1".into(),
            diagnostics: "bad input".into(),
            transient: false,
        };
        assert_eq!(err.stage(), Some(Stage::Package));
        assert_eq!(err.diagnostics(), Some("bad input"));
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "package stage failed: exited with status 1");
        assert_eq!(PipelineError::Cancelled.stage(), None);
    }

    #[tokio::test]
    async fn test_media_files_are_relative_and_exclude_manifests() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("video")).await.unwrap();
        for file in ["manifest.mpd", "video/init.mp4", "video/seg-1.m4s", "video/video.m3u8"] {
            tokio::fs::write(dir.path().join(file), b"x").await.unwrap();
        }
        let files = media_files(dir.path()).await.unwrap();
        assert_eq!(files, vec!["video/init.mp4", "video/seg-1.m4s"]);
    }
}
