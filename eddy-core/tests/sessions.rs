//! Integration tests for session admission, stopping and reclamation.
//!
//! A gated in-process runner stands in for the encode/package pipeline so
//! that tests control exactly when work finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eddy_core::config::EddyConfig;
use eddy_core::content::CommitOutcome;
use eddy_core::pipeline::{
    JobObserver, JobRunner, PipelineError, PipelineJob, PipelineOutput, Stage,
};
use eddy_core::session::{
    EventBus, InMemorySessionRepository, JsonFileSessionRepository, PlaybackEvent,
    SessionRepository,
};
use eddy_core::{SessionError, SessionManager, SessionStatus, StreamingFormat, TranscodeParams};
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Finishes one job per released permit; cancellation wins over waiting.
struct GatedRunner {
    permits: Semaphore,
    work_root: PathBuf,
    fail: bool,
}

impl GatedRunner {
    fn new(work_root: &Path) -> Self {
        Self {
            permits: Semaphore::new(0),
            work_root: work_root.to_path_buf(),
            fail: false,
        }
    }

    fn failing(work_root: &Path) -> Self {
        Self {
            fail: true,
            ..Self::new(work_root)
        }
    }

    fn release(&self, jobs: usize) {
        self.permits.add_permits(jobs);
    }
}

#[async_trait]
impl JobRunner for GatedRunner {
    async fn run(
        &self,
        job: PipelineJob,
        observer: Arc<dyn JobObserver>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        observer.provider_selected("gated");
        observer.progress(0.25);

        tokio::select! {
            permit = self.permits.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            }
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        }

        if self.fail {
            return Err(PipelineError::StageFailed {
                stage: Stage::Encode,
                cause: "exit status 1".to_string(),
                diagnostics: "/library/secret.mkv: Invalid data found".to_string(),
                transient: false,
            });
        }

        observer.segment_ready("chunk-0-00001.m4s");
        Ok(PipelineOutput {
            content_hash: job.params.content_hash(),
            outcome: CommitOutcome::Committed,
            provider_id: Some("gated".to_string()),
        })
    }

    fn work_dir(&self, job_id: Uuid) -> PathBuf {
        self.work_root.join(job_id.to_string())
    }
}

/// Test fixture wiring a session manager to a gated runner.
struct SessionFixture {
    _dir: tempfile::TempDir,
    runner: Arc<GatedRunner>,
    repository: Arc<InMemorySessionRepository>,
    manager: SessionManager,
}

impl SessionFixture {
    fn new() -> Self {
        Self::with_runner(GatedRunner::new)
    }

    fn with_runner(build: impl FnOnce(&Path) -> GatedRunner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EddyConfig::for_testing(dir.path());
        let runner = Arc::new(build(&dir.path().join("tmp")));
        let repository = Arc::new(InMemorySessionRepository::new());
        let manager = SessionManager::new(
            config.sessions,
            runner.clone(),
            repository.clone(),
            EventBus::default(),
        );
        Self {
            _dir: dir,
            runner,
            repository,
            manager,
        }
    }

    fn submit(&self, media_id: &str) -> Result<Uuid, SessionError> {
        let params = TranscodeParams::new(media_id, "mp4", StreamingFormat::Dash)
            .with_video("h264", false)
            .with_audio("aac", true);
        let session = self.manager.submit(
            PathBuf::from(format!("/library/{media_id}.mkv")),
            params,
            Some(Duration::from_secs(60)),
        )?;
        Ok(session.id)
    }

    fn status(&self, id: Uuid) -> SessionStatus {
        self.manager.get(id).unwrap().status
    }

    async fn wait_for(&self, id: Uuid, status: SessionStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.status(id) != status {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session {id} never reached {status}"));
    }
}

#[tokio::test]
async fn test_admission_bound_queues_extra_sessions() {
    let fixture = SessionFixture::new();

    let first = assert_ok!(fixture.submit("a"));
    let second = assert_ok!(fixture.submit("b"));
    let third = assert_ok!(fixture.submit("c"));

    assert_eq!(fixture.status(first), SessionStatus::Running);
    assert_eq!(fixture.status(second), SessionStatus::Running);
    assert_eq!(fixture.status(third), SessionStatus::Pending);

    let stats = fixture.manager.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.max_concurrent, 2);

    // Stopping a running session hands its slot to the queue head at once
    assert!(fixture.manager.stop(first).unwrap());
    assert_eq!(fixture.status(first), SessionStatus::Stopped);
    assert_eq!(fixture.status(third), SessionStatus::Running);
    assert_eq!(fixture.manager.running(), 2);
    assert_eq!(fixture.manager.stats().queued, 0);
}

#[tokio::test]
async fn test_full_queue_refuses_with_retry_hint() {
    let fixture = SessionFixture::new();
    // Two slots plus a queue of four
    for i in 0..6 {
        assert_ok!(fixture.submit(&format!("m{i}")));
    }

    match fixture.submit("overflow") {
        Err(SessionError::LimitExceeded {
            queued,
            retry_after,
        }) => {
            assert_eq!(queued, 4);
            assert_eq!(retry_after, Duration::from_secs(1));
        }
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
    assert_eq!(fixture.manager.list().len(), 6);
}

#[tokio::test]
async fn test_completion_promotes_queue_in_fifo_order() {
    let fixture = SessionFixture::new();
    let mut events = fixture.manager.events().subscribe();

    let a = fixture.submit("a").unwrap();
    let b = fixture.submit("b").unwrap();
    let c = fixture.submit("c").unwrap();
    let d = fixture.submit("d").unwrap();

    fixture.runner.release(1);
    // One of the two running sessions finishes; c is next in line
    tokio::time::timeout(Duration::from_secs(5), async {
        while fixture.status(c) != SessionStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(fixture.status(d), SessionStatus::Pending);

    fixture.runner.release(3);
    for id in [a, b, c, d] {
        fixture.wait_for(id, SessionStatus::Completed).await;
    }

    let done = fixture.manager.get(a).unwrap();
    assert_eq!(done.progress, 100.0);
    assert_eq!(done.provider_id.as_deref(), Some("gated"));
    assert!(done.completed_at.is_some());

    let mut completed = 0;
    let mut segments = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PlaybackEvent::SessionCompleted { .. } => completed += 1,
            PlaybackEvent::SegmentReady { file, .. } => {
                assert_eq!(file, "chunk-0-00001.m4s");
                segments += 1;
            }
            _ => {}
        }
    }
    assert_eq!(completed, 4);
    assert_eq!(segments, 4);
}

#[tokio::test]
async fn test_stop_pending_and_stop_all() {
    let fixture = SessionFixture::new();
    let running = [fixture.submit("a").unwrap(), fixture.submit("b").unwrap()];
    let pending = fixture.submit("c").unwrap();

    assert!(fixture.manager.stop(pending).unwrap());
    assert_eq!(fixture.status(pending), SessionStatus::Stopped);
    assert!(fixture.manager.get(pending).unwrap().started_at.is_none());
    // Already terminal
    assert!(!fixture.manager.stop(pending).unwrap());

    assert_eq!(fixture.manager.stop_all(), 2);
    for id in running {
        assert_eq!(fixture.status(id), SessionStatus::Stopped);
    }
    assert_eq!(fixture.manager.running(), 0);
    assert_eq!(fixture.manager.stop_all(), 0);

    // Cancelled pipelines report back without reviving the session
    tokio::time::sleep(Duration::from_millis(50)).await;
    for id in running {
        assert_eq!(fixture.status(id), SessionStatus::Stopped);
    }
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let fixture = SessionFixture::new();
    let id = Uuid::new_v4();
    assert!(matches!(
        fixture.manager.stop(id),
        Err(SessionError::SessionNotFound { .. })
    ));
    assert!(matches!(
        fixture.manager.status(id),
        Err(SessionError::SessionNotFound { .. })
    ));
    assert_err!(fixture.manager.touch(id));
}

#[tokio::test]
async fn test_failure_keeps_diagnostics_out_of_session() {
    let fixture = SessionFixture::with_runner(GatedRunner::failing);
    let id = fixture.submit("broken").unwrap();
    fixture.runner.release(1);
    fixture.wait_for(id, SessionStatus::Failed).await;

    let session = fixture.manager.status(id).unwrap();
    assert_eq!(session.error.as_deref(), Some("Transcoding failed"));
    assert_eq!(fixture.manager.running(), 0);

    // Failed sessions stay queryable until retention expires
    fixture.manager.sweep().await;
    assert!(fixture.manager.get(id).is_some());
}

#[tokio::test]
async fn test_orphaned_session_is_reclaimed_by_sweep() {
    let fixture = SessionFixture::new();

    // A record left running by a crashed process
    let params = TranscodeParams::new("crashed", "mp4", StreamingFormat::Hls).with_video("h264", false);
    let mut orphan = eddy_core::TranscodeSession::new("/library/crashed.mkv".into(), params, None);
    orphan.transition(SessionStatus::Running).unwrap();
    orphan.last_activity = Utc::now() - chrono::Duration::minutes(5);
    fixture.repository.save(&orphan).await.unwrap();

    let work_dir = fixture.runner.work_dir(orphan.id);
    tokio::fs::create_dir_all(&work_dir).await.unwrap();
    tokio::fs::write(work_dir.join("encoded.mp4"), b"partial").await.unwrap();

    let restored = fixture
        .manager
        .recover(fixture.repository.as_ref())
        .await
        .unwrap();
    assert_eq!(restored, 1);

    let report = fixture.manager.sweep().await;
    assert_eq!(report.orphans_stopped, 1);
    assert_eq!(report.temp_dirs_removed, 1);
    assert_eq!(fixture.status(orphan.id), SessionStatus::Stopped);
    assert!(!work_dir.exists());

    fixture.manager.flush().await;
    let saved = fixture.repository.load_all().await.unwrap();
    assert_eq!(saved[0].status, SessionStatus::Stopped);
}

#[tokio::test]
async fn test_recent_activity_keeps_session_alive() {
    let fixture = SessionFixture::new();
    let params = TranscodeParams::new("idle", "mp4", StreamingFormat::Dash).with_video("h264", false);
    let mut session = eddy_core::TranscodeSession::new("/library/idle.mkv".into(), params, None);
    session.transition(SessionStatus::Running).unwrap();
    fixture.repository.save(&session).await.unwrap();
    fixture
        .manager
        .recover(fixture.repository.as_ref())
        .await
        .unwrap();

    // Within the one-second TTL
    fixture.manager.touch(session.id).unwrap();
    let report = fixture.manager.sweep().await;
    assert_eq!(report.orphans_stopped, 0);
    assert_eq!(fixture.status(session.id), SessionStatus::Running);
}

#[tokio::test]
async fn test_expired_terminal_sessions_are_removed() {
    let fixture = SessionFixture::new();
    let params = TranscodeParams::new("old", "mp4", StreamingFormat::Dash).with_video("h264", true);
    let mut old = eddy_core::TranscodeSession::already_completed("/library/old.mkv".into(), params);
    old.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
    fixture.repository.save(&old).await.unwrap();
    fixture
        .manager
        .recover(fixture.repository.as_ref())
        .await
        .unwrap();

    let report = fixture.manager.sweep().await;
    assert_eq!(report.sessions_expired, 1);
    assert!(fixture.manager.get(old.id).is_none());

    fixture.manager.flush().await;
    assert!(fixture.repository.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sessions_persist_to_json_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = EddyConfig::for_testing(dir.path());
    let runner = Arc::new(GatedRunner::new(&dir.path().join("tmp")));
    let repository = Arc::new(
        JsonFileSessionRepository::open(dir.path().join("state"))
            .await
            .unwrap(),
    );
    let manager = SessionManager::new(
        config.sessions.clone(),
        runner.clone(),
        repository.clone(),
        EventBus::default(),
    );

    let params = TranscodeParams::new("kept", "mp4", StreamingFormat::Dash).with_video("h264", false);
    let session = manager
        .submit("/library/kept.mkv".into(), params, None)
        .unwrap();
    runner.release(1);
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.get(session.id).unwrap().status != SessionStatus::Completed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    manager.flush().await;

    // A fresh manager sees the same record
    let reopened = Arc::new(
        JsonFileSessionRepository::open(dir.path().join("state"))
            .await
            .unwrap(),
    );
    let restarted = SessionManager::new(
        config.sessions,
        runner,
        reopened.clone(),
        EventBus::default(),
    );
    assert_eq!(restarted.recover(reopened.as_ref()).await.unwrap(), 1);
    let restored = restarted.get(session.id).unwrap();
    assert_eq!(restored.status, SessionStatus::Completed);
    assert_eq!(restored.content_hash, session.content_hash);
}

#[tokio::test]
async fn test_shutdown_stops_running_work() {
    let fixture = SessionFixture::new();
    let id = fixture.submit("long").unwrap();

    fixture.manager.shutdown().await;
    assert_eq!(fixture.status(id), SessionStatus::Stopped);
}
