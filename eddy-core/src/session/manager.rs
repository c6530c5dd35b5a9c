//! Session table and worker-slot admission.
//!
//! The table, FIFO queue and running count sit behind one mutex so that
//! admit, finish, stop and sweep are each a single critical section. Pipeline
//! work runs on spawned tasks that report back through a [`JobObserver`];
//! only this module mutates session records.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    EventBus, PlaybackEvent, RepositoryError, SessionError, SessionRepository, SessionStatus,
    TranscodeSession,
};
use crate::config::SessionConfig;
use crate::params::TranscodeParams;
use crate::pipeline::{JobObserver, JobRunner, PipelineError, PipelineJob, PipelineOutput};

/// Message shown to clients for any pipeline failure.
const GENERIC_FAILURE: &str = "Transcoding failed";

/// How long shutdown waits for running jobs to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Point-in-time admission figures.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// Outcome of one orphan/retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orphans_stopped: usize,
    pub temp_dirs_removed: usize,
    pub sessions_expired: usize,
}

struct Entry {
    session: TranscodeSession,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    /// Counted in `State::running`
    holds_slot: bool,
}

impl Entry {
    fn new(session: TranscodeSession) -> Self {
        Self {
            session,
            cancel: None,
            task: None,
            holds_slot: false,
        }
    }

    fn has_live_task(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, Entry>,
    queue: VecDeque<Uuid>,
    running: usize,
}

enum PersistOp {
    Save(Box<TranscodeSession>),
    Delete(Uuid),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    config: SessionConfig,
    runner: Arc<dyn JobRunner>,
    events: EventBus,
    state: Mutex<State>,
    persist: mpsc::UnboundedSender<PersistOp>,
    shutdown: CancellationToken,
}

/// Tracks every session and gates how many run at once.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates the manager and its persistence writer. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: SessionConfig,
        runner: Arc<dyn JobRunner>,
        repository: Arc<dyn SessionRepository>,
        events: EventBus,
    ) -> Self {
        let (persist, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_writer(repository, rx));

        Self {
            inner: Arc::new(Inner {
                config,
                runner,
                events,
                state: Mutex::new(State::default()),
                persist,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Loads persisted records. Unfinished ones have no live work and are
    /// reclaimed by the next sweep once their activity ages past the TTL.
    pub async fn recover(
        &self,
        repository: &dyn SessionRepository,
    ) -> Result<usize, RepositoryError> {
        let records = repository.load_all().await?;
        let mut state = self.inner.state.lock();
        let mut restored = 0;
        for session in records {
            if state.sessions.contains_key(&session.id) {
                continue;
            }
            if !session.is_terminal() {
                warn!(session_id = %session.id, status = %session.status, "Recovered unfinished session");
            }
            state.sessions.insert(session.id, Entry::new(session));
            restored += 1;
        }
        info!(restored, "Recovered session records");
        Ok(restored)
    }

    /// Admits a new session and returns immediately.
    ///
    /// The session starts at once when a worker slot is free, otherwise it
    /// waits in FIFO order.
    ///
    /// # Errors
    ///
    /// - `SessionError::LimitExceeded` - All slots busy and the queue is full
    pub fn submit(
        &self,
        input: PathBuf,
        params: TranscodeParams,
        source_duration: Option<Duration>,
    ) -> Result<TranscodeSession, SessionError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let has_slot = state.running < inner.config.max_concurrent;
        if !has_slot && state.queue.len() >= inner.config.max_queue {
            warn!(
                queued = state.queue.len(),
                running = state.running,
                "Admission refused, queue full"
            );
            return Err(SessionError::LimitExceeded {
                queued: state.queue.len(),
                retry_after: inner.config.retry_after,
            });
        }

        let session = TranscodeSession::new(input, params, source_duration);
        let id = session.id;
        info!(session_id = %id, media_id = %session.media_id, hash = %session.content_hash, "Session admitted");
        state.sessions.insert(id, Entry::new(session));

        if has_slot {
            launch(inner, &mut state, id);
        } else {
            state.queue.push_back(id);
            let position = state.queue.len() - 1;
            debug!(session_id = %id, position, "Session queued");
            inner.events.emit(PlaybackEvent::SessionQueued {
                session_id: id,
                position,
            });
            persist(inner, &state, id);
        }

        state
            .sessions
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or(SessionError::SessionNotFound { id })
    }

    /// Records a request already satisfied by the content store. Takes no
    /// worker slot.
    pub fn record_completed(&self, input: PathBuf, params: TranscodeParams) -> TranscodeSession {
        let inner = &self.inner;
        let session = TranscodeSession::already_completed(input, params);
        let id = session.id;
        let mut state = inner.state.lock();
        state.sessions.insert(id, Entry::new(session.clone()));
        inner.events.emit(PlaybackEvent::SessionCompleted {
            session_id: id,
            content_hash: session.content_hash.clone(),
        });
        persist(inner, &state, id);
        debug!(session_id = %id, hash = %session.content_hash, "Served from content store");
        session
    }

    pub fn get(&self, id: Uuid) -> Option<TranscodeSession> {
        self.inner
            .state
            .lock()
            .sessions
            .get(&id)
            .map(|e| e.session.clone())
    }

    /// Snapshot for a client poll; counts as client activity.
    pub fn status(&self, id: Uuid) -> Result<TranscodeSession, SessionError> {
        let mut state = self.inner.state.lock();
        let entry = state
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::SessionNotFound { id })?;
        entry.session.touch();
        Ok(entry.session.clone())
    }

    /// Records client activity without reading the session.
    pub fn touch(&self, id: Uuid) -> Result<(), SessionError> {
        self.status(id).map(|_| ())
    }

    pub fn list(&self) -> Vec<TranscodeSession> {
        let mut sessions: Vec<_> = self
            .inner
            .state
            .lock()
            .sessions
            .values()
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Stops a session. Returns false when it had already finished.
    ///
    /// The worker slot is released immediately; process teardown completes
    /// in the background and is observed through later polls.
    ///
    /// # Errors
    ///
    /// - `SessionError::SessionNotFound` - Unknown id
    pub fn stop(&self, id: Uuid) -> Result<bool, SessionError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.sessions.contains_key(&id) {
            return Err(SessionError::SessionNotFound { id });
        }
        let stopped = stop_locked(inner, &mut state, id, None);
        promote(inner, &mut state);
        Ok(stopped)
    }

    /// Stops every unfinished session. Queued sessions go first so none of
    /// them is promoted into a slot freed by this call.
    pub fn stop_all(&self) -> usize {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let queued: Vec<Uuid> = state.queue.iter().copied().collect();
        let running: Vec<Uuid> = state
            .sessions
            .iter()
            .filter(|(_, e)| e.session.status == SessionStatus::Running)
            .map(|(id, _)| *id)
            .collect();

        let count = queued
            .into_iter()
            .chain(running)
            .filter(|id| stop_locked(inner, &mut state, *id, None))
            .count();
        info!(count, "Stopped all sessions");
        count
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.inner.state.lock();
        let mut by_status = BTreeMap::new();
        for entry in state.sessions.values() {
            *by_status
                .entry(entry.session.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        SessionStats {
            running: state.running,
            queued: state.queue.len(),
            max_concurrent: self.inner.config.max_concurrent,
            max_queue: self.inner.config.max_queue,
            by_status,
        }
    }

    /// Reclaims orphans and drops expired terminal sessions.
    ///
    /// An orphan is an unfinished session with no live pipeline task and no
    /// client activity within the orphan TTL. Its scratch directory is
    /// removed; this sweep is the only place in-flight temp state is deleted.
    pub async fn sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let now = Utc::now();
        let orphan_ttl = to_chrono(inner.config.orphan_ttl);
        let retention = to_chrono(inner.config.terminal_retention);
        let mut report = SweepReport::default();
        let mut scratch = Vec::new();

        {
            let mut state = inner.state.lock();

            let orphans: Vec<Uuid> = state
                .sessions
                .iter()
                .filter(|(_, e)| {
                    !e.session.is_terminal()
                        && !e.has_live_task()
                        && now - e.session.last_activity > orphan_ttl
                })
                .map(|(id, _)| *id)
                .collect();

            for id in orphans {
                if stop_locked(inner, &mut state, id, Some("Session abandoned")) {
                    warn!(session_id = %id, "Reclaimed orphaned session");
                    report.orphans_stopped += 1;
                    scratch.push(inner.runner.work_dir(id));
                }
            }

            let expired: Vec<Uuid> = state
                .sessions
                .iter()
                .filter(|(_, e)| {
                    e.session.is_terminal()
                        && !e.has_live_task()
                        && now - e.session.completed_at.unwrap_or(e.session.updated_at) > retention
                })
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                state.sessions.remove(&id);
                let _ = inner.persist.send(PersistOp::Delete(id));
                report.sessions_expired += 1;
            }

            promote(inner, &mut state);
        }

        for dir in scratch {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => report.temp_dirs_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove scratch directory"),
            }
        }

        if report != SweepReport::default() {
            info!(?report, "Session sweep finished");
        }
        report
    }

    /// Waits until all queued persistence writes have been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.persist.send(PersistOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Cancels running work, waits briefly for it to finish and flushes
    /// persistence.
    pub async fn shutdown(&self) {
        info!("Shutting down session manager");
        self.inner.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock();
            state.queue.clear();
            state
                .sessions
                .values_mut()
                .filter_map(|e| e.task.take())
                .collect()
        };

        let wait_all = futures::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, wait_all).await.is_err() {
            warn!("Pipeline tasks still running after shutdown grace");
        }
        self.flush().await;
    }

    /// Number of sessions holding a worker slot.
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }
}

/// Moves a pending session into a worker slot and spawns its pipeline.
fn launch(inner: &Arc<Inner>, state: &mut State, id: Uuid) {
    let Some(entry) = state.sessions.get_mut(&id) else {
        return;
    };
    if let Err(e) = entry.session.transition(SessionStatus::Running) {
        error!(session_id = %id, error = %e, "Cannot launch session");
        return;
    }

    let cancel = inner.shutdown.child_token();
    let job = PipelineJob {
        id,
        input: entry.session.input.clone(),
        params: entry.session.params.clone(),
        source_duration: entry.session.source_duration(),
        provider_id: entry.session.provider_id.clone(),
    };
    let observer: Arc<dyn JobObserver> = Arc::new(SessionObserver {
        inner: Arc::clone(inner),
        id,
    });

    let task_inner = Arc::clone(inner);
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let result = task_inner.runner.run(job, observer, task_cancel).await;
        finish(&task_inner, id, result);
    });

    entry.cancel = Some(cancel);
    entry.task = Some(task);
    entry.holds_slot = true;
    state.running += 1;

    debug!(session_id = %id, running = state.running, "Session started");
    persist(inner, state, id);
}

/// Applies a pipeline result and hands the slot to the next queued session.
fn finish(inner: &Arc<Inner>, id: Uuid, result: Result<PipelineOutput, PipelineError>) {
    let mut state = inner.state.lock();
    let Some(entry) = state.sessions.get_mut(&id) else {
        return;
    };

    let released = std::mem::take(&mut entry.holds_slot);
    entry.cancel = None;

    if entry.session.is_terminal() {
        // Stopped while running; the stop already released the slot
        debug!(session_id = %id, status = %entry.session.status, "Ignoring result of finished session");
    } else {
        let event = match result {
            Ok(output) => {
                entry.session.content_hash = output.content_hash.clone();
                if output.provider_id.is_some() {
                    entry.session.provider_id = output.provider_id;
                }
                let _ = entry.session.transition(SessionStatus::Completed);
                info!(session_id = %id, hash = %output.content_hash, outcome = ?output.outcome, "Session completed");
                PlaybackEvent::SessionCompleted {
                    session_id: id,
                    content_hash: output.content_hash,
                }
            }
            Err(PipelineError::Cancelled) => {
                let _ = entry.session.transition(SessionStatus::Stopped);
                PlaybackEvent::SessionStopped { session_id: id }
            }
            Err(e) => {
                let _ = entry.session.transition(SessionStatus::Failed);
                entry.session.error = Some(GENERIC_FAILURE.to_string());
                error!(
                    session_id = %id,
                    error = %e,
                    stage = ?e.stage(),
                    diagnostics = e.diagnostics().unwrap_or_default(),
                    "Session failed"
                );
                PlaybackEvent::SessionFailed {
                    session_id: id,
                    error: GENERIC_FAILURE.to_string(),
                }
            }
        };
        inner.events.emit(event);
        persist(inner, &state, id);
    }

    if released {
        state.running = state.running.saturating_sub(1);
    }
    promote(inner, &mut state);
}

/// Stops one session under the lock. Returns false if already terminal.
fn stop_locked(inner: &Arc<Inner>, state: &mut State, id: Uuid, reason: Option<&str>) -> bool {
    let Some(entry) = state.sessions.get_mut(&id) else {
        return false;
    };
    if entry.session.is_terminal() {
        return false;
    }

    let was = entry.session.status;
    if entry.session.transition(SessionStatus::Stopped).is_err() {
        return false;
    }
    entry.session.error = reason.map(str::to_string);
    if let Some(cancel) = entry.cancel.take() {
        cancel.cancel();
    }
    let released = std::mem::take(&mut entry.holds_slot);

    if released {
        state.running = state.running.saturating_sub(1);
    }
    if was == SessionStatus::Pending {
        state.queue.retain(|queued| *queued != id);
    }

    info!(session_id = %id, from = %was, "Session stopped");
    inner.events.emit(PlaybackEvent::SessionStopped { session_id: id });
    persist(inner, state, id);
    true
}

/// Fills free slots from the head of the queue.
fn promote(inner: &Arc<Inner>, state: &mut State) {
    while state.running < inner.config.max_concurrent {
        let Some(id) = state.queue.pop_front() else {
            break;
        };
        let pending = state
            .sessions
            .get(&id)
            .is_some_and(|e| e.session.status == SessionStatus::Pending);
        if pending {
            debug!(session_id = %id, "Promoting queued session");
            launch(inner, state, id);
        }
    }
}

fn persist(inner: &Inner, state: &State, id: Uuid) {
    if let Some(entry) = state.sessions.get(&id) {
        let _ = inner
            .persist
            .send(PersistOp::Save(Box::new(entry.session.clone())));
    }
}

/// Applies persistence operations in the order they were issued.
async fn persist_writer(
    repository: Arc<dyn SessionRepository>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        let result = match op {
            PersistOp::Save(session) => repository.save(&session).await,
            PersistOp::Delete(id) => repository.delete(id).await,
            PersistOp::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session record");
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Bridges pipeline callbacks into the session table.
struct SessionObserver {
    inner: Arc<Inner>,
    id: Uuid,
}

impl JobObserver for SessionObserver {
    fn provider_selected(&self, provider_id: &str) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.sessions.get_mut(&self.id) else {
            return;
        };
        if entry.session.status != SessionStatus::Running {
            return;
        }
        entry.session.provider_id = Some(provider_id.to_string());
        entry.session.updated_at = Utc::now();
        self.inner.events.emit(PlaybackEvent::SessionStarted {
            session_id: self.id,
            provider_id: provider_id.to_string(),
        });
        persist(&self.inner, &state, self.id);
    }

    fn progress(&self, fraction: f64) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.sessions.get_mut(&self.id) {
            if entry.session.status == SessionStatus::Running {
                entry.session.progress = (fraction * 100.0).clamp(0.0, 100.0);
                entry.session.updated_at = Utc::now();
            }
        }
    }

    fn segment_ready(&self, file: &str) {
        let hash = {
            let state = self.inner.state.lock();
            match state.sessions.get(&self.id) {
                Some(entry) if entry.session.status == SessionStatus::Running => {
                    entry.session.content_hash.clone()
                }
                _ => return,
            }
        };
        self.inner.events.emit(PlaybackEvent::SegmentReady {
            session_id: self.id,
            content_hash: hash,
            file: file.to_string(),
        });
    }
}
