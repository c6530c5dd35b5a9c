//! Periodic reclamation of abandoned sessions and stale content.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionManager, SweepReport};
use crate::content::{ContentStore, RecoveryReport};

/// Everything one cleanup pass reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions: SweepReport,
    pub store: RecoveryReport,
    pub content_expired: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs session sweeps and content-store maintenance together.
pub struct CleanupService {
    sessions: SessionManager,
    store: Arc<ContentStore>,
    /// Committed entries unused for longer than this are deleted
    retention: Option<Duration>,
}

impl CleanupService {
    pub fn new(sessions: SessionManager, store: Arc<ContentStore>, retention: Option<Duration>) -> Self {
        Self {
            sessions,
            store,
            retention,
        }
    }

    /// One pass. Store failures are logged; they never abort the session sweep.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport {
            sessions: self.sessions.sweep().await,
            ..CleanupReport::default()
        };

        match self.store.remove_incomplete().await {
            Ok(recovered) => report.store = recovered,
            Err(e) => warn!(error = %e, "Failed to remove incomplete content"),
        }

        if let Some(retention) = self.retention {
            match self.store.expired(retention).await {
                Ok(hashes) => {
                    for hash in hashes {
                        match self.store.delete(&hash).await {
                            Ok(true) => report.content_expired += 1,
                            Ok(false) => {}
                            Err(e) => warn!(%hash, error = %e, "Failed to delete expired content"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list expired content"),
            }
        }

        if report.is_empty() {
            debug!("Cleanup pass found nothing to reclaim");
        } else {
            info!(?report, "Cleanup pass finished");
        }
        report
    }

    /// Runs a pass every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cleanup loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}
