use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clubsync_core::{ImportJob, ImportStatus};
use clubsync_storage::ImportStore;
use clubsync_upstream::ClubApi;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::import::{ImportError, ImportRunner, StepOutcome};
use crate::SyncConfig;

/// What to do with a job whose attempt ended in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the job pending; the next claim resumes from the last checkpoint.
    Retry,
    /// Mark the job failed and keep its state for inspection.
    Fail,
}

pub fn classify(err: &ImportError) -> Disposition {
    match err.upstream() {
        Some(source) if source.is_transient() => Disposition::Retry,
        _ => Disposition::Fail,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed,
    ContinueLater,
    Retry(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub job_id: i64,
    pub club_id: String,
    pub outcome: AttemptOutcome,
}

impl TickReport {
    /// Whether the worker should go straight back for another claim.
    pub fn made_progress(&self) -> bool {
        matches!(
            self.outcome,
            AttemptOutcome::Completed | AttemptOutcome::ContinueLater
        )
    }
}

/// The single import worker: claims one job at a time and advances it.
pub struct ImportWorker {
    store: Arc<dyn ImportStore>,
    runner: ImportRunner,
    attempt_timeout: Duration,
    poll_interval: Duration,
}

impl ImportWorker {
    pub fn new(store: Arc<dyn ImportStore>, api: Arc<dyn ClubApi>, config: &SyncConfig) -> Self {
        Self {
            runner: ImportRunner::new(
                store.clone(),
                api,
                config.event_page_size,
                config.member_page_size,
            ),
            store,
            attempt_timeout: config.attempt_timeout,
            poll_interval: config.poll_interval,
        }
    }

    /// Claim and advance at most one job. `None` when nothing was pending.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<Option<TickReport>> {
        let Some(job) = self.store.claim_next_job(self.attempt_timeout).await? else {
            return Ok(None);
        };

        let span = info_span!("import_job", job_id = job.id, club_id = %job.club_id);
        self.attempt(job, cancel).instrument(span).await.map(Some)
    }

    async fn attempt(&self, mut job: ImportJob, cancel: &CancellationToken) -> Result<TickReport> {
        let started_at = Utc::now();
        let attempt = tokio::time::timeout(
            self.attempt_timeout,
            self.runner.advance(&mut job, cancel),
        )
        .await;
        job.last_tried_at = Some(started_at);

        let outcome = match attempt {
            Ok(Ok(StepOutcome::Completed)) => {
                job.status = ImportStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.error.clear();
                info!("import completed");
                AttemptOutcome::Completed
            }
            Ok(Ok(StepOutcome::ContinueLater)) => {
                job.error.clear();
                debug!(pending_events = job.state.pending_events.len(), "import continues later");
                AttemptOutcome::ContinueLater
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                job.error = message.clone();
                match classify(&err) {
                    Disposition::Retry => {
                        warn!(error = %message, "import attempt failed; will retry");
                        AttemptOutcome::Retry(message)
                    }
                    Disposition::Fail => {
                        job.status = ImportStatus::Failed;
                        error!(error = %message, "import failed");
                        AttemptOutcome::Failed(message)
                    }
                }
            }
            Err(_elapsed) => {
                let message = format!("attempt timed out after {}s", self.attempt_timeout.as_secs());
                job.error = message.clone();
                warn!("{message}; will retry");
                AttemptOutcome::Retry(message)
            }
        };

        self.store.save_job(&job).await?;
        Ok(TickReport {
            job_id: job.id,
            club_id: job.club_id,
            outcome,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval = ?self.poll_interval, "import worker started");
        while !cancel.is_cancelled() {
            let progressed = match self.tick(&cancel).await {
                Ok(Some(report)) => report.made_progress(),
                Ok(None) => false,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "import worker tick failed");
                    false
                }
            };
            if progressed {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("import worker stopped");
    }
}
