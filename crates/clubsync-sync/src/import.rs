use std::sync::Arc;

use anyhow::Context;
use clubsync_core::{ImportJob, Member};
use clubsync_storage::ImportStore;
use clubsync_upstream::{ClubApi, CursorWalk, UpstreamError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::flush::flush_event;

/// Result of one bounded unit of import work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Progress was checkpointed; the job should be claimed again.
    ContinueLater,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: UpstreamError,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ImportError {
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            Self::Upstream { source, .. } => Some(source),
            Self::Storage(_) => None,
        }
    }
}

fn upstream(context: impl Into<String>) -> impl FnOnce(UpstreamError) -> ImportError {
    let context = context.into();
    move |source| ImportError::Upstream { context, source }
}

/// Drives an [`ImportJob`] through the club profile, the event listing and
/// each event's member pages, checkpointing after every page.
#[derive(Clone)]
pub struct ImportRunner {
    store: Arc<dyn ImportStore>,
    api: Arc<dyn ClubApi>,
    event_page_size: u32,
    member_page_size: u32,
}

impl ImportRunner {
    pub fn new(
        store: Arc<dyn ImportStore>,
        api: Arc<dyn ClubApi>,
        event_page_size: u32,
        member_page_size: u32,
    ) -> Self {
        Self {
            store,
            api,
            event_page_size: event_page_size.max(1),
            member_page_size: member_page_size.max(1),
        }
    }

    /// Run until the job completes or yields with `ContinueLater`.
    ///
    /// `job.state` is always a valid resume point when this returns, including
    /// on error or when the future is dropped.
    pub async fn advance(
        &self,
        job: &mut ImportJob,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ImportError> {
        let span = info_span!("import_advance", job_id = job.id, club_id = %job.club_id);
        self.advance_inner(job, cancel).instrument(span).await
    }

    async fn advance_inner(
        &self,
        job: &mut ImportJob,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ImportError> {
        if !job.state.club_synced {
            match self.sync_club(job, cancel).await {
                Err(ImportError::Upstream {
                    source: UpstreamError::UnsupportedMeetup,
                    ..
                }) => {
                    info!("club is not importable upstream; nothing to do");
                    return Ok(StepOutcome::Completed);
                }
                other => other?,
            }
        }

        if job.state.needs_event_page() {
            self.fetch_event_page(job, cancel).await?;
        }

        loop {
            let Some(head) = job.state.head().cloned() else {
                return Ok(if job.state.event_listing_done {
                    StepOutcome::Completed
                } else {
                    StepOutcome::ContinueLater
                });
            };

            let mut walk = CursorWalk::resume(job.state.member_cursor.clone());
            let fetched = walk
                .step(|after| {
                    self.api
                        .members_page(cancel, &head.id, after, self.member_page_size)
                })
                .await;

            let members = match fetched {
                Ok(members) => members,
                Err(err) if err.is_skippable() => {
                    warn!(event_id = %head.id, error = %err, "skipping event");
                    job.state.finish_head();
                    self.checkpoint(job).await?;
                    continue;
                }
                Err(err) => return Err(upstream(format!("members of event {}", head.id))(err)),
            };

            let exhausted = walk.is_exhausted();
            let added = job.state.merge_members(members, walk.into_cursor());
            debug!(event_id = %head.id, added, total = job.state.accumulated_members.len(), "member page");

            if !exhausted {
                self.checkpoint(job).await?;
                return Ok(StepOutcome::ContinueLater);
            }

            let members: Vec<Member> = job.state.accumulated_members.values().cloned().collect();
            flush_event(self.store.as_ref(), &head, members).await?;
            job.state.finish_head();
            self.checkpoint(job).await?;
            info!(event_id = %head.id, remaining = job.state.pending_events.len(), "event imported");
        }
    }

    async fn sync_club(&self, job: &mut ImportJob, cancel: &CancellationToken) -> Result<(), ImportError> {
        let club = self
            .api
            .club(cancel, &job.club_id)
            .await
            .map_err(upstream(format!("club {}", job.club_id)))?;

        if let Some(creator_id) = &club.creator_id {
            self.store
                .upsert_members(&[Member::placeholder(creator_id.as_str())])
                .await
                .with_context(|| format!("storing creator of club {}", club.id))?;
        }
        self.store
            .upsert_clubs(std::slice::from_ref(&club))
            .await
            .with_context(|| format!("storing club {}", club.id))?;

        job.state.club_synced = true;
        self.checkpoint(job).await?;
        info!(club_name = %club.name, "club profile imported");
        Ok(())
    }

    async fn fetch_event_page(&self, job: &mut ImportJob, cancel: &CancellationToken) -> Result<(), ImportError> {
        let mut walk = CursorWalk::resume(job.state.event_cursor.clone());
        let club_id = job.club_id.clone();
        let events = walk
            .step(|after| {
                self.api
                    .events_page(cancel, &club_id, after, self.event_page_size)
            })
            .await
            .map_err(upstream(format!("events of club {club_id}")))?;

        let listing_done = walk.is_exhausted();
        info!(events = events.len(), listing_done, "event page fetched");
        job.state
            .enqueue_events(events, walk.into_cursor(), listing_done);
        self.checkpoint(job).await
    }

    async fn checkpoint(&self, job: &ImportJob) -> Result<(), ImportError> {
        self.store
            .checkpoint_job(job)
            .await
            .with_context(|| format!("checkpointing import job {}", job.id))?;
        Ok(())
    }
}
