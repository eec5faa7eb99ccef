//! Operations exposed to collaborators (the HTTP API and the CLI).

use anyhow::{ensure, Result};
use clubsync_core::{Event, ImportJob, Member};
use clubsync_storage::ImportStore;
use tracing::info;

/// Queue a full history import for a club.
pub async fn submit_club_import(store: &dyn ImportStore, club_id: &str) -> Result<ImportJob> {
    let club_id = club_id.trim();
    ensure!(!club_id.is_empty(), "club id must not be empty");
    let job = store.create_job(club_id).await?;
    info!(job_id = job.id, club_id, "club import submitted");
    Ok(job)
}

/// Most recent jobs first.
pub async fn current_jobs(store: &dyn ImportStore, limit: i64) -> Result<Vec<ImportJob>> {
    store.list_jobs(limit.clamp(1, 500)).await
}

pub async fn club_events(store: &dyn ImportStore, club_id: &str) -> Result<Vec<Event>> {
    store.club_events(club_id).await
}

pub async fn club_members(store: &dyn ImportStore, club_id: &str) -> Result<Vec<Member>> {
    store.club_members(club_id).await
}

pub async fn set_auto_import(store: &dyn ImportStore, club_id: &str, enabled: bool) -> Result<()> {
    let club_id = club_id.trim();
    ensure!(!club_id.is_empty(), "club id must not be empty");
    store.set_auto_import(club_id, enabled).await?;
    info!(club_id, enabled, "auto-import updated");
    Ok(())
}
