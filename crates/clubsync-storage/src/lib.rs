//! Persistence for clubsync: idempotent upserts of imported rows and the
//! durable import job records that make imports resumable.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubsync_core::{Club, Event, ImportJob, Member, Rsvp};

pub mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "clubsync-storage";

/// Identity of a stored event, as picked by the staleness refresher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEventRef {
    pub id: String,
    pub club_id: String,
    pub imported_at: DateTime<Utc>,
}

/// Storage used by the import pipeline and its collaborators.
///
/// Every upsert is keyed by the upstream id (RSVPs by event and member), runs
/// as one all-or-nothing batch, and follows these conflict rules:
/// - a placeholder member never overwrites an existing member row;
/// - an event is only overwritten by data whose upstream `updated_at` is not
///   older than what is stored;
/// - a `CHECKED_IN` RSVP is never moved back to another status;
/// - club auto-import settings are never changed by an import upsert.
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_job(&self, club_id: &str) -> Result<ImportJob>;

    /// Atomically claim the pending job tried least recently (never-tried
    /// first, then oldest). The claim is leased for `lease`; a worker that
    /// dies mid-attempt releases it when the lease runs out.
    async fn claim_next_job(&self, lease: Duration) -> Result<Option<ImportJob>>;

    /// Persist the job's import state without touching status or lease.
    async fn checkpoint_job(&self, job: &ImportJob) -> Result<()>;

    /// Persist status, state, timestamps and error, and release the lease.
    async fn save_job(&self, job: &ImportJob) -> Result<()>;

    async fn find_job(&self, id: i64) -> Result<Option<ImportJob>>;

    /// Newest jobs first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImportJob>>;

    async fn has_job_for_club(&self, club_id: &str) -> Result<bool>;

    async fn upsert_members(&self, members: &[Member]) -> Result<()>;

    async fn upsert_clubs(&self, clubs: &[Club]) -> Result<()>;

    async fn upsert_events(&self, events: &[Event]) -> Result<()>;

    /// Every referenced member must already be stored.
    async fn upsert_rsvps(&self, event_id: &str, rsvps: &[Rsvp]) -> Result<()>;

    /// Clubs flagged for auto-import that were never auto-imported or were
    /// last auto-imported before `before`.
    async fn clubs_due_for_auto_import(&self, before: DateTime<Utc>) -> Result<Vec<Club>>;

    async fn mark_auto_imported(&self, club_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Creates a bare club row if the club is not known yet.
    async fn set_auto_import(&self, club_id: &str, enabled: bool) -> Result<()>;

    async fn known_event_ids(&self, club_id: &str) -> Result<HashSet<String>>;

    /// The event imported least recently, if it was imported before `before`.
    async fn stalest_event(&self, before: DateTime<Utc>) -> Result<Option<StoredEventRef>>;

    async fn touch_event(&self, event_id: &str) -> Result<()>;

    /// Removes the event and its RSVPs. Returns whether a row existed.
    async fn delete_event(&self, event_id: &str) -> Result<bool>;

    async fn club(&self, club_id: &str) -> Result<Option<Club>>;

    /// Events of a club ordered by start time, with their RSVPs.
    async fn club_events(&self, club_id: &str) -> Result<Vec<Event>>;

    /// Members with an RSVP to any of the club's events, ordered by id.
    async fn club_members(&self, club_id: &str) -> Result<Vec<Member>>;
}

/// Collapse duplicate keys inside one batch, last occurrence wins. A single
/// upsert statement may not touch the same row twice.
pub(crate) fn dedup_last<'a, T, K: Ord>(
    items: &'a [T],
    key: impl Fn(&T) -> K,
) -> Vec<&'a T> {
    let mut by_key = BTreeMap::new();
    for item in items {
        by_key.insert(key(item), item);
    }
    by_key.into_values().collect()
}
