//! In-process [`ImportStore`] with the same conflict rules as Postgres. Used
//! by tests and dry runs; it also records the order of writes.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubsync_core::{Club, Event, ImportJob, ImportState, ImportStatus, Member, Rsvp, RsvpStatus};
use tokio::sync::Mutex;

use crate::{dedup_last, ImportStore, StoredEventRef};

/// One accepted write, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Members(Vec<String>),
    Clubs(Vec<String>),
    Events(Vec<String>),
    Rsvps { event_id: String, member_ids: Vec<String> },
}

/// Table contents without timestamps, for comparing two stores.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub clubs: BTreeMap<String, Club>,
    pub members: BTreeMap<String, Member>,
    pub events: BTreeMap<String, Event>,
    pub rsvps: BTreeMap<(String, String), RsvpStatus>,
}

#[derive(Debug, Clone)]
struct Stamped<T> {
    row: T,
    imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct JobRow {
    job: ImportJob,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_job_id: i64,
    jobs: Vec<JobRow>,
    clubs: BTreeMap<String, Stamped<Club>>,
    members: BTreeMap<String, Stamped<Member>>,
    events: BTreeMap<String, Stamped<Event>>,
    rsvps: BTreeMap<(String, String), Stamped<RsvpStatus>>,
    writes: Vec<WriteOp>,
    fail_upserts: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upsert fail, as a broken database would.
    pub async fn fail_upserts(&self, fail: bool) {
        self.inner.lock().await.fail_upserts = fail;
    }

    pub async fn writes(&self) -> Vec<WriteOp> {
        self.inner.lock().await.writes.clone()
    }

    /// Backdate an event's import time, to make it eligible for refresh.
    pub async fn set_event_imported_at(&self, event_id: &str, at: DateTime<Utc>) {
        if let Some(event) = self.inner.lock().await.events.get_mut(event_id) {
            event.imported_at = at;
        }
    }

    /// Events' RSVPs are left empty in the snapshot; see `rsvps`.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().await;
        Snapshot {
            clubs: inner
                .clubs
                .iter()
                .map(|(id, s)| (id.clone(), s.row.clone()))
                .collect(),
            members: inner
                .members
                .iter()
                .map(|(id, s)| (id.clone(), s.row.clone()))
                .collect(),
            events: inner
                .events
                .iter()
                .map(|(id, s)| {
                    let mut event = s.row.clone();
                    event.rsvps.clear();
                    (id.clone(), event)
                })
                .collect(),
            rsvps: inner
                .rsvps
                .iter()
                .map(|(key, s)| (key.clone(), s.row.clone()))
                .collect(),
        }
    }
}

impl Inner {
    fn check_writable(&self) -> Result<()> {
        if self.fail_upserts {
            bail!("storage unavailable");
        }
        Ok(())
    }

    fn job_row_mut(&mut self, id: i64) -> Result<&mut JobRow> {
        self.jobs
            .iter_mut()
            .find(|row| row.job.id == id)
            .ok_or_else(|| anyhow!("import job {id} does not exist"))
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_job(&self, club_id: &str) -> Result<ImportJob> {
        let mut inner = self.inner.lock().await;
        inner.next_job_id += 1;
        let job = ImportJob {
            id: inner.next_job_id,
            club_id: club_id.to_string(),
            status: ImportStatus::Pending,
            state: ImportState::new(),
            created_at: Utc::now(),
            last_tried_at: None,
            completed_at: None,
            error: String::new(),
        };
        inner.jobs.push(JobRow {
            job: job.clone(),
            locked_until: None,
        });
        Ok(job)
    }

    async fn claim_next_job(&self, lease: Duration) -> Result<Option<ImportJob>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let next = inner
            .jobs
            .iter_mut()
            .filter(|row| row.job.status == ImportStatus::Pending)
            .filter(|row| row.locked_until.map_or(true, |until| until < now))
            // `None` sorts before `Some`, so never-tried jobs come first.
            .min_by_key(|row| (row.job.last_tried_at, row.job.created_at, row.job.id));
        let Some(row) = next else {
            return Ok(None);
        };
        row.job.last_tried_at = Some(now);
        row.locked_until = Some(now + chrono::Duration::from_std(lease)?);
        Ok(Some(row.job.clone()))
    }

    async fn checkpoint_job(&self, job: &ImportJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.job_row_mut(job.id)?.job.state = job.state.clone();
        Ok(())
    }

    async fn save_job(&self, job: &ImportJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner.job_row_mut(job.id)?;
        row.job.status = job.status;
        row.job.state = job.state.clone();
        row.job.last_tried_at = job.last_tried_at;
        row.job.completed_at = job.completed_at;
        row.job.error = job.error.clone();
        row.locked_until = None;
        Ok(())
    }

    async fn find_job(&self, id: i64) -> Result<Option<ImportJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .iter()
            .find(|row| row.job.id == id)
            .map(|row| row.job.clone()))
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImportJob>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<ImportJob> = inner.jobs.iter().map(|row| row.job.clone()).collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        jobs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(jobs)
    }

    async fn has_job_for_club(&self, club_id: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.iter().any(|row| row.job.club_id == club_id))
    }

    async fn upsert_members(&self, members: &[Member]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let now = Utc::now();
        let members = dedup_last(members, |m| m.id.clone());
        for member in &members {
            let existing = inner.members.contains_key(&member.id);
            if existing && member.is_placeholder() {
                continue;
            }
            inner.members.insert(
                member.id.clone(),
                Stamped {
                    row: (*member).clone(),
                    imported_at: now,
                },
            );
        }
        inner
            .writes
            .push(WriteOp::Members(members.iter().map(|m| m.id.clone()).collect()));
        Ok(())
    }

    async fn upsert_clubs(&self, clubs: &[Club]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let now = Utc::now();
        let clubs = dedup_last(clubs, |c| c.id.clone());
        for club in &clubs {
            let mut row = (*club).clone();
            if let Some(existing) = inner.clubs.get(&club.id) {
                row.auto_import = existing.row.auto_import;
                row.last_auto_import = existing.row.last_auto_import;
            } else {
                row.auto_import = false;
                row.last_auto_import = None;
            }
            inner.clubs.insert(club.id.clone(), Stamped { row, imported_at: now });
        }
        inner
            .writes
            .push(WriteOp::Clubs(clubs.iter().map(|c| c.id.clone()).collect()));
        Ok(())
    }

    async fn upsert_events(&self, events: &[Event]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let now = Utc::now();
        let events = dedup_last(events, |e| e.id.clone());
        for event in &events {
            if let Some(existing) = inner.events.get(&event.id) {
                if let (Some(stored), Some(incoming)) = (existing.row.updated_at, event.updated_at) {
                    if incoming < stored {
                        continue;
                    }
                }
            }
            let mut row = (*event).clone();
            row.rsvps.clear();
            inner.events.insert(event.id.clone(), Stamped { row, imported_at: now });
        }
        inner
            .writes
            .push(WriteOp::Events(events.iter().map(|e| e.id.clone()).collect()));
        Ok(())
    }

    async fn upsert_rsvps(&self, event_id: &str, rsvps: &[Rsvp]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let rsvps = dedup_last(rsvps, |r| r.user_id.clone());
        if !inner.events.contains_key(event_id) {
            bail!("rsvps reference unknown event {event_id}");
        }
        if let Some(missing) = rsvps.iter().find(|r| !inner.members.contains_key(&r.user_id)) {
            bail!("rsvp for event {event_id} references unknown member {}", missing.user_id);
        }
        let now = Utc::now();
        for rsvp in &rsvps {
            let key = (event_id.to_string(), rsvp.user_id.clone());
            let status = match inner.rsvps.get(&key) {
                Some(existing) if existing.row == RsvpStatus::CheckedIn => RsvpStatus::CheckedIn,
                _ => rsvp.status.clone(),
            };
            inner.rsvps.insert(key, Stamped { row: status, imported_at: now });
        }
        inner.writes.push(WriteOp::Rsvps {
            event_id: event_id.to_string(),
            member_ids: rsvps.iter().map(|r| r.user_id.clone()).collect(),
        });
        Ok(())
    }

    async fn clubs_due_for_auto_import(&self, before: DateTime<Utc>) -> Result<Vec<Club>> {
        let inner = self.inner.lock().await;
        let mut clubs: Vec<Club> = inner
            .clubs
            .values()
            .map(|s| &s.row)
            .filter(|c| c.auto_import && c.last_auto_import.map_or(true, |at| at < before))
            .cloned()
            .collect();
        clubs.sort_by(|a, b| (a.last_auto_import, &a.id).cmp(&(b.last_auto_import, &b.id)));
        Ok(clubs)
    }

    async fn mark_auto_imported(&self, club_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(club) = inner.clubs.get_mut(club_id) {
            club.row.last_auto_import = Some(at);
        }
        Ok(())
    }

    async fn set_auto_import(&self, club_id: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        inner
            .clubs
            .entry(club_id.to_string())
            .or_insert_with(|| Stamped {
                row: Club {
                    id: club_id.to_string(),
                    name: String::new(),
                    avatar_url: None,
                    creator_id: None,
                    auto_import: false,
                    last_auto_import: None,
                    raw: serde_json::Value::Null,
                },
                imported_at: now,
            })
            .row
            .auto_import = enabled;
        Ok(())
    }

    async fn known_event_ids(&self, club_id: &str) -> Result<HashSet<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .values()
            .filter(|s| s.row.club_id == club_id)
            .map(|s| s.row.id.clone())
            .collect())
    }

    async fn stalest_event(&self, before: DateTime<Utc>) -> Result<Option<StoredEventRef>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .values()
            .filter(|s| s.imported_at < before)
            .min_by_key(|s| (s.imported_at, s.row.id.clone()))
            .map(|s| StoredEventRef {
                id: s.row.id.clone(),
                club_id: s.row.club_id.clone(),
                imported_at: s.imported_at,
            }))
    }

    async fn touch_event(&self, event_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(event_id) {
            event.imported_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.rsvps.retain(|(event, _), _| event != event_id);
        Ok(inner.events.remove(event_id).is_some())
    }

    async fn club(&self, club_id: &str) -> Result<Option<Club>> {
        let inner = self.inner.lock().await;
        Ok(inner.clubs.get(club_id).map(|s| s.row.clone()))
    }

    async fn club_events(&self, club_id: &str) -> Result<Vec<Event>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<Event> = inner
            .events
            .values()
            .filter(|s| s.row.club_id == club_id)
            .map(|s| {
                let mut event = s.row.clone();
                event.rsvps = inner
                    .rsvps
                    .iter()
                    .filter(|((event_id, _), _)| *event_id == event.id)
                    .map(|((_, member_id), status)| Rsvp {
                        user_id: member_id.clone(),
                        status: status.row.clone(),
                    })
                    .collect();
                event
            })
            .collect();
        // Postgres orders NULL start times last.
        events.sort_by(|a, b| {
            (a.starts_at.is_none(), a.starts_at, &a.id).cmp(&(b.starts_at.is_none(), b.starts_at, &b.id))
        });
        Ok(events)
    }

    async fn club_members(&self, club_id: &str) -> Result<Vec<Member>> {
        let inner = self.inner.lock().await;
        let event_ids: HashSet<&str> = inner
            .events
            .values()
            .filter(|s| s.row.club_id == club_id)
            .map(|s| s.row.id.as_str())
            .collect();
        let member_ids: HashSet<&str> = inner
            .rsvps
            .keys()
            .filter(|(event_id, _)| event_ids.contains(event_id.as_str()))
            .map(|(_, member_id)| member_id.as_str())
            .collect();
        Ok(inner
            .members
            .values()
            .filter(|s| member_ids.contains(s.row.id.as_str()))
            .map(|s| s.row.clone())
            .collect())
    }
}
