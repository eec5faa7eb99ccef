//! Scripted upstream used by the pipeline tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use clubsync_core::{Club, Event, Member, Rsvp, RsvpStatus};
use clubsync_upstream::{ClubApi, Page, UpstreamError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Script {
    clubs: HashMap<String, Club>,
    unsupported_clubs: HashSet<String>,
    listings: HashMap<String, Vec<Event>>,
    members: HashMap<String, Vec<Member>>,
    missing_events: HashSet<String>,
    upcoming: HashMap<String, Vec<Event>>,
    failures: HashMap<&'static str, VecDeque<UpstreamError>>,
    hang: HashSet<&'static str>,
    calls: Vec<String>,
}

/// In-memory upstream. Cursors are offsets into the scripted lists.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    script: Mutex<Script>,
}

pub(crate) fn club(id: &str, creator: &str) -> Club {
    Club {
        id: id.into(),
        name: format!("Club {id}"),
        avatar_url: None,
        creator_id: Some(creator.into()),
        auto_import: false,
        last_auto_import: None,
        raw: json!({ "id": id }),
    }
}

pub(crate) fn member(id: &str) -> Member {
    Member {
        id: id.into(),
        username: id.into(),
        display_name: format!("Member {id}"),
        avatar_url: Some(format!("https://img.example/{id}.png")),
        raw: json!({ "id": id }),
    }
}

pub(crate) fn event(id: &str, club_id: &str, creator: &str, rsvp_users: &[&str]) -> Event {
    Event {
        id: id.into(),
        club_id: club_id.into(),
        name: format!("Event {id}"),
        details: String::new(),
        address: None,
        creator_id: Some(creator.into()),
        cover_photo_url: None,
        starts_at: None,
        ends_at: None,
        updated_at: Some("2026-01-01T00:00:00Z".parse().unwrap()),
        rsvps: rsvp_users
            .iter()
            .map(|user| Rsvp {
                user_id: (*user).into(),
                status: RsvpStatus::Accepted,
            })
            .collect(),
        raw: json!({ "id": id }),
    }
}

fn page<T: Clone>(items: &[T], after: Option<String>, first: u32) -> Page<T> {
    let start = after.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0).min(items.len());
    let end = (start + first as usize).min(items.len());
    Page {
        items: items[start..end].to_vec(),
        end_cursor: Some(end.to_string()),
        has_next_page: end < items.len(),
    }
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_club(self, club: Club) -> Self {
        self.script.lock().unwrap().clubs.insert(club.id.clone(), club);
        self
    }

    pub(crate) fn with_unsupported_club(self, club_id: &str) -> Self {
        self.script.lock().unwrap().unsupported_clubs.insert(club_id.into());
        self
    }

    pub(crate) fn with_listing(self, club_id: &str, events: Vec<Event>) -> Self {
        self.script.lock().unwrap().listings.insert(club_id.into(), events);
        self
    }

    pub(crate) fn with_members(self, event_id: &str, members: Vec<Member>) -> Self {
        self.script.lock().unwrap().members.insert(event_id.into(), members);
        self
    }

    pub(crate) fn with_upcoming(self, club_id: &str, events: Vec<Event>) -> Self {
        self.script.lock().unwrap().upcoming.insert(club_id.into(), events);
        self
    }

    pub(crate) fn remove_event(&self, event_id: &str) {
        self.script.lock().unwrap().missing_events.insert(event_id.into());
    }

    /// The next call to `op` fails with `err`. Queued failures stack up.
    pub(crate) fn fail_next(&self, op: &'static str, err: UpstreamError) {
        self.script
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Every call to `op` waits forever.
    pub(crate) fn hang(&self, op: &'static str) {
        self.script.lock().unwrap().hang.insert(op);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Record the call and decide whether it hangs or fails.
    fn enter(&self, op: &'static str, key: &str) -> Result<bool, UpstreamError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(format!("{op}:{key}"));
        if let Some(err) = script.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(script.hang.contains(op))
    }

    async fn gate(&self, op: &'static str, key: &str, cancel: &CancellationToken) -> Result<(), UpstreamError> {
        if self.enter(op, key)? {
            cancel.cancelled().await;
            return Err(UpstreamError::Cancelled);
        }
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl ClubApi for ScriptedApi {
    async fn club(&self, cancel: &CancellationToken, club_id: &str) -> Result<Club, UpstreamError> {
        self.gate("club", club_id, cancel).await?;
        let script = self.script.lock().unwrap();
        if script.unsupported_clubs.contains(club_id) {
            return Err(UpstreamError::UnsupportedMeetup);
        }
        script
            .clubs
            .get(club_id)
            .cloned()
            .ok_or_else(|| UpstreamError::Graphql(format!("club {club_id} not found")))
    }

    async fn events_page(
        &self,
        cancel: &CancellationToken,
        club_id: &str,
        after: Option<String>,
        first: u32,
    ) -> Result<Page<Event>, UpstreamError> {
        self.gate("events_page", club_id, cancel).await?;
        let script = self.script.lock().unwrap();
        let events = script.listings.get(club_id).cloned().unwrap_or_default();
        Ok(page(&events, after, first))
    }

    async fn members_page(
        &self,
        cancel: &CancellationToken,
        event_id: &str,
        after: Option<String>,
        first: u32,
    ) -> Result<Page<Member>, UpstreamError> {
        self.gate("members_page", event_id, cancel).await?;
        let script = self.script.lock().unwrap();
        if script.missing_events.contains(event_id) {
            return Err(UpstreamError::EventNotFound);
        }
        let members = script.members.get(event_id).cloned().unwrap_or_default();
        Ok(page(&members, after, first))
    }

    async fn event(&self, cancel: &CancellationToken, event_id: &str) -> Result<Event, UpstreamError> {
        self.gate("event", event_id, cancel).await?;
        let script = self.script.lock().unwrap();
        if script.missing_events.contains(event_id) {
            return Err(UpstreamError::EventNotFound);
        }
        script
            .listings
            .values()
            .chain(script.upcoming.values())
            .flatten()
            .find(|event| event.id == event_id)
            .cloned()
            .ok_or(UpstreamError::EventNotFound)
    }

    async fn upcoming_events(
        &self,
        cancel: &CancellationToken,
        club_id: &str,
    ) -> Result<Vec<Event>, UpstreamError> {
        self.gate("upcoming", club_id, cancel).await?;
        let script = self.script.lock().unwrap();
        if script.unsupported_clubs.contains(club_id) {
            return Err(UpstreamError::UnsupportedMeetup);
        }
        Ok(script.upcoming.get(club_id).cloned().unwrap_or_default())
    }
}
