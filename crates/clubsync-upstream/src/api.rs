use async_trait::async_trait;
use clubsync_core::{Club, Event, Member};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::normalize::{
    club_from_node, event_from_node, member_from_node, page_from_connection, Connection,
};
use crate::pager::Page;
use crate::transport::GraphqlClient;
use crate::UpstreamError;

const EVENT_FIELDS: &str = r#"
fragment EventFields on Event {
  id
  name
  details
  address { formatted }
  creator { id }
  coverPhoto { url }
  startsAt
  endsAt
  updatedAt
  club { id }
  rsvps { user { id } status }
}
"#;

const CLUB_QUERY: &str = r#"
query Club($clubId: ID!) {
  club(id: $clubId) { id name avatar { url } creator { id } }
}
"#;

const CLUB_EVENTS_QUERY: &str = r#"
query ClubEvents($clubId: ID!, $first: Int!, $after: String) {
  club(id: $clubId) {
    events(first: $first, after: $after) {
      edges { node { ...EventFields } }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

const UPCOMING_EVENTS_QUERY: &str = r#"
query UpcomingClubEvents($clubId: ID!, $first: Int!) {
  club(id: $clubId) {
    upcomingEvents(first: $first) {
      edges { node { ...EventFields } }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

const EVENT_QUERY: &str = r#"
query Event($eventId: ID!) {
  event(id: $eventId) { ...EventFields }
}
"#;

const EVENT_MEMBERS_QUERY: &str = r#"
query EventMembers($eventId: ID!, $first: Int!, $after: String) {
  event(id: $eventId) {
    members(first: $first, after: $after) {
      edges { node { id username displayName avatar { url } } }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

/// How many upcoming events the shallow auto-import query asks for.
pub const UPCOMING_EVENTS_LIMIT: u32 = 50;

/// The upstream operations the import pipeline depends on.
#[async_trait]
pub trait ClubApi: Send + Sync {
    async fn club(&self, cancel: &CancellationToken, club_id: &str) -> Result<Club, UpstreamError>;

    async fn events_page(
        &self,
        cancel: &CancellationToken,
        club_id: &str,
        after: Option<String>,
        first: u32,
    ) -> Result<Page<Event>, UpstreamError>;

    async fn members_page(
        &self,
        cancel: &CancellationToken,
        event_id: &str,
        after: Option<String>,
        first: u32,
    ) -> Result<Page<Member>, UpstreamError>;

    async fn event(&self, cancel: &CancellationToken, event_id: &str) -> Result<Event, UpstreamError>;

    /// Future and in-progress events only; a single shallow request.
    async fn upcoming_events(
        &self,
        cancel: &CancellationToken,
        club_id: &str,
    ) -> Result<Vec<Event>, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct ClubData {
    club: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ClubEventsData {
    club: Option<ClubEventsNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClubEventsNode {
    #[serde(alias = "upcomingEvents")]
    events: Connection,
}

#[derive(Debug, Deserialize)]
struct EventData {
    event: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct EventMembersData {
    event: Option<EventMembersNode>,
}

#[derive(Debug, Deserialize)]
struct EventMembersNode {
    members: Connection,
}

fn with_event_fields(query: &str) -> String {
    format!("{query}{EVENT_FIELDS}")
}

fn club_missing(club_id: &str) -> UpstreamError {
    UpstreamError::Graphql(format!("club {club_id} not found"))
}

#[async_trait]
impl ClubApi for GraphqlClient {
    async fn club(&self, cancel: &CancellationToken, club_id: &str) -> Result<Club, UpstreamError> {
        let data: ClubData = self
            .execute(cancel, CLUB_QUERY, json!({ "clubId": club_id }))
            .await?;
        let raw = data.club.ok_or_else(|| club_missing(club_id))?;
        club_from_node(raw)
    }

    async fn events_page(
        &self,
        cancel: &CancellationToken,
        club_id: &str,
        after: Option<String>,
        first: u32,
    ) -> Result<Page<Event>, UpstreamError> {
        let data: ClubEventsData = self
            .execute(
                cancel,
                &with_event_fields(CLUB_EVENTS_QUERY),
                json!({ "clubId": club_id, "first": first, "after": after }),
            )
            .await?;
        let club = data.club.ok_or_else(|| club_missing(club_id))?;
        page_from_connection(club.events, |node| event_from_node(node, club_id))
    }

    async fn members_page(
        &self,
        cancel: &CancellationToken,
        event_id: &str,
        after: Option<String>,
        first: u32,
    ) -> Result<Page<Member>, UpstreamError> {
        let data: EventMembersData = self
            .execute(
                cancel,
                EVENT_MEMBERS_QUERY,
                json!({ "eventId": event_id, "first": first, "after": after }),
            )
            .await?;
        let event = data.event.ok_or(UpstreamError::EventNotFound)?;
        page_from_connection(event.members, member_from_node)
    }

    async fn event(&self, cancel: &CancellationToken, event_id: &str) -> Result<Event, UpstreamError> {
        let data: EventData = self
            .execute(cancel, &with_event_fields(EVENT_QUERY), json!({ "eventId": event_id }))
            .await?;
        let raw = data.event.ok_or(UpstreamError::EventNotFound)?;
        let event = event_from_node(raw, "")?;
        if event.club_id.is_empty() {
            return Err(UpstreamError::Malformed(format!(
                "event {} has no club reference",
                event.id
            )));
        }
        Ok(event)
    }

    async fn upcoming_events(
        &self,
        cancel: &CancellationToken,
        club_id: &str,
    ) -> Result<Vec<Event>, UpstreamError> {
        let data: ClubEventsData = self
            .execute(
                cancel,
                &with_event_fields(UPCOMING_EVENTS_QUERY),
                json!({ "clubId": club_id, "first": UPCOMING_EVENTS_LIMIT }),
            )
            .await?;
        let club = data.club.ok_or_else(|| club_missing(club_id))?;
        Ok(page_from_connection(club.events, |node| event_from_node(node, club_id))?.items)
    }
}
