//! Decoding of upstream GraphQL nodes into the core domain records.

use chrono::{DateTime, Utc};
use clubsync_core::{Club, Event, Member, Rsvp, RsvpStatus};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::pager::Page;
use crate::UpstreamError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Photo {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Address {
    formatted: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RsvpNode {
    user: IdRef,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventNode {
    id: String,
    name: Option<String>,
    details: Option<String>,
    address: Option<Address>,
    creator: Option<IdRef>,
    cover_photo: Option<Photo>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    club: Option<IdRef>,
    rsvps: Option<Vec<RsvpNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberNode {
    id: String,
    username: Option<String>,
    display_name: Option<String>,
    avatar: Option<Photo>,
}

#[derive(Debug, Deserialize)]
struct ClubNode {
    id: String,
    name: Option<String>,
    avatar: Option<Photo>,
    creator: Option<IdRef>,
}

fn decode_node<T: DeserializeOwned>(kind: &str, raw: &JsonValue) -> Result<T, UpstreamError> {
    T::deserialize(raw).map_err(|err| UpstreamError::Malformed(format!("decoding {kind} node: {err}")))
}

pub fn event_from_node(raw: JsonValue, club_id: &str) -> Result<Event, UpstreamError> {
    let node: EventNode = decode_node("event", &raw)?;
    let rsvps = node
        .rsvps
        .unwrap_or_default()
        .into_iter()
        .map(|rsvp| Rsvp {
            user_id: rsvp.user.id,
            status: RsvpStatus::from(rsvp.status),
        })
        .collect();

    Ok(Event {
        id: node.id,
        club_id: node.club.map(|club| club.id).unwrap_or_else(|| club_id.to_string()),
        name: node.name.unwrap_or_default(),
        details: node.details.unwrap_or_default(),
        address: node.address.and_then(|a| a.formatted),
        creator_id: node.creator.map(|c| c.id),
        cover_photo_url: node.cover_photo.and_then(|p| p.url),
        starts_at: node.starts_at,
        ends_at: node.ends_at,
        updated_at: node.updated_at,
        rsvps,
        raw,
    })
}

pub fn member_from_node(raw: JsonValue) -> Result<Member, UpstreamError> {
    let node: MemberNode = decode_node("member", &raw)?;
    Ok(Member {
        id: node.id,
        username: node.username.unwrap_or_default(),
        display_name: node.display_name.unwrap_or_default(),
        avatar_url: node.avatar.and_then(|a| a.url),
        raw,
    })
}

pub fn club_from_node(raw: JsonValue) -> Result<Club, UpstreamError> {
    let node: ClubNode = decode_node("club", &raw)?;
    Ok(Club {
        id: node.id,
        name: node.name.unwrap_or_default(),
        avatar_url: node.avatar.and_then(|a| a.url),
        creator_id: node.creator.map(|c| c.id),
        auto_import: false,
        last_auto_import: None,
        raw,
    })
}

pub(crate) fn page_from_connection<T>(
    connection: Connection,
    mut convert: impl FnMut(JsonValue) -> Result<T, UpstreamError>,
) -> Result<Page<T>, UpstreamError> {
    let items = connection
        .edges
        .into_iter()
        .map(|edge| convert(edge.node))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page {
        items,
        end_cursor: connection.page_info.end_cursor,
        has_next_page: connection.page_info.has_next_page,
    })
}
