//! Core domain model for clubsync: clubs, events, members and import jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod state;

pub use state::ImportState;

pub const CRATE_NAME: &str = "clubsync-core";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Club {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub creator_id: Option<String>,
    pub auto_import: bool,
    pub last_auto_import: Option<DateTime<Utc>>,
    pub raw: JsonValue,
}

/// A person known to the upstream service.
///
/// Rows created only because an RSVP or an event creator referenced them carry
/// empty display fields; see [`Member::placeholder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub raw: JsonValue,
}

impl Member {
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: String::new(),
            display_name: String::new(),
            avatar_url: None,
            raw: JsonValue::Null,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.username.is_empty() && self.display_name.is_empty() && self.avatar_url.is_none()
    }
}

/// RSVP state as reported upstream. Unknown values are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RsvpStatus {
    Accepted,
    Declined,
    CheckedIn,
    Waitlisted,
    Other(String),
}

impl RsvpStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Declined => "DECLINED",
            Self::CheckedIn => "CHECKED_IN",
            Self::Waitlisted => "WAITLISTED",
            Self::Other(other) => other,
        }
    }
}

impl From<String> for RsvpStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ACCEPTED" => Self::Accepted,
            "DECLINED" => Self::Declined,
            "CHECKED_IN" => Self::CheckedIn,
            "WAITLISTED" => Self::Waitlisted,
            _ => Self::Other(value),
        }
    }
}

impl From<RsvpStatus> for String {
    fn from(value: RsvpStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RsvpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rsvp {
    pub user_id: String,
    pub status: RsvpStatus,
}

/// Normalized upstream event. `raw` keeps the node exactly as received so
/// fields can be re-derived later without refetching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub club_id: String,
    pub name: String,
    pub details: String,
    pub address: Option<String>,
    pub creator_id: Option<String>,
    pub cover_photo_url: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub rsvps: Vec<Rsvp>,
    pub raw: JsonValue,
}

impl Event {
    /// Every member id this event references: its creator and each RSVP user.
    pub fn referenced_member_ids(&self) -> impl Iterator<Item = &str> {
        self.creator_id
            .as_deref()
            .into_iter()
            .chain(self.rsvps.iter().map(|rsvp| rsvp.user_id.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Pending,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownImportStatus(pub String);

impl fmt::Display for UnknownImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown import status {:?}", self.0)
    }
}

impl std::error::Error for UnknownImportStatus {}

impl FromStr for ImportStatus {
    type Err = UnknownImportStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownImportStatus(other.to_string())),
        }
    }
}

/// One attempt at importing a club's history. Rows are kept after they
/// finish; a club may accumulate several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: i64,
    pub club_id: String,
    pub status: ImportStatus,
    pub state: ImportState,
    pub created_at: DateTime<Utc>,
    pub last_tried_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: String,
}

impl ImportJob {
    pub fn is_finished(&self) -> bool {
        self.status != ImportStatus::Pending
    }
}
