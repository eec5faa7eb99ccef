use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{Event, Member};

/// Resumable progress of one club import, persisted verbatim in the job row.
///
/// `member_cursor` and `accumulated_members` describe the event at the front
/// of `pending_events` and are cleared whenever that event is popped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportState {
    pub club_synced: bool,
    pub event_cursor: Option<String>,
    pub event_listing_done: bool,
    pub pending_events: VecDeque<Event>,
    pub member_cursor: Option<String>,
    pub accumulated_members: BTreeMap<String, Member>,
}

impl ImportState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&Event> {
        self.pending_events.front()
    }

    /// Nothing queued and the event listing has been walked to its end.
    pub fn is_drained(&self) -> bool {
        self.pending_events.is_empty() && self.event_listing_done
    }

    pub fn needs_event_page(&self) -> bool {
        self.pending_events.is_empty() && !self.event_listing_done
    }

    /// Append one page of the club's event listing, preserving upstream order.
    pub fn enqueue_events(
        &mut self,
        events: impl IntoIterator<Item = Event>,
        cursor: Option<String>,
        listing_done: bool,
    ) {
        self.pending_events.extend(events);
        self.event_cursor = cursor;
        self.event_listing_done = listing_done;
    }

    /// Merge one page of members for the head event. A member seen on an
    /// earlier page is replaced, never duplicated. Returns how many ids were new.
    pub fn merge_members(
        &mut self,
        members: impl IntoIterator<Item = Member>,
        cursor: Option<String>,
    ) -> usize {
        let mut added = 0;
        for member in members {
            if self
                .accumulated_members
                .insert(member.id.clone(), member)
                .is_none()
            {
                added += 1;
            }
        }
        self.member_cursor = cursor;
        added
    }

    /// Pop the head event and reset the per-event member progress.
    pub fn finish_head(&mut self) -> Option<Event> {
        let event = self.pending_events.pop_front();
        self.member_cursor = None;
        self.accumulated_members.clear();
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Rsvp, RsvpStatus};
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event {
            id: id.into(),
            club_id: "club-1".into(),
            name: format!("Event {id}"),
            details: "details".into(),
            address: Some("1 Main St".into()),
            creator_id: Some("creator".into()),
            cover_photo_url: None,
            starts_at: None,
            ends_at: None,
            updated_at: None,
            rsvps: vec![Rsvp {
                user_id: "u1".into(),
                status: RsvpStatus::Other("INTERESTED".into()),
            }],
            raw: json!({ "id": id }),
        }
    }

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.into(),
            username: id.into(),
            display_name: name.into(),
            avatar_url: None,
            raw: json!({ "id": id }),
        }
    }

    #[test]
    fn overlapping_member_pages_keep_one_entry_per_id() {
        let mut state = ImportState::new();
        state.enqueue_events(vec![event("e1")], Some("ev-1".into()), true);

        let added = state.merge_members(
            vec![member("a", "Ann"), member("b", "Bob")],
            Some("m-1".into()),
        );
        assert_eq!(added, 2);
        let added = state.merge_members(
            vec![member("b", "Bobby"), member("c", "Cat")],
            Some("m-2".into()),
        );
        assert_eq!(added, 1);

        assert_eq!(state.accumulated_members.len(), 3);
        assert_eq!(state.accumulated_members["b"].display_name, "Bobby");
        assert_eq!(state.member_cursor.as_deref(), Some("m-2"));
    }

    #[test]
    fn finishing_head_resets_member_progress() {
        let mut state = ImportState::new();
        state.enqueue_events(vec![event("e1"), event("e2")], None, true);
        state.merge_members(vec![member("a", "Ann")], Some("m-1".into()));

        let popped = state.finish_head().unwrap();
        assert_eq!(popped.id, "e1");
        assert_eq!(state.head().map(|e| e.id.as_str()), Some("e2"));
        assert!(state.member_cursor.is_none());
        assert!(state.accumulated_members.is_empty());
        assert!(!state.is_drained());

        state.finish_head();
        assert!(state.is_drained());
    }

    #[test]
    fn state_survives_a_json_round_trip() {
        let mut state = ImportState::new();
        state.club_synced = true;
        state.enqueue_events(vec![event("e1"), event("e2")], Some("opaque==".into()), false);
        state.merge_members(vec![member("a", "Ann")], Some("m-1".into()));

        let encoded = serde_json::to_value(&state).unwrap();
        let decoded: ImportState = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, state);
        assert!(!decoded.needs_event_page());
    }

    #[test]
    fn empty_document_decodes_as_fresh_state() {
        let decoded: ImportState = serde_json::from_str("{}").unwrap();
        assert_eq!(decoded, ImportState::new());
        assert!(decoded.needs_event_page());
    }
}
