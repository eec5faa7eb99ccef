use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clubsync_core::{Event, Member};
use clubsync_storage::ImportStore;
use tracing::debug;

/// Fetched members plus a placeholder for every member the event references
/// that was not fetched, so RSVPs and the creator always resolve.
pub(crate) fn with_placeholders(
    event: &Event,
    members: impl IntoIterator<Item = Member>,
) -> Vec<Member> {
    let mut by_id: BTreeMap<String, Member> = members
        .into_iter()
        .map(|member| (member.id.clone(), member))
        .collect();
    for id in event.referenced_member_ids() {
        by_id
            .entry(id.to_string())
            .or_insert_with(|| Member::placeholder(id));
    }
    by_id.into_values().collect()
}

/// Write one event with everything it references: members first, then the
/// event row, then its RSVPs.
pub(crate) async fn flush_event(
    store: &dyn ImportStore,
    event: &Event,
    members: impl IntoIterator<Item = Member>,
) -> Result<()> {
    let members = with_placeholders(event, members);
    store
        .upsert_members(&members)
        .await
        .with_context(|| format!("storing members of event {}", event.id))?;
    store
        .upsert_events(std::slice::from_ref(event))
        .await
        .with_context(|| format!("storing event {}", event.id))?;
    store
        .upsert_rsvps(&event.id, &event.rsvps)
        .await
        .with_context(|| format!("storing rsvps of event {}", event.id))?;
    debug!(
        event_id = %event.id,
        members = members.len(),
        rsvps = event.rsvps.len(),
        "event flushed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clubsync_core::{Rsvp, RsvpStatus};
    use clubsync_storage::memory::WriteOp;
    use clubsync_storage::MemoryStore;
    use serde_json::json;

    fn event() -> Event {
        Event {
            id: "e1".into(),
            club_id: "c1".into(),
            name: "Long run".into(),
            details: String::new(),
            address: None,
            creator_id: Some("host".into()),
            cover_photo_url: None,
            starts_at: None,
            ends_at: None,
            updated_at: None,
            rsvps: vec![
                Rsvp {
                    user_id: "u1".into(),
                    status: RsvpStatus::Accepted,
                },
                Rsvp {
                    user_id: "u2".into(),
                    status: RsvpStatus::Declined,
                },
            ],
            raw: json!({}),
        }
    }

    #[test]
    fn placeholders_fill_only_missing_references() {
        let fetched = Member {
            id: "u1".into(),
            username: "ann".into(),
            display_name: "Ann".into(),
            avatar_url: None,
            raw: json!({}),
        };
        let members = with_placeholders(&event(), vec![fetched.clone()]);
        let ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["host", "u1", "u2"]);
        assert_eq!(members[1], fetched);
        assert!(members[0].is_placeholder());
        assert!(members[2].is_placeholder());
    }

    #[tokio::test]
    async fn flush_writes_members_then_event_then_rsvps() {
        let store = MemoryStore::new();
        flush_event(&store, &event(), Vec::new()).await.unwrap();
        assert_eq!(
            store.writes().await,
            vec![
                WriteOp::Members(vec!["host".into(), "u1".into(), "u2".into()]),
                WriteOp::Events(vec!["e1".into()]),
                WriteOp::Rsvps {
                    event_id: "e1".into(),
                    member_ids: vec!["u1".into(), "u2".into()],
                },
            ]
        );
    }
}
