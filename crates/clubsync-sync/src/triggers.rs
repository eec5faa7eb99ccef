use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clubsync_core::{Club, Event, Member};
use clubsync_storage::{ImportStore, StoredEventRef};
use clubsync_upstream::{ClubApi, CursorWalk, UpstreamError};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::flush::flush_event;
use crate::SyncConfig;

fn cutoff(age: Duration) -> Result<DateTime<Utc>> {
    Ok(Utc::now() - chrono::Duration::from_std(age).context("threshold out of range")?)
}

/// Run `tick` every `period` until cancelled. The first tick fires immediately.
async fn run_every<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(trigger = name, period = ?period, "trigger started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(err) = tick().await {
            warn!(trigger = name, error = %format!("{err:#}"), "trigger tick failed");
        }
    }
    info!(trigger = name, "trigger stopped");
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoImportReport {
    pub clubs: usize,
    pub events_inserted: usize,
    pub jobs_created: usize,
}

/// Shallow delta import of upcoming events for clubs flagged for auto-import.
pub struct AutoImportScheduler {
    store: Arc<dyn ImportStore>,
    api: Arc<dyn ClubApi>,
    after: Duration,
    period: Duration,
}

impl AutoImportScheduler {
    pub fn new(store: Arc<dyn ImportStore>, api: Arc<dyn ClubApi>, config: &SyncConfig) -> Self {
        Self {
            store,
            api,
            after: config.auto_import_after,
            period: config.auto_import_interval,
        }
    }

    pub async fn tick(&self, cancel: &CancellationToken) -> Result<AutoImportReport> {
        let due = self.store.clubs_due_for_auto_import(cutoff(self.after)?).await?;
        let mut report = AutoImportReport::default();
        for club in due {
            if cancel.is_cancelled() {
                break;
            }
            let span = info_span!("auto_import", club_id = %club.id);
            match self.import_club(&club, cancel).instrument(span).await {
                Ok((inserted, job_created)) => {
                    report.clubs += 1;
                    report.events_inserted += inserted;
                    report.jobs_created += usize::from(job_created);
                }
                // Not marked, so the club stays due and is picked up next tick.
                Err(err) => warn!(club_id = %club.id, error = %format!("{err:#}"), "auto-import failed"),
            }
        }
        if report.clubs > 0 {
            info!(
                clubs = report.clubs,
                events_inserted = report.events_inserted,
                jobs_created = report.jobs_created,
                "auto-import pass finished"
            );
        }
        Ok(report)
    }

    async fn import_club(&self, club: &Club, cancel: &CancellationToken) -> Result<(usize, bool)> {
        let job_created = if self.store.has_job_for_club(&club.id).await? {
            false
        } else {
            let job = self.store.create_job(&club.id).await?;
            info!(job_id = job.id, "queued full history import");
            true
        };

        let upcoming = match self.api.upcoming_events(cancel, &club.id).await {
            Ok(events) => events,
            Err(UpstreamError::UnsupportedMeetup) => {
                debug!("club is not importable upstream");
                Vec::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("fetching upcoming events of club {}", club.id))
            }
        };

        let known = self.store.known_event_ids(&club.id).await?;
        let fresh: Vec<&Event> = upcoming
            .iter()
            .filter(|event| !known.contains(&event.id))
            .collect();
        for event in &fresh {
            flush_event(self.store.as_ref(), event, Vec::new()).await?;
        }

        self.store.mark_auto_imported(&club.id, Utc::now()).await?;
        debug!(upcoming = upcoming.len(), inserted = fresh.len(), "club auto-imported");
        Ok((fresh.len(), job_created))
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let token = &cancel;
        run_every("auto_import", self.period, cancel.clone(), move || async move {
            self.tick(token).await.map(|_| ())
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed { event_id: String, members: usize },
    /// The event is gone upstream; the local copy was removed.
    Deleted { event_id: String },
    /// The event can no longer be fetched; it was only marked as visited.
    Skipped { event_id: String },
}

/// Re-fetches the least recently imported event in full.
pub struct StaleEventRefresher {
    store: Arc<dyn ImportStore>,
    api: Arc<dyn ClubApi>,
    after: Duration,
    period: Duration,
    member_page_size: u32,
}

impl StaleEventRefresher {
    pub fn new(store: Arc<dyn ImportStore>, api: Arc<dyn ClubApi>, config: &SyncConfig) -> Self {
        Self {
            store,
            api,
            after: config.refresh_after,
            period: config.refresh_interval,
            member_page_size: config.member_page_size.max(1),
        }
    }

    /// Refresh at most one event. `None` when nothing is stale.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<Option<RefreshOutcome>> {
        let Some(stale) = self.store.stalest_event(cutoff(self.after)?).await? else {
            return Ok(None);
        };
        let span = info_span!("refresh_event", event_id = %stale.id, club_id = %stale.club_id);
        self.refresh(stale, cancel).instrument(span).await.map(Some)
    }

    async fn refresh(&self, stale: StoredEventRef, cancel: &CancellationToken) -> Result<RefreshOutcome> {
        let fetched = self.refetch(&stale.id, cancel).await;
        let outcome = match fetched {
            Ok((event, members)) => {
                let count = members.len();
                flush_event(self.store.as_ref(), &event, members).await?;
                // An older upstream snapshot is not written, but the event
                // still counts as visited.
                self.store.touch_event(&event.id).await?;
                RefreshOutcome::Refreshed {
                    event_id: event.id,
                    members: count,
                }
            }
            Err(UpstreamError::EventNotFound) => {
                self.store.delete_event(&stale.id).await?;
                info!("event vanished upstream; local copy deleted");
                RefreshOutcome::Deleted { event_id: stale.id }
            }
            Err(UpstreamError::UnsupportedMeetup) => {
                self.store.touch_event(&stale.id).await?;
                RefreshOutcome::Skipped { event_id: stale.id }
            }
            Err(err) if err.is_transient() => {
                return Err(err).with_context(|| format!("refreshing event {}", stale.id));
            }
            // Retrying cannot help; move the rotation past this event.
            Err(err) => {
                warn!(error = %err, "event cannot be refreshed; skipping");
                self.store.touch_event(&stale.id).await?;
                RefreshOutcome::Skipped { event_id: stale.id }
            }
        };
        debug!(?outcome, "refresh finished");
        Ok(outcome)
    }

    async fn refetch(
        &self,
        event_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(Event, Vec<Member>), UpstreamError> {
        let event = self.api.event(cancel, event_id).await?;
        let members = CursorWalk::default()
            .drain(|after| {
                self.api
                    .members_page(cancel, event_id, after, self.member_page_size)
            })
            .await?;
        Ok((event, members))
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let token = &cancel;
        run_every("stale_refresh", self.period, cancel.clone(), move || async move {
            self.tick(token).await.map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event, member, ScriptedApi};
    use clubsync_storage::MemoryStore;

    #[tokio::test]
    async fn auto_import_inserts_only_unknown_upcoming_events() {
        let store = Arc::new(MemoryStore::new());
        store.set_auto_import("c1", true).await.unwrap();
        store
            .upsert_events(&[event("e1", "c1", "host", &[])])
            .await
            .unwrap();

        let mut changed = event("e1", "c1", "host", &[]);
        changed.name = "renamed upstream".into();
        let api = Arc::new(
            ScriptedApi::new().with_upcoming("c1", vec![changed, event("e2", "c1", "host", &["u1"])]),
        );
        let scheduler = AutoImportScheduler::new(store.clone(), api.clone(), &SyncConfig::default());
        let cancel = CancellationToken::new();

        let report = scheduler.tick(&cancel).await.unwrap();
        assert_eq!(
            report,
            AutoImportReport {
                clubs: 1,
                events_inserted: 1,
                jobs_created: 1,
            }
        );

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.events["e1"].name, "Event e1");
        assert!(snapshot.events.contains_key("e2"));
        assert!(snapshot.members["u1"].is_placeholder());
        assert!(snapshot.members.contains_key("host"));

        let club = store.club("c1").await.unwrap().unwrap();
        assert!(club.last_auto_import.is_some());
        assert!(store.has_job_for_club("c1").await.unwrap());

        // Just imported, so not due again.
        assert_eq!(scheduler.tick(&cancel).await.unwrap(), AutoImportReport::default());
        assert_eq!(api.calls(), vec!["upcoming:c1"]);
    }

    #[tokio::test]
    async fn failed_auto_import_leaves_club_due() {
        let store = Arc::new(MemoryStore::new());
        store.set_auto_import("c1", true).await.unwrap();
        let api = Arc::new(ScriptedApi::new());
        api.fail_next("upcoming", UpstreamError::TooManyRequests);
        let scheduler = AutoImportScheduler::new(store.clone(), api.clone(), &SyncConfig::default());
        let cancel = CancellationToken::new();

        let report = scheduler.tick(&cancel).await.unwrap();
        assert_eq!(report.clubs, 0);
        assert!(store.club("c1").await.unwrap().unwrap().last_auto_import.is_none());

        let report = scheduler.tick(&cancel).await.unwrap();
        assert_eq!(report.clubs, 1);
        // The backfill job was queued on the first pass only.
        assert_eq!(report.jobs_created, 0);
    }

    #[tokio::test]
    async fn clubs_without_the_flag_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.set_auto_import("c1", false).await.unwrap();
        let api = Arc::new(ScriptedApi::new());
        let scheduler = AutoImportScheduler::new(store.clone(), api.clone(), &SyncConfig::default());

        let report = scheduler.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, AutoImportReport::default());
        assert!(api.calls().is_empty());
        assert!(!store.has_job_for_club("c1").await.unwrap());
    }

    async fn stale_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_members(&[Member::placeholder("u1")])
            .await
            .unwrap();
        store
            .upsert_events(&[event("e1", "c1", "host", &["u1"])])
            .await
            .unwrap();
        store
            .upsert_rsvps("e1", &event("e1", "c1", "host", &["u1"]).rsvps)
            .await
            .unwrap();
        store
            .set_event_imported_at("e1", Utc::now() - chrono::Duration::days(1))
            .await;
        store
    }

    #[tokio::test]
    async fn refresher_rewrites_stale_event_with_members() {
        let store = stale_store().await;
        let api = Arc::new(
            ScriptedApi::new()
                .with_listing("c1", vec![event("e1", "c1", "host", &["u1", "u2"])])
                .with_members("e1", vec![member("u1"), member("u2")]),
        );
        let refresher = StaleEventRefresher::new(store.clone(), api, &SyncConfig::default());
        let cancel = CancellationToken::new();

        let outcome = refresher.tick(&cancel).await.unwrap();
        assert_eq!(
            outcome,
            Some(RefreshOutcome::Refreshed {
                event_id: "e1".into(),
                members: 2,
            })
        );
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.members["u1"].display_name, "Member u1");
        assert_eq!(snapshot.rsvps.len(), 2);

        // Freshly imported now, so nothing is stale.
        assert_eq!(refresher.tick(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refresher_deletes_event_that_vanished_upstream() {
        let store = stale_store().await;
        let api = Arc::new(ScriptedApi::new());
        api.remove_event("e1");
        let refresher = StaleEventRefresher::new(store.clone(), api, &SyncConfig::default());

        let outcome = refresher.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            Some(RefreshOutcome::Deleted {
                event_id: "e1".into()
            })
        );
        let snapshot = store.snapshot().await;
        assert!(snapshot.events.is_empty());
        assert!(snapshot.rsvps.is_empty());
        // Members are shared across events and stay.
        assert!(snapshot.members.contains_key("u1"));
    }

    #[tokio::test]
    async fn refresher_moves_past_unsupported_event() {
        let store = stale_store().await;
        let api = Arc::new(ScriptedApi::new());
        api.fail_next("event", UpstreamError::UnsupportedMeetup);
        let refresher = StaleEventRefresher::new(store.clone(), api, &SyncConfig::default());
        let cancel = CancellationToken::new();

        assert_eq!(
            refresher.tick(&cancel).await.unwrap(),
            Some(RefreshOutcome::Skipped {
                event_id: "e1".into()
            })
        );
        assert!(store.snapshot().await.events.contains_key("e1"));
        assert_eq!(refresher.tick(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn permanently_failing_event_does_not_block_the_rotation() {
        let store = stale_store().await;
        store
            .upsert_events(&[event("e2", "c1", "host", &[])])
            .await
            .unwrap();
        store
            .set_event_imported_at("e1", Utc::now() - chrono::Duration::days(2))
            .await;
        store
            .set_event_imported_at("e2", Utc::now() - chrono::Duration::days(1))
            .await;
        let api = Arc::new(ScriptedApi::new().with_listing(
            "c1",
            vec![event("e1", "c1", "host", &["u1"]), event("e2", "c1", "host", &[])],
        ));
        api.fail_next("event", UpstreamError::Graphql("forbidden".into()));
        let refresher = StaleEventRefresher::new(store.clone(), api.clone(), &SyncConfig::default());
        let cancel = CancellationToken::new();

        assert_eq!(
            refresher.tick(&cancel).await.unwrap(),
            Some(RefreshOutcome::Skipped {
                event_id: "e1".into()
            })
        );
        assert_eq!(
            refresher.tick(&cancel).await.unwrap(),
            Some(RefreshOutcome::Refreshed {
                event_id: "e2".into(),
                members: 0,
            })
        );
        assert_eq!(refresher.tick(&cancel).await.unwrap(), None);
        assert_eq!(
            api.calls(),
            vec!["event:e1", "event:e2", "members_page:e2"]
        );
        assert!(store.snapshot().await.events.contains_key("e1"));
    }

    #[tokio::test]
    async fn refresher_surfaces_transient_errors() {
        let store = stale_store().await;
        let api = Arc::new(ScriptedApi::new());
        api.fail_next("event", UpstreamError::TooManyRequests);
        let refresher = StaleEventRefresher::new(store.clone(), api, &SyncConfig::default());

        let err = refresher.tick(&CancellationToken::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("refreshing event e1"));
        assert!(store.snapshot().await.events.contains_key("e1"));
    }
}
