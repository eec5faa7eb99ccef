use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubsync_core::{Club, Event, ImportJob, ImportState, ImportStatus, Member, Rsvp, RsvpStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{dedup_last, ImportStore, StoredEventRef};

/// Rows per INSERT statement; keeps bind parameters well below the protocol limit.
const UPSERT_CHUNK: usize = 1_000;

const JOB_COLUMNS: &str =
    "id, club_id, status, state, created_at, last_tried_at, completed_at, error";
const CLUB_COLUMNS: &str = "id, name, avatar_url, creator_id, auto_import, last_auto_import, raw";
const MEMBER_COLUMNS: &str = "id, username, display_name, avatar_url, raw";
const EVENT_COLUMNS: &str = "id, club_id, name, details, address, creator_id, cover_photo_url, \
     starts_at, ends_at, source_updated_at, raw";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<ImportJob> {
    let status: String = row.try_get("status")?;
    let Json(state): Json<ImportState> = row.try_get("state")?;
    Ok(ImportJob {
        id: row.try_get("id")?,
        club_id: row.try_get("club_id")?,
        status: status.parse::<ImportStatus>()?,
        state,
        created_at: row.try_get("created_at")?,
        last_tried_at: row.try_get("last_tried_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

fn club_from_row(row: &PgRow) -> Result<Club> {
    Ok(Club {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
        creator_id: row.try_get("creator_id")?,
        auto_import: row.try_get("auto_import")?,
        last_auto_import: row.try_get("last_auto_import")?,
        raw: row.try_get("raw")?,
    })
}

fn member_from_row(row: &PgRow) -> Result<Member> {
    Ok(Member {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        raw: row.try_get("raw")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        club_id: row.try_get("club_id")?,
        name: row.try_get("name")?,
        details: row.try_get("details")?,
        address: row.try_get("address")?,
        creator_id: row.try_get("creator_id")?,
        cover_photo_url: row.try_get("cover_photo_url")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        updated_at: row.try_get("source_updated_at")?,
        rsvps: Vec::new(),
        raw: row.try_get("raw")?,
    })
}

#[async_trait]
impl ImportStore for PgStore {
    async fn create_job(&self, club_id: &str) -> Result<ImportJob> {
        let row = sqlx::query(&format!(
            "INSERT INTO club_import_jobs (club_id, status, state) \
             VALUES ($1, 'pending', $2) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(club_id)
        .bind(Json(ImportState::new()))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("creating import job for club {club_id}"))?;
        job_from_row(&row)
    }

    async fn claim_next_job(&self, lease: Duration) -> Result<Option<ImportJob>> {
        let row = sqlx::query(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                  FROM club_import_jobs
                 WHERE status = 'pending'
                   AND (locked_until IS NULL OR locked_until < NOW())
                 ORDER BY last_tried_at ASC NULLS FIRST, created_at ASC
                 LIMIT 1
                   FOR UPDATE SKIP LOCKED
            )
            UPDATE club_import_jobs
               SET last_tried_at = NOW(),
                   locked_until = NOW() + make_interval(secs => $1)
              FROM next_job
             WHERE club_import_jobs.id = next_job.id
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("club_import_jobs.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .context("claiming next import job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn checkpoint_job(&self, job: &ImportJob) -> Result<()> {
        sqlx::query("UPDATE club_import_jobs SET state = $1 WHERE id = $2")
            .bind(Json(&job.state))
            .bind(job.id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("checkpointing import job {}", job.id))?;
        debug!(job_id = job.id, pending_events = job.state.pending_events.len(), "checkpoint");
        Ok(())
    }

    async fn save_job(&self, job: &ImportJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE club_import_jobs
               SET status = $1,
                   state = $2,
                   last_tried_at = $3,
                   completed_at = $4,
                   error = $5,
                   locked_until = NULL
             WHERE id = $6
            "#,
        )
        .bind(job.status.as_str())
        .bind(Json(&job.state))
        .bind(job.last_tried_at)
        .bind(job.completed_at)
        .bind(&job.error)
        .bind(job.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving import job {}", job.id))?;
        Ok(())
    }

    async fn find_job(&self, id: i64) -> Result<Option<ImportJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM club_import_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading import job {id}"))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImportJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM club_import_jobs ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing import jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    async fn has_job_for_club(&self, club_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM club_import_jobs WHERE club_id = $1)",
        )
        .bind(club_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("looking up jobs for club {club_id}"))?;
        Ok(exists)
    }

    async fn upsert_members(&self, members: &[Member]) -> Result<()> {
        let members = dedup_last(members, |m| m.id.clone());
        if members.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in members.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO members (id, username, display_name, avatar_url, raw, imported_at) ",
            );
            query.push_values(chunk, |mut row, member| {
                row.push_bind(&member.id)
                    .push_bind(&member.username)
                    .push_bind(&member.display_name)
                    .push_bind(&member.avatar_url)
                    .push_bind(&member.raw)
                    .push("NOW()");
            });
            // Placeholders only fill gaps; they never blank out a real profile.
            query.push(
                " ON CONFLICT (id) DO UPDATE SET \
                   username = EXCLUDED.username, \
                   display_name = EXCLUDED.display_name, \
                   avatar_url = EXCLUDED.avatar_url, \
                   raw = EXCLUDED.raw, \
                   imported_at = EXCLUDED.imported_at \
                 WHERE NOT (EXCLUDED.username = '' \
                   AND EXCLUDED.display_name = '' \
                   AND EXCLUDED.avatar_url IS NULL)",
            );
            query
                .build()
                .execute(&mut *tx)
                .await
                .context("upserting members")?;
        }
        tx.commit().await.context("committing member upsert")?;
        Ok(())
    }

    async fn upsert_clubs(&self, clubs: &[Club]) -> Result<()> {
        let clubs = dedup_last(clubs, |c| c.id.clone());
        if clubs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in clubs.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO clubs (id, name, avatar_url, creator_id, raw, imported_at) ",
            );
            query.push_values(chunk, |mut row, club| {
                row.push_bind(&club.id)
                    .push_bind(&club.name)
                    .push_bind(&club.avatar_url)
                    .push_bind(&club.creator_id)
                    .push_bind(&club.raw)
                    .push("NOW()");
            });
            query.push(
                " ON CONFLICT (id) DO UPDATE SET \
                   name = EXCLUDED.name, \
                   avatar_url = EXCLUDED.avatar_url, \
                   creator_id = EXCLUDED.creator_id, \
                   raw = EXCLUDED.raw, \
                   imported_at = EXCLUDED.imported_at",
            );
            query
                .build()
                .execute(&mut *tx)
                .await
                .context("upserting clubs")?;
        }
        tx.commit().await.context("committing club upsert")?;
        Ok(())
    }

    async fn upsert_events(&self, events: &[Event]) -> Result<()> {
        let events = dedup_last(events, |e| e.id.clone());
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in events.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO events ({EVENT_COLUMNS}, imported_at) "
            ));
            query.push_values(chunk, |mut row, event| {
                row.push_bind(&event.id)
                    .push_bind(&event.club_id)
                    .push_bind(&event.name)
                    .push_bind(&event.details)
                    .push_bind(&event.address)
                    .push_bind(&event.creator_id)
                    .push_bind(&event.cover_photo_url)
                    .push_bind(event.starts_at)
                    .push_bind(event.ends_at)
                    .push_bind(event.updated_at)
                    .push_bind(&event.raw)
                    .push("NOW()");
            });
            // A snapshot older than the stored one must not roll the row back.
            query.push(
                " ON CONFLICT (id) DO UPDATE SET \
                   club_id = EXCLUDED.club_id, \
                   name = EXCLUDED.name, \
                   details = EXCLUDED.details, \
                   address = EXCLUDED.address, \
                   creator_id = EXCLUDED.creator_id, \
                   cover_photo_url = EXCLUDED.cover_photo_url, \
                   starts_at = EXCLUDED.starts_at, \
                   ends_at = EXCLUDED.ends_at, \
                   source_updated_at = EXCLUDED.source_updated_at, \
                   raw = EXCLUDED.raw, \
                   imported_at = EXCLUDED.imported_at \
                 WHERE events.source_updated_at IS NULL \
                    OR EXCLUDED.source_updated_at IS NULL \
                    OR EXCLUDED.source_updated_at >= events.source_updated_at",
            );
            query
                .build()
                .execute(&mut *tx)
                .await
                .context("upserting events")?;
        }
        tx.commit().await.context("committing event upsert")?;
        Ok(())
    }

    async fn upsert_rsvps(&self, event_id: &str, rsvps: &[Rsvp]) -> Result<()> {
        let rsvps = dedup_last(rsvps, |r| r.user_id.clone());
        if rsvps.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in rsvps.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO event_rsvps (event_id, member_id, status, imported_at) ",
            );
            query.push_values(chunk, |mut row, rsvp| {
                row.push_bind(event_id)
                    .push_bind(&rsvp.user_id)
                    .push_bind(rsvp.status.as_str())
                    .push("NOW()");
            });
            query.push(
                " ON CONFLICT (event_id, member_id) DO UPDATE SET \
                   status = CASE WHEN event_rsvps.status = 'CHECKED_IN' \
                                 THEN event_rsvps.status ELSE EXCLUDED.status END, \
                   imported_at = EXCLUDED.imported_at",
            );
            query
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting rsvps for event {event_id}"))?;
        }
        tx.commit().await.context("committing rsvp upsert")?;
        Ok(())
    }

    async fn clubs_due_for_auto_import(&self, before: DateTime<Utc>) -> Result<Vec<Club>> {
        let rows = sqlx::query(&format!(
            "SELECT {CLUB_COLUMNS} FROM clubs \
              WHERE auto_import \
                AND (last_auto_import IS NULL OR last_auto_import < $1) \
              ORDER BY last_auto_import ASC NULLS FIRST, id"
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("selecting clubs due for auto-import")?;
        rows.iter().map(club_from_row).collect()
    }

    async fn mark_auto_imported(&self, club_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE clubs SET last_auto_import = $1 WHERE id = $2")
            .bind(at)
            .bind(club_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("marking club {club_id} auto-imported"))?;
        Ok(())
    }

    async fn set_auto_import(&self, club_id: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO clubs (id, auto_import) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET auto_import = EXCLUDED.auto_import",
        )
        .bind(club_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .with_context(|| format!("setting auto-import for club {club_id}"))?;
        Ok(())
    }

    async fn known_event_ids(&self, club_id: &str) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM events WHERE club_id = $1")
            .bind(club_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("listing events of club {club_id}"))?;
        Ok(ids.into_iter().collect())
    }

    async fn stalest_event(&self, before: DateTime<Utc>) -> Result<Option<StoredEventRef>> {
        let row = sqlx::query(
            "SELECT id, club_id, imported_at FROM events \
              WHERE imported_at < $1 \
              ORDER BY imported_at ASC, id \
              LIMIT 1",
        )
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .context("selecting stalest event")?;
        row.map(|row| -> Result<StoredEventRef> {
            Ok(StoredEventRef {
                id: row.try_get("id")?,
                club_id: row.try_get("club_id")?,
                imported_at: row.try_get("imported_at")?,
            })
        })
        .transpose()
    }

    async fn touch_event(&self, event_id: &str) -> Result<()> {
        sqlx::query("UPDATE events SET imported_at = NOW() WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("touching event {event_id}"))?;
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event_rsvps WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting rsvps of event {event_id}"))?;
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting event {event_id}"))?;
        tx.commit().await.context("committing event delete")?;
        Ok(result.rows_affected() > 0)
    }

    async fn club(&self, club_id: &str) -> Result<Option<Club>> {
        let row = sqlx::query(&format!("SELECT {CLUB_COLUMNS} FROM clubs WHERE id = $1"))
            .bind(club_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading club {club_id}"))?;
        row.as_ref().map(club_from_row).transpose()
    }

    async fn club_events(&self, club_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE club_id = $1 \
              ORDER BY starts_at ASC NULLS LAST, id"
        ))
        .bind(club_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading events of club {club_id}"))?;
        let mut events = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;

        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let rsvp_rows = sqlx::query(
            "SELECT event_id, member_id, status FROM event_rsvps \
              WHERE event_id = ANY($1) \
              ORDER BY event_id, member_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading rsvps of club {club_id}"))?;

        let mut by_event: HashMap<String, Vec<Rsvp>> = HashMap::new();
        for row in &rsvp_rows {
            let status: String = row.try_get("status")?;
            by_event
                .entry(row.try_get("event_id")?)
                .or_default()
                .push(Rsvp {
                    user_id: row.try_get("member_id")?,
                    status: RsvpStatus::from(status),
                });
        }
        for event in &mut events {
            event.rsvps = by_event.remove(&event.id).unwrap_or_default();
        }
        Ok(events)
    }

    async fn club_members(&self, club_id: &str) -> Result<Vec<Member>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members \
              WHERE id IN ( \
                    SELECT r.member_id FROM event_rsvps r \
                      JOIN events e ON e.id = r.event_id \
                     WHERE e.club_id = $1) \
              ORDER BY id"
        ))
        .bind(club_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading members of club {club_id}"))?;
        rows.iter().map(member_from_row).collect()
    }
}

// Needs a reachable Postgres: DATABASE_URL=... cargo test -p clubsync-storage --features db-tests
#[cfg(all(test, feature = "db-tests"))]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.into(),
            username: id.into(),
            display_name: name.into(),
            avatar_url: Some(format!("https://img/{id}.png")),
            raw: json!({ "id": id }),
        }
    }

    fn event(id: &str, updated_at: &str, name: &str) -> Event {
        Event {
            id: id.into(),
            club_id: "c1".into(),
            name: name.into(),
            details: String::new(),
            address: None,
            creator_id: None,
            cover_photo_url: None,
            starts_at: None,
            ends_at: None,
            updated_at: Some(updated_at.parse().unwrap()),
            rsvps: vec![],
            raw: json!({}),
        }
    }

    async fn display_name(pool: &PgPool, id: &str) -> String {
        sqlx::query_scalar("SELECT display_name FROM members WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn placeholder_never_erases_a_profile(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        store.upsert_members(&[member("u1", "Ann")]).await.unwrap();
        store.upsert_members(&[Member::placeholder("u1")]).await.unwrap();
        assert_eq!(display_name(&pool, "u1").await, "Ann");

        store.upsert_members(&[Member::placeholder("u2")]).await.unwrap();
        store.upsert_members(&[member("u2", "Bob")]).await.unwrap();
        assert_eq!(display_name(&pool, "u2").await, "Bob");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stale_event_snapshot_is_ignored(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        store
            .upsert_events(&[event("e1", "2026-03-02T00:00:00Z", "newer")])
            .await
            .unwrap();
        store
            .upsert_events(&[event("e1", "2026-03-01T00:00:00Z", "older")])
            .await
            .unwrap();
        let name: String = sqlx::query_scalar("SELECT name FROM events WHERE id = 'e1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(name, "newer");

        store
            .upsert_events(&[event("e1", "2026-03-03T00:00:00Z", "newest")])
            .await
            .unwrap();
        let name: String = sqlx::query_scalar("SELECT name FROM events WHERE id = 'e1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(name, "newest");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn checked_in_rsvp_is_not_reverted(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        store.upsert_members(&[Member::placeholder("u1")]).await.unwrap();
        store
            .upsert_events(&[event("e1", "2026-03-02T00:00:00Z", "run")])
            .await
            .unwrap();
        let rsvp = |status| Rsvp {
            user_id: "u1".into(),
            status,
        };
        store.upsert_rsvps("e1", &[rsvp(RsvpStatus::CheckedIn)]).await.unwrap();
        store.upsert_rsvps("e1", &[rsvp(RsvpStatus::Accepted)]).await.unwrap();

        let status: String = sqlx::query_scalar(
            "SELECT status FROM event_rsvps WHERE event_id = 'e1' AND member_id = 'u1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(status, "CHECKED_IN");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn rsvp_for_unknown_member_is_rejected(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        store
            .upsert_events(&[event("e1", "2026-03-02T00:00:00Z", "run")])
            .await
            .unwrap();
        let result = store
            .upsert_rsvps(
                "e1",
                &[Rsvp {
                    user_id: "ghost".into(),
                    status: RsvpStatus::Accepted,
                }],
            )
            .await;
        assert!(result.is_err());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn leased_job_is_not_claimed_twice(pool: PgPool) {
        let store = PgStore::new(pool);
        let first = store.create_job("c1").await.unwrap();
        let second = store.create_job("c2").await.unwrap();
        let lease = Duration::from_secs(60);

        let claimed = store.claim_next_job(lease).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        let claimed_again = store.claim_next_job(lease).await.unwrap().unwrap();
        assert_eq!(claimed_again.id, second.id);
        assert!(store.claim_next_job(lease).await.unwrap().is_none());

        store.save_job(&claimed).await.unwrap();
        let next = store.claim_next_job(lease).await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }
}
