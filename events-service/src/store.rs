use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz, Uuid as SqlUuid};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use shared::*;
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

/// Durable home of the outbox rows.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Returns `false` when an event with the same external id is already stored.
    async fn insert(&self, event: NewEvent, received_at: DateTime<Utc>) -> Result<bool>;

    /// Moves up to `limit` claimable rows to `en_proceso` and returns them.
    async fn claim_batch(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Event>>;

    async fn claim_one(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Event>>;

    /// Takes over rows whose claim is older than `lease`. They stay
    /// `en_proceso` with a fresh claim time so only one reaper owns them.
    async fn reclaim_expired(&self, lease: Duration, now: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Settles a claimed row. Returns `false` when the claim was lost to a
    /// reaper or the row was already settled, leaving it untouched.
    async fn mark_processed(&self, event: &Event, now: DateTime<Utc>) -> Result<bool>;

    /// Same ownership rule as `mark_processed`.
    async fn mark_failed(
        &self,
        event: &Event,
        decision: &FailureDecision,
        error_msg: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find(&self, id: Uuid) -> Result<Option<Event>>;

    async fn list(&self, status: Option<EventStatus>, limit: i64) -> Result<Vec<Event>>;

    /// Puts an `error`/`fallido` row back to `pendiente` with a clean counter.
    async fn requeue(&self, id: Uuid) -> Result<Option<Event>>;
}

const CLAIMABLE: &str = "(estado = 'pendiente' \
     OR (estado = 'error' AND (proximo_intento IS NULL OR proximo_intento <= $1)))";

pub struct PgEventStore {
    pool: DbPool,
}

impl PgEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_events(rows: Vec<DbEvent>) -> Result<Vec<Event>> {
    rows.into_iter().map(Event::try_from).collect()
}

/// A claim is identified by the row id plus the `reclamado_en` it was taken at.
fn claim_token(event: &Event) -> Result<DateTime<Utc>> {
    event
        .claimed_at
        .ok_or_else(|| anyhow!("Event {} was settled without being claimed", event.id))
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: NewEvent, received_at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let row = NewDbEvent::from_new(event, received_at);

        let inserted = diesel::insert_into(eventos::table)
            .values(&row)
            .on_conflict(eventos::id_externo)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn claim_batch(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut conn = self.pool.get().await?;

        let query = format!(
            "WITH candidatos AS ( \
                 SELECT id FROM eventos \
                 WHERE {CLAIMABLE} \
                 ORDER BY (origen <> '{PRIORITY_SOURCE}'), origen, recibido_en \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE eventos \
             SET estado = 'en_proceso', ultimo_intento = $1, reclamado_en = $1 \
             FROM candidatos \
             WHERE eventos.id = candidatos.id \
             RETURNING eventos.*"
        );

        let rows = diesel::sql_query(query)
            .bind::<Timestamptz, _>(now)
            .bind::<BigInt, _>(limit)
            .load::<DbEvent>(&mut conn)
            .await?;

        // RETURNING does not keep the CTE order.
        let mut events = into_events(rows)?;
        sort_for_dispatch(&mut events);
        Ok(events)
    }

    async fn claim_one(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Event>> {
        let mut conn = self.pool.get().await?;

        let query = format!(
            "UPDATE eventos \
             SET estado = 'en_proceso', ultimo_intento = $1, reclamado_en = $1 \
             WHERE id = $2 AND {CLAIMABLE} \
             RETURNING *"
        );

        let rows = diesel::sql_query(query)
            .bind::<Timestamptz, _>(now)
            .bind::<SqlUuid, _>(id)
            .load::<DbEvent>(&mut conn)
            .await?;

        rows.into_iter().next().map(Event::try_from).transpose()
    }

    async fn reclaim_expired(&self, lease: Duration, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut conn = self.pool.get().await?;
        let cutoff = now - lease;

        let rows = diesel::update(
            eventos::table
                .filter(eventos::estado.eq(EventStatus::InProgress.as_str()))
                .filter(eventos::reclamado_en.lt(cutoff)),
        )
        .set(eventos::reclamado_en.eq(now))
        .returning(DbEvent::as_returning())
        .get_results(&mut conn)
        .await?;

        into_events(rows)
    }

    async fn mark_processed(&self, event: &Event, now: DateTime<Utc>) -> Result<bool> {
        let claimed_at = claim_token(event)?;
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            eventos::table
                .filter(eventos::id.eq(event.id))
                .filter(eventos::estado.eq(EventStatus::InProgress.as_str()))
                .filter(eventos::reclamado_en.eq(claimed_at)),
        )
        .set((
            eventos::estado.eq(EventStatus::Processed.as_str()),
            eventos::procesado_en.eq(Some(now)),
            eventos::error_msg.eq(None::<String>),
            eventos::proximo_intento.eq(None::<DateTime<Utc>>),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn mark_failed(
        &self,
        event: &Event,
        decision: &FailureDecision,
        error_msg: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let claimed_at = claim_token(event)?;
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            eventos::table
                .filter(eventos::id.eq(event.id))
                .filter(eventos::estado.eq(EventStatus::InProgress.as_str()))
                .filter(eventos::reclamado_en.eq(claimed_at)),
        )
        .set((
            eventos::estado.eq(decision.status().as_str()),
            eventos::intentos.eq(decision.attempts()),
            eventos::ultimo_intento.eq(Some(now)),
            eventos::error_msg.eq(Some(truncate_error(error_msg))),
            eventos::proximo_intento.eq(decision.next_attempt_at()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Event>> {
        let mut conn = self.pool.get().await?;

        let row = eventos::table
            .filter(eventos::id.eq(id))
            .select(DbEvent::as_select())
            .first::<DbEvent>(&mut conn)
            .await
            .optional()?;

        row.map(Event::try_from).transpose()
    }

    async fn list(&self, status: Option<EventStatus>, limit: i64) -> Result<Vec<Event>> {
        let mut conn = self.pool.get().await?;

        let mut query = eventos::table
            .select(DbEvent::as_select())
            .order(eventos::recibido_en.desc())
            .limit(limit)
            .into_boxed();
        if let Some(status) = status {
            query = query.filter(eventos::estado.eq(status.as_str()));
        }

        let rows = query.load::<DbEvent>(&mut conn).await?;
        into_events(rows)
    }

    async fn requeue(&self, id: Uuid) -> Result<Option<Event>> {
        let mut conn = self.pool.get().await?;

        let row = diesel::update(
            eventos::table
                .filter(eventos::id.eq(id))
                .filter(eventos::estado.eq_any([
                    EventStatus::Errored.as_str(),
                    EventStatus::Failed.as_str(),
                ])),
        )
        .set((
            eventos::estado.eq(EventStatus::Pending.as_str()),
            eventos::intentos.eq(0),
            eventos::error_msg.eq(None::<String>),
            eventos::proximo_intento.eq(None::<DateTime<Utc>>),
        ))
        .returning(DbEvent::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        row.map(Event::try_from).transpose()
    }
}
