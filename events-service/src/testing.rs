//! In-memory doubles for the store, notifier and booking traits.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::MigrationHarness;
use shared::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use uuid::Uuid;
use crate::bookings::*;
use crate::handlers::{EventHandler, HandlerError, HandlerResult};
use crate::notifier::{DeadLetterAlert, OperatorNotifier};
use crate::rate_limit::RateLimiter;
use crate::store::{DbPool, EventStore};

pub fn metadata_for(tipo: &str) -> EventMetadata {
    EventMetadata {
        id: Uuid::new_v4(),
        origen: "stripe".to_string(),
        tipo: tipo.to_string(),
        categoria: category_of(tipo).to_string(),
        recibido_en: Utc::now(),
    }
}

/// Pool on the disposable database named by `TEST_DATABASE_URL`, migrated
/// once per test binary. Only `#[ignore]`d tests use it.
pub async fn database_pool() -> DbPool {
    static MIGRATED: Once = Once::new();
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL is not set");

    MIGRATED.call_once(|| {
        let mut conn = PgConnection::establish(&url).expect("connect for migrations");
        conn.run_pending_migrations(crate::MIGRATIONS).expect("run migrations");
    });

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&url);
    Pool::builder().max_size(2).build(manager).await.expect("build pool")
}

/// Mirrors the Postgres store: same claim filter, ordering and guards.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
    broken: Mutex<Vec<Uuid>>,
}

impl MemoryEventStore {
    pub fn seed(&self, source: &str, tipo: &str, status: EventStatus, attempts: i32) -> Uuid {
        let now = Utc::now();
        let mut event = Event::from_new(
            NewEvent::new(source, tipo, serde_json::json!({ "tipo": tipo }), None),
            now,
        );
        event.status = status;
        event.attempts = attempts;
        if status == EventStatus::InProgress {
            event.claimed_at = Some(now);
        }
        let id = event.id;
        self.events.lock().unwrap().push(event);
        id
    }

    /// Seeds a pending event received `offset_secs` after a fixed instant.
    pub fn seed_at(&self, source: &str, tipo: &str, offset_secs: i64) -> Uuid {
        let received_at: DateTime<Utc> = Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap();
        let event = Event::from_new(NewEvent::new(source, tipo, serde_json::json!({}), None), received_at);
        let id = event.id;
        self.events.lock().unwrap().push(event);
        id
    }

    pub fn get(&self, id: Uuid) -> Event {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .expect("event seeded")
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn make_due(&self, id: Uuid) {
        self.update(id, |e| e.next_attempt_at = Some(Utc::now() - Duration::seconds(1)));
    }

    pub fn expire_claim(&self, id: Uuid, age: Duration) {
        self.update(id, |e| e.claimed_at = Some(Utc::now() - age));
    }

    /// Makes settling `id` fail as if the connection dropped.
    pub fn break_settlement(&self, id: Uuid) {
        self.broken.lock().unwrap().push(id);
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Event)) {
        let mut events = self.events.lock().unwrap();
        if let Some(event) = events.iter_mut().find(|e| e.id == id) {
            f(event);
        }
    }

    /// Applies `f` only while `event` still holds its claim on the row.
    fn settle(&self, event: &Event, f: impl FnOnce(&mut Event)) -> Result<bool> {
        if self.broken.lock().unwrap().contains(&event.id) {
            return Err(anyhow!("connection reset while settling {}", event.id));
        }
        let mut events = self.events.lock().unwrap();
        match events.iter_mut().find(|e| e.id == event.id) {
            Some(row) if row.status == EventStatus::InProgress && row.claimed_at == event.claimed_at => {
                f(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn claim(event: &mut Event, now: DateTime<Utc>) {
        event.status = EventStatus::InProgress;
        event.last_attempt_at = Some(now);
        event.claimed_at = Some(now);
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: NewEvent, received_at: DateTime<Utc>) -> Result<bool> {
        let mut events = self.events.lock().unwrap();
        if event.external_id.is_some() && events.iter().any(|e| e.external_id == event.external_id) {
            return Ok(false);
        }
        events.push(Event::from_new(event, received_at));
        Ok(true)
    }

    async fn claim_batch(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events = self.events.lock().unwrap();
        let mut candidates: Vec<&mut Event> = events.iter_mut().filter(|e| e.is_claimable(now)).collect();
        candidates.sort_by(|a, b| claim_order(a, b));

        let claimed = candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|event| {
                Self::claim(event, now);
                event.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn claim_one(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Event>> {
        let mut events = self.events.lock().unwrap();
        Ok(events
            .iter_mut()
            .find(|e| e.id == id && e.is_claimable(now))
            .map(|event| {
                Self::claim(event, now);
                event.clone()
            }))
    }

    async fn reclaim_expired(&self, lease: Duration, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let cutoff = now - lease;
        let mut events = self.events.lock().unwrap();
        Ok(events
            .iter_mut()
            .filter(|e| e.status == EventStatus::InProgress && e.claimed_at.map_or(false, |at| at < cutoff))
            .map(|event| {
                event.claimed_at = Some(now);
                event.clone()
            })
            .collect())
    }

    async fn mark_processed(&self, event: &Event, now: DateTime<Utc>) -> Result<bool> {
        self.settle(event, |e| {
            e.status = EventStatus::Processed;
            e.processed_at = Some(now);
            e.error_msg = None;
            e.next_attempt_at = None;
        })
    }

    async fn mark_failed(
        &self,
        event: &Event,
        decision: &FailureDecision,
        error_msg: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.settle(event, |e| {
            e.status = decision.status();
            e.attempts = decision.attempts();
            e.last_attempt_at = Some(now);
            e.error_msg = Some(truncate_error(error_msg));
            e.next_attempt_at = decision.next_attempt_at();
        })
    }

    async fn find(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.events.lock().unwrap().iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, status: Option<EventStatus>, limit: i64) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .all()
            .into_iter()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn requeue(&self, id: Uuid) -> Result<Option<Event>> {
        let mut events = self.events.lock().unwrap();
        Ok(events
            .iter_mut()
            .find(|e| e.id == id && e.status.is_requeueable())
            .map(|event| {
                event.status = EventStatus::Pending;
                event.attempts = 0;
                event.error_msg = None;
                event.next_attempt_at = None;
                event.clone()
            }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<DeadLetterAlert>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self { alerts: Mutex::new(Vec::new()), fail: true }
    }

    pub fn alerts(&self) -> Vec<DeadLetterAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorNotifier for RecordingNotifier {
    async fn dead_letter(&self, alert: &DeadLetterAlert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        if self.fail {
            return Err(anyhow!("smtp unreachable"));
        }
        Ok(())
    }
}

pub struct CountingHandler {
    name: &'static str,
    seen: Mutex<Vec<EventMetadata>>,
    calls: AtomicUsize,
}

impl CountingHandler {
    pub fn named(name: &'static str) -> Self {
        Self { name, seen: Mutex::new(Vec::new()), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_metadata(&self) -> Option<EventMetadata> {
        self.seen.lock().unwrap().last().cloned()
    }

    pub fn seen_ids(&self) -> Vec<Uuid> {
        self.seen.lock().unwrap().iter().map(|m| m.id).collect()
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, metadata: &EventMetadata, _payload: &serde_json::Value) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(metadata.clone());
        Ok(())
    }
}

pub struct FailingHandler {
    message: &'static str,
    internal: bool,
}

impl FailingHandler {
    pub fn rejecting(message: &'static str) -> Self {
        Self { message, internal: false }
    }

    pub fn internal(message: &'static str) -> Self {
        Self { message, internal: true }
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn handle(&self, _metadata: &EventMetadata, _payload: &serde_json::Value) -> HandlerResult {
        if self.internal {
            Err(HandlerError::Internal(anyhow!(self.message)))
        } else {
            Err(HandlerError::Rejected(self.message.to_string()))
        }
    }
}

/// Knows a fixed set of reservations and records every call.
#[derive(Default)]
pub struct RecordingBookings {
    reservations: Mutex<Vec<(Uuid, &'static str)>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingBookings {
    pub fn with_reservation(id: Uuid) -> Self {
        Self::with_reservation_in(id, RESERVA_PENDIENTE_PAGO)
    }

    pub fn with_reservation_in(id: Uuid, estado: &'static str) -> Self {
        Self { reservations: Mutex::new(vec![(id, estado)]), calls: Mutex::new(Vec::new()) }
    }

    pub fn reservation_state(&self, id: Uuid) -> Option<&'static str> {
        self.reservations
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| *r == id)
            .map(|(_, estado)| *estado)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Moves `id` to `to` when it is currently in one of `from`.
    fn transition(&self, id: Uuid, from: &[&str], to: &'static str) -> Option<&'static str> {
        let mut reservations = self.reservations.lock().unwrap();
        let (_, estado) = reservations.iter_mut().find(|(r, _)| *r == id)?;
        let before = *estado;
        if from.contains(&before) {
            *estado = to;
        }
        Some(before)
    }
}

#[async_trait]
impl BookingStore for RecordingBookings {
    async fn confirm_checkout(&self, checkout: &CheckoutCompleted) -> Result<CheckoutConfirmation> {
        self.record(format!("confirm_checkout:{}", checkout.reserva_id));
        let before = self.transition(checkout.reserva_id, &RESERVA_CONFIRMABLE, RESERVA_CONFIRMADA);
        Ok(CheckoutConfirmation::for_reservation_state(before))
    }

    async fn expire_checkout(&self, reserva_id: Uuid) -> Result<bool> {
        self.record(format!("expire_checkout:{}", reserva_id));
        let before = self.transition(reserva_id, &[RESERVA_PENDIENTE_PAGO], RESERVA_CANCELADA);
        Ok(before == Some(RESERVA_PENDIENTE_PAGO))
    }

    async fn mark_payment_failed(&self, payment_intent_id: &str) -> Result<usize> {
        self.record(format!("mark_payment_failed:{}", payment_intent_id));
        Ok(0)
    }

    async fn refund_payment(&self, payment_intent_id: &str) -> Result<Option<Uuid>> {
        self.record(format!("refund_payment:{}", payment_intent_id));
        Ok(None)
    }

    async fn sync_agency_account(&self, status: &AccountStatus) -> Result<bool> {
        self.record(format!("sync_agency_account:{}", status.account_id));
        Ok(true)
    }

    async fn upsert_payout(&self, payout: &PayoutUpdate) -> Result<()> {
        self.record(format!("upsert_payout:{}", payout.payout_id));
        Ok(())
    }
}

/// Allows the first `limit` checks per key.
pub struct MemoryRateLimiter {
    limit: usize,
    hits: Mutex<std::collections::HashMap<String, usize>>,
}

impl MemoryRateLimiter {
    pub fn new(limit: usize) -> Self {
        Self { limit, hits: Mutex::new(Default::default()) }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, key: &str) -> Result<bool> {
        let mut hits = self.hits.lock().unwrap();
        let count = hits.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count <= self.limit)
    }
}
