use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Attempts after which an event is dead-lettered.
pub const MAX_INTENTOS: i32 = 5;
pub const ERROR_MSG_MAX_CHARS: usize = 500;
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Source whose events are always dispatched ahead of everything else.
pub const PRIORITY_SOURCE: &str = "stripe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "en_proceso")]
    InProgress,
    #[serde(rename = "procesado")]
    Processed,
    #[serde(rename = "error")]
    Errored,
    #[serde(rename = "fallido")]
    Failed,
}

#[derive(Debug, Error)]
#[error("unknown event status: {0}")]
pub struct UnknownStatus(pub String);

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pendiente",
            EventStatus::InProgress => "en_proceso",
            EventStatus::Processed => "procesado",
            EventStatus::Errored => "error",
            EventStatus::Failed => "fallido",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Processed | EventStatus::Failed)
    }

    /// Rows an operator may push back to `pendiente`.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, EventStatus::Errored | EventStatus::Failed)
    }
}

impl FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pendiente" => Ok(EventStatus::Pending),
            "en_proceso" => Ok(EventStatus::InProgress),
            "procesado" => Ok(EventStatus::Processed),
            "error" => Ok(EventStatus::Errored),
            "fallido" => Ok(EventStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processor event types the platform reacts to. Anything else is kept
/// verbatim in `Other` so it can still be stored and relayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    CheckoutSessionCompleted,
    CheckoutSessionExpired,
    PaymentIntentFailed,
    ChargeRefunded,
    AccountUpdated,
    PayoutPaid,
    PayoutFailed,
    Other(String),
}

impl EventKind {
    pub const SUBSCRIBED: [EventKind; 7] = [
        EventKind::CheckoutSessionCompleted,
        EventKind::CheckoutSessionExpired,
        EventKind::PaymentIntentFailed,
        EventKind::ChargeRefunded,
        EventKind::AccountUpdated,
        EventKind::PayoutPaid,
        EventKind::PayoutFailed,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::CheckoutSessionCompleted => "checkout.session.completed",
            EventKind::CheckoutSessionExpired => "checkout.session.expired",
            EventKind::PaymentIntentFailed => "payment_intent.payment_failed",
            EventKind::ChargeRefunded => "charge.refunded",
            EventKind::AccountUpdated => "account.updated",
            EventKind::PayoutPaid => "payout.paid",
            EventKind::PayoutFailed => "payout.failed",
            EventKind::Other(tipo) => tipo,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Other(_))
    }

    pub fn category(&self) -> &str {
        category_of(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(tipo: &str) -> Self {
        match tipo {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "checkout.session.expired" => EventKind::CheckoutSessionExpired,
            "payment_intent.payment_failed" => EventKind::PaymentIntentFailed,
            "charge.refunded" => EventKind::ChargeRefunded,
            "account.updated" => EventKind::AccountUpdated,
            "payout.paid" => EventKind::PayoutPaid,
            "payout.failed" => EventKind::PayoutFailed,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(tipo: String) -> Self {
        EventKind::from(tipo.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First dot-segment of an event type: `checkout.session.completed` -> `checkout`.
pub fn category_of(tipo: &str) -> &str {
    tipo.split('.').next().unwrap_or(tipo)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "origen")]
    pub source: String,
    #[serde(rename = "tipo")]
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(rename = "estado")]
    pub status: EventStatus,
    #[serde(rename = "intentos")]
    pub attempts: i32,
    #[serde(rename = "recibido_en")]
    pub received_at: DateTime<Utc>,
    #[serde(rename = "procesado_en")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(rename = "ultimo_intento")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    #[serde(rename = "id_externo")]
    pub external_id: Option<String>,
    #[serde(rename = "proximo_intento")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(rename = "reclamado_en")]
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: Uuid,
    pub origen: String,
    pub tipo: String,
    pub categoria: String,
    pub recibido_en: DateTime<Utc>,
}

/// What a producer writes to the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: Uuid,
    pub source: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub external_id: Option<String>,
}

impl Event {
    pub fn event_kind(&self) -> EventKind {
        EventKind::from(self.kind.as_str())
    }

    pub fn category(&self) -> &str {
        category_of(&self.kind)
    }

    pub fn metadata(&self) -> EventMetadata {
        EventMetadata {
            id: self.id,
            origen: self.source.clone(),
            tipo: self.kind.clone(),
            categoria: self.category().to_string(),
            recibido_en: self.received_at,
        }
    }

    pub fn from_new(new_event: NewEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            id: new_event.id,
            source: new_event.source,
            kind: new_event.kind,
            payload: new_event.payload,
            status: EventStatus::Pending,
            attempts: 0,
            received_at,
            processed_at: None,
            last_attempt_at: None,
            error_msg: None,
            external_id: new_event.external_id,
            next_attempt_at: None,
            claimed_at: None,
        }
    }

    /// Whether a claim at `now` may pick this row up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Pending => true,
            EventStatus::Errored => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

impl NewEvent {
    pub fn new(source: &str, kind: &str, payload: serde_json::Value, external_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            kind: kind.to_string(),
            payload,
            external_id,
        }
    }
}

/// Dispatch order: priority source first, then by source, then oldest first.
pub fn claim_order(a: &Event, b: &Event) -> Ordering {
    let rank = |e: &Event| e.source != PRIORITY_SOURCE;
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.received_at.cmp(&b.received_at))
}

pub fn sort_for_dispatch(events: &mut [Event]) {
    events.sort_by(claim_order);
}

/// Cuts a failure message down to what fits in `error_msg`.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(ERROR_MSG_MAX_CHARS).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLetter {
        attempts: i32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_INTENTOS,
            base_delay: Duration::seconds(30),
            max_delay: Duration::hours(1),
        }
    }
}

impl RetryPolicy {
    pub fn on_failure(&self, previous_attempts: i32, now: DateTime<Utc>) -> FailureDecision {
        let attempts = previous_attempts.saturating_add(1);
        if attempts >= self.max_attempts {
            FailureDecision::DeadLetter { attempts }
        } else {
            FailureDecision::Retry {
                attempts,
                next_attempt_at: now + self.backoff(attempts),
            }
        }
    }

    /// Delay before the retry that follows failure number `attempts`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = (attempts.max(1) - 1).min(30) as u32;
        let seconds = self
            .base_delay
            .num_seconds()
            .saturating_mul(1i64 << exponent);
        Duration::seconds(seconds).min(self.max_delay)
    }
}

impl FailureDecision {
    pub fn status(&self) -> EventStatus {
        match self {
            FailureDecision::Retry { .. } => EventStatus::Errored,
            FailureDecision::DeadLetter { .. } => EventStatus::Failed,
        }
    }

    pub fn attempts(&self) -> i32 {
        match self {
            FailureDecision::Retry { attempts, .. } | FailureDecision::DeadLetter { attempts } => *attempts,
        }
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FailureDecision::Retry { next_attempt_at, .. } => Some(*next_attempt_at),
            FailureDecision::DeadLetter { .. } => None,
        }
    }
}
