use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use shared::*;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use crate::bookings::*;
use crate::registry::HandlerRegistry;

/// Why a handler did not complete. Both variants count as a failed attempt.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran but refused the event (bad payload, unknown entity).
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type HandlerResult = Result<(), HandlerError>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, metadata: &EventMetadata, payload: &serde_json::Value) -> HandlerResult;
}

#[derive(Debug, Deserialize)]
struct StripeEnvelope<T> {
    data: StripeData<T>,
    #[serde(default)]
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeData<T> {
    object: T,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    #[serde(default)]
    payment_intent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountObject {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
}

#[derive(Debug, Deserialize)]
struct PayoutObject {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    arrival_date: Option<i64>,
}

fn parse_envelope<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<StripeEnvelope<T>, HandlerError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| HandlerError::Rejected(format!("Malformed payload: {}", e)))
}

pub fn parse_checkout_completed(payload: &serde_json::Value) -> Result<CheckoutCompleted, HandlerError> {
    let session = parse_envelope::<CheckoutSessionObject>(payload)?.data.object;
    let reserva_id = reservation_id(&session)?;

    Ok(CheckoutCompleted {
        reserva_id,
        session_id: session.id,
        payment_intent_id: session.payment_intent,
        amount_minor: session
            .amount_total
            .ok_or_else(|| HandlerError::Rejected("Checkout session without amount_total".to_string()))?,
        currency: session.currency.unwrap_or_else(|| "eur".to_string()),
    })
}

pub fn parse_checkout_expired(payload: &serde_json::Value) -> Result<Uuid, HandlerError> {
    let session = parse_envelope::<CheckoutSessionObject>(payload)?.data.object;
    reservation_id(&session)
}

pub fn parse_payment_intent_id(payload: &serde_json::Value) -> Result<String, HandlerError> {
    Ok(parse_envelope::<PaymentIntentObject>(payload)?.data.object.id)
}

pub fn parse_refunded_payment_intent(payload: &serde_json::Value) -> Result<String, HandlerError> {
    parse_envelope::<ChargeObject>(payload)?
        .data
        .object
        .payment_intent
        .ok_or_else(|| HandlerError::Rejected("Refunded charge without payment_intent".to_string()))
}

pub fn parse_account_status(payload: &serde_json::Value) -> Result<AccountStatus, HandlerError> {
    let account = parse_envelope::<AccountObject>(payload)?.data.object;
    Ok(AccountStatus {
        account_id: account.id,
        charges_enabled: account.charges_enabled,
        payouts_enabled: account.payouts_enabled,
        details_submitted: account.details_submitted,
    })
}

pub fn parse_payout(payload: &serde_json::Value) -> Result<PayoutUpdate, HandlerError> {
    let envelope = parse_envelope::<PayoutObject>(payload)?;
    let payout = envelope.data.object;
    let arrival_date: Option<DateTime<Utc>> = payout
        .arrival_date
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Ok(PayoutUpdate {
        payout_id: payout.id,
        account_id: envelope.account,
        amount_minor: payout.amount,
        currency: payout.currency,
        status: payout.status,
        arrival_date,
    })
}

fn reservation_id(session: &CheckoutSessionObject) -> Result<Uuid, HandlerError> {
    let raw = session
        .metadata
        .get("reserva_id")
        .or(session.client_reference_id.as_ref())
        .ok_or_else(|| HandlerError::Rejected(format!("Checkout session {} has no reserva_id", session.id)))?;

    Uuid::parse_str(raw).map_err(|_| HandlerError::Rejected(format!("Invalid reserva_id: {}", raw)))
}

fn unexpected(handler: &str, metadata: &EventMetadata) -> HandlerError {
    HandlerError::Rejected(format!("{} cannot handle {}", handler, metadata.tipo))
}

pub struct CheckoutHandler {
    bookings: Arc<dyn BookingStore>,
}

impl CheckoutHandler {
    pub fn new(bookings: Arc<dyn BookingStore>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl EventHandler for CheckoutHandler {
    fn name(&self) -> &'static str {
        "checkout"
    }

    async fn handle(&self, metadata: &EventMetadata, payload: &serde_json::Value) -> HandlerResult {
        match EventKind::from(metadata.tipo.as_str()) {
            EventKind::CheckoutSessionCompleted => {
                let checkout = parse_checkout_completed(payload)?;
                match self.bookings.confirm_checkout(&checkout).await? {
                    CheckoutConfirmation::NotFound => Err(HandlerError::Rejected(format!(
                        "Reservation {} not found",
                        checkout.reserva_id
                    ))),
                    CheckoutConfirmation::Confirmed | CheckoutConfirmation::AlreadySettled(_) => Ok(()),
                }
            }
            EventKind::CheckoutSessionExpired => {
                let reserva_id = parse_checkout_expired(payload)?;
                if self.bookings.expire_checkout(reserva_id).await? {
                    info!("Reservation {} cancelled after checkout expiry", reserva_id);
                }
                Ok(())
            }
            _ => Err(unexpected(self.name(), metadata)),
        }
    }
}

pub struct PaymentHandler {
    bookings: Arc<dyn BookingStore>,
}

impl PaymentHandler {
    pub fn new(bookings: Arc<dyn BookingStore>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl EventHandler for PaymentHandler {
    fn name(&self) -> &'static str {
        "payment"
    }

    async fn handle(&self, metadata: &EventMetadata, payload: &serde_json::Value) -> HandlerResult {
        match EventKind::from(metadata.tipo.as_str()) {
            EventKind::PaymentIntentFailed => {
                let payment_intent_id = parse_payment_intent_id(payload)?;
                let updated = self.bookings.mark_payment_failed(&payment_intent_id).await?;
                if updated == 0 {
                    // Failures before checkout completes have no payment row yet.
                    info!("No payment recorded for failed intent {}", payment_intent_id);
                }
                Ok(())
            }
            EventKind::ChargeRefunded => {
                let payment_intent_id = parse_refunded_payment_intent(payload)?;
                match self.bookings.refund_payment(&payment_intent_id).await? {
                    Some(reserva_id) => {
                        info!("Reservation {} refunded", reserva_id);
                        Ok(())
                    }
                    None => Err(HandlerError::Rejected(format!(
                        "No payment for refunded intent {}",
                        payment_intent_id
                    ))),
                }
            }
            _ => Err(unexpected(self.name(), metadata)),
        }
    }
}

pub struct AgencyHandler {
    bookings: Arc<dyn BookingStore>,
}

impl AgencyHandler {
    pub fn new(bookings: Arc<dyn BookingStore>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl EventHandler for AgencyHandler {
    fn name(&self) -> &'static str {
        "agency"
    }

    async fn handle(&self, metadata: &EventMetadata, payload: &serde_json::Value) -> HandlerResult {
        match EventKind::from(metadata.tipo.as_str()) {
            EventKind::AccountUpdated => {
                let status = parse_account_status(payload)?;
                if !self.bookings.sync_agency_account(&status).await? {
                    warn!("No agency linked to connected account {}", status.account_id);
                }
                Ok(())
            }
            EventKind::PayoutPaid | EventKind::PayoutFailed => {
                let payout = parse_payout(payload)?;
                self.bookings.upsert_payout(&payout).await?;
                info!("Payout {} is {}", payout.payout_id, payout.status);
                Ok(())
            }
            _ => Err(unexpected(self.name(), metadata)),
        }
    }
}

pub fn register_booking_handlers(registry: &mut HandlerRegistry, bookings: Arc<dyn BookingStore>) {
    let checkout: Arc<dyn EventHandler> = Arc::new(CheckoutHandler::new(bookings.clone()));
    let payment: Arc<dyn EventHandler> = Arc::new(PaymentHandler::new(bookings.clone()));
    let agency: Arc<dyn EventHandler> = Arc::new(AgencyHandler::new(bookings));

    registry.register(EventKind::CheckoutSessionCompleted, checkout.clone());
    registry.register(EventKind::CheckoutSessionExpired, checkout);
    registry.register(EventKind::PaymentIntentFailed, payment.clone());
    registry.register(EventKind::ChargeRefunded, payment);
    registry.register(EventKind::AccountUpdated, agency.clone());
    registry.register(EventKind::PayoutPaid, agency.clone());
    registry.register(EventKind::PayoutFailed, agency);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{metadata_for, RecordingBookings};
    use serde_json::json;

    fn checkout_payload(metadata: serde_json::Value) -> serde_json::Value {
        json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_test_1",
                "payment_intent": "pi_1",
                "amount_total": 4500,
                "currency": "EUR",
                "metadata": metadata,
            }}
        })
    }

    #[test]
    fn checkout_completed_reads_reservation_from_metadata() {
        let reserva_id = Uuid::new_v4();
        let checkout = parse_checkout_completed(&checkout_payload(json!({"reserva_id": reserva_id.to_string()}))).unwrap();
        assert_eq!(checkout.reserva_id, reserva_id);
        assert_eq!(checkout.session_id, "cs_test_1");
        assert_eq!(checkout.payment_intent_id.as_deref(), Some("pi_1"));
        assert_eq!(checkout.amount_minor, 4500);
    }

    #[test]
    fn checkout_without_reservation_is_rejected() {
        let err = parse_checkout_completed(&checkout_payload(json!({}))).unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(msg) if msg.contains("no reserva_id")));
    }

    #[test]
    fn payout_takes_connected_account_from_envelope() {
        let payload = json!({
            "account": "acct_9",
            "data": {"object": {"id": "po_1", "amount": 1000, "currency": "eur", "status": "paid", "arrival_date": 1_700_000_000}}
        });
        let payout = parse_payout(&payload).unwrap();
        assert_eq!(payout.account_id.as_deref(), Some("acct_9"));
        assert_eq!(payout.arrival_date.map(|d| d.timestamp()), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn unknown_reservation_is_a_soft_failure() {
        let bookings = Arc::new(RecordingBookings::default());
        let handler = CheckoutHandler::new(bookings.clone());
        let payload = checkout_payload(json!({"reserva_id": Uuid::new_v4().to_string()}));

        let err = handler
            .handle(&metadata_for("checkout.session.completed"), &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(bookings.calls().len(), 1);
    }

    #[tokio::test]
    async fn known_reservation_is_confirmed() {
        let reserva_id = Uuid::new_v4();
        let bookings = Arc::new(RecordingBookings::with_reservation(reserva_id));
        let handler = CheckoutHandler::new(bookings.clone());
        let payload = checkout_payload(json!({"reserva_id": reserva_id.to_string()}));

        handler
            .handle(&metadata_for("checkout.session.completed"), &payload)
            .await
            .unwrap();
        assert_eq!(bookings.calls(), vec![format!("confirm_checkout:{}", reserva_id)]);
    }

    #[tokio::test]
    async fn late_checkout_for_refunded_reservation_is_acknowledged() {
        let reserva_id = Uuid::new_v4();
        let bookings = Arc::new(RecordingBookings::with_reservation_in(reserva_id, RESERVA_REEMBOLSADA));
        let handler = CheckoutHandler::new(bookings.clone());
        let payload = checkout_payload(json!({"reserva_id": reserva_id.to_string()}));

        handler
            .handle(&metadata_for("checkout.session.completed"), &payload)
            .await
            .unwrap();
        assert_eq!(bookings.reservation_state(reserva_id), Some(RESERVA_REEMBOLSADA));
    }

    #[tokio::test]
    async fn refund_of_unknown_payment_is_rejected() {
        let bookings = Arc::new(RecordingBookings::default());
        let handler = PaymentHandler::new(bookings);
        let payload = json!({"data": {"object": {"id": "ch_1", "payment_intent": "pi_404"}}});

        let err = handler
            .handle(&metadata_for("charge.refunded"), &payload)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pi_404"));
    }

    #[tokio::test]
    async fn handlers_refuse_foreign_kinds() {
        let handler = AgencyHandler::new(Arc::new(RecordingBookings::default()));
        let err = handler
            .handle(&metadata_for("charge.refunded"), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "agency cannot handle charge.refunded");
    }

    #[test]
    fn every_subscribed_kind_gets_a_handler() {
        let mut registry = HandlerRegistry::new();
        register_booking_handlers(&mut registry, Arc::new(RecordingBookings::default()));
        assert!(registry.validate(&EventKind::SUBSCRIBED).is_ok());
    }
}
