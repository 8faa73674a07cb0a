use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::{info, warn};
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;
use crate::store::DbPool;

pub const RESERVA_PENDIENTE_PAGO: &str = "pendiente_pago";
pub const RESERVA_CONFIRMADA: &str = "confirmada";
pub const RESERVA_CANCELADA: &str = "cancelada";
pub const RESERVA_REEMBOLSADA: &str = "reembolsada";

/// States a completed checkout may (re)confirm. Later states win over a
/// late or replayed checkout event.
pub const RESERVA_CONFIRMABLE: [&str; 2] = [RESERVA_PENDIENTE_PAGO, RESERVA_CONFIRMADA];

pub const PAGO_COMPLETADO: &str = "completado";
pub const PAGO_FALLIDO: &str = "fallido";
pub const PAGO_REEMBOLSADO: &str = "reembolsado";

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutCompleted {
    pub reserva_id: Uuid,
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutConfirmation {
    Confirmed,
    /// The reservation already moved past payment, e.g. cancelled or refunded.
    AlreadySettled(String),
    NotFound,
}

impl CheckoutConfirmation {
    pub fn for_reservation_state(estado: Option<&str>) -> Self {
        match estado {
            None => CheckoutConfirmation::NotFound,
            Some(estado) if RESERVA_CONFIRMABLE.iter().any(|s| *s == estado) => CheckoutConfirmation::Confirmed,
            Some(estado) => CheckoutConfirmation::AlreadySettled(estado.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountStatus {
    pub account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutUpdate {
    pub payout_id: String,
    pub account_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub arrival_date: Option<DateTime<Utc>>,
}

/// Side effects of payment events on reservations, payments and agencies.
/// Every operation is safe to replay.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn confirm_checkout(&self, checkout: &CheckoutCompleted) -> Result<CheckoutConfirmation>;

    /// Returns `false` when no reservation was still awaiting payment.
    async fn expire_checkout(&self, reserva_id: Uuid) -> Result<bool>;

    async fn mark_payment_failed(&self, payment_intent_id: &str) -> Result<usize>;

    /// Returns the refunded reservation, if the payment was known.
    async fn refund_payment(&self, payment_intent_id: &str) -> Result<Option<Uuid>>;

    /// Returns `false` when no agency owns the account.
    async fn sync_agency_account(&self, status: &AccountStatus) -> Result<bool>;

    async fn upsert_payout(&self, payout: &PayoutUpdate) -> Result<()>;
}

pub struct PgBookingStore {
    pool: DbPool,
}

impl PgBookingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn confirm_checkout(&self, checkout: &CheckoutCompleted) -> Result<CheckoutConfirmation> {
        let mut conn = self.pool.get().await?;

        let new_pago = NewPago {
            id: Uuid::new_v4(),
            reserva_id: checkout.reserva_id,
            stripe_session_id: checkout.session_id.clone(),
            stripe_payment_intent_id: checkout.payment_intent_id.clone(),
            monto: amount_from_minor_units(checkout.amount_minor),
            moneda: checkout.currency.to_lowercase(),
            estado: PAGO_COMPLETADO.to_string(),
        };
        let reserva_id = checkout.reserva_id;
        let session_id = checkout.session_id.clone();
        let checkout = checkout.clone();

        let confirmation = conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    reservas::table
                        .filter(reservas::id.eq(checkout.reserva_id))
                        .filter(reservas::estado.eq_any(RESERVA_CONFIRMABLE)),
                )
                .set((
                    reservas::estado.eq(RESERVA_CONFIRMADA),
                    reservas::stripe_session_id.eq(Some(checkout.session_id.clone())),
                    reservas::actualizado_en.eq(Some(Utc::now())),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    let estado = reservas::table
                        .filter(reservas::id.eq(checkout.reserva_id))
                        .select(reservas::estado)
                        .first::<String>(conn)
                        .await
                        .optional()?;
                    return Ok(CheckoutConfirmation::for_reservation_state(estado.as_deref()));
                }

                diesel::insert_into(pagos::table)
                    .values(&new_pago)
                    .on_conflict(pagos::stripe_session_id)
                    .do_nothing()
                    .execute(conn)
                    .await?;

                Ok(CheckoutConfirmation::Confirmed)
            })
        }).await?;

        match &confirmation {
            CheckoutConfirmation::Confirmed => {
                info!("Reservation {} confirmed by checkout {}", reserva_id, session_id)
            }
            CheckoutConfirmation::AlreadySettled(estado) => warn!(
                "Checkout {} arrived for reservation {} already {}, left as is",
                session_id, reserva_id, estado
            ),
            CheckoutConfirmation::NotFound => {}
        }

        Ok(confirmation)
    }

    async fn expire_checkout(&self, reserva_id: Uuid) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            reservas::table
                .filter(reservas::id.eq(reserva_id))
                .filter(reservas::estado.eq(RESERVA_PENDIENTE_PAGO)),
        )
        .set((
            reservas::estado.eq(RESERVA_CANCELADA),
            reservas::actualizado_en.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated > 0)
    }

    async fn mark_payment_failed(&self, payment_intent_id: &str) -> Result<usize> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            pagos::table
                .filter(pagos::stripe_payment_intent_id.eq(payment_intent_id))
                .filter(pagos::estado.ne(PAGO_REEMBOLSADO)),
        )
        .set((
            pagos::estado.eq(PAGO_FALLIDO),
            pagos::actualizado_en.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated)
    }

    async fn refund_payment(&self, payment_intent_id: &str) -> Result<Option<Uuid>> {
        let mut conn = self.pool.get().await?;
        let payment_intent_id = payment_intent_id.to_string();

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let reserva_ids: Vec<Uuid> = diesel::update(
                    pagos::table.filter(pagos::stripe_payment_intent_id.eq(payment_intent_id.as_str())),
                )
                .set((
                    pagos::estado.eq(PAGO_REEMBOLSADO),
                    pagos::actualizado_en.eq(Some(Utc::now())),
                ))
                .returning(pagos::reserva_id)
                .get_results(conn)
                .await?;

                let Some(reserva_id) = reserva_ids.into_iter().next() else {
                    return Ok(None);
                };

                diesel::update(reservas::table.filter(reservas::id.eq(reserva_id)))
                    .set((
                        reservas::estado.eq(RESERVA_REEMBOLSADA),
                        reservas::actualizado_en.eq(Some(Utc::now())),
                    ))
                    .execute(conn)
                    .await?;

                Ok(Some(reserva_id))
            })
        }).await
    }

    async fn sync_agency_account(&self, status: &AccountStatus) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            agencias::table.filter(agencias::stripe_account_id.eq(status.account_id.as_str())),
        )
        .set((
            agencias::cobros_habilitados.eq(status.charges_enabled),
            agencias::pagos_habilitados.eq(status.payouts_enabled),
            agencias::onboarding_completo.eq(status.details_submitted),
            agencias::actualizado_en.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated > 0)
    }

    async fn upsert_payout(&self, payout: &PayoutUpdate) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let row = LiquidacionRow {
            stripe_payout_id: payout.payout_id.clone(),
            stripe_account_id: payout.account_id.clone(),
            monto: amount_from_minor_units(payout.amount_minor),
            moneda: payout.currency.to_lowercase(),
            estado: payout.status.clone(),
            fecha_llegada: payout.arrival_date,
            actualizado_en: Some(Utc::now()),
        };

        diesel::insert_into(liquidaciones::table)
            .values(&row)
            .on_conflict(liquidaciones::stripe_payout_id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}
