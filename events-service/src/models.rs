use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use shared::*;

#[derive(Debug, Clone, Queryable, QueryableByName, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::eventos)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbEvent {
    pub id: Uuid,
    pub origen: String,
    pub tipo: String,
    pub payload: serde_json::Value,
    pub estado: String,
    pub intentos: i32,
    pub recibido_en: DateTime<Utc>,
    pub procesado_en: Option<DateTime<Utc>>,
    pub ultimo_intento: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub id_externo: Option<String>,
    pub proximo_intento: Option<DateTime<Utc>>,
    pub reclamado_en: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::eventos)]
pub struct NewDbEvent {
    pub id: Uuid,
    pub origen: String,
    pub tipo: String,
    pub payload: serde_json::Value,
    pub estado: String,
    pub intentos: i32,
    pub recibido_en: DateTime<Utc>,
    pub id_externo: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::pagos)]
pub struct NewPago {
    pub id: Uuid,
    pub reserva_id: Uuid,
    pub stripe_session_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub monto: bigdecimal::BigDecimal,
    pub moneda: String,
    pub estado: String,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::liquidaciones)]
pub struct LiquidacionRow {
    pub stripe_payout_id: String,
    pub stripe_account_id: Option<String>,
    pub monto: bigdecimal::BigDecimal,
    pub moneda: String,
    pub estado: String,
    pub fecha_llegada: Option<DateTime<Utc>>,
    pub actualizado_en: Option<DateTime<Utc>>,
}

impl NewDbEvent {
    pub fn from_new(event: NewEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            id: event.id,
            origen: event.source,
            tipo: event.kind,
            payload: event.payload,
            estado: EventStatus::Pending.as_str().to_string(),
            intentos: 0,
            recibido_en: received_at,
            id_externo: event.external_id,
        }
    }
}

impl TryFrom<DbEvent> for Event {
    type Error = anyhow::Error;

    fn try_from(row: DbEvent) -> Result<Self, Self::Error> {
        let status: EventStatus = row.estado.parse()?;

        Ok(Self {
            id: row.id,
            source: row.origen,
            kind: row.tipo,
            payload: row.payload,
            status,
            attempts: row.intentos,
            received_at: row.recibido_en,
            processed_at: row.procesado_en,
            last_attempt_at: row.ultimo_intento,
            error_msg: row.error_msg,
            external_id: row.id_externo,
            next_attempt_at: row.proximo_intento,
            claimed_at: row.reclamado_en,
        })
    }
}

/// Converts Stripe's minor units (cents) into a two-decimal amount.
pub fn amount_from_minor_units(minor: i64) -> bigdecimal::BigDecimal {
    bigdecimal::BigDecimal::new(minor.into(), 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_become_two_decimals() {
        assert_eq!(amount_from_minor_units(12550).to_string(), "125.50");
        assert_eq!(amount_from_minor_units(5).to_string(), "0.05");
    }

    #[test]
    fn rows_with_unknown_status_are_rejected() {
        let row = DbEvent {
            id: Uuid::new_v4(),
            origen: "stripe".to_string(),
            tipo: "charge.refunded".to_string(),
            payload: serde_json::json!({}),
            estado: "archivado".to_string(),
            intentos: 0,
            recibido_en: Utc::now(),
            procesado_en: None,
            ultimo_intento: None,
            error_msg: None,
            id_externo: None,
            proximo_intento: None,
            reclamado_en: None,
        };
        assert!(Event::try_from(row).is_err());
    }
}
