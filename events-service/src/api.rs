use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use uuid::Uuid;
use crate::error::ApiError;
use crate::outbox::{DispatchSummary, OutboxProcessor, Outcome};
use crate::rate_limit::{rate_limit, RateLimiter};
use crate::store::EventStore;
use crate::verification::{bearer_matches, verify_stripe_signature};

#[derive(Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_secs: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub processor: Arc<OutboxProcessor>,
    pub webhook: WebhookConfig,
    pub cron_secret: Option<String>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

#[derive(Debug, Deserialize)]
struct StripeEventHeader {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub estado: Option<String>,
    pub limit: Option<i64>,
}

const MAX_LIST_LIMIT: i64 = 500;

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/webhooks/stripe", post(receive_stripe_webhook))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(state.rate_limiter.clone(), rate_limit));

    let operator = Router::new()
        .route("/cron/eventos", get(run_dispatcher).post(run_dispatcher))
        .route("/eventos", get(list_events))
        .route("/eventos/:id/reintentar", post(requeue_event))
        .layer(middleware::from_fn_with_state(state.clone(), require_operator));

    Router::new()
        .merge(public)
        .merge(operator)
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Bearer guard for cron and operator routes. Open when no secret is set.
async fn require_operator(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(secret) = &state.cron_secret {
        if !bearer_matches(req.headers(), secret) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}

pub async fn receive_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers.get("stripe-signature").and_then(|v| v.to_str().ok());
    verify_stripe_signature(
        &state.webhook.secret,
        &body,
        signature,
        Utc::now().timestamp(),
        state.webhook.tolerance_secs,
    )?;

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {}", e)))?;
    let header: StripeEventHeader = serde_json::from_value(payload.clone())
        .map_err(|e| ApiError::BadRequest(format!("Not a Stripe event: {}", e)))?;

    let new_event = NewEvent::new(PRIORITY_SOURCE, &header.kind, payload, Some(header.id.clone()));
    let event_id = new_event.id;

    if !state.store.insert(new_event, Utc::now()).await? {
        tracing::info!("Duplicate delivery of Stripe event {}", header.id);
        return Ok(Json(WebhookAck { received: true, duplicate: true, outcome: None }));
    }

    tracing::info!("Stored Stripe event {} ({}) as {}", header.id, header.kind, event_id);

    // The event is durable now; a failed dispatch is retried by the cron pass.
    let outcome = match state.processor.dispatch_one(event_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Synchronous dispatch of event {} failed: {}", event_id, e);
            None
        }
    };

    Ok(Json(WebhookAck { received: true, duplicate: false, outcome }))
}

pub async fn run_dispatcher(State(state): State<AppState>) -> Result<Json<DispatchSummary>, ApiError> {
    let summary = state.processor.process_outbox_events().await?;
    tracing::info!(
        "Dispatcher run: claimed {}, processed {}, retried {}, dead-lettered {}, reclaimed {}",
        summary.claimed,
        summary.processed,
        summary.retried,
        summary.dead_lettered,
        summary.reclaimed
    );
    Ok(Json(summary))
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let status = params
        .estado
        .as_deref()
        .map(str::parse::<EventStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let limit = params.limit.unwrap_or(DEFAULT_BATCH_SIZE).clamp(1, MAX_LIST_LIMIT);

    Ok(Json(state.store.list(status, limit).await?))
}

pub async fn requeue_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Event>, ApiError> {
    if let Some(event) = state.store.requeue(id).await? {
        tracing::info!("Event {} requeued by operator", id);
        return Ok(Json(event));
    }

    match state.store.find(id).await? {
        Some(event) => Err(ApiError::Conflict(format!(
            "Event {} is {} and cannot be requeued",
            id, event.status
        ))),
        None => Err(ApiError::NotFound(format!("Event {} not found", id))),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
