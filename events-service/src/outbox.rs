use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;
use crate::handlers::HandlerError;
use crate::notifier::{DeadLetterAlert, OperatorNotifier};
use crate::registry::HandlerRegistry;
use crate::store::EventStore;

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub batch_size: i64,
    pub lease: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            lease: Duration::minutes(15),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Processed,
    Retried,
    DeadLettered,
    /// Another run took the claim over and settled the row first.
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub reclaimed: usize,
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub lost: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Lost => self.lost += 1,
        }
    }
}

pub struct OutboxProcessor {
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    notifier: Arc<dyn OperatorNotifier>,
    config: DispatchConfig,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<HandlerRegistry>,
        notifier: Arc<dyn OperatorNotifier>,
        config: DispatchConfig,
    ) -> Self {
        Self { store, registry, notifier, config }
    }

    pub async fn run(&self, period: std::time::Duration) {
        let mut interval = time::interval(period);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// One dispatcher pass: reap expired claims, claim a batch, run it.
    pub async fn process_outbox_events(&self) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let now = Utc::now();

        for event in self.store.reclaim_expired(self.config.lease, now).await? {
            warn!("Claim on event {} expired while en_proceso", event.id);
            summary.reclaimed += 1;
            match self.record_failure(&event, "Lease expired while en_proceso").await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => error!("Failed to settle expired event {}: {}", event.id, e),
            }
        }

        let events = self.store.claim_batch(self.config.batch_size, now).await?;
        summary.claimed = events.len();
        if !events.is_empty() {
            info!("Claimed {} outbox events", events.len());
        }

        for event in events {
            match self.process_event(&event).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => error!("Failed to settle event {}: {}", event.id, e),
            }
        }

        Ok(summary)
    }

    /// Dispatches a single event right after it was stored. Returns `None`
    /// when the row was not claimable (already taken or settled).
    pub async fn dispatch_one(&self, id: Uuid) -> Result<Option<Outcome>> {
        match self.store.claim_one(id, Utc::now()).await? {
            Some(event) => Ok(Some(self.process_event(&event).await?)),
            None => Ok(None),
        }
    }

    async fn process_event(&self, event: &Event) -> Result<Outcome> {
        match self.invoke_handlers(event).await {
            Ok(()) => {
                if !self.store.mark_processed(event, Utc::now()).await? {
                    return Ok(self.lost_claim(event));
                }
                info!(event_id = %event.id, tipo = %event.kind, "Processed outbox event");
                Ok(Outcome::Processed)
            }
            Err(e) => self.record_failure(event, &e.to_string()).await,
        }
    }

    /// Runs the chain in order and stops at the first failure. Effects of
    /// handlers that already ran are kept.
    async fn invoke_handlers(&self, event: &Event) -> Result<(), HandlerError> {
        let metadata = event.metadata();

        for handler in self.registry.handlers_for(&event.event_kind()) {
            handler
                .handle(&metadata, &event.payload)
                .await
                .map_err(|e| match e {
                    HandlerError::Rejected(msg) => HandlerError::Rejected(format!("{}: {}", handler.name(), msg)),
                    HandlerError::Internal(err) => HandlerError::Internal(anyhow!("{}: {:#}", handler.name(), err)),
                })?;
        }

        Ok(())
    }

    async fn record_failure(&self, event: &Event, message: &str) -> Result<Outcome> {
        let now = Utc::now();
        let decision = self.config.retry.on_failure(event.attempts, now);
        if !self.store.mark_failed(event, &decision, message, now).await? {
            return Ok(self.lost_claim(event));
        }

        match decision {
            FailureDecision::Retry { attempts, next_attempt_at } => {
                warn!(
                    event_id = %event.id,
                    tipo = %event.kind,
                    intentos = attempts,
                    "Outbox event failed, retrying at {}: {}",
                    next_attempt_at,
                    message
                );
                Ok(Outcome::Retried)
            }
            FailureDecision::DeadLetter { attempts } => {
                error!(
                    event_id = %event.id,
                    tipo = %event.kind,
                    intentos = attempts,
                    "Outbox event dead-lettered: {}",
                    message
                );
                let alert = DeadLetterAlert {
                    metadata: event.metadata(),
                    attempts,
                    error: truncate_error(message),
                };
                if let Err(e) = self.notifier.dead_letter(&alert).await {
                    error!("Failed to notify operator about event {}: {}", event.id, e);
                }
                Ok(Outcome::DeadLettered)
            }
        }
    }

    fn lost_claim(&self, event: &Event) -> Outcome {
        warn!(
            event_id = %event.id,
            tipo = %event.kind,
            "Claim on outbox event was taken over before it could be settled"
        );
        Outcome::Lost
    }
}
