use anyhow::anyhow;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use shared::EventMetadata;
use std::time::Duration;
use crate::handlers::{EventHandler, HandlerResult};

#[derive(Serialize)]
struct RelayedEvent<'a> {
    metadata: &'a EventMetadata,
    payload: &'a serde_json::Value,
}

pub fn topic_for(metadata: &EventMetadata) -> String {
    format!("{}-events", metadata.categoria)
}

/// Republishes every dispatched event to `<categoria>-events`.
pub struct KafkaRelay {
    producer: FutureProducer,
}

impl KafkaRelay {
    pub fn new(brokers: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl EventHandler for KafkaRelay {
    fn name(&self) -> &'static str {
        "kafka-relay"
    }

    async fn handle(&self, metadata: &EventMetadata, payload: &serde_json::Value) -> HandlerResult {
        let topic = topic_for(metadata);
        let json = serde_json::to_string(&RelayedEvent { metadata, payload }).map_err(anyhow::Error::from)?;
        let key = metadata.id.to_string();
        let record = FutureRecord::to(&topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::metadata_for;

    #[test]
    fn topic_follows_category() {
        assert_eq!(topic_for(&metadata_for("checkout.session.completed")), "checkout-events");
        assert_eq!(topic_for(&metadata_for("payout.failed")), "payout-events");
    }
}
