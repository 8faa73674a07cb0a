use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use shared::EventMetadata;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterAlert {
    pub metadata: EventMetadata,
    pub attempts: i32,
    pub error: String,
}

/// Tells a human about events that exhausted their retries.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn dead_letter(&self, alert: &DeadLetterAlert) -> Result<()>;
}

impl DeadLetterAlert {
    pub fn subject(&self) -> String {
        format!("[eventos] {} fallido tras {} intentos", self.metadata.tipo, self.attempts)
    }

    pub fn body(&self) -> String {
        format!(
            "Evento: {}\nOrigen: {}\nTipo: {}\nRecibido: {}\nIntentos: {}\nError: {}\n",
            self.metadata.id,
            self.metadata.origen,
            self.metadata.tipo,
            self.metadata.recibido_en.to_rfc3339(),
            self.attempts,
            self.error,
        )
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub operator: String,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
}

/// Sends alerts through a transactional email HTTP API.
pub struct EmailNotifier {
    client: reqwest::Client,
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl OperatorNotifier for EmailNotifier {
    async fn dead_letter(&self, alert: &DeadLetterAlert) -> Result<()> {
        let body = SendEmailRequest {
            from: self.config.from.as_str(),
            to: [self.config.operator.as_str()],
            subject: alert.subject(),
            text: alert.body(),
        };

        let resp = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Email request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Email API returned {status}: {text}"));
        }

        info!("Operator notified about dead-lettered event {}", alert.metadata.id);
        Ok(())
    }
}

/// Used when no email API key is configured.
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn dead_letter(&self, alert: &DeadLetterAlert) -> Result<()> {
        error!(
            event_id = %alert.metadata.id,
            tipo = %alert.metadata.tipo,
            intentos = alert.attempts,
            "{}: {}",
            alert.subject(),
            alert.error
        );
        Ok(())
    }
}
