//! Delivery client: the HTTP POST at the end of the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{DeliveryOutcome, TaskEnvelope};
use crate::error::CourierError;

/// Bodies kept for `last_error` are capped so a chatty sink cannot bloat the
/// queue storage.
const MAX_BODY_BYTES: usize = 2048;

/// Delivery port: one attempt, one outcome.
///
/// Implementations must never "throw" on a non-2xx response; the dispatcher
/// treats every outcome as data and decides retry from it.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, envelope: &TaskEnvelope) -> DeliveryOutcome;
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Per-attempt upper bound; a hung sink costs at most this long.
    pub timeout: Duration,
    /// TLS certificate verification. Leave on outside of lab setups.
    pub verify_tls: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(45),
            verify_tls: true,
        }
    }
}

/// HTTP sink backed by reqwest.
pub struct WebhookClient {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> Result<Self, CourierError> {
        if config.url.is_empty() {
            return Err(CourierError::InvalidConfig(
                "webhook url is not set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| CourierError::InvalidConfig(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl DeliverySink for WebhookClient {
    async fn deliver(&self, envelope: &TaskEnvelope) -> DeliveryOutcome {
        debug!(
            url = %self.config.url,
            correlation_id = envelope.correlation_id(),
            bytes = envelope.payload().len(),
            "posting payload"
        );

        let response = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(envelope.payload().to_vec())
            .send()
            .await;

        match response {
            Err(e) => DeliveryOutcome::transport(e.to_string()),
            Ok(response) => {
                let code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                DeliveryOutcome::status(code, truncate(body))
            }
        }
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_BODY_BYTES {
        let mut end = MAX_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
