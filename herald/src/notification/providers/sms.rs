//! SMS delivery through an HTTP gateway.
//!
//! The gateway accepts a submission and reports the handset outcome later, so
//! successful submissions come back as `Pending` and are confirmed through
//! `check_status`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    DeliveryOutcome, DeliveryProvider, FailureClass, extract_message_id, is_valid_e164,
    truncate_chars,
};
use crate::domain::{Channel, DeliveryRecord, Notification};

/// SMS provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// Submission endpoint.
    pub api_url: String,
    pub api_key: Option<String>,
    /// Sender id or originating number.
    pub sender_id: String,
    pub mock_mode: bool,
    /// Longer bodies are truncated.
    pub max_content_length: usize,
    pub rate_limit_per_minute: u32,
    pub timeout_secs: u64,
    /// Status endpoint; the message id is appended as a path segment.
    pub status_url: Option<String>,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: None,
            sender_id: String::new(),
            mock_mode: false,
            max_content_length: 160,
            rate_limit_per_minute: 60,
            timeout_secs: 10,
            status_url: None,
        }
    }
}

/// SMS provider.
pub struct SmsProvider {
    config: SmsConfig,
    client: Client,
}

impl SmsProvider {
    pub fn new(config: SmsConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        json!({
            "to": notification.recipient,
            "from": self.config.sender_id,
            "body": truncate_chars(&notification.body, self.config.max_content_length),
            "reference": notification.id,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Map a gateway status word to an outcome.
fn outcome_from_gateway_status(status: &str, external_id: Option<String>) -> DeliveryOutcome {
    match status.to_ascii_lowercase().as_str() {
        "delivered" => DeliveryOutcome::delivered(external_id),
        "undeliverable" | "invalid_number" | "bounced" => {
            DeliveryOutcome::bounced(format!("Gateway reported {}", status))
        }
        "failed" | "rejected" => DeliveryOutcome::failed_with_code(
            FailureClass::Rejected,
            status.to_ascii_uppercase(),
            "Gateway rejected the message",
        ),
        "expired" => DeliveryOutcome::failed_with_code(
            FailureClass::ServerError,
            "EXPIRED",
            "Message expired before delivery",
        ),
        _ => DeliveryOutcome::pending(external_id),
    }
}

#[async_trait]
impl DeliveryProvider for SmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn name(&self) -> &'static str {
        "sms-gateway"
    }

    fn can_handle(&self, notification: &Notification) -> bool {
        notification.channel == Channel::Sms && is_valid_e164(&notification.recipient)
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let started = Instant::now();

        if self.config.mock_mode {
            debug!(
                notification_id = %notification.id,
                to = %notification.recipient,
                "Mock SMS accepted"
            );
            return DeliveryOutcome::pending(Some(format!("mock-{}", uuid::Uuid::new_v4())))
                .with_response_code(Some(202))
                .with_latency(started.elapsed());
        }

        let request = self
            .authorize(self.client.post(&self.config.api_url))
            .json(&self.build_payload(notification));

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return DeliveryOutcome::failed(
                    FailureClass::from_transport_error(&e),
                    format!("SMS gateway request failed: {}", e),
                )
                .with_latency(started.elapsed());
            }
        };

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let latency = started.elapsed();

        if let Some(class) = FailureClass::from_http_status(status) {
            warn!(notification_id = %notification.id, status, %class, "SMS gateway refused submission");
            let code = body
                .get("error_code")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let outcome = match code {
                Some(code) => DeliveryOutcome::failed_with_code(class, code, body.to_string()),
                None => DeliveryOutcome::failed(class, format!("SMS gateway returned {}", status)),
            };
            return outcome
                .with_response_code(Some(i32::from(status)))
                .with_latency(latency);
        }

        let message_id = extract_message_id(&body);
        let outcome = match message_id {
            Some(id) => {
                let gateway_status = body.get("status").and_then(|v| v.as_str()).unwrap_or("queued");
                outcome_from_gateway_status(gateway_status, Some(id))
            }
            // Without an id there is nothing to poll; acceptance is final.
            None => DeliveryOutcome::delivered(None),
        };
        outcome
            .with_response_code(Some(i32::from(status)))
            .with_latency(latency)
    }

    async fn check_status(&self, record: &DeliveryRecord) -> DeliveryOutcome {
        let external_id = record.external_id.clone();

        if self.config.mock_mode {
            return DeliveryOutcome::delivered(external_id);
        }

        let (Some(status_url), Some(id)) = (&self.config.status_url, &external_id) else {
            return DeliveryOutcome::pending(external_id);
        };

        let url = format!("{}/{}", status_url.trim_end_matches('/'), id);
        let response = match self.authorize(self.client.get(&url)).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(delivery_id = %record.id, status = %response.status(), "SMS status query refused");
                return DeliveryOutcome::pending(external_id);
            }
            Err(e) => {
                debug!(delivery_id = %record.id, error = %e, "SMS status query failed");
                return DeliveryOutcome::pending(external_id);
            }
        };

        match response.json::<serde_json::Value>().await {
            Ok(body) => {
                let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("");
                outcome_from_gateway_status(status, external_id)
            }
            Err(_) => DeliveryOutcome::pending(external_id),
        }
    }

    fn is_available(&self) -> bool {
        self.config.mock_mode || (!self.config.api_url.is_empty() && self.config.api_key.is_some())
    }

    fn rate_limit(&self) -> u32 {
        self.config.rate_limit_per_minute
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}
