//! Push delivery through an HTTP gateway (FCM-style legacy API).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{DeliveryOutcome, DeliveryProvider, FailureClass, extract_message_id, truncate_chars};
use crate::domain::{Channel, DeliveryRecord, Notification, NotificationPriority};

/// Push provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub api_url: String,
    pub server_key: Option<String>,
    pub app_id: String,
    pub mock_mode: bool,
    pub max_content_length: usize,
    pub rate_limit_per_minute: u32,
    pub timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            server_key: None,
            app_id: String::new(),
            mock_mode: false,
            max_content_length: 4_000,
            rate_limit_per_minute: 1_200,
            timeout_secs: 10,
        }
    }
}

/// Push provider.
pub struct PushProvider {
    config: PushConfig,
    client: Client,
}

impl PushProvider {
    pub fn new(config: PushConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        let priority = match notification.priority {
            NotificationPriority::High | NotificationPriority::Urgent => "high",
            _ => "normal",
        };
        json!({
            "to": notification.recipient,
            "app_id": self.config.app_id,
            "priority": priority,
            "notification": {
                "title": notification.subject,
                "body": truncate_chars(&notification.body, self.config.max_content_length),
            },
            "data": {
                "notification_id": notification.id,
                "type": notification.notification_type,
            },
        })
    }
}

#[async_trait]
impl DeliveryProvider for PushProvider {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn name(&self) -> &'static str {
        "push-gateway"
    }

    fn can_handle(&self, notification: &Notification) -> bool {
        notification.channel == Channel::Push && !notification.recipient.trim().is_empty()
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let started = Instant::now();

        if self.config.mock_mode {
            debug!(notification_id = %notification.id, "Mock push delivered");
            return DeliveryOutcome::delivered(Some(format!("mock-{}", uuid::Uuid::new_v4())))
                .with_response_code(Some(200))
                .with_latency(started.elapsed());
        }

        let mut request = self
            .client
            .post(&self.config.api_url)
            .json(&self.build_payload(notification));
        if let Some(key) = &self.config.server_key {
            request = request.header(reqwest::header::AUTHORIZATION, format!("key={}", key));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return DeliveryOutcome::failed(
                    FailureClass::from_transport_error(&e),
                    format!("Push gateway request failed: {}", e),
                )
                .with_latency(started.elapsed());
            }
        };

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let latency = started.elapsed();

        if let Some(class) = FailureClass::from_http_status(status) {
            warn!(notification_id = %notification.id, status, %class, "Push gateway refused message");
            return DeliveryOutcome::failed(class, format!("Push gateway returned {}", status))
                .with_response_code(Some(i32::from(status)))
                .with_latency(latency);
        }

        // Legacy gateways report per-token errors inside a 200 response.
        let token_error = body
            .get("results")
            .and_then(|r| r.get(0))
            .and_then(|r| r.get("error"))
            .and_then(|e| e.as_str());
        if let Some(err) = token_error {
            let class = match err {
                "NotRegistered" | "InvalidRegistration" | "MismatchSenderId" => {
                    FailureClass::InvalidRecipient
                }
                "Unavailable" | "InternalServerError" => FailureClass::ServerError,
                "DeviceMessageRateExceeded" => FailureClass::Throttled,
                _ => FailureClass::Rejected,
            };
            return DeliveryOutcome::failed_with_code(class, err, "Push token rejected")
                .with_response_code(Some(i32::from(status)))
                .with_latency(latency);
        }

        DeliveryOutcome::delivered(extract_message_id(&body).or_else(|| {
            body.get("results")
                .and_then(|r| r.get(0))
                .and_then(extract_message_id)
        }))
        .with_response_code(Some(i32::from(status)))
        .with_latency(latency)
    }

    async fn check_status(&self, record: &DeliveryRecord) -> DeliveryOutcome {
        // Gateway acceptance is synchronous; nothing further to poll.
        DeliveryOutcome::pending(record.external_id.clone())
    }

    fn is_available(&self) -> bool {
        self.config.mock_mode || (!self.config.api_url.is_empty() && self.config.server_key.is_some())
    }

    fn rate_limit(&self) -> u32 {
        self.config.rate_limit_per_minute
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}
