//! Delivery providers.
//!
//! One provider per channel:
//! - Email over SMTP (`lettre`)
//! - SMS through an HTTP gateway
//! - Push through an HTTP gateway
//!
//! A provider performs exactly one attempt per call and never retries; the
//! dispatcher owns retry policy. Failures are classified here, from structured
//! data (HTTP status, SMTP reply class, transport error kind), so nothing
//! downstream inspects message text.

mod email;
mod push;
mod sms;

pub use email::{EmailConfig, EmailProvider};
pub use push::{PushConfig, PushProvider};
pub use sms::{SmsConfig, SmsProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::domain::{Channel, DeliveryRecord, FailureDetail, Notification};

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Timeout,
    Network,
    ServerError,
    Throttled,
    InvalidRecipient,
    Rejected,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Network => "NETWORK",
            Self::ServerError => "SERVER_ERROR",
            Self::Throttled => "THROTTLED",
            Self::InvalidRecipient => "INVALID_RECIPIENT",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::ServerError | Self::Throttled
        )
    }

    /// Classify a non-success HTTP status. Returns `None` for 2xx.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(Self::Throttled),
            408 => Some(Self::Timeout),
            400 | 404 | 410 | 422 => Some(Self::InvalidRecipient),
            500..=599 => Some(Self::ServerError),
            _ => Some(Self::Rejected),
        }
    }

    /// Classify a transport-level HTTP client error.
    pub fn from_transport_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::from_http_status(status.as_u16()).unwrap_or(Self::ServerError)
        } else {
            Self::Network
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-level result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Delivered,
    /// Accepted; confirmation arrives later through `check_status`.
    Pending,
    Bounced {
        reason: String,
    },
    Failed {
        class: FailureClass,
        code: Option<String>,
        message: String,
    },
}

/// Outcome of a `deliver` or `check_status` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: OutcomeStatus,
    pub external_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub response_code: Option<i32>,
    pub latency: Duration,
}

impl DeliveryOutcome {
    fn with_status(status: OutcomeStatus) -> Self {
        Self {
            status,
            external_id: None,
            provider_message_id: None,
            response_code: None,
            latency: Duration::ZERO,
        }
    }

    pub fn delivered(external_id: Option<String>) -> Self {
        Self {
            external_id,
            ..Self::with_status(OutcomeStatus::Delivered)
        }
    }

    pub fn pending(external_id: Option<String>) -> Self {
        Self {
            external_id,
            ..Self::with_status(OutcomeStatus::Pending)
        }
    }

    pub fn bounced(reason: impl Into<String>) -> Self {
        Self::with_status(OutcomeStatus::Bounced {
            reason: reason.into(),
        })
    }

    pub fn failed(class: FailureClass, message: impl Into<String>) -> Self {
        Self::with_status(OutcomeStatus::Failed {
            class,
            code: None,
            message: message.into(),
        })
    }

    /// Failure with a provider-specific error code.
    pub fn failed_with_code(
        class: FailureClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::with_status(OutcomeStatus::Failed {
            class,
            code: Some(code.into()),
            message: message.into(),
        })
    }

    pub fn with_response_code(mut self, code: Option<i32>) -> Self {
        self.response_code = code;
        self
    }

    pub fn with_provider_message_id(mut self, id: Option<String>) -> Self {
        self.provider_message_id = id;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.status {
            OutcomeStatus::Failed { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Failure details as recorded on the delivery record.
    pub fn failure_detail(&self) -> Option<FailureDetail> {
        match &self.status {
            OutcomeStatus::Failed {
                class,
                code,
                message,
            } => {
                let code = match code {
                    Some(code) => format!("{}:{}", class.as_str(), code),
                    None => class.as_str().to_string(),
                };
                Some(FailureDetail::new(code, message.clone()).with_response_code(self.response_code))
            }
            _ => None,
        }
    }
}

/// Channel-specific delivery mechanism.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn channel(&self) -> Channel;

    fn name(&self) -> &'static str;

    /// Channel matches and the recipient address is syntactically valid.
    fn can_handle(&self, notification: &Notification) -> bool;

    /// Perform exactly one delivery attempt.
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome;

    /// Poll asynchronous confirmation for an accepted message.
    ///
    /// Returns a `Pending` outcome when the status cannot be queried.
    async fn check_status(&self, record: &DeliveryRecord) -> DeliveryOutcome;

    /// Credentials and configuration are present (or mock mode is on).
    fn is_available(&self) -> bool;

    /// Maximum attempts per minute.
    fn rate_limit(&self) -> u32;

    /// Upper bound for one call.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Providers keyed by channel.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one for its channel.
    pub fn register(&mut self, provider: Arc<dyn DeliveryProvider>) {
        self.providers.insert(provider.channel(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn DeliveryProvider>> {
        self.providers.get(&channel).cloned()
    }

    /// Provider for the notification's channel, if it can handle the notification.
    pub fn select(&self, notification: &Notification) -> Option<Arc<dyn DeliveryProvider>> {
        self.get(notification.channel)
            .filter(|p| p.can_handle(notification))
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.providers.keys().copied().collect()
    }

    /// Log the availability of each registered provider.
    pub fn log_availability(&self) {
        for provider in self.providers.values() {
            if provider.is_available() {
                info!(
                    provider = provider.name(),
                    channel = %provider.channel(),
                    rate_limit = provider.rate_limit(),
                    "Delivery provider available"
                );
            } else {
                error!(
                    provider = provider.name(),
                    channel = %provider.channel(),
                    alert = true,
                    "Delivery provider not configured"
                );
            }
        }
    }
}

/// Syntactic email check: one `@`, non-empty local part, dotted domain.
pub fn is_valid_email(address: &str) -> bool {
    address.parse::<lettre::Address>().is_ok()
        && address
            .rsplit('@')
            .next()
            .is_some_and(|domain| domain.contains('.'))
}

/// E.164: `+` followed by 8 to 15 digits, no leading zero.
pub fn is_valid_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

/// Truncate `text` to at most `max_chars` characters.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Pull a message id out of a gateway JSON response.
pub(crate) fn extract_message_id(body: &serde_json::Value) -> Option<String> {
    ["message_id", "messageId", "id", "name"]
        .iter()
        .find_map(|key| body.get(*key))
        .and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
