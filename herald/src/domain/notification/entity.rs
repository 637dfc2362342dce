//! Notification entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, DeliveryStatus, NotificationPriority};

/// Aggregate status of a notification, derived from its delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Processing,
    Delivered,
    Failed,
    Skipped,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Aggregate status for a notification whose delivery is in `status`.
    pub fn from_delivery(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Pending => Self::Pending,
            DeliveryStatus::InProgress => Self::Processing,
            DeliveryStatus::Success => Self::Delivered,
            DeliveryStatus::Failed | DeliveryStatus::Bounced => Self::Failed,
            DeliveryStatus::Skipped => Self::Skipped,
            DeliveryStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A notification intent for one user on one channel.
///
/// Content fields are immutable once created; only the aggregate status
/// changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    /// `source_event_id:user:channel:type`, unique.
    pub dedup_key: String,
    pub user_id: String,
    /// Canonical snake_case type, e.g. `order_placed`.
    pub notification_type: String,
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub correlation_id: Option<String>,
    pub source_event_id: String,
    pub status: NotificationStatus,
    /// Groups notifications that downstream consumers may batch together.
    pub digest_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_event_id: impl Into<String>,
        user_id: impl Into<String>,
        notification_type: impl Into<String>,
        channel: Channel,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let source_event_id = source_event_id.into();
        let user_id = user_id.into();
        let notification_type = notification_type.into();
        let dedup_key = Self::dedup_key_for(&source_event_id, &user_id, channel, &notification_type);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dedup_key,
            user_id,
            notification_type,
            channel,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            priority: NotificationPriority::Normal,
            correlation_id: None,
            source_event_id,
            status: NotificationStatus::Pending,
            digest_key: None,
            created_at: now,
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_digest_key(mut self, digest_key: Option<String>) -> Self {
        self.digest_key = digest_key;
        self
    }

    /// Idempotency key for one (event, user, channel, type) combination.
    pub fn dedup_key_for(
        source_event_id: &str,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            source_event_id,
            user_id,
            channel.as_str(),
            notification_type
        )
    }
}
