//! Inbound domain events, the notification routing table and outbound
//! lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, DeliveryRecord, DeliveryStatus, Notification, NotificationPriority};

/// Event type carrying a cancellation request instead of a notification.
pub const CANCEL_EVENT_TYPE: &str = "notification.cancel";

/// Static routing metadata for a supported notification type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NotificationTypeInfo {
    /// Canonical notification type (snake_case).
    pub notification_type: &'static str,
    /// Human-friendly label, used as the fallback subject.
    pub label: &'static str,
    /// Additional accepted inbound event names.
    pub aliases: &'static [&'static str],
    /// Channels used when the event does not name any.
    pub default_channels: &'static [Channel],
    /// Priority used when the event does not carry one.
    pub priority: NotificationPriority,
}

const NOTIFICATION_TYPES: &[NotificationTypeInfo] = &[
    NotificationTypeInfo {
        notification_type: "order_placed",
        label: "Order Placed",
        aliases: &["order.placed", "order.created", "OrderPlaced"],
        default_channels: &[Channel::Email, Channel::Push],
        priority: NotificationPriority::Normal,
    },
    NotificationTypeInfo {
        notification_type: "order_shipped",
        label: "Order Shipped",
        aliases: &["order.shipped", "OrderShipped"],
        default_channels: &[Channel::Email, Channel::Sms, Channel::Push],
        priority: NotificationPriority::Normal,
    },
    NotificationTypeInfo {
        notification_type: "order_delivered",
        label: "Order Delivered",
        aliases: &["order.delivered", "OrderDelivered"],
        default_channels: &[Channel::Email, Channel::Push],
        priority: NotificationPriority::Normal,
    },
    NotificationTypeInfo {
        notification_type: "order_cancelled",
        label: "Order Cancelled",
        aliases: &["order.cancelled", "order.canceled", "OrderCancelled"],
        default_channels: &[Channel::Email, Channel::Push],
        priority: NotificationPriority::High,
    },
    NotificationTypeInfo {
        notification_type: "payment_succeeded",
        label: "Payment Received",
        aliases: &["payment.succeeded", "payment.completed", "PaymentSucceeded"],
        default_channels: &[Channel::Email],
        priority: NotificationPriority::Normal,
    },
    NotificationTypeInfo {
        notification_type: "payment_failed",
        label: "Payment Failed",
        aliases: &["payment.failed", "payment.declined", "PaymentFailed"],
        default_channels: &[Channel::Email, Channel::Sms],
        priority: NotificationPriority::High,
    },
    NotificationTypeInfo {
        notification_type: "refund_issued",
        label: "Refund Issued",
        aliases: &["payment.refunded", "refund.issued", "RefundIssued"],
        default_channels: &[Channel::Email],
        priority: NotificationPriority::Normal,
    },
    NotificationTypeInfo {
        notification_type: "user_registered",
        label: "Welcome",
        aliases: &["user.registered", "user.created", "UserRegistered"],
        default_channels: &[Channel::Email],
        priority: NotificationPriority::Low,
    },
    NotificationTypeInfo {
        notification_type: "password_reset",
        label: "Password Reset",
        aliases: &["user.password_reset", "user.password_reset_requested", "PasswordReset"],
        default_channels: &[Channel::Email],
        priority: NotificationPriority::High,
    },
    NotificationTypeInfo {
        notification_type: "security_alert",
        label: "Security Alert",
        aliases: &["user.security_alert", "user.login_suspicious", "SecurityAlert"],
        default_channels: &[Channel::Email, Channel::Sms, Channel::Push],
        priority: NotificationPriority::Urgent,
    },
];

pub fn notification_types() -> &'static [NotificationTypeInfo] {
    NOTIFICATION_TYPES
}

/// Map an inbound event name or alias to its canonical notification type.
pub fn canonicalize_notification_type(input: &str) -> Option<&'static str> {
    type_info(input).map(|info| info.notification_type)
}

/// Routing metadata for an event name, canonical type or alias.
pub fn type_info(input: &str) -> Option<&'static NotificationTypeInfo> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let wanted = normalize_key(trimmed);
    NOTIFICATION_TYPES.iter().find(|info| {
        normalize_key(info.notification_type) == wanted
            || info.aliases.iter().any(|alias| normalize_key(alias) == wanted)
    })
}

/// Case and separator insensitive form: `order.Placed`, `order_placed` and
/// `OrderPlaced` all normalize to `orderplaced`.
fn normalize_key(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| !matches!(c, '.' | '_' | '-' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Recipient addresses carried by an inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipient {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub device_token: Option<String>,
}

impl Recipient {
    /// Address used on `channel`, if one was supplied.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let addr = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
            Channel::Push => self.device_token.as_deref(),
        };
        addr.map(str::trim).filter(|a| !a.is_empty())
    }
}

/// Inbound domain event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub recipient: Recipient,
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
    #[serde(default)]
    pub digest_key: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DomainEvent {
    /// Parse a JSON payload.
    pub fn from_slice(payload: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn is_cancellation(&self) -> bool {
        self.event_type == CANCEL_EVENT_TYPE
    }

    /// Target of a `notification.cancel` event.
    pub fn cancellation_target(&self) -> Option<&str> {
        self.data.get("notification_id").and_then(|v| v.as_str())
    }

    pub fn cancellation_reason(&self) -> &str {
        self.data
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("cancelled by request")
    }

    /// Leading routing segment (`order`, `payment`, `user`, ...).
    pub fn domain(&self) -> &str {
        self.event_type.split('.').next().unwrap_or_default()
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Subject supplied by the producer, or the type's label.
    pub fn subject_or(&self, fallback: &str) -> String {
        self.data_str("subject").unwrap_or(fallback).to_string()
    }

    /// Body supplied by the producer, or the raw data payload.
    pub fn body(&self) -> String {
        match self.data_str("body") {
            Some(body) => body.to_string(),
            None if self.data.is_null() => String::new(),
            None => self.data.to_string(),
        }
    }
}

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    /// Accepted by the provider, confirmation pending. Not terminal.
    Sent,
    Delivered,
    Failed,
    Bounced,
    Cancelled,
    Skipped,
}

impl LifecycleEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    /// Event type emitted on reaching a terminal status.
    pub fn for_terminal(status: DeliveryStatus) -> Option<Self> {
        match status {
            DeliveryStatus::Success => Some(Self::Delivered),
            DeliveryStatus::Failed => Some(Self::Failed),
            DeliveryStatus::Bounced => Some(Self::Bounced),
            DeliveryStatus::Cancelled => Some(Self::Cancelled),
            DeliveryStatus::Skipped => Some(Self::Skipped),
            DeliveryStatus::Pending | DeliveryStatus::InProgress => None,
        }
    }
}

impl std::fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound notification lifecycle event. Emitted, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: String,
    pub notification_id: String,
    pub delivery_id: String,
    pub user_id: String,
    pub notification_type: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub event_type: LifecycleEventType,
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_key: Option<String>,
    /// Error or deny reason code, when there is one.
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        notification: &Notification,
        record: &DeliveryRecord,
        event_type: LifecycleEventType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification.id.clone(),
            delivery_id: record.id.clone(),
            user_id: notification.user_id.clone(),
            notification_type: notification.notification_type.clone(),
            channel: record.channel,
            status: record.status,
            event_type,
            correlation_id: notification.correlation_id.clone(),
            digest_key: notification.digest_key.clone(),
            reason: record.error_code.clone(),
            occurred_at: now,
        }
    }

    /// `event.<eventType>.<channel>`
    pub fn routing_key(&self) -> String {
        format!(
            "event.{}.{}",
            self.event_type.as_str(),
            self.channel.routing_segment()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_aliases() {
        assert_eq!(canonicalize_notification_type("order.placed"), Some("order_placed"));
        assert_eq!(canonicalize_notification_type("OrderShipped"), Some("order_shipped"));
        assert_eq!(canonicalize_notification_type("payment_failed"), Some("payment_failed"));
        assert_eq!(canonicalize_notification_type("order.canceled"), Some("order_cancelled"));
        assert_eq!(canonicalize_notification_type("  "), None);
        assert_eq!(canonicalize_notification_type("inventory.low"), None);
    }

    #[test]
    fn test_every_type_has_channels() {
        for info in notification_types() {
            assert!(!info.default_channels.is_empty(), "{}", info.notification_type);
        }
        assert_eq!(
            type_info("security_alert").map(|i| i.priority),
            Some(NotificationPriority::Urgent)
        );
    }

    #[test]
    fn test_parse_envelope_with_defaults() {
        let json = r#"{
            "event_id": "evt-1",
            "event_type": "order.placed",
            "occurred_at": "2024-05-01T12:00:00Z",
            "user_id": "u-1",
            "recipient": {"email": "a@example.com"},
            "data": {"order_id": "o-9"}
        }"#;
        let event = DomainEvent::from_slice(json.as_bytes()).unwrap();
        assert_eq!(event.domain(), "order");
        assert!(event.channels.is_none());
        assert_eq!(event.recipient.address_for(Channel::Email), Some("a@example.com"));
        assert_eq!(event.recipient.address_for(Channel::Sms), None);
        assert_eq!(event.subject_or("Order Placed"), "Order Placed");
        assert!(event.body().contains("o-9"));
    }

    #[test]
    fn test_malformed_envelope_is_error() {
        assert!(DomainEvent::from_slice(b"{not json").is_err());
        assert!(DomainEvent::from_slice(br#"{"event_type": "order.placed"}"#).is_err());
    }

    #[test]
    fn test_cancellation_event() {
        let json = r#"{
            "event_id": "evt-2",
            "event_type": "notification.cancel",
            "occurred_at": "2024-05-01T12:00:00Z",
            "data": {"notification_id": "n-1", "reason": "order refunded"}
        }"#;
        let event = DomainEvent::from_slice(json.as_bytes()).unwrap();
        assert!(event.is_cancellation());
        assert_eq!(event.cancellation_target(), Some("n-1"));
        assert_eq!(event.cancellation_reason(), "order refunded");
    }

    #[test]
    fn test_routing_key() {
        let n = Notification::new(
            "evt-1",
            "u-1",
            "order_placed",
            Channel::Sms,
            "+15550001111",
            "s",
            "b",
            Utc::now(),
        );
        let r = DeliveryRecord::new(&n.id, Channel::Sms, "+15550001111", 3, Utc::now());
        let event = LifecycleEvent::new(&n, &r, LifecycleEventType::Delivered, Utc::now());
        assert_eq!(event.routing_key(), "event.delivered.sms");
    }

    #[test]
    fn test_terminal_event_types() {
        assert_eq!(
            LifecycleEventType::for_terminal(DeliveryStatus::Success),
            Some(LifecycleEventType::Delivered)
        );
        assert_eq!(LifecycleEventType::for_terminal(DeliveryStatus::InProgress), None);
    }
}
