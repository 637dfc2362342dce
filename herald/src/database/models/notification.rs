//! Notification database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Channel, Notification, NotificationPriority, NotificationStatus};
use crate::{Error, Result};

/// Row of the `notifications` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub dedup_key: String,
    pub user_id: String,
    pub notification_type: String,
    pub channel: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    pub correlation_id: Option<String>,
    pub source_event_id: String,
    pub status: String,
    pub digest_key: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

impl From<&Notification> for NotificationDbModel {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id.clone(),
            dedup_key: n.dedup_key.clone(),
            user_id: n.user_id.clone(),
            notification_type: n.notification_type.clone(),
            channel: n.channel.as_str().to_string(),
            recipient: n.recipient.clone(),
            subject: n.subject.clone(),
            body: n.body.clone(),
            priority: n.priority.as_str().to_string(),
            correlation_id: n.correlation_id.clone(),
            source_event_id: n.source_event_id.clone(),
            status: n.status.as_str().to_string(),
            digest_key: n.digest_key.clone(),
            created_at: datetime_to_ms(n.created_at),
        }
    }
}

impl TryFrom<NotificationDbModel> for Notification {
    type Error = Error;

    fn try_from(row: NotificationDbModel) -> Result<Self> {
        let channel = Channel::parse(&row.channel)
            .ok_or_else(|| Error::Database(format!("Unknown channel '{}'", row.channel)))?;
        let priority = NotificationPriority::parse(&row.priority)
            .ok_or_else(|| Error::Database(format!("Unknown priority '{}'", row.priority)))?;
        let status = NotificationStatus::parse(&row.status).ok_or_else(|| {
            Error::Database(format!("Unknown notification status '{}'", row.status))
        })?;

        Ok(Notification {
            id: row.id,
            dedup_key: row.dedup_key,
            user_id: row.user_id,
            notification_type: row.notification_type,
            channel,
            recipient: row.recipient,
            subject: row.subject,
            body: row.body,
            priority,
            correlation_id: row.correlation_id,
            source_event_id: row.source_event_id,
            status,
            digest_key: row.digest_key,
            created_at: ms_to_datetime(row.created_at),
        })
    }
}

/// Row of the `notification_cancellations` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CancellationDbModel {
    pub notification_id: String,
    pub reason: String,
    /// Unix epoch milliseconds.
    pub cancelled_at: i64,
}
