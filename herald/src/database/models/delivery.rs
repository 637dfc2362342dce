//! Delivery record database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::{Channel, DeliveryRecord, DeliveryStatus};
use crate::{Error, Result};

/// Row of the `delivery_records` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecordDbModel {
    pub id: String,
    pub notification_id: String,
    pub channel: String,
    pub recipient: String,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub status: String,
    pub attempted_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub bounced_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub external_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub response_code: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&DeliveryRecord> for DeliveryRecordDbModel {
    fn from(r: &DeliveryRecord) -> Self {
        Self {
            id: r.id.clone(),
            notification_id: r.notification_id.clone(),
            channel: r.channel.as_str().to_string(),
            recipient: r.recipient.clone(),
            attempt_count: i64::from(r.attempt_count),
            max_attempts: i64::from(r.max_attempts),
            status: r.status.as_str().to_string(),
            attempted_at: opt_datetime_to_ms(r.attempted_at),
            delivered_at: opt_datetime_to_ms(r.delivered_at),
            failed_at: opt_datetime_to_ms(r.failed_at),
            bounced_at: opt_datetime_to_ms(r.bounced_at),
            sent_at: opt_datetime_to_ms(r.sent_at),
            next_attempt_at: opt_datetime_to_ms(r.next_attempt_at),
            external_id: r.external_id.clone(),
            provider_message_id: r.provider_message_id.clone(),
            response_code: r.response_code.map(i64::from),
            error_code: r.error_code.clone(),
            error_message: r.error_message.clone(),
            provider: r.provider.clone(),
            version: r.version,
            created_at: datetime_to_ms(r.created_at),
            updated_at: datetime_to_ms(r.updated_at),
        }
    }
}

impl TryFrom<DeliveryRecordDbModel> for DeliveryRecord {
    type Error = Error;

    fn try_from(row: DeliveryRecordDbModel) -> Result<Self> {
        let channel = Channel::parse(&row.channel)
            .ok_or_else(|| Error::Database(format!("Unknown channel '{}'", row.channel)))?;
        let status = DeliveryStatus::parse(&row.status)
            .ok_or_else(|| Error::Database(format!("Unknown delivery status '{}'", row.status)))?;

        Ok(DeliveryRecord {
            id: row.id,
            notification_id: row.notification_id,
            channel,
            recipient: row.recipient,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            status,
            attempted_at: opt_ms_to_datetime(row.attempted_at),
            delivered_at: opt_ms_to_datetime(row.delivered_at),
            failed_at: opt_ms_to_datetime(row.failed_at),
            bounced_at: opt_ms_to_datetime(row.bounced_at),
            sent_at: opt_ms_to_datetime(row.sent_at),
            next_attempt_at: opt_ms_to_datetime(row.next_attempt_at),
            external_id: row.external_id,
            provider_message_id: row.provider_message_id,
            response_code: row.response_code.and_then(|c| i32::try_from(c).ok()),
            error_code: row.error_code,
            error_message: row.error_message,
            provider: row.provider,
            version: row.version,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        })
    }
}

/// Count of delivery records in one status on one channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryStatusCountRow {
    pub channel: String,
    pub status: String,
    pub count: i64,
}
