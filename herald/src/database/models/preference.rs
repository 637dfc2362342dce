//! Preference database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Channel, NotificationPriority, Preference, QuietHours, parse_time};
use crate::{Error, Result};

/// Row of the `notification_preferences` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PreferenceDbModel {
    pub id: String,
    pub user_id: String,
    pub channel: String,
    pub notification_type: String,
    pub enabled: bool,
    pub global_opt_out: bool,
    pub quiet_hours_enabled: bool,
    /// `HH:MM`
    pub quiet_hours_start: String,
    /// `HH:MM`
    pub quiet_hours_end: String,
    pub timezone: String,
    pub hourly_cap: Option<i64>,
    pub daily_cap: Option<i64>,
    pub min_priority: String,
    pub opt_out_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Preference> for PreferenceDbModel {
    fn from(p: &Preference) -> Self {
        Self {
            id: p.id.clone(),
            user_id: p.user_id.clone(),
            channel: p.channel.as_str().to_string(),
            notification_type: p.notification_type.clone(),
            enabled: p.enabled,
            global_opt_out: p.global_opt_out,
            quiet_hours_enabled: p.quiet_hours_enabled,
            quiet_hours_start: QuietHours::format_time(p.quiet_hours.start),
            quiet_hours_end: QuietHours::format_time(p.quiet_hours.end),
            timezone: p.quiet_hours.timezone.clone(),
            hourly_cap: p.hourly_cap.map(i64::from),
            daily_cap: p.daily_cap.map(i64::from),
            min_priority: p.min_priority.as_str().to_string(),
            opt_out_reason: p.opt_out_reason.clone(),
            created_at: datetime_to_ms(p.created_at),
            updated_at: datetime_to_ms(p.updated_at),
        }
    }
}

impl TryFrom<PreferenceDbModel> for Preference {
    type Error = Error;

    fn try_from(row: PreferenceDbModel) -> Result<Self> {
        let channel = Channel::parse(&row.channel)
            .ok_or_else(|| Error::Database(format!("Unknown channel '{}'", row.channel)))?;
        let start = parse_time(&row.quiet_hours_start).ok_or_else(|| {
            Error::Database(format!("Invalid quiet_hours_start '{}'", row.quiet_hours_start))
        })?;
        let end = parse_time(&row.quiet_hours_end).ok_or_else(|| {
            Error::Database(format!("Invalid quiet_hours_end '{}'", row.quiet_hours_end))
        })?;
        let min_priority = NotificationPriority::parse(&row.min_priority).unwrap_or_default();

        Ok(Preference {
            id: row.id,
            user_id: row.user_id,
            channel,
            notification_type: row.notification_type,
            enabled: row.enabled,
            global_opt_out: row.global_opt_out,
            quiet_hours_enabled: row.quiet_hours_enabled,
            quiet_hours: QuietHours {
                start,
                end,
                timezone: row.timezone,
            },
            hourly_cap: row.hourly_cap.and_then(|c| u32::try_from(c).ok()),
            daily_cap: row.daily_cap.and_then(|c| u32::try_from(c).ok()),
            min_priority,
            opt_out_reason: row.opt_out_reason,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        })
    }
}
