//! Preference entity.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, NotificationPriority, QuietHours, parse_time};
use crate::{Error, Result};

/// Delivery preference of one user for one (channel, notification type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub id: String,
    pub user_id: String,
    pub channel: Channel,
    pub notification_type: String,
    pub enabled: bool,
    pub global_opt_out: bool,
    pub quiet_hours_enabled: bool,
    pub quiet_hours: QuietHours,
    /// Maximum sends in any trailing hour.
    pub hourly_cap: Option<u32>,
    /// Maximum sends in any trailing 24 hours.
    pub daily_cap: Option<u32>,
    pub min_priority: NotificationPriority,
    pub opt_out_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Preference {
    /// Permissive defaults: enabled, no quiet hours, no caps, any priority.
    pub fn default_for(
        user_id: impl Into<String>,
        channel: Channel,
        notification_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            channel,
            notification_type: notification_type.into(),
            enabled: true,
            global_opt_out: false,
            quiet_hours_enabled: false,
            quiet_hours: QuietHours {
                start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
                end: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
                timezone: "UTC".to_string(),
            },
            hourly_cap: None,
            daily_cap: None,
            min_priority: NotificationPriority::Low,
            opt_out_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the recipient refuses this kind of notification outright.
    pub fn is_opted_out(&self) -> bool {
        self.global_opt_out || !self.enabled
    }
}

/// Partial update applied by the preference service.
///
/// Cap fields use a nested option: `Some(None)` clears the cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceUpdate {
    pub enabled: Option<bool>,
    pub global_opt_out: Option<bool>,
    pub opt_out_reason: Option<String>,
    pub quiet_hours_enabled: Option<bool>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub timezone: Option<String>,
    pub hourly_cap: Option<Option<u32>>,
    pub daily_cap: Option<Option<u32>>,
    pub min_priority: Option<NotificationPriority>,
}

impl PreferenceUpdate {
    /// Validate and apply the update.
    pub fn apply(&self, pref: &mut Preference, now: DateTime<Utc>) -> Result<()> {
        if let Some(start) = &self.quiet_hours_start {
            pref.quiet_hours.start = parse_time(start)
                .ok_or_else(|| Error::validation(format!("Invalid quiet hours start: {}", start)))?;
        }
        if let Some(end) = &self.quiet_hours_end {
            pref.quiet_hours.end = parse_time(end)
                .ok_or_else(|| Error::validation(format!("Invalid quiet hours end: {}", end)))?;
        }
        if let Some(tz) = &self.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(Error::validation(format!("Unknown timezone: {}", tz)));
            }
            pref.quiet_hours.timezone = tz.clone();
        }
        for cap in [self.hourly_cap, self.daily_cap].into_iter().flatten().flatten() {
            if cap == 0 {
                return Err(Error::validation("Frequency cap must be positive"));
            }
        }

        if let Some(enabled) = self.enabled {
            pref.enabled = enabled;
        }
        if let Some(opt_out) = self.global_opt_out {
            pref.global_opt_out = opt_out;
            if !opt_out {
                pref.opt_out_reason = None;
            }
        }
        if self.opt_out_reason.is_some() {
            pref.opt_out_reason = self.opt_out_reason.clone();
        }
        if let Some(qh) = self.quiet_hours_enabled {
            pref.quiet_hours_enabled = qh;
        }
        if let Some(cap) = self.hourly_cap {
            pref.hourly_cap = cap;
        }
        if let Some(cap) = self.daily_cap {
            pref.daily_cap = cap;
        }
        if let Some(min) = self.min_priority {
            pref.min_priority = min;
        }
        pref.updated_at = now;
        Ok(())
    }
}
