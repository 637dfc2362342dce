//! Preference gate.
//!
//! Decides whether a notification may be delivered to a user on a channel
//! right now. Preference rows come from the read-through cache; frequency
//! counts are always read live.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Result;
use crate::database::repositories::DeliveryRepository;
use crate::domain::{Channel, NotificationPriority};
use crate::notification::preferences::PreferenceService;

/// Trailing window a frequency cap applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyWindow {
    Hourly,
    Daily,
}

impl FrequencyWindow {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::hours(24),
        }
    }
}

/// Why the gate refused a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    OptedOut,
    PriorityTooLow {
        minimum: NotificationPriority,
    },
    /// Recipient is inside quiet hours until `until`.
    QuietHours {
        until: DateTime<Utc>,
    },
    FrequencyExceeded {
        window: FrequencyWindow,
        limit: u32,
    },
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OptedOut => "OPTED_OUT",
            Self::PriorityTooLow { .. } => "PRIORITY_TOO_LOW",
            Self::QuietHours { .. } => "QUIET_HOURS",
            Self::FrequencyExceeded { .. } => "FREQUENCY_EXCEEDED",
        }
    }

    /// Deferred rather than dropped: the delivery is retried once the window ends.
    pub fn defer_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::QuietHours { until } => Some(*until),
            _ => None,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OptedOut => write!(f, "recipient opted out"),
            Self::PriorityTooLow { minimum } => {
                write!(f, "priority below recipient minimum {}", minimum.as_str())
            }
            Self::QuietHours { until } => write!(f, "quiet hours until {}", until.to_rfc3339()),
            Self::FrequencyExceeded { window, limit } => {
                write!(f, "{:?} cap of {} reached", window, limit)
            }
        }
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allow: bool,
    pub reason: Option<DenyReason>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
        }
    }
}

pub struct PreferenceGate {
    preferences: Arc<PreferenceService>,
    deliveries: Arc<dyn DeliveryRepository>,
}

impl PreferenceGate {
    pub fn new(preferences: Arc<PreferenceService>, deliveries: Arc<dyn DeliveryRepository>) -> Self {
        Self {
            preferences,
            deliveries,
        }
    }

    pub async fn may_deliver(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
        priority: NotificationPriority,
        now: DateTime<Utc>,
    ) -> Result<GateDecision> {
        let pref = self
            .preferences
            .resolve(user_id, channel, notification_type, now)
            .await?;

        if pref.is_opted_out() {
            return Ok(GateDecision::deny(DenyReason::OptedOut));
        }

        if priority < pref.min_priority {
            return Ok(GateDecision::deny(DenyReason::PriorityTooLow {
                minimum: pref.min_priority,
            }));
        }

        if pref.quiet_hours_enabled
            && !priority.bypasses_quiet_hours()
            && pref.quiet_hours.is_active(now)
        {
            let until = match pref.quiet_hours.window_end(now) {
                Some(until) => until,
                None => {
                    warn!(user_id = %user_id, "Could not resolve quiet hours end, deferring one hour");
                    now + Duration::hours(1)
                }
            };
            return Ok(GateDecision::deny(DenyReason::QuietHours { until }));
        }

        let caps = [
            (FrequencyWindow::Hourly, pref.hourly_cap),
            (FrequencyWindow::Daily, pref.daily_cap),
        ];
        for (window, cap) in caps {
            let Some(limit) = cap else { continue };
            let sent = self
                .deliveries
                .count_sent_since(user_id, channel, notification_type, now - window.duration())
                .await?;
            if sent >= i64::from(limit) {
                debug!(
                    user_id = %user_id,
                    channel = %channel,
                    notification_type = %notification_type,
                    sent,
                    limit,
                    "Frequency cap reached"
                );
                return Ok(GateDecision::deny(DenyReason::FrequencyExceeded { window, limit }));
            }
        }

        Ok(GateDecision::allow())
    }
}
