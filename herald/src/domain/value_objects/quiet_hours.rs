//! Quiet-hours window value object.
//!
//! A window is a half-open local-time range `[start, end)` evaluated in the
//! recipient's timezone. When `start > end` the window wraps across midnight
//! (e.g. 22:00 - 06:00). A window with `start == end` is empty.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Quiet-hours window in a recipient's local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

impl QuietHours {
    /// Build a window from `HH:MM` strings.
    pub fn new(start: &str, end: &str, timezone: impl Into<String>) -> Result<Self> {
        let start = parse_time(start)
            .ok_or_else(|| Error::validation(format!("Invalid quiet hours start: {}", start)))?;
        let end = parse_time(end)
            .ok_or_else(|| Error::validation(format!("Invalid quiet hours end: {}", end)))?;
        Ok(Self {
            start,
            end,
            timezone: timezone.into(),
        })
    }

    /// Resolve the configured timezone, falling back to UTC for unknown names.
    pub fn tz(&self) -> Tz {
        match self.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = %self.timezone, "Unknown quiet hours timezone, using UTC");
                chrono_tz::UTC
            }
        }
    }

    /// Whether a local wall-clock time falls inside the window.
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// Whether the instant `now` falls inside the window in the recipient's timezone.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz());
        self.contains(local.time())
    }

    /// The UTC instant at which the window containing `now` closes.
    ///
    /// Returns `None` when `now` is outside the window.
    pub fn window_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz = self.tz();
        let local = now.with_timezone(&tz);
        if !self.contains(local.time()) {
            return None;
        }

        let mut end_date = local.date_naive();
        if local.time() >= self.end {
            // Inside a wrapped window before midnight: it closes tomorrow.
            end_date = end_date.succ_opt()?;
        }
        Some(resolve_local(&tz, end_date.and_time(self.end)))
    }

    /// Format a time as stored in the database (`HH:MM`).
    pub fn format_time(time: NaiveTime) -> String {
        time.format("%H:%M").to_string()
    }
}

/// Parse a `HH:MM` (or `HH:MM:SS`) string.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Map a local wall-clock time to UTC, moving forward through DST gaps.
fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..4 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => candidate += Duration::minutes(30),
        }
    }
    Utc.from_utc_datetime(&naive)
}
