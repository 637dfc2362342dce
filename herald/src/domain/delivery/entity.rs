//! Delivery record entity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::DeliveryStatus;
use crate::Error;
use crate::domain::Channel;

/// Default number of provider attempts per delivery record.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Observable phase of a record, derived from its status and scheduling fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPhase {
    Pending,
    /// Claimed, provider call running.
    InFlight,
    /// A retry is scheduled at `next_attempt_at`.
    RetryScheduled,
    /// Accepted by the provider; confirmation is polled at `next_attempt_at`.
    AwaitingConfirmation,
    Terminal,
}

/// Error details captured from a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FailureDetail {
    pub code: String,
    pub message: String,
    pub response_code: Option<i32>,
}

impl FailureDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            response_code: None,
        }
    }

    pub fn with_response_code(mut self, code: Option<i32>) -> Self {
        self.response_code = code;
        self
    }
}

/// Result of recording a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is scheduled after the delay.
    Scheduled { attempt: u32, delay: Duration },
    /// Attempts are used up; the record is FAILED.
    Exhausted,
}

/// Durable state of one delivery lineage for a notification on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub notification_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: DeliveryStatus,
    pub attempted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    /// First time a provider accepted or delivered the message. Frequency
    /// caps count from here, whatever the record's later status.
    pub sent_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub response_code: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    /// Optimistic concurrency counter, bumped by every persisted transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Create a new PENDING record.
    pub fn new(
        notification_id: impl Into<String>,
        channel: Channel,
        recipient: impl Into<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            channel,
            recipient: recipient.into(),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            status: DeliveryStatus::Pending,
            attempted_at: None,
            delivered_at: None,
            failed_at: None,
            bounced_at: None,
            sent_at: None,
            next_attempt_at: None,
            external_id: None,
            provider_message_id: None,
            response_code: None,
            error_code: None,
            error_message: None,
            provider: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn phase(&self) -> DeliveryPhase {
        match self.status {
            DeliveryStatus::Pending => DeliveryPhase::Pending,
            DeliveryStatus::InProgress => match (&self.next_attempt_at, &self.external_id) {
                (None, _) => DeliveryPhase::InFlight,
                (Some(_), None) => DeliveryPhase::RetryScheduled,
                (Some(_), Some(_)) => DeliveryPhase::AwaitingConfirmation,
            },
            _ => DeliveryPhase::Terminal,
        }
    }

    /// Whether the record's scheduled time (if any) has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    fn transition(&mut self, target: DeliveryStatus, now: DateTime<Utc>) -> Result<(), Error> {
        self.status = self.status.transition_to(target)?;
        self.updated_at = now;
        if target.is_terminal() {
            self.next_attempt_at = None;
        }
        Ok(())
    }

    fn ensure_status(&self, expected: DeliveryStatus, target: DeliveryStatus) -> Result<(), Error> {
        if self.status != expected {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// PENDING -> IN_PROGRESS: the first provider attempt is claimed.
    pub fn start_attempt(&mut self, provider: &str, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::Pending, DeliveryStatus::InProgress)?;
        self.transition(DeliveryStatus::InProgress, now)?;
        self.attempt_count = self.attempt_count.max(1);
        self.attempted_at = Some(now);
        self.next_attempt_at = None;
        self.provider = Some(provider.to_string());
        Ok(())
    }

    /// PENDING -> PENDING: hold the record until `until` without consuming an attempt.
    pub fn defer(
        &mut self,
        until: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::Pending, DeliveryStatus::Pending)?;
        self.transition(DeliveryStatus::Pending, now)?;
        self.next_attempt_at = Some(until);
        self.error_code = Some(reason.to_string());
        Ok(())
    }

    /// PENDING -> FAILED: no provider can take the record.
    pub fn reject(&mut self, failure: FailureDetail, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::Pending, DeliveryStatus::Failed)?;
        self.transition(DeliveryStatus::Failed, now)?;
        self.failed_at = Some(now);
        self.apply_failure(failure);
        Ok(())
    }

    /// PENDING -> SKIPPED: the preference gate dropped the record.
    pub fn skip(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::Pending, DeliveryStatus::Skipped)?;
        self.transition(DeliveryStatus::Skipped, now)?;
        self.error_code = Some(reason.to_string());
        Ok(())
    }

    /// PENDING / IN_PROGRESS -> CANCELLED.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), Error> {
        self.transition(DeliveryStatus::Cancelled, now)?;
        self.error_code = Some("CANCELLED".to_string());
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    /// IN_PROGRESS -> IN_PROGRESS: a scheduled retry is picked up.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::InProgress)?;
        self.transition(DeliveryStatus::InProgress, now)?;
        self.attempted_at = Some(now);
        self.next_attempt_at = None;
        self.external_id = None;
        Ok(())
    }

    /// Re-claim an in-flight attempt whose lease expired.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::InProgress)?;
        self.transition(DeliveryStatus::InProgress, now)?;
        self.attempted_at = Some(now);
        Ok(())
    }

    /// IN_PROGRESS -> SUCCESS.
    pub fn mark_delivered(
        &mut self,
        external_id: Option<String>,
        provider_message_id: Option<String>,
        response_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::Success)?;
        self.transition(DeliveryStatus::Success, now)?;
        self.delivered_at = Some(now);
        self.sent_at.get_or_insert(now);
        if external_id.is_some() {
            self.external_id = external_id;
        }
        if provider_message_id.is_some() {
            self.provider_message_id = provider_message_id;
        }
        self.response_code = response_code.or(self.response_code);
        self.error_code = None;
        self.error_message = None;
        Ok(())
    }

    /// IN_PROGRESS -> IN_PROGRESS: the provider accepted the message and
    /// confirmation is polled at `poll_at`.
    pub fn await_confirmation(
        &mut self,
        external_id: String,
        provider_message_id: Option<String>,
        response_code: Option<i32>,
        poll_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::InProgress)?;
        self.transition(DeliveryStatus::InProgress, now)?;
        self.sent_at.get_or_insert(now);
        self.external_id = Some(external_id);
        if provider_message_id.is_some() {
            self.provider_message_id = provider_message_id;
        }
        self.response_code = response_code.or(self.response_code);
        self.next_attempt_at = Some(poll_at);
        Ok(())
    }

    /// Record a retryable failure.
    ///
    /// While attempts remain the attempt counter is advanced and the next
    /// attempt is scheduled `backoff(new_count)` from now; otherwise the record
    /// becomes FAILED.
    pub fn fail_retryable(
        &mut self,
        failure: FailureDetail,
        backoff: impl FnOnce(u32) -> Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::InProgress)?;
        self.apply_failure(failure);

        if self.attempt_count < self.max_attempts {
            self.transition(DeliveryStatus::InProgress, now)?;
            self.attempt_count += 1;
            let delay = backoff(self.attempt_count);
            self.next_attempt_at = Some(now + delay);
            self.external_id = None;
            Ok(RetryDecision::Scheduled {
                attempt: self.attempt_count,
                delay,
            })
        } else {
            self.transition(DeliveryStatus::Failed, now)?;
            self.failed_at = Some(now);
            Ok(RetryDecision::Exhausted)
        }
    }

    /// IN_PROGRESS -> FAILED for a non-retryable failure.
    pub fn fail(&mut self, failure: FailureDetail, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::Failed)?;
        self.transition(DeliveryStatus::Failed, now)?;
        self.failed_at = Some(now);
        self.apply_failure(failure);
        Ok(())
    }

    /// IN_PROGRESS -> BOUNCED.
    pub fn bounce(
        &mut self,
        reason: &str,
        response_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.ensure_status(DeliveryStatus::InProgress, DeliveryStatus::Bounced)?;
        self.transition(DeliveryStatus::Bounced, now)?;
        self.bounced_at = Some(now);
        self.error_code = Some("BOUNCED".to_string());
        self.error_message = Some(reason.to_string());
        self.response_code = response_code.or(self.response_code);
        Ok(())
    }

    fn apply_failure(&mut self, failure: FailureDetail) {
        self.error_code = Some(failure.code);
        self.error_message = Some(failure.message);
        if failure.response_code.is_some() {
            self.response_code = failure.response_code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn record() -> DeliveryRecord {
        DeliveryRecord::new("n-1", Channel::Email, "a@example.com", 3, now())
    }

    fn timeout() -> FailureDetail {
        FailureDetail::new("TIMEOUT", "provider timed out")
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::seconds(5 * 2_i64.pow(attempt))
    }

    #[test]
    fn test_new_record_is_pending() {
        let r = record();
        assert_eq!(r.status, DeliveryStatus::Pending);
        assert_eq!(r.phase(), DeliveryPhase::Pending);
        assert_eq!(r.attempt_count, 0);
        assert!(r.is_due(now()));
    }

    #[test]
    fn test_start_attempt_sets_first_attempt() {
        let mut r = record();
        r.start_attempt("smtp", now()).unwrap();
        assert_eq!(r.status, DeliveryStatus::InProgress);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(r.attempted_at, Some(now()));
        assert_eq!(r.phase(), DeliveryPhase::InFlight);
        assert_eq!(r.provider.as_deref(), Some("smtp"));
    }

    #[test]
    fn test_defer_keeps_pending_and_sets_next_attempt() {
        let mut r = record();
        let until = now() + Duration::hours(6);
        r.defer(until, "QUIET_HOURS", now()).unwrap();
        assert_eq!(r.status, DeliveryStatus::Pending);
        assert_eq!(r.next_attempt_at, Some(until));
        assert_eq!(r.attempt_count, 0);
        assert!(!r.is_due(now()));
        assert!(r.is_due(until));
    }

    #[test]
    fn test_retry_sequence_never_exceeds_max_attempts() {
        let mut r = record();
        r.start_attempt("smtp", now()).unwrap();

        let first = r.fail_retryable(timeout(), backoff, now()).unwrap();
        assert_eq!(
            first,
            RetryDecision::Scheduled {
                attempt: 2,
                delay: Duration::seconds(20)
            }
        );
        assert_eq!(r.phase(), DeliveryPhase::RetryScheduled);

        r.resume(now()).unwrap();
        let second = r.fail_retryable(timeout(), backoff, now()).unwrap();
        assert_eq!(
            second,
            RetryDecision::Scheduled {
                attempt: 3,
                delay: Duration::seconds(40)
            }
        );

        r.resume(now()).unwrap();
        let third = r.fail_retryable(timeout(), backoff, now()).unwrap();
        assert_eq!(third, RetryDecision::Exhausted);
        assert_eq!(r.status, DeliveryStatus::Failed);
        assert_eq!(r.attempt_count, 3);
        assert!(r.attempt_count <= r.max_attempts);
        assert!(r.next_attempt_at.is_none());
        assert_eq!(r.failed_at, Some(now()));
    }

    #[test]
    fn test_success_after_retries() {
        let mut r = record();
        r.start_attempt("smtp", now()).unwrap();
        r.fail_retryable(timeout(), backoff, now()).unwrap();
        r.resume(now()).unwrap();
        r.fail_retryable(timeout(), backoff, now()).unwrap();
        r.resume(now()).unwrap();
        r.mark_delivered(Some("ext-1".into()), None, Some(250), now())
            .unwrap();

        assert_eq!(r.status, DeliveryStatus::Success);
        assert_eq!(r.attempt_count, 3);
        assert_eq!(r.external_id.as_deref(), Some("ext-1"));
        assert!(r.error_code.is_none());
        assert!(r.next_attempt_at.is_none());
    }

    #[test]
    fn test_await_confirmation_phase() {
        let mut r = record();
        r.start_attempt("sms-gateway", now()).unwrap();
        r.await_confirmation(
            "msg-9".into(),
            None,
            Some(202),
            now() + Duration::seconds(30),
            now(),
        )
        .unwrap();
        assert_eq!(r.phase(), DeliveryPhase::AwaitingConfirmation);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(r.sent_at, Some(now()));

        let confirmed_at = now() + Duration::seconds(30);
        r.mark_delivered(None, None, Some(200), confirmed_at).unwrap();
        assert_eq!(r.delivered_at, Some(confirmed_at));
        assert_eq!(r.sent_at, Some(now()));
    }

    #[test]
    fn test_failed_attempt_is_not_a_send() {
        let mut r = record();
        r.start_attempt("smtp", now()).unwrap();
        r.fail_retryable(timeout(), backoff, now()).unwrap();
        assert!(r.sent_at.is_none());

        r.resume(now()).unwrap();
        r.fail(FailureDetail::new("REJECTED", "policy"), now()).unwrap();
        assert!(r.sent_at.is_none());
    }

    #[test]
    fn test_terminal_record_is_immutable() {
        let mut r = record();
        r.start_attempt("smtp", now()).unwrap();
        r.mark_delivered(None, None, None, now()).unwrap();

        assert!(r.start_attempt("smtp", now()).is_err());
        assert!(r.resume(now()).is_err());
        assert!(r.cancel("late", now()).is_err());
        assert!(r.fail(timeout(), now()).is_err());
        assert!(r.fail_retryable(timeout(), backoff, now()).is_err());
        assert!(r.bounce("gone", None, now()).is_err());
        assert_eq!(r.status, DeliveryStatus::Success);
    }

    #[test]
    fn test_skip_and_reject_only_from_pending() {
        let mut skipped = record();
        skipped.skip("OPTED_OUT", now()).unwrap();
        assert_eq!(skipped.status, DeliveryStatus::Skipped);
        assert_eq!(skipped.error_code.as_deref(), Some("OPTED_OUT"));

        let mut in_progress = record();
        in_progress.start_attempt("smtp", now()).unwrap();
        assert!(in_progress.skip("OPTED_OUT", now()).is_err());
        assert!(
            in_progress
                .reject(FailureDetail::new("NO_PROVIDER", "none"), now())
                .is_err()
        );
    }

    #[test]
    fn test_cancel_clears_schedule() {
        let mut r = record();
        r.defer(now() + Duration::hours(1), "RATE_LIMITED", now())
            .unwrap();
        r.cancel("user request", now()).unwrap();
        assert_eq!(r.status, DeliveryStatus::Cancelled);
        assert!(r.next_attempt_at.is_none());
        assert_eq!(r.phase(), DeliveryPhase::Terminal);
    }

    #[test]
    fn test_bounce_records_reason() {
        let mut r = record();
        r.start_attempt("smtp", now()).unwrap();
        r.bounce("mailbox does not exist", Some(550), now()).unwrap();
        assert_eq!(r.status, DeliveryStatus::Bounced);
        assert_eq!(r.bounced_at, Some(now()));
        assert_eq!(r.response_code, Some(550));
    }
}
