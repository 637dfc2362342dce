//! Dispatcher.
//!
//! Turns inbound domain events into notifications and drives each delivery
//! record through the gate, its provider and the retry scheduler. Every
//! transition is persisted with a compare-and-swap on the record version; a
//! worker that loses the race drops its task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::database::repositories::{DeliveryRepository, NotificationRepository};
use crate::domain::{
    Channel, DeliveryPhase, DeliveryRecord, DeliveryStatus, FailureDetail, Notification,
    RetryDecision,
};
use crate::metrics::{MetricsSink, names};
use crate::notification::events::{DomainEvent, LifecycleEvent, LifecycleEventType, type_info};
use crate::notification::gate::PreferenceGate;
use crate::notification::providers::{
    DeliveryOutcome, DeliveryProvider, FailureClass, OutcomeStatus, ProviderRegistry,
};
use crate::notification::queue::{DispatchTask, LifecyclePublisher, RetryQueue};
use crate::notification::rate_limiter::ChannelRateLimiter;
use crate::notification::retry::{RetryConfig, RetryScheduler};
use crate::{Error, Result};

/// Lease used for in-flight records whose channel has no provider.
const FALLBACK_LEASE: Duration = Duration::from_secs(60);

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent dispatch workers.
    pub workers: usize,
    /// Records re-enqueued per recovery sweep.
    pub recovery_batch_size: i64,
    /// How long a record waits when its provider is not configured.
    pub unavailable_defer_secs: u64,
    /// Provider timeout multiple after which an in-flight attempt is re-run.
    pub lease_factor: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            recovery_batch_size: 500,
            unavailable_defer_secs: 300,
            lease_factor: 2,
        }
    }
}

/// Collaborators of the dispatcher.
pub struct DispatcherParts {
    pub notifications: Arc<dyn NotificationRepository>,
    pub deliveries: Arc<dyn DeliveryRepository>,
    pub gate: Arc<PreferenceGate>,
    pub providers: ProviderRegistry,
    pub queue: Arc<dyn RetryQueue>,
    pub publisher: Arc<dyn LifecyclePublisher>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Why a task went back on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    Retry,
    /// Quiet hours, provider rate limit or provider not configured.
    Deferred,
    AwaitingConfirmation,
    NotDue,
    LeaseHeld,
}

/// Why a task was dropped without work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    AlreadyTerminal,
    /// The task's attempt number is behind the record.
    Stale,
    /// Another worker advanced the record first.
    Conflict,
    Missing,
}

/// Result of processing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Terminal(DeliveryStatus),
    Requeued {
        delay: Duration,
        reason: RequeueReason,
    },
    Dropped(DropReason),
}

/// Delivery counts for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_channel: BTreeMap<String, BTreeMap<String, i64>>,
}

pub struct Dispatcher {
    notifications: Arc<dyn NotificationRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    gate: Arc<PreferenceGate>,
    providers: ProviderRegistry,
    queue: Arc<dyn RetryQueue>,
    publisher: Arc<dyn LifecyclePublisher>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryScheduler,
    rate_limiter: ChannelRateLimiter,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts, retry: RetryConfig, config: DispatcherConfig) -> Self {
        Self {
            notifications: parts.notifications,
            deliveries: parts.deliveries,
            gate: parts.gate,
            providers: parts.providers,
            queue: parts.queue,
            publisher: parts.publisher,
            metrics: parts.metrics,
            retry: RetryScheduler::new(retry),
            rate_limiter: ChannelRateLimiter::new(),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    // ========== Ingestion ==========

    /// Route an inbound event into notifications and PENDING delivery records.
    ///
    /// Idempotent per (event, user, channel, type): replaying an event returns
    /// tasks only for records that are still non-terminal.
    pub async fn ingest(&self, event: &DomainEvent) -> Result<Vec<DispatchTask>> {
        if event.is_cancellation() {
            let target = event.cancellation_target().ok_or_else(|| {
                Error::validation("notification.cancel event without data.notification_id")
            })?;
            match self.cancel(target, event.cancellation_reason()).await {
                Ok(_) => {}
                Err(Error::NotFound { .. }) => {
                    warn!(notification_id = %target, "Cancellation for unknown notification ignored");
                }
                Err(e) => return Err(e),
            }
            return Ok(Vec::new());
        }

        let info = type_info(&event.event_type).ok_or_else(|| {
            Error::validation(format!("Unroutable event type '{}'", event.event_type))
        })?;
        if event.user_id.trim().is_empty() {
            return Err(Error::validation(format!(
                "Event {} has no user_id",
                event.event_id
            )));
        }

        let mut channels: Vec<Channel> = match &event.channels {
            Some(channels) if !channels.is_empty() => channels.clone(),
            _ => info.default_channels.to_vec(),
        };
        channels.sort();
        channels.dedup();

        let priority = event.priority.unwrap_or(info.priority);
        let now = Utc::now();
        let mut tasks = Vec::with_capacity(channels.len());

        for channel in channels {
            let Some(address) = event.recipient.address_for(channel) else {
                debug!(
                    event_id = %event.event_id,
                    channel = %channel,
                    "No recipient address for channel, not routed"
                );
                continue;
            };

            let notification = Notification::new(
                &event.event_id,
                &event.user_id,
                info.notification_type,
                channel,
                address,
                event.subject_or(info.label),
                event.body(),
                now,
            )
            .with_priority(priority)
            .with_correlation_id(event.correlation_id.clone())
            .with_digest_key(event.digest_key.clone());
            let record = DeliveryRecord::new(
                &notification.id,
                channel,
                address,
                self.retry.max_attempts(),
                now,
            );

            let stored = self
                .notifications
                .insert_with_delivery(&notification, &record)
                .await?;

            if !stored.created {
                debug!(
                    event_id = %event.event_id,
                    notification_id = %stored.notification.id,
                    status = %stored.delivery.status,
                    "Event already ingested"
                );
            }
            if stored.delivery.is_terminal() {
                continue;
            }

            tasks.push(
                DispatchTask::new(&stored.notification.id, &stored.delivery.id)
                    .for_attempt(stored.delivery.attempt_count),
            );
        }

        self.metrics
            .increment(names::EVENTS_INGESTED, &[("domain", event.domain())]);
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            notification_type = info.notification_type,
            tasks = tasks.len(),
            "Event ingested"
        );
        Ok(tasks)
    }

    /// Ingest an event and enqueue its tasks for immediate dispatch.
    pub async fn submit(&self, event: &DomainEvent) -> Result<usize> {
        let tasks = self.ingest(event).await?;
        let count = tasks.len();
        for task in tasks {
            self.queue.enqueue(task, Duration::ZERO).await?;
        }
        Ok(count)
    }

    // ========== Dispatch ==========

    pub async fn dispatch(&self, task: DispatchTask) -> Result<DispatchOutcome> {
        self.dispatch_at(task, Utc::now()).await
    }

    /// Process one task as of `now`.
    pub async fn dispatch_at(&self, task: DispatchTask, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        match self.process(&task, now).await {
            Err(e) if e.is_conflict() => {
                debug!(delivery_id = %task.delivery_id, "Lost update race, task dropped");
                self.metrics
                    .increment(names::STALE_TASKS, &[("reason", "conflict")]);
                Ok(DispatchOutcome::Dropped(DropReason::Conflict))
            }
            other => other,
        }
    }

    async fn process(&self, task: &DispatchTask, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let record = match self.deliveries.get(&task.delivery_id).await {
            Ok(record) => record,
            Err(Error::NotFound { .. }) => {
                warn!(delivery_id = %task.delivery_id, "Task for unknown delivery record dropped");
                return Ok(DispatchOutcome::Dropped(DropReason::Missing));
            }
            Err(e) => return Err(e),
        };

        if record.is_terminal() {
            debug!(
                delivery_id = %record.id,
                status = %record.status,
                "Record already terminal, nothing to do"
            );
            return Ok(DispatchOutcome::Dropped(DropReason::AlreadyTerminal));
        }

        if task.attempt < record.attempt_count {
            debug!(
                delivery_id = %record.id,
                task_attempt = task.attempt,
                record_attempt = record.attempt_count,
                "Stale task dropped"
            );
            self.metrics
                .increment(names::STALE_TASKS, &[("reason", "stale")]);
            return Ok(DispatchOutcome::Dropped(DropReason::Stale));
        }

        let notification = self.notifications.get(&record.notification_id).await?;

        match record.phase() {
            DeliveryPhase::Pending => {
                if !record.is_due(now) {
                    return self.requeue_at(task.clone(), &record, now, RequeueReason::NotDue).await;
                }
                self.process_pending(notification, record, task, now).await
            }
            DeliveryPhase::InFlight => self.process_in_flight(notification, record, task, now).await,
            DeliveryPhase::RetryScheduled => {
                if !record.is_due(now) {
                    return self.requeue_at(task.clone(), &record, now, RequeueReason::NotDue).await;
                }
                self.resume_retry(notification, record, task, now).await
            }
            DeliveryPhase::AwaitingConfirmation => {
                if !record.is_due(now) {
                    return self.requeue_at(task.clone(), &record, now, RequeueReason::NotDue).await;
                }
                self.poll_confirmation(notification, record, task, now).await
            }
            DeliveryPhase::Terminal => Ok(DispatchOutcome::Dropped(DropReason::AlreadyTerminal)),
        }
    }

    async fn process_pending(
        &self,
        notification: Notification,
        mut record: DeliveryRecord,
        task: &DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        if let Some(cancellation) = self.notifications.get_cancellation(&notification.id).await? {
            record.cancel(&cancellation.reason, now)?;
            return self.finish(&notification, record, now).await;
        }

        let Some(provider) = self.providers.select(&notification) else {
            let failure = match self.providers.get(record.channel) {
                Some(provider) => FailureDetail::new(
                    FailureClass::InvalidRecipient.as_str(),
                    format!("{} cannot deliver to this recipient", provider.name()),
                ),
                None => FailureDetail::new("NO_PROVIDER", format!("No provider for {}", record.channel)),
            };
            record.reject(failure, now)?;
            return self.finish(&notification, record, now).await;
        };

        if !provider.is_available() {
            error!(
                provider = provider.name(),
                channel = %record.channel,
                delivery_id = %record.id,
                alert = true,
                "Provider not configured, delivery deferred"
            );
            self.metrics.increment(
                names::PROVIDER_UNAVAILABLE,
                &[("channel", record.channel.as_str())],
            );
            let delay = Duration::from_secs(self.config.unavailable_defer_secs);
            return self
                .defer(record, task, delay, "PROVIDER_UNAVAILABLE", now)
                .await;
        }

        let decision = self
            .gate
            .may_deliver(
                &notification.user_id,
                record.channel,
                &notification.notification_type,
                notification.priority,
                now,
            )
            .await?;
        if let Some(reason) = decision.reason.filter(|_| !decision.allow) {
            info!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                channel = %record.channel,
                reason = reason.code(),
                detail = %reason,
                "Dispatch denied by preferences"
            );
            self.metrics.increment(
                names::GATE_DENIED,
                &[("channel", record.channel.as_str()), ("reason", reason.code())],
            );
            return match reason.defer_until() {
                Some(until) => {
                    let delay = (until - now).to_std().unwrap_or(Duration::ZERO);
                    self.defer(record, task, delay, reason.code(), now).await
                }
                None => {
                    record.skip(reason.code(), now)?;
                    self.finish(&notification, record, now).await
                }
            };
        }

        if let Err(wait) = self
            .rate_limiter
            .try_acquire(record.channel, provider.rate_limit())
        {
            debug!(channel = %record.channel, wait_ms = wait.as_millis() as u64, "Provider rate limit reached");
            self.metrics
                .increment(names::RATE_LIMITED, &[("channel", record.channel.as_str())]);
            return self.defer(record, task, wait, "RATE_LIMITED", now).await;
        }

        record.start_attempt(provider.name(), now)?;
        self.save(&mut record).await?;
        let task = task.clone().for_attempt(record.attempt_count);
        self.attempt(notification, record, provider, task, now).await
    }

    async fn process_in_flight(
        &self,
        notification: Notification,
        mut record: DeliveryRecord,
        task: &DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let provider = self.providers.get(record.channel);
        let lease = provider
            .as_ref()
            .map(|p| p.timeout() * self.config.lease_factor.max(1))
            .unwrap_or(FALLBACK_LEASE);
        let claimed_at = record.attempted_at.unwrap_or(record.updated_at);
        let expires = claimed_at + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());

        if expires > now {
            let remaining = (expires - now).to_std().unwrap_or(Duration::ZERO);
            return self
                .requeue(task.clone(), remaining, RequeueReason::LeaseHeld)
                .await;
        }

        let Some(provider) = provider else {
            record.fail(
                FailureDetail::new("NO_PROVIDER", format!("No provider for {}", record.channel)),
                now,
            )?;
            return self.finish(&notification, record, now).await;
        };

        warn!(
            delivery_id = %record.id,
            attempt = record.attempt_count,
            "In-flight lease expired, re-running attempt"
        );
        record.reclaim(now)?;
        self.save(&mut record).await?;
        self.attempt(notification, record, provider, task.clone(), now).await
    }

    async fn resume_retry(
        &self,
        notification: Notification,
        mut record: DeliveryRecord,
        task: &DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        if let Some(cancellation) = self.notifications.get_cancellation(&notification.id).await? {
            record.cancel(&cancellation.reason, now)?;
            return self.finish(&notification, record, now).await;
        }

        let Some(provider) = self.providers.get(record.channel) else {
            record.resume(now)?;
            record.fail(
                FailureDetail::new("NO_PROVIDER", format!("No provider for {}", record.channel)),
                now,
            )?;
            return self.finish(&notification, record, now).await;
        };

        record.resume(now)?;
        self.save(&mut record).await?;
        self.attempt(notification, record, provider, task.clone(), now).await
    }

    async fn poll_confirmation(
        &self,
        notification: Notification,
        record: DeliveryRecord,
        task: &DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let Some(provider) = self.providers.get(record.channel) else {
            return self
                .apply_outcome(
                    &notification,
                    record,
                    DeliveryOutcome::failed(FailureClass::Rejected, "Provider removed"),
                    task,
                    true,
                    now,
                )
                .await;
        };

        let outcome = match tokio::time::timeout(provider.timeout(), provider.check_status(&record)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(delivery_id = %record.id, "Status query timed out");
                DeliveryOutcome::pending(record.external_id.clone())
            }
        };
        self.apply_outcome(&notification, record, outcome, task, true, now)
            .await
    }

    /// Run one provider call for a claimed record and apply its outcome.
    async fn attempt(
        &self,
        notification: Notification,
        record: DeliveryRecord,
        provider: Arc<dyn DeliveryProvider>,
        task: DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let channel = record.channel.as_str();
        self.metrics.increment(names::ATTEMPTS, &[("channel", channel)]);

        let timeout = provider.timeout();
        let outcome = match tokio::time::timeout(timeout, provider.deliver(&notification)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::failed(
                FailureClass::Timeout,
                format!("Provider call exceeded {}s", timeout.as_secs()),
            )
            .with_latency(timeout),
        };
        self.metrics.record_duration(
            names::PROVIDER_LATENCY,
            &[("channel", channel), ("provider", provider.name())],
            outcome.latency,
        );

        debug!(
            delivery_id = %record.id,
            attempt = record.attempt_count,
            provider = provider.name(),
            outcome = ?outcome.status,
            latency_ms = outcome.latency.as_millis() as u64,
            "Provider call finished"
        );
        self.apply_outcome(&notification, record, outcome, &task, false, now)
            .await
    }

    async fn apply_outcome(
        &self,
        notification: &Notification,
        mut record: DeliveryRecord,
        outcome: DeliveryOutcome,
        task: &DispatchTask,
        polling: bool,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let cancellation = self.notifications.get_cancellation(&notification.id).await?;
        let failure = outcome.failure_detail();

        match outcome.status {
            OutcomeStatus::Delivered => {
                record.mark_delivered(
                    outcome.external_id,
                    outcome.provider_message_id,
                    outcome.response_code,
                    now,
                )?;
                self.finish(notification, record, now).await
            }
            OutcomeStatus::Bounced { reason } => {
                record.bounce(&reason, outcome.response_code, now)?;
                self.finish(notification, record, now).await
            }
            OutcomeStatus::Pending => {
                if let Some(cancellation) = cancellation {
                    info!(
                        delivery_id = %record.id,
                        "Provider accepted a cancelled notification, confirmation not tracked"
                    );
                    record.cancel(&cancellation.reason, now)?;
                    return self.finish(notification, record, now).await;
                }

                // Never resubmitted once the provider holds the message.
                if polling && task.polls >= self.retry.max_status_polls() {
                    warn!(
                        delivery_id = %record.id,
                        polls = task.polls,
                        "No delivery confirmation after maximum polls"
                    );
                    record.fail(
                        FailureDetail::new(
                            "TIMEOUT:CONFIRMATION",
                            "Delivery not confirmed by provider",
                        ),
                        now,
                    )?;
                    return self.finish(notification, record, now).await;
                }

                let Some(external_id) = outcome.external_id.or_else(|| record.external_id.clone())
                else {
                    // Nothing to poll without an id; acceptance is the final word.
                    record.mark_delivered(None, outcome.provider_message_id, outcome.response_code, now)?;
                    return self.finish(notification, record, now).await;
                };

                let poll_delay = self.retry.status_poll_delay();
                let poll_at = now + chrono::Duration::from_std(poll_delay).unwrap_or(chrono::Duration::zero());
                record.await_confirmation(
                    external_id,
                    outcome.provider_message_id,
                    outcome.response_code,
                    poll_at,
                    now,
                )?;
                self.save(&mut record).await?;

                let next = if polling {
                    task.clone().next_poll()
                } else {
                    self.emit(notification, &record, LifecycleEventType::Sent, now)
                        .await;
                    task.clone().for_attempt(record.attempt_count)
                };
                self.requeue(next, poll_delay, RequeueReason::AwaitingConfirmation)
                    .await
            }
            OutcomeStatus::Failed { class, .. } => {
                let detail = failure.unwrap_or_default();

                if !class.is_retryable() {
                    record.fail(detail, now)?;
                    return self.finish(notification, record, now).await;
                }

                if let Some(cancellation) = cancellation {
                    info!(
                        delivery_id = %record.id,
                        error_code = %detail.code,
                        "Retryable failure on a cancelled notification, not retried"
                    );
                    record.cancel(&cancellation.reason, now)?;
                    return self.finish(notification, record, now).await;
                }

                self.apply_retryable(notification, record, class, detail, task, now)
                    .await
            }
        }
    }

    async fn apply_retryable(
        &self,
        notification: &Notification,
        mut record: DeliveryRecord,
        class: FailureClass,
        detail: FailureDetail,
        task: &DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let max_delay = self.retry.max_delay();
        let decision = record.fail_retryable(
            detail,
            |attempt| {
                let delay = self.retry.backoff(class, attempt).unwrap_or(max_delay);
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
            },
            now,
        )?;

        match decision {
            RetryDecision::Scheduled { attempt, delay } => {
                self.save(&mut record).await?;
                let delay = delay.to_std().unwrap_or(Duration::ZERO);
                info!(
                    delivery_id = %record.id,
                    channel = %record.channel,
                    class = %class,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                self.metrics.increment(
                    names::RETRIES_SCHEDULED,
                    &[("channel", record.channel.as_str()), ("class", class.as_str())],
                );
                self.requeue(task.clone().for_attempt(attempt), delay, RequeueReason::Retry)
                    .await
            }
            RetryDecision::Exhausted => self.finish(notification, record, now).await,
        }
    }

    /// Hold a PENDING record for `delay` without consuming an attempt.
    async fn defer(
        &self,
        mut record: DeliveryRecord,
        task: &DispatchTask,
        delay: Duration,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let until = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        record.defer(until, reason, now)?;
        self.save(&mut record).await?;
        self.requeue(task.clone(), delay, RequeueReason::Deferred).await
    }

    async fn requeue_at(
        &self,
        task: DispatchTask,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
        reason: RequeueReason,
    ) -> Result<DispatchOutcome> {
        let delay = record
            .next_attempt_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.requeue(task, delay, reason).await
    }

    async fn requeue(
        &self,
        task: DispatchTask,
        delay: Duration,
        reason: RequeueReason,
    ) -> Result<DispatchOutcome> {
        self.queue.enqueue(task, delay).await?;
        Ok(DispatchOutcome::Requeued { delay, reason })
    }

    /// Persist a terminal transition and emit its lifecycle event.
    async fn finish(
        &self,
        notification: &Notification,
        mut record: DeliveryRecord,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        self.save(&mut record).await?;

        self.metrics.increment(
            names::OUTCOMES,
            &[("channel", record.channel.as_str()), ("status", record.status.as_str())],
        );
        info!(
            notification_id = %notification.id,
            delivery_id = %record.id,
            channel = %record.channel,
            status = %record.status,
            attempts = record.attempt_count,
            error_code = record.error_code.as_deref().unwrap_or(""),
            "Delivery finished"
        );

        if let Some(event_type) = LifecycleEventType::for_terminal(record.status) {
            self.emit(notification, &record, event_type, now).await;
        }
        Ok(DispatchOutcome::Terminal(record.status))
    }

    async fn save(&self, record: &mut DeliveryRecord) -> Result<()> {
        record.version = self.deliveries.compare_and_swap(record).await?;
        Ok(())
    }

    async fn emit(
        &self,
        notification: &Notification,
        record: &DeliveryRecord,
        event_type: LifecycleEventType,
        now: DateTime<Utc>,
    ) {
        let event = LifecycleEvent::new(notification, record, event_type, now);
        match self.publisher.publish(&event).await {
            Ok(()) => self.metrics.increment(
                names::LIFECYCLE_PUBLISHED,
                &[("event_type", event_type.as_str())],
            ),
            Err(e) => error!(
                notification_id = %notification.id,
                routing_key = %event.routing_key(),
                error = %e,
                alert = true,
                "Failed to publish lifecycle event"
            ),
        }
    }

    // ========== Cancellation, recovery, reporting ==========

    /// Cancel a notification.
    ///
    /// Records the cancellation sentinel, then cancels every delivery that is
    /// not currently in flight. In-flight attempts observe the sentinel once
    /// their provider call returns. Returns the number of records cancelled here.
    pub async fn cancel(&self, notification_id: &str, reason: &str) -> Result<usize> {
        let now = Utc::now();
        let notification = self.notifications.get(notification_id).await?;

        if !self
            .notifications
            .record_cancellation(notification_id, reason, now)
            .await?
        {
            debug!(notification_id = %notification_id, "Cancellation already recorded");
        }

        let mut cancelled = 0;
        for mut record in self.deliveries.get_for_notification(notification_id).await? {
            match record.phase() {
                DeliveryPhase::Pending | DeliveryPhase::RetryScheduled => {
                    record.cancel(reason, now)?;
                    match self.finish(&notification, record, now).await {
                        Ok(_) => cancelled += 1,
                        Err(e) if e.is_conflict() => {
                            debug!(notification_id = %notification_id, "Record advanced concurrently, worker will observe cancellation");
                        }
                        Err(e) => return Err(e),
                    }
                }
                DeliveryPhase::InFlight | DeliveryPhase::AwaitingConfirmation => {
                    debug!(
                        delivery_id = %record.id,
                        "Delivery in flight, cancellation applied after provider call"
                    );
                }
                DeliveryPhase::Terminal => {}
            }
        }

        info!(notification_id = %notification_id, cancelled, reason = %reason, "Notification cancelled");
        Ok(cancelled)
    }

    /// Re-enqueue records whose scheduled time has passed, e.g. after a restart.
    pub async fn recover_due(&self, now: DateTime<Utc>, limit: i64) -> Result<usize> {
        let due = self.deliveries.list_due(now, limit).await?;
        let count = due.len();
        for record in due {
            let task = DispatchTask::new(&record.notification_id, &record.id)
                .for_attempt(record.attempt_count);
            self.queue.enqueue(task, Duration::ZERO).await?;
        }
        if count > 0 {
            info!(count, "Recovered due deliveries");
        }
        Ok(count)
    }

    pub async fn stats(&self) -> Result<DeliveryStats> {
        let mut stats = DeliveryStats::default();
        for row in self.deliveries.count_by_status().await? {
            stats.total += row.count;
            *stats.by_status.entry(row.status.clone()).or_default() += row.count;
            *stats
                .by_channel
                .entry(row.channel)
                .or_default()
                .entry(row.status)
                .or_default() += row.count;
        }
        Ok(stats)
    }
}
