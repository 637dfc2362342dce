//! End-to-end dispatch tests against a real SQLite database with mocked providers.

mod common;

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;

use common::{event, harness, harness_with};
use herald::broker::{AckAction, handle_inbound};
use herald::config::EngineConfig;
use herald::database::repositories::{DeliveryRepository, NotificationRepository};
use herald::domain::{Channel, DeliveryRecord, DeliveryStatus, Notification, PreferenceUpdate};
use herald::metrics::names;
use herald::notification::{
    BroadcastPublisher, DeliveryOutcome, DeliveryProvider, DispatchOutcome, Dispatcher, DropReason,
    EmailConfig, EmailProvider, FailureClass, LifecycleEventType, ProviderRegistry,
    RequeueReason, RetryConfig, WorkerPool,
};
use herald::services::ServiceContainer;
use tokio_util::sync::CancellationToken;

mock! {
    pub Provider {}

    #[async_trait]
    impl DeliveryProvider for Provider {
        fn channel(&self) -> Channel;
        fn name(&self) -> &'static str;
        fn can_handle(&self, notification: &Notification) -> bool;
        async fn deliver(&self, notification: &Notification) -> DeliveryOutcome;
        async fn check_status(&self, record: &DeliveryRecord) -> DeliveryOutcome;
        fn is_available(&self) -> bool;
        fn rate_limit(&self) -> u32;
        fn timeout(&self) -> Duration;
    }
}

/// A configured provider for `channel` with no delivery expectations yet.
fn provider(channel: Channel) -> MockProvider {
    let mut provider = MockProvider::new();
    provider.expect_channel().return_const(channel);
    provider.expect_name().return_const("mock");
    provider.expect_can_handle().returning(|_| true);
    provider.expect_is_available().return_const(true);
    provider.expect_rate_limit().return_const(600u32);
    provider.expect_timeout().return_const(Duration::from_secs(5));
    provider
}

fn registry(provider: MockProvider) -> ProviderRegistry {
    ProviderRegistry::new().with_provider(Arc::new(provider))
}

fn timeout_failure() -> DeliveryOutcome {
    DeliveryOutcome::failed(FailureClass::Timeout, "relay did not answer")
}

#[tokio::test]
async fn test_email_retries_twice_then_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut email = provider(Channel::Email);
    let counter = calls.clone();
    email.expect_deliver().times(3).returning(move |_| {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => timeout_failure(),
            _ => DeliveryOutcome::delivered(Some("msg-1".into())),
        }
    });
    let mut h = harness(registry(email)).await;

    assert_eq!(h.dispatcher.submit(&event("evt-1", "order.placed", &["EMAIL"])).await.unwrap(), 1);
    let (task, delay) = h.queue.take_one();
    assert_eq!(delay, Duration::ZERO);

    let mut now = Utc::now();
    let mut delays = Vec::new();
    let mut task = task;
    for _ in 0..2 {
        let outcome = h.dispatcher.dispatch_at(task.clone(), now).await.unwrap();
        let (next, delay) = h.queue.take_one();
        assert_eq!(
            outcome,
            DispatchOutcome::Requeued {
                delay,
                reason: RequeueReason::Retry
            }
        );
        delays.push(delay);
        now += chrono::Duration::from_std(delay).unwrap();
        task = next;
    }

    let outcome = h.dispatcher.dispatch_at(task, now).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Terminal(DeliveryStatus::Success));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert!(delays[1] > delays[0], "backoff must grow: {delays:?}");
    assert_eq!(delays, vec![Duration::from_secs(20), Duration::from_secs(40)]);

    let record = h.deliveries.get(&task_delivery_id(&h).await).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.external_id.as_deref(), Some("msg-1"));
    assert!(record.delivered_at.is_some());

    let events = h.drain_events();
    let delivered: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == LifecycleEventType::Delivered)
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].correlation_id.as_deref(), Some("corr-evt-1"));
    assert_eq!(delivered[0].routing_key(), "event.delivered.email");
    assert!(!events.iter().any(|e| e.event_type == LifecycleEventType::Failed));

    assert_eq!(h.metrics.counter(names::RETRIES_SCHEDULED, &[("channel", "EMAIL"), ("class", "TIMEOUT")]), 2);
}

/// Delivery id of the only notification for `user-1`.
async fn task_delivery_id(h: &common::Harness) -> String {
    let notifications = h.notifications.list_for_user("user-1", 10).await.unwrap();
    assert_eq!(notifications.len(), 1);
    let records = h
        .deliveries
        .get_for_notification(&notifications[0].id)
        .await
        .unwrap();
    records[0].id.clone()
}

#[tokio::test]
async fn test_redelivery_after_success_is_a_no_op() {
    let mut email = provider(Channel::Email);
    email
        .expect_deliver()
        .times(1)
        .returning(|_| DeliveryOutcome::delivered(Some("msg-1".into())));
    let mut h = harness(registry(email)).await;
    let evt = event("evt-2", "order.placed", &["EMAIL"]);

    h.dispatcher.submit(&evt).await.unwrap();
    let (task, _) = h.queue.take_one();
    let now = Utc::now();
    assert_eq!(
        h.dispatcher.dispatch_at(task.clone(), now).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Success)
    );

    // Broker redelivers the same task, then the producer replays the event.
    assert_eq!(
        h.dispatcher.dispatch_at(task, now).await.unwrap(),
        DispatchOutcome::Dropped(DropReason::AlreadyTerminal)
    );
    assert_eq!(h.dispatcher.submit(&evt).await.unwrap(), 0);
    assert!(h.queue.take().is_empty());

    assert_eq!(h.notifications.list_for_user("user-1", 10).await.unwrap().len(), 1);
    let delivered = h
        .drain_events()
        .into_iter()
        .filter(|e| e.event_type == LifecycleEventType::Delivered)
        .count();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let mut email = provider(Channel::Email);
    email.expect_deliver().times(2).returning(|_| timeout_failure());
    let retry = RetryConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let mut h = harness_with(registry(email), retry).await;

    h.dispatcher.submit(&event("evt-3", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    let now = Utc::now();

    h.dispatcher.dispatch_at(task, now).await.unwrap();
    let (task, delay) = h.queue.take_one();
    let later = now + chrono::Duration::from_std(delay).unwrap();
    assert_eq!(
        h.dispatcher.dispatch_at(task, later).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Failed)
    );

    let record = h.deliveries.get(&task_delivery_id(&h).await).await.unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.error_code.as_deref(), Some("TIMEOUT"));
    assert!(record.failed_at.is_some());

    let failed = h
        .drain_events()
        .into_iter()
        .filter(|e| e.event_type == LifecycleEventType::Failed)
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let mut sms = provider(Channel::Sms);
    sms.expect_deliver().times(1).returning(|_| {
        DeliveryOutcome::failed(FailureClass::InvalidRecipient, "unknown number")
    });
    let h = harness(registry(sms)).await;

    h.dispatcher.submit(&event("evt-4", "order.shipped", &["SMS"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    assert_eq!(
        h.dispatcher.dispatch_at(task, Utc::now()).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Failed)
    );
    assert!(h.queue.take().is_empty());

    let record = h.deliveries.get(&task_delivery_id(&h).await).await.unwrap();
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.error_code.as_deref(), Some("INVALID_RECIPIENT"));
}

#[tokio::test]
async fn test_pending_submission_confirmed_by_polling() {
    let mut sms = provider(Channel::Sms);
    sms.expect_deliver()
        .times(1)
        .returning(|_| DeliveryOutcome::pending(Some("ext-1".into())));
    sms.expect_check_status()
        .times(1)
        .returning(|record| DeliveryOutcome::delivered(record.external_id.clone()));
    let mut h = harness(registry(sms)).await;

    h.dispatcher.submit(&event("evt-5", "order.shipped", &["SMS"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    let now = Utc::now();

    let outcome = h.dispatcher.dispatch_at(task, now).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Requeued {
            delay: Duration::from_secs(30),
            reason: RequeueReason::AwaitingConfirmation
        }
    );
    let (poll, _) = h.queue.take_one();
    let sent: Vec<_> = h.drain_events();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_type, LifecycleEventType::Sent);

    let outcome = h
        .dispatcher
        .dispatch_at(poll, now + chrono::Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Terminal(DeliveryStatus::Success));

    let record = h.deliveries.get(&task_delivery_id(&h).await).await.unwrap();
    assert_eq!(record.external_id.as_deref(), Some("ext-1"));
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn test_opted_out_recipient_is_skipped() {
    let mut email = provider(Channel::Email);
    email.expect_deliver().never();
    let mut h = harness(registry(email)).await;

    h.preferences
        .opt_out("user-1", Channel::Email, "order_placed", Some("too many emails".into()))
        .await
        .unwrap();

    h.dispatcher.submit(&event("evt-6", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    assert_eq!(
        h.dispatcher.dispatch_at(task, Utc::now()).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Skipped)
    );

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, LifecycleEventType::Skipped);
    assert_eq!(events[0].reason.as_deref(), Some("OPTED_OUT"));
}

#[tokio::test]
async fn test_quiet_hours_defer_without_consuming_attempt() {
    let mut email = provider(Channel::Email);
    email.expect_deliver().never();
    let h = harness(registry(email)).await;

    // Two-hour window centred on now, possibly wrapping midnight.
    let now = Utc::now();
    let start = (now - chrono::Duration::hours(1)).format("%H:%M").to_string();
    let end = (now + chrono::Duration::hours(1)).format("%H:%M").to_string();
    h.preferences
        .update(
            "user-1",
            Channel::Email,
            "order_placed",
            PreferenceUpdate {
                quiet_hours_enabled: Some(true),
                quiet_hours_start: Some(start),
                quiet_hours_end: Some(end),
                timezone: Some("UTC".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.dispatcher.submit(&event("evt-7", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    let outcome = h.dispatcher.dispatch_at(task, now).await.unwrap();
    let DispatchOutcome::Requeued { delay, reason } = outcome else {
        panic!("expected a deferral, got {outcome:?}");
    };
    assert_eq!(reason, RequeueReason::Deferred);
    assert!(delay <= Duration::from_secs(3600));

    let record = h.deliveries.get(&task_delivery_id(&h).await).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.error_code.as_deref(), Some("QUIET_HOURS"));
    assert!(record.next_attempt_at.is_some());
}

#[tokio::test]
async fn test_cancel_before_dispatch() {
    let mut email = provider(Channel::Email);
    email.expect_deliver().never();
    let mut h = harness(registry(email)).await;

    h.dispatcher.submit(&event("evt-8", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();

    assert_eq!(h.dispatcher.cancel(&task.notification_id, "order voided").await.unwrap(), 1);
    assert_eq!(
        h.dispatcher.dispatch_at(task.clone(), Utc::now()).await.unwrap(),
        DispatchOutcome::Dropped(DropReason::AlreadyTerminal)
    );

    let record = h.deliveries.get(&task.delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Cancelled);

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, LifecycleEventType::Cancelled);

    // Repeating the cancellation changes nothing.
    assert_eq!(h.dispatcher.cancel(&task.notification_id, "again").await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancellation_event() {
    let h = harness(registry(provider(Channel::Email))).await;

    h.dispatcher.submit(&event("evt-9", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();

    let cancel: herald::notification::DomainEvent = serde_json::from_value(serde_json::json!({
        "event_id": "evt-10",
        "event_type": "notification.cancel",
        "occurred_at": Utc::now(),
        "data": {"notification_id": task.notification_id, "reason": "refunded"}
    }))
    .unwrap();
    assert_eq!(h.dispatcher.submit(&cancel).await.unwrap(), 0);
    let record = h.deliveries.get(&task.delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Cancelled);

    // Unknown targets are ignored.
    let unknown: herald::notification::DomainEvent = serde_json::from_value(serde_json::json!({
        "event_id": "evt-11",
        "event_type": "notification.cancel",
        "occurred_at": Utc::now(),
        "data": {"notification_id": "missing"}
    }))
    .unwrap();
    assert_eq!(h.dispatcher.submit(&unknown).await.unwrap(), 0);
}

#[tokio::test]
async fn test_default_channels_follow_available_addresses() {
    let h = harness(ProviderRegistry::new()).await;

    let mut evt = event("evt-12", "order.shipped", &[]);
    evt.recipient.device_token = None;
    let tasks = h.dispatcher.ingest(&evt).await.unwrap();
    // order_shipped defaults to email, SMS and push; push has no address.
    assert_eq!(tasks.len(), 2);

    let stats = h.dispatcher.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_status.get("PENDING"), Some(&2));
}

#[tokio::test]
async fn test_inbound_consumer_verdicts() {
    let h = harness(ProviderRegistry::new()).await;

    assert_eq!(handle_inbound(&h.dispatcher, b"{not json").await, AckAction::Reject);

    let unroutable = serde_json::to_vec(&event("evt-13", "inventory.restocked", &["EMAIL"])).unwrap();
    assert_eq!(handle_inbound(&h.dispatcher, &unroutable).await, AckAction::Reject);

    let valid = serde_json::to_vec(&event("evt-14", "payment.failed", &["EMAIL"])).unwrap();
    assert_eq!(handle_inbound(&h.dispatcher, &valid).await, AckAction::Ack);
    assert_eq!(h.queue.take().len(), 1);

    assert_eq!(h.metrics.counter_total(names::EVENTS_REJECTED), 2);
    assert_eq!(h.metrics.counter(names::EVENTS_INGESTED, &[("domain", "payment")]), 1);
}

#[tokio::test]
async fn test_missing_provider_rejects_delivery() {
    let mut h = harness(ProviderRegistry::new()).await;

    h.dispatcher.submit(&event("evt-15", "order.placed", &["PUSH"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    assert_eq!(
        h.dispatcher.dispatch_at(task, Utc::now()).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Failed)
    );
    let events = h.drain_events();
    assert_eq!(events[0].reason.as_deref(), Some("NO_PROVIDER"));
}

#[tokio::test]
async fn test_recover_due_requeues_pending_records() {
    let h = harness(ProviderRegistry::new()).await;
    h.dispatcher.ingest(&event("evt-16", "order.placed", &["EMAIL"])).await.unwrap();
    assert!(h.queue.take().is_empty());

    let recovered = h.dispatcher.recover_due(Utc::now(), 100).await.unwrap();
    assert_eq!(recovered, 1);
    let (task, delay) = h.queue.take_one();
    assert_eq!(delay, Duration::ZERO);
    assert_eq!(task.attempt, 0);
}

#[tokio::test]
async fn test_worker_pool_delivers_through_in_memory_queue() {
    let (pool, _dir) = common::test_pool().await;
    let providers = ProviderRegistry::new().with_provider(Arc::new(EmailProvider::new(EmailConfig {
        mock_mode: true,
        ..Default::default()
    })));
    let publisher = BroadcastPublisher::default();
    let mut events = publisher.subscribe();

    let (container, receiver) =
        ServiceContainer::in_memory(&EngineConfig::default(), pool, providers, publisher);
    let workers = WorkerPool::new(2, CancellationToken::new());
    workers.start(container.dispatcher.clone(), receiver);

    container
        .dispatcher
        .submit(&event("evt-17", "user.registered", &["EMAIL"]))
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.event_type == LifecycleEventType::Delivered {
                return event;
            }
        }
    })
    .await
    .expect("delivery did not complete");
    assert_eq!(delivered.notification_type, "user_registered");
    assert_eq!(delivered.channel, Channel::Email);

    workers.stop().await;
    assert!(workers.processed() >= 1);
    let stats = container.stats().await.unwrap();
    assert_eq!(stats.by_status.get("SUCCESS"), Some(&1));
}

#[tokio::test]
async fn test_unhandled_recipient_is_rejected() {
    let mut email = MockProvider::new();
    email.expect_channel().return_const(Channel::Email);
    email.expect_name().return_const("mock");
    email.expect_can_handle().returning(|_| false);
    email.expect_deliver().never();
    let mut h = harness(registry(email)).await;

    h.dispatcher.submit(&event("evt-18", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    assert_eq!(
        h.dispatcher.dispatch_at(task.clone(), Utc::now()).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Failed)
    );

    let record = h.deliveries.get(&task.delivery_id).await.unwrap();
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.error_code.as_deref(), Some("INVALID_RECIPIENT"));
    assert_eq!(h.drain_events()[0].event_type, LifecycleEventType::Failed);
}

#[tokio::test]
async fn test_digest_key_reaches_lifecycle_events() {
    let mut email = provider(Channel::Email);
    email
        .expect_deliver()
        .times(1)
        .returning(|_| DeliveryOutcome::delivered(Some("msg-3".into())));
    let mut h = harness(registry(email)).await;

    let mut evt = event("evt-19", "order.shipped", &["EMAIL"]);
    evt.digest_key = Some("orders-daily".into());
    h.dispatcher.submit(&evt).await.unwrap();
    let (task, _) = h.queue.take_one();
    h.dispatcher.dispatch_at(task, Utc::now()).await.unwrap();

    let stored = h.notifications.list_for_user("user-1", 10).await.unwrap();
    assert_eq!(stored[0].digest_key.as_deref(), Some("orders-daily"));

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].digest_key.as_deref(), Some("orders-daily"));
    let payload = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(payload["digest_key"], "orders-daily");
}

/// Email provider that cancels the notification while its own call is in flight.
struct CancelledInFlight {
    dispatcher: Arc<OnceLock<Arc<Dispatcher>>>,
    outcome: fn() -> DeliveryOutcome,
    calls: AtomicU32,
}

#[async_trait]
impl DeliveryProvider for CancelledInFlight {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &'static str {
        "cancelled-in-flight"
    }

    fn can_handle(&self, _notification: &Notification) -> bool {
        true
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let dispatcher = self.dispatcher.get().expect("dispatcher not wired");
        let cancelled = dispatcher.cancel(&notification.id, "order voided").await.unwrap();
        assert_eq!(cancelled, 0, "in-flight record is left to the worker");
        (self.outcome)()
    }

    async fn check_status(&self, record: &DeliveryRecord) -> DeliveryOutcome {
        DeliveryOutcome::delivered(record.external_id.clone())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn rate_limit(&self) -> u32 {
        600
    }
}

async fn cancelled_in_flight(
    outcome: fn() -> DeliveryOutcome,
) -> (common::Harness, Arc<CancelledInFlight>) {
    let slot = Arc::new(OnceLock::new());
    let provider = Arc::new(CancelledInFlight {
        dispatcher: slot.clone(),
        outcome,
        calls: AtomicU32::new(0),
    });
    let h = harness(ProviderRegistry::new().with_provider(provider.clone())).await;
    assert!(slot.set(h.dispatcher.clone()).is_ok());
    (h, provider)
}

#[tokio::test]
async fn test_cancel_during_call_stops_retry() {
    let (mut h, provider) = cancelled_in_flight(timeout_failure).await;

    h.dispatcher.submit(&event("evt-20", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    assert_eq!(
        h.dispatcher.dispatch_at(task.clone(), Utc::now()).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Cancelled)
    );
    assert!(h.queue.take().is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let record = h.deliveries.get(&task.delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Cancelled);
    assert_eq!(record.error_message.as_deref(), Some("order voided"));

    let events = h.drain_events();
    let cancelled = events
        .iter()
        .filter(|e| e.event_type == LifecycleEventType::Cancelled)
        .count();
    assert_eq!(cancelled, 1);
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_cancel_during_call_keeps_completed_delivery() {
    let (mut h, _provider) =
        cancelled_in_flight(|| DeliveryOutcome::delivered(Some("msg-4".into()))).await;

    h.dispatcher.submit(&event("evt-21", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    assert_eq!(
        h.dispatcher.dispatch_at(task, Utc::now()).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Success)
    );
    assert!(h.queue.take().is_empty());

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, LifecycleEventType::Delivered);
}

#[tokio::test]
async fn test_duplicate_task_after_retry_is_stale() {
    let mut email = provider(Channel::Email);
    email.expect_deliver().times(1).returning(|_| timeout_failure());
    let h = harness(registry(email)).await;

    h.dispatcher.submit(&event("evt-22", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    let now = Utc::now();

    let outcome = h.dispatcher.dispatch_at(task.clone(), now).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Requeued {
            reason: RequeueReason::Retry,
            ..
        }
    ));
    let (retry, _) = h.queue.take_one();
    assert_eq!(retry.attempt, 1);

    // The broker hands back the attempt-0 task after the retry was scheduled.
    assert_eq!(
        h.dispatcher.dispatch_at(task, now).await.unwrap(),
        DispatchOutcome::Dropped(DropReason::Stale)
    );
    assert!(h.queue.take().is_empty());
    assert_eq!(h.metrics.counter(names::STALE_TASKS, &[("reason", "stale")]), 1);
}

#[tokio::test]
async fn test_in_flight_attempt_holds_lease() {
    let mut email = provider(Channel::Email);
    email.expect_deliver().never();
    let h = harness(registry(email)).await;

    h.dispatcher.submit(&event("evt-23", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    let now = Utc::now();

    // Another worker claimed the record and is still calling the provider.
    let mut record = h.deliveries.get(&task.delivery_id).await.unwrap();
    record.start_attempt("mock", now).unwrap();
    h.deliveries.compare_and_swap(&record).await.unwrap();

    let outcome = h
        .dispatcher
        .dispatch_at(task.for_attempt(1), now + chrono::Duration::seconds(1))
        .await
        .unwrap();
    let DispatchOutcome::Requeued { delay, reason } = outcome else {
        panic!("expected a requeue, got {outcome:?}");
    };
    assert_eq!(reason, RequeueReason::LeaseHeld);
    assert!(delay > Duration::ZERO);

    let (requeued, _) = h.queue.take_one();
    assert_eq!(requeued.attempt, 1);
    let record = h.deliveries.get(&requeued.delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::InProgress);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatch_calls_provider_once() {
    let mut email = provider(Channel::Email);
    email
        .expect_deliver()
        .times(1)
        .returning(|_| DeliveryOutcome::delivered(Some("msg-5".into())));
    let h = harness(registry(email)).await;

    h.dispatcher.submit(&event("evt-24", "order.placed", &["EMAIL"])).await.unwrap();
    let (task, _) = h.queue.take_one();
    let now = Utc::now();

    let first = tokio::spawn({
        let dispatcher = h.dispatcher.clone();
        let task = task.clone();
        async move { dispatcher.dispatch_at(task, now).await }
    });
    let second = tokio::spawn({
        let dispatcher = h.dispatcher.clone();
        let task = task.clone();
        async move { dispatcher.dispatch_at(task, now).await }
    });
    let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

    let succeeded = outcomes
        .iter()
        .filter(|o| **o == DispatchOutcome::Terminal(DeliveryStatus::Success))
        .count();
    assert_eq!(succeeded, 1, "outcomes: {outcomes:?}");
    for outcome in &outcomes {
        assert!(
            matches!(
                outcome,
                DispatchOutcome::Terminal(DeliveryStatus::Success)
                    | DispatchOutcome::Dropped(_)
                    | DispatchOutcome::Requeued {
                        reason: RequeueReason::LeaseHeld,
                        ..
                    }
            ),
            "unexpected outcome {outcome:?}"
        );
    }

    let record = h.deliveries.get(&task.delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn test_unconfirmed_submission_fails_after_poll_limit() {
    let mut sms = provider(Channel::Sms);
    sms.expect_deliver()
        .times(1)
        .returning(|_| DeliveryOutcome::pending(Some("ext-2".into())));
    sms.expect_check_status()
        .times(3)
        .returning(|record| DeliveryOutcome::pending(record.external_id.clone()));
    let retry = RetryConfig {
        max_status_polls: 2,
        ..Default::default()
    };
    let mut h = harness_with(registry(sms), retry).await;

    h.dispatcher.submit(&event("evt-25", "order.shipped", &["SMS"])).await.unwrap();
    let (mut task, _) = h.queue.take_one();
    let mut now = Utc::now();

    let mut outcome = h.dispatcher.dispatch_at(task, now).await.unwrap();
    for _ in 0..2 {
        assert!(matches!(
            outcome,
            DispatchOutcome::Requeued {
                reason: RequeueReason::AwaitingConfirmation,
                ..
            }
        ));
        let (next, delay) = h.queue.take_one();
        task = next;
        now += chrono::Duration::from_std(delay).unwrap();
        outcome = h.dispatcher.dispatch_at(task.clone(), now).await.unwrap();
    }
    let (task, delay) = h.queue.take_one();
    assert_eq!(task.polls, 2);
    now += chrono::Duration::from_std(delay).unwrap();

    assert_eq!(
        h.dispatcher.dispatch_at(task.clone(), now).await.unwrap(),
        DispatchOutcome::Terminal(DeliveryStatus::Failed)
    );
    assert!(h.queue.take().is_empty());

    let record = h.deliveries.get(&task.delivery_id).await.unwrap();
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.error_code.as_deref(), Some("TIMEOUT:CONFIRMATION"));
    assert!(record.sent_at.is_some());
    assert!(record.next_attempt_at.is_none());

    let types: Vec<_> = h.drain_events().into_iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![LifecycleEventType::Sent, LifecycleEventType::Failed]);
}
