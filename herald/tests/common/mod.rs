//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;

use herald::Result;
use herald::database::repositories::{
    SqlxDeliveryRepository, SqlxNotificationRepository, SqlxPreferenceRepository,
};
use herald::database::{DbPool, init_pool, run_migrations};
use herald::metrics::MetricsCollector;
use herald::notification::{
    BroadcastPublisher, DispatchTask, Dispatcher, DispatcherConfig, DispatcherParts, DomainEvent,
    LifecycleEvent, PreferenceCache, PreferenceGate, PreferenceService, ProviderRegistry,
    RetryConfig, RetryQueue,
};

/// Queue that records every enqueue instead of delivering it.
#[derive(Default)]
pub struct RecordingQueue {
    items: Mutex<Vec<(DispatchTask, Duration)>>,
}

impl RecordingQueue {
    pub fn take(&self) -> Vec<(DispatchTask, Duration)> {
        std::mem::take(&mut *self.items.lock())
    }

    /// The single task enqueued since the last take.
    pub fn take_one(&self) -> (DispatchTask, Duration) {
        let mut items = self.take();
        assert_eq!(items.len(), 1, "expected exactly one enqueued task");
        items.remove(0)
    }
}

#[async_trait]
impl RetryQueue for RecordingQueue {
    async fn enqueue(&self, task: DispatchTask, delay: Duration) -> Result<()> {
        self.items.lock().push((task, delay));
        Ok(())
    }
}

pub struct Harness {
    pub pool: DbPool,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<RecordingQueue>,
    pub events: broadcast::Receiver<LifecycleEvent>,
    pub preferences: Arc<PreferenceService>,
    pub gate: Arc<PreferenceGate>,
    pub deliveries: Arc<SqlxDeliveryRepository>,
    pub notifications: Arc<SqlxNotificationRepository>,
    pub metrics: Arc<MetricsCollector>,
    _dir: TempDir,
}

impl Harness {
    /// Lifecycle events published so far.
    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// File-backed database with migrations applied.
pub async fn test_pool() -> (DbPool, TempDir) {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("herald.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool(&db_url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (pool, dir)
}

pub async fn harness(providers: ProviderRegistry) -> Harness {
    harness_with(providers, RetryConfig::default()).await
}

pub async fn harness_with(providers: ProviderRegistry, retry: RetryConfig) -> Harness {
    let (pool, dir) = test_pool().await;

    let notifications = Arc::new(SqlxNotificationRepository::new(pool.clone()));
    let deliveries = Arc::new(SqlxDeliveryRepository::new(pool.clone()));
    let preference_repo = Arc::new(SqlxPreferenceRepository::new(pool.clone()));
    let preferences = Arc::new(PreferenceService::new(preference_repo, PreferenceCache::new()));
    let gate = Arc::new(PreferenceGate::new(preferences.clone(), deliveries.clone()));

    let queue = Arc::new(RecordingQueue::default());
    let publisher = BroadcastPublisher::default();
    let events = publisher.subscribe();
    let metrics = Arc::new(MetricsCollector::new());

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherParts {
            notifications: notifications.clone(),
            deliveries: deliveries.clone(),
            gate: gate.clone(),
            providers,
            queue: queue.clone(),
            publisher: Arc::new(publisher),
            metrics: metrics.clone(),
        },
        retry,
        DispatcherConfig::default(),
    ));

    Harness {
        pool,
        dispatcher,
        queue,
        events,
        preferences,
        gate,
        deliveries,
        notifications,
        metrics,
        _dir: dir,
    }
}

/// Inbound event for `user-1` with every recipient address filled in.
pub fn event(event_id: &str, event_type: &str, channels: &[&str]) -> DomainEvent {
    serde_json::from_value(serde_json::json!({
        "event_id": event_id,
        "event_type": event_type,
        "correlation_id": format!("corr-{event_id}"),
        "occurred_at": Utc::now(),
        "user_id": "user-1",
        "recipient": {
            "email": "jane@example.com",
            "phone": "+14155552671",
            "device_token": "device-token-1"
        },
        "channels": channels,
        "data": {"subject": "Your order", "body": "It is on its way"}
    }))
    .unwrap()
}
