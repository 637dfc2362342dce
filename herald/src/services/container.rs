//! Service container.
//!
//! Builds repositories, the preference layer, providers and the dispatcher
//! from an [`EngineConfig`], and owns the background tasks started from them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::broker::{self, Broker, topology};
use crate::config::{EngineConfig, ProvidersConfig};
use crate::database::repositories::{
    SqlxDeliveryRepository, SqlxNotificationRepository, SqlxPreferenceRepository,
};
use crate::metrics::MetricsCollector;
use crate::notification::{
    BroadcastPublisher, DeliveryStats, DispatchTask, Dispatcher, DispatcherParts, EmailProvider,
    InMemoryQueue, LifecyclePublisher, PreferenceCache, PreferenceGate, PreferenceService,
    ProviderRegistry, PushProvider, RetryQueue, SmsProvider,
};

/// Interval between preference cache sweeps.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for consumers to finish their current message.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Build one provider per channel from configuration.
pub fn build_providers(config: &ProvidersConfig) -> ProviderRegistry {
    ProviderRegistry::new()
        .with_provider(Arc::new(EmailProvider::new(config.email.clone())))
        .with_provider(Arc::new(SmsProvider::new(config.sms.clone())))
        .with_provider(Arc::new(PushProvider::new(config.push.clone())))
}

/// Service container holding the engine's long-lived services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub preferences: Arc<PreferenceService>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<MetricsCollector>,
    broker: Option<Arc<Broker>>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Wire the engine against an AMQP broker.
    pub fn with_broker(config: &EngineConfig, pool: SqlitePool, broker: Broker) -> Self {
        let broker = Arc::new(broker);
        let queue: Arc<dyn RetryQueue> = Arc::new(broker.retry_queue());
        let publisher: Arc<dyn LifecyclePublisher> = Arc::new(broker.publisher());
        let providers = build_providers(&config.providers);
        Self::assemble(config, pool, providers, queue, publisher, Some(broker))
    }

    /// Wire the engine against in-process queues.
    ///
    /// Returns the receiver of due dispatch tasks for a [`WorkerPool`](crate::notification::WorkerPool).
    pub fn in_memory(
        config: &EngineConfig,
        pool: SqlitePool,
        providers: ProviderRegistry,
        publisher: BroadcastPublisher,
    ) -> (Self, mpsc::UnboundedReceiver<DispatchTask>) {
        let (queue, receiver) = InMemoryQueue::new();
        let container = Self::assemble(
            config,
            pool,
            providers,
            Arc::new(queue),
            Arc::new(publisher),
            None,
        );
        (container, receiver)
    }

    fn assemble(
        config: &EngineConfig,
        pool: SqlitePool,
        providers: ProviderRegistry,
        queue: Arc<dyn RetryQueue>,
        publisher: Arc<dyn LifecyclePublisher>,
        broker: Option<Arc<Broker>>,
    ) -> Self {
        info!("Initializing service container");

        let notifications = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let deliveries = Arc::new(SqlxDeliveryRepository::new(pool.clone()));
        let preference_repo = Arc::new(SqlxPreferenceRepository::new(pool.clone()));

        let cache = PreferenceCache::with_ttl(config.gate.preference_cache_ttl());
        let preferences = Arc::new(PreferenceService::new(preference_repo, cache));
        let gate = Arc::new(PreferenceGate::new(preferences.clone(), deliveries.clone()));

        let metrics = Arc::new(MetricsCollector::new());
        metrics.set_label("service", "herald");

        providers.log_availability();

        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherParts {
                notifications,
                deliveries,
                gate,
                providers,
                queue,
                publisher,
                metrics: metrics.clone(),
            },
            config.retry.clone(),
            config.dispatcher.clone(),
        ));

        info!("Service container initialized");

        Self {
            pool,
            preferences,
            dispatcher,
            metrics,
            broker,
            tasks: parking_lot::Mutex::new(JoinSet::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Re-enqueue records that are due, then start background tasks.
    ///
    /// With a broker this declares topology and starts one consumer per
    /// inbound domain queue plus `workers` dispatch consumers.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        if let Some(broker) = &self.broker {
            broker.declare_topology().await?;
            self.start_consumers(broker).await?;
        }

        let recovered = self
            .dispatcher
            .recover_due(Utc::now(), self.dispatcher.config().recovery_batch_size)
            .await?;
        if recovered > 0 {
            info!(recovered, "Re-enqueued due deliveries");
        }

        self.start_cache_sweeper();

        info!("Services initialized");
        Ok(())
    }

    async fn start_consumers(&self, broker: &Arc<Broker>) -> Result<()> {
        let config = broker.config().clone();

        for domain in &config.domains {
            let channel = broker.consumer_channel().await?;
            let dispatcher = self.dispatcher.clone();
            let queue = topology::inbound_queue(domain);
            let tag = format!("herald-inbound-{}", domain);
            let token = self.cancellation_token.clone();
            self.tasks.lock().spawn(async move {
                let result = broker::run_consumer(channel, queue.clone(), tag, token, move |payload| {
                    let dispatcher = dispatcher.clone();
                    async move { broker::handle_inbound(&dispatcher, &payload).await }
                })
                .await;
                if let Err(e) = result {
                    error!(queue = %queue, error = %e, alert = true, "Inbound consumer terminated");
                }
            });
        }

        for worker_id in 0..self.dispatcher.config().workers {
            let channel = broker.consumer_channel().await?;
            let dispatcher = self.dispatcher.clone();
            let queue = config.dispatch_queue.clone();
            let tag = format!("herald-dispatch-{}", worker_id);
            let token = self.cancellation_token.clone();
            self.tasks.lock().spawn(async move {
                let result = broker::run_consumer(channel, queue.clone(), tag, token, move |payload| {
                    let dispatcher = dispatcher.clone();
                    async move { broker::handle_dispatch(&dispatcher, &payload).await }
                })
                .await;
                if let Err(e) = result {
                    error!(queue = %queue, error = %e, alert = true, "Dispatch consumer terminated");
                }
            });
        }

        info!(
            inbound = config.domains.len(),
            dispatch = self.dispatcher.config().workers,
            "Consumers started"
        );
        Ok(())
    }

    fn start_cache_sweeper(&self) {
        let preferences = self.preferences.clone();
        let token = self.cancellation_token.clone();
        self.tasks.lock().spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Preference cache sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = preferences.cache().cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "Expired preference cache entries removed");
                        }
                    }
                }
            }
        });
    }

    /// Cancel background tasks, wait for them and close the broker.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(DEFAULT_SHUTDOWN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks did not stop in time, aborting");
            tasks.abort_all();
        }

        if let Some(broker) = &self.broker {
            broker.close().await?;
        }
        self.pool.close().await;
        info!("Shutdown complete");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn stats(&self) -> Result<DeliveryStats> {
        self.dispatcher.stats().await
    }
}
