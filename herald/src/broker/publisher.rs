//! Confirmed publishing of lifecycle events and dispatch tasks.

use async_trait::async_trait;
use dashmap::DashSet;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::{BasicProperties, Channel};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{BrokerConfig, topology};
use crate::notification::events::LifecycleEvent;
use crate::notification::queue::{DispatchTask, LifecyclePublisher, RetryQueue};
use crate::{Error, Result};

const PERSISTENT: u8 = 2;

fn json_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT)
}

/// Publish and wait for the broker's confirm.
async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            json_properties(),
        )
        .await?
        .await?;

    if confirm.is_nack() {
        return Err(Error::Other(format!(
            "Broker refused message for {}/{}",
            exchange, routing_key
        )));
    }
    Ok(())
}

/// Lifecycle events on the `notification.events` topic exchange.
#[derive(Clone)]
pub struct AmqpLifecyclePublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpLifecyclePublisher {
    pub fn new(channel: Channel, exchange: String) -> Self {
        Self { channel, exchange }
    }
}

#[async_trait]
impl LifecyclePublisher for AmqpLifecyclePublisher {
    async fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        let routing_key = topology::lifecycle_routing_key(&event.routing_key());
        let payload = serde_json::to_vec(event)?;
        publish_confirmed(&self.channel, &self.exchange, &routing_key, &payload).await?;
        debug!(routing_key = %routing_key, notification_id = %event.notification_id, "Lifecycle event published");
        Ok(())
    }
}

/// Dispatch tasks, immediately or through a TTL wait queue.
#[derive(Clone)]
pub struct AmqpRetryQueue {
    channel: Channel,
    config: BrokerConfig,
    declared: Arc<DashSet<u64>>,
}

impl AmqpRetryQueue {
    pub fn new(channel: Channel, config: BrokerConfig) -> Self {
        Self {
            channel,
            config,
            declared: Arc::new(DashSet::new()),
        }
    }

    async fn ensure_wait_queue(&self, delay_ms: u64) -> Result<String> {
        let name = topology::wait_queue(&self.config.retry_wait_prefix, delay_ms);
        if !self.declared.contains(&delay_ms) {
            self.channel
                .queue_declare(
                    name.as_str(),
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    topology::wait_queue_args(&self.config, delay_ms),
                )
                .await?;
            self.declared.insert(delay_ms);
            debug!(queue = %name, "Wait queue declared");
        }
        Ok(name)
    }
}

#[async_trait]
impl RetryQueue for AmqpRetryQueue {
    async fn enqueue(&self, task: DispatchTask, delay: Duration) -> Result<()> {
        let payload = task.to_json()?;
        let delay_ms = topology::quantize_delay_ms(delay.as_millis() as u64);

        if delay_ms == 0 {
            return publish_confirmed(
                &self.channel,
                &self.config.work_exchange,
                &self.config.dispatch_queue,
                &payload,
            )
            .await;
        }

        let queue = self.ensure_wait_queue(delay_ms).await?;
        // Default exchange routes by queue name.
        publish_confirmed(&self.channel, "", &queue, &payload).await
    }
}
