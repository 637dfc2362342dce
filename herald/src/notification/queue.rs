//! Work queue and lifecycle publishing seams.
//!
//! The dispatcher only sees the [`RetryQueue`] and [`LifecyclePublisher`]
//! traits. The AMQP broker implements both for production; the in-process
//! implementations here back the single-node mode and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::notification::events::LifecycleEvent;
use crate::{Error, Result};

/// Unit of work on the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub notification_id: String,
    pub delivery_id: String,
    /// Attempt number the task was issued for.
    pub attempt: u32,
    /// Status polls already spent on the current attempt.
    #[serde(default)]
    pub polls: u32,
}

impl DispatchTask {
    pub fn new(notification_id: impl Into<String>, delivery_id: impl Into<String>) -> Self {
        Self {
            notification_id: notification_id.into(),
            delivery_id: delivery_id.into(),
            attempt: 0,
            polls: 0,
        }
    }

    pub fn for_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self.polls = 0;
        self
    }

    pub fn next_poll(mut self) -> Self {
        self.polls += 1;
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Delayed re-enqueue of dispatch tasks.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Make `task` visible to workers after `delay`.
    async fn enqueue(&self, task: DispatchTask, delay: Duration) -> Result<()>;
}

/// Outbound lifecycle events.
#[async_trait]
pub trait LifecyclePublisher: Send + Sync {
    async fn publish(&self, event: &LifecycleEvent) -> Result<()>;
}

/// In-process dispatch queue.
///
/// Delayed tasks are held by a sleeping tokio task each and handed to the
/// channel once the delay elapses, so consumers never poll.
#[derive(Clone)]
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<DispatchTask>,
}

impl InMemoryQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RetryQueue for InMemoryQueue {
    async fn enqueue(&self, task: DispatchTask, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self
                .tx
                .send(task)
                .map_err(|_| Error::Other("Dispatch queue closed".to_string()));
        }

        trace!(delivery_id = %task.delivery_id, delay_ms = delay.as_millis() as u64, "Holding task");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task).is_err() {
                debug!("Dispatch queue closed before delayed task became visible");
            }
        });
        Ok(())
    }
}

/// In-process lifecycle publisher backed by a broadcast channel.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl LifecyclePublisher for BroadcastPublisher {
    async fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
