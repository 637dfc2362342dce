//! Inbound and dispatch consumers.
//!
//! Acknowledgement is manual: a message is acked only after the resulting
//! delivery record state is persisted. Malformed payloads are rejected
//! without requeue so the broker dead-letters them; processing errors are
//! requeued until the queue's delivery limit dead-letters them.

use futures::StreamExt;
use lapin::Channel;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::names;
use crate::notification::dispatcher::Dispatcher;
use crate::notification::events::DomainEvent;
use crate::notification::queue::DispatchTask;
use crate::{Error, Result};

/// What to tell the broker about a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    /// Dead-letter without redelivery.
    Reject,
    /// Redeliver later.
    Requeue,
}

/// Process one inbound domain event payload.
pub async fn handle_inbound(dispatcher: &Dispatcher, payload: &[u8]) -> AckAction {
    let event = match DomainEvent::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, bytes = payload.len(), alert = true, "Malformed domain event, dead-lettering");
            dispatcher
                .metrics()
                .increment(names::EVENTS_REJECTED, &[("reason", "malformed")]);
            return AckAction::Reject;
        }
    };

    match dispatcher.submit(&event).await {
        Ok(_) => AckAction::Ack,
        Err(e @ Error::Validation(_)) => {
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                alert = true,
                "Unprocessable domain event, dead-lettering"
            );
            dispatcher
                .metrics()
                .increment(names::EVENTS_REJECTED, &[("reason", "unroutable")]);
            AckAction::Reject
        }
        Err(e) => {
            warn!(event_id = %event.event_id, error = %e, "Event processing failed, requeueing");
            AckAction::Requeue
        }
    }
}

/// Process one dispatch task payload.
pub async fn handle_dispatch(dispatcher: &Dispatcher, payload: &[u8]) -> AckAction {
    let task = match DispatchTask::from_slice(payload) {
        Ok(task) => task,
        Err(e) => {
            error!(error = %e, alert = true, "Malformed dispatch task, dead-lettering");
            return AckAction::Reject;
        }
    };

    match dispatcher.dispatch(task.clone()).await {
        Ok(outcome) => {
            debug!(delivery_id = %task.delivery_id, ?outcome, "Task processed");
            AckAction::Ack
        }
        Err(e) => {
            warn!(delivery_id = %task.delivery_id, error = %e, "Dispatch failed, requeueing");
            AckAction::Requeue
        }
    }
}

/// Consume `queue` until cancelled, acknowledging per the handler's verdict.
pub async fn run_consumer<F, Fut>(
    channel: Channel,
    queue: String,
    consumer_tag: String,
    token: CancellationToken,
    handler: F,
) -> Result<()>
where
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = AckAction>,
{
    let mut consumer = channel
        .basic_consume(
            queue.as_str(),
            consumer_tag.as_str(),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    info!(queue = %queue, consumer = %consumer_tag, "Consumer started");

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "Consumer stream failed");
                    return Err(e.into());
                }
                None => break,
            },
        };

        let action = handler(delivery.data.clone()).await;
        match action {
            AckAction::Ack => {
                delivery.acker.ack(BasicAckOptions::default()).await?;
            }
            AckAction::Reject => {
                delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await?;
            }
            AckAction::Requeue => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await?;
            }
        }
    }

    info!(queue = %queue, "Consumer stopped");
    Ok(())
}
