//! Exchange and queue layout.
//!
//! ```text
//! domain.events (topic) --order.#--> notification.inbound.order --dlx--> notification.dlq.order
//! notification.work (direct) -----> notification.dispatch
//! notification.retry.wait.<ms> --ttl--> notification.work
//! notification.events (topic) <-- notification.event.<type>.<channel>
//! ```

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

use super::BrokerConfig;

/// Wait queues are rounded up to this granularity so delays share queues.
pub const WAIT_QUEUE_GRANULARITY_MS: u64 = 1_000;

/// Dead-letter routing key of the dispatch queue.
pub const DISPATCH_DEAD_LETTER_KEY: &str = "dispatch";

pub fn inbound_queue(domain: &str) -> String {
    format!("notification.inbound.{}", domain)
}

pub fn inbound_binding(domain: &str) -> String {
    format!("{}.#", domain)
}

pub fn dead_letter_queue(domain: &str) -> String {
    format!("notification.dlq.{}", domain)
}

/// Delay rounded up to the wait queue granularity, in milliseconds.
pub fn quantize_delay_ms(delay_ms: u64) -> u64 {
    delay_ms.div_ceil(WAIT_QUEUE_GRANULARITY_MS) * WAIT_QUEUE_GRANULARITY_MS
}

pub fn wait_queue(prefix: &str, delay_ms: u64) -> String {
    format!("{}.{}", prefix, delay_ms)
}

/// Routing key for a lifecycle event on the outbound exchange.
pub fn lifecycle_routing_key(event_routing_key: &str) -> String {
    format!("notification.{}", event_routing_key)
}

fn put_str(args: &mut FieldTable, key: &str, value: &str) {
    args.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

fn put_int(args: &mut FieldTable, key: &str, value: i64) {
    args.insert(ShortString::from(key), AMQPValue::LongLongInt(value));
}

/// Arguments for a per-domain inbound quorum queue.
pub fn inbound_queue_args(config: &BrokerConfig, domain: &str) -> FieldTable {
    let mut args = FieldTable::default();
    put_str(&mut args, "x-queue-type", "quorum");
    put_int(&mut args, "x-message-ttl", config.message_ttl_ms as i64);
    put_int(&mut args, "x-delivery-limit", i64::from(config.delivery_limit));
    put_str(&mut args, "x-dead-letter-exchange", &config.dead_letter_exchange);
    put_str(&mut args, "x-dead-letter-routing-key", domain);
    args
}

/// Arguments for the dispatch work queue.
pub fn dispatch_queue_args(config: &BrokerConfig) -> FieldTable {
    let mut args = FieldTable::default();
    put_str(&mut args, "x-queue-type", "quorum");
    put_int(&mut args, "x-delivery-limit", i64::from(config.delivery_limit));
    put_str(&mut args, "x-dead-letter-exchange", &config.dead_letter_exchange);
    put_str(&mut args, "x-dead-letter-routing-key", DISPATCH_DEAD_LETTER_KEY);
    args
}

/// Arguments for a delay queue: messages expire into the work exchange.
pub fn wait_queue_args(config: &BrokerConfig, delay_ms: u64) -> FieldTable {
    let mut args = FieldTable::default();
    put_int(&mut args, "x-message-ttl", delay_ms as i64);
    put_str(&mut args, "x-dead-letter-exchange", &config.work_exchange);
    put_str(&mut args, "x-dead-letter-routing-key", &config.dispatch_queue);
    args
}
