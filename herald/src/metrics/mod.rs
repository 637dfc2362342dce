//! Metrics.
//!
//! Delivery code records through the [`MetricsSink`] trait; the engine wires in
//! a [`MetricsCollector`], which keeps counters in memory and exposes a
//! [`MetricsSnapshot`] for reporting.
//!
//! # Example
//!
//! ```ignore
//! use herald::metrics::{MetricsCollector, MetricsSink};
//!
//! let collector = MetricsCollector::new();
//! collector.increment("deliveries_total", &[("channel", "EMAIL"), ("status", "SUCCESS")]);
//! let snapshot = collector.snapshot();
//! ```

mod collector;

pub use collector::{MetricsCollector, MetricsSnapshot};

use std::time::Duration;

/// Counter names recorded by the engine.
pub mod names {
    pub const EVENTS_INGESTED: &str = "events_ingested_total";
    pub const EVENTS_REJECTED: &str = "events_rejected_total";
    pub const ATTEMPTS: &str = "delivery_attempts_total";
    pub const OUTCOMES: &str = "delivery_outcomes_total";
    pub const RETRIES_SCHEDULED: &str = "retries_scheduled_total";
    pub const GATE_DENIED: &str = "gate_denied_total";
    pub const RATE_LIMITED: &str = "rate_limited_total";
    pub const PROVIDER_UNAVAILABLE: &str = "provider_unavailable_total";
    pub const STALE_TASKS: &str = "stale_tasks_total";
    pub const LIFECYCLE_PUBLISHED: &str = "lifecycle_events_total";
    pub const PROVIDER_LATENCY: &str = "provider_latency";
}

/// Destination for engine metrics.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, labels: &[(&str, &str)]);

    fn record_duration(&self, name: &str, labels: &[(&str, &str)], duration: Duration);
}
