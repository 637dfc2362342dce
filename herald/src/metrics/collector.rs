//! Metrics collector implementation.
//!
//! Counters are keyed by metric name plus sorted labels, e.g.
//! `delivery_outcomes_total{channel=EMAIL,status=SUCCESS}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::MetricsSink;

#[derive(Debug, Default)]
struct DurationStat {
    total_ms: AtomicU64,
    count: AtomicU64,
}

/// In-memory metrics collector.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<String, AtomicU64>,
    durations: DashMap<String, DurationStat>,

    // Labels applied to every snapshot
    labels: RwLock<HashMap<String, String>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom label reported with every snapshot.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.write().insert(key.into(), value.into());
    }

    /// Current value of one counter.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of a counter across all label combinations.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| metric_name(e.key()) == name)
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();

        let duration_avg_ms = self
            .durations
            .iter()
            .map(|e| {
                let count = e.value().count.load(Ordering::Relaxed);
                let total = e.value().total_ms.load(Ordering::Relaxed);
                let avg = if count > 0 {
                    total as f64 / count as f64
                } else {
                    0.0
                };
                (e.key().clone(), avg)
            })
            .collect();

        MetricsSnapshot {
            counters,
            duration_avg_ms,
            labels: self.labels.read().clone(),
        }
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.durations.clear();
    }
}

impl MetricsSink for MetricsCollector {
    fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.counters
            .entry(series_key(name, labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, name: &str, labels: &[(&str, &str)], duration: Duration) {
        let stat = self.durations.entry(series_key(name, labels)).or_default();
        stat.total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        stat.count.fetch_add(1, Ordering::Relaxed);
    }
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}{{{}}}", name, joined)
}

fn metric_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub duration_avg_ms: HashMap<String, f64>,
    pub labels: HashMap<String, String>,
}
