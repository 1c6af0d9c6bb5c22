//! Metric sink: a fire-and-forget interface taking `(metric_name, value, labels)`.
//!
//! Deliberately narrower than a typed `tower::Service<Event>` telemetry
//! sink: this crate's metric contract has no typed event enum, no
//! readiness polling, and no backpressure — components simply record a
//! value and move on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One recorded metric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

fn is_valid_metric_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Fire-and-forget metric sink. Implementors must never block or panic;
/// recording a metric is best-effort by contract.
pub trait MetricSink: Send + Sync {
    fn record(&self, metric_name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Validates the metric name and drops invalid names with a single log
/// event, then delegates to `sink.record`. Every [`MetricSink`] caller should
/// go through this helper rather than calling `record` directly.
pub fn emit(sink: &dyn MetricSink, metric_name: &str, value: f64, labels: &[(&str, &str)]) {
    if !is_valid_metric_name(metric_name) {
        tracing::warn!(metric_name, "dropping metric with invalid name");
        return;
    }
    sink.record(metric_name, value, labels);
}

/// Discards all metrics.
#[derive(Debug, Default, Clone)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn record(&self, _metric_name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Logs every metric via `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn record(&self, metric_name: &str, value: f64, labels: &[(&str, &str)]) {
        let labels: HashMap<_, _> = labels.iter().cloned().collect();
        tracing::info!(metric = metric_name, value, ?labels, "metric");
    }
}

/// Stores observations in a bounded in-memory ring buffer; oldest events are
/// evicted once `capacity` is exceeded. Useful for tests and for small
/// deployments that scrape in-process state instead of exporting.
#[derive(Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl MetricSink for MemorySink {
    fn record(&self, metric_name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(MetricEvent {
            name: metric_name.to_string(),
            value,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
    }
}
