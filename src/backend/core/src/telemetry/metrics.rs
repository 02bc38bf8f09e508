//! Prometheus metrics for the event consumers.
//!
//! - Per-consumer counters for processed, duplicate and dead-lettered events
//! - Handling duration histograms
//! - Reminder lifecycle counters
//! - Bus publish and retry counters
//! - Live-sync viewer gauge
//!
//! # Example
//!
//! ```rust,no_run
//! use taskflow_core::telemetry::metrics::ConsumerMetrics;
//!
//! ConsumerMetrics::processed("audit-log", "applied");
//! ConsumerMetrics::handling_duration("audit-log", 0.004);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Handling latencies in seconds. Store round trips dominate, so the
/// buckets are dense below 100ms.
const HANDLING_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Serve scrapes from a dedicated listener instead of the API's
    /// `/metrics` route.
    pub listen_addr: Option<SocketAddr>,
    pub buckets: Vec<f64>,
    /// Extra labels stamped on every series, next to `service`.
    pub labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
            buckets: HANDLING_BUCKETS.to_vec(),
            labels: BTreeMap::new(),
        }
    }
}

/// Render handle for the installed recorder. Empty when metrics are off or
/// served by a dedicated listener.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetricsRegistry(enabled={})", self.is_enabled())
    }
}

impl MetricsRegistry {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// Prometheus text exposition, or an empty string.
    pub fn render(&self) -> String {
        self.handle.as_ref().map(PrometheusHandle::render).unwrap_or_default()
    }
}

/// Install the global Prometheus recorder. Fails on invalid buckets or when a
/// recorder is already installed. A dedicated listener needs the Tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let builder = config
        .labels
        .iter()
        .fold(PrometheusBuilder::new().add_global_label("service", service_name), |b, (k, v)| {
            b.add_global_label(k, v)
        })
        .set_buckets(&config.buckets)?;

    let handle = match config.listen_addr {
        Some(addr) => {
            builder.with_http_listener(addr).install()?;
            None
        }
        None => Some(builder.install_recorder()?),
    };
    register_metric_descriptions();

    tracing::info!(service = service_name, listen_addr = ?config.listen_addr, "Prometheus recorder installed");
    Ok(MetricsRegistry { handle })
}

fn register_metric_descriptions() {
    describe_counter!(
        "taskflow_events_processed_total",
        "Events handled by a consumer, by outcome"
    );
    describe_counter!(
        "taskflow_events_duplicate_total",
        "Redelivered events skipped by the idempotency ledger"
    );
    describe_counter!(
        "taskflow_events_dead_lettered_total",
        "Events routed to the dead-letter topic, by error code"
    );
    describe_counter!(
        "taskflow_handler_retries_total",
        "Transient handler failures retried with backoff"
    );
    describe_histogram!(
        "taskflow_event_handling_seconds",
        "Time spent handling one delivery"
    );

    describe_counter!("taskflow_reminders_scheduled_total", "Pending reminders created");
    describe_counter!("taskflow_reminders_cancelled_total", "Pending reminders cancelled");
    describe_counter!("taskflow_reminders_fired_total", "Reminders transitioned to Fired");
    describe_counter!(
        "taskflow_reminders_conflicts_total",
        "Fire attempts lost to another scheduler instance"
    );

    describe_counter!("taskflow_recurrences_emitted_total", "Next occurrences emitted");

    describe_counter!("taskflow_bus_published_total", "Records accepted by the bus");
    describe_counter!("taskflow_bus_publish_retries_total", "Publish attempts retried");

    describe_gauge!("taskflow_live_viewers", "Connected live-sync viewers");
    describe_counter!(
        "taskflow_live_updates_dropped_total",
        "Updates skipped by lagging viewers"
    );

    describe_counter!("taskflow_errors_total", "Errors by code");
}

/// Consumer-runtime metrics.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    pub fn processed(consumer: &str, outcome: &'static str) {
        counter!(
            "taskflow_events_processed_total",
            "consumer" => consumer.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn duplicate(consumer: &str) {
        counter!("taskflow_events_duplicate_total", "consumer" => consumer.to_string()).increment(1);
    }

    pub fn dead_lettered(consumer: &str, code: &str) {
        counter!(
            "taskflow_events_dead_lettered_total",
            "consumer" => consumer.to_string(),
            "code" => code.to_string(),
        )
        .increment(1);
    }

    pub fn retried(consumer: &str) {
        counter!("taskflow_handler_retries_total", "consumer" => consumer.to_string()).increment(1);
    }

    pub fn handling_duration(consumer: &str, seconds: f64) {
        histogram!("taskflow_event_handling_seconds", "consumer" => consumer.to_string()).record(seconds);
    }
}

/// Reminder lifecycle metrics.
pub struct ReminderMetrics;

impl ReminderMetrics {
    pub fn scheduled() {
        counter!("taskflow_reminders_scheduled_total").increment(1);
    }

    pub fn cancelled() {
        counter!("taskflow_reminders_cancelled_total").increment(1);
    }

    pub fn fired() {
        counter!("taskflow_reminders_fired_total").increment(1);
    }

    pub fn conflict() {
        counter!("taskflow_reminders_conflicts_total").increment(1);
    }
}

/// Bus client metrics.
pub struct BusMetrics;

impl BusMetrics {
    pub fn published(topic: &str) {
        counter!("taskflow_bus_published_total", "topic" => topic.to_string()).increment(1);
    }

    pub fn publish_retry(topic: &str) {
        counter!("taskflow_bus_publish_retries_total", "topic" => topic.to_string()).increment(1);
    }
}

/// Recurrence and live-sync metrics.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    pub fn recurrence_emitted() {
        counter!("taskflow_recurrences_emitted_total").increment(1);
    }

    pub fn set_live_viewers(count: usize) {
        gauge!("taskflow_live_viewers").set(count as f64);
    }

    pub fn live_updates_dropped(count: u64) {
        counter!("taskflow_live_updates_dropped_total").increment(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = MetricsRegistry::disabled();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        ConsumerMetrics::processed("test", "applied");
        ReminderMetrics::fired();
        BusMetrics::publish_retry("task-events");
        LifecycleMetrics::set_live_viewers(3);
    }

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.listen_addr.is_none());
        assert_eq!(config.buckets.first(), Some(&0.001));
    }
}
