//! Logging and Prometheus metrics for the engine process.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    init_metrics, BusMetrics, ConsumerMetrics, LifecycleMetrics, MetricsConfig, MetricsRegistry,
    ReminderMetrics,
};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Added as the `service` label on every metric.
    pub service_name: String,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "taskflow-engine".to_string(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Install the subscriber and the Prometheus recorder. Must run inside the
/// Tokio runtime and only once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    init_logging(&config.logging)?;
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    ::tracing::debug!(
        service = %config.service_name,
        format = ?config.logging.format,
        metrics_enabled = config.metrics.enabled,
        "Telemetry ready"
    );
    Ok(TelemetryHandle { metrics })
}

#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::debug!(metrics_enabled = self.metrics.is_enabled(), "Telemetry stopped");
    }
}
