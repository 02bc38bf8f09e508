//! `tracing` subscriber setup.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base filter directive, e.g. `info` or `warn,taskflow_core=debug`.
    pub level: String,
    pub format: LogFormat,
    /// Extra `target=level` directives layered over `level`.
    pub module_levels: BTreeMap<String, String>,
    /// Add source file and line to every event.
    pub with_location: bool,
    /// Log span close events. Consumer spans then report how long each
    /// event took to handle.
    pub log_span_close: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            module_levels: BTreeMap::new(),
            with_location: false,
            log_span_close: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("expected json, pretty or compact, got '{}'", other)),
        }
    }
}

/// `RUST_LOG` replaces `level` when set; `module_levels` apply on top either way.
pub fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let base = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| config.level.clone());

    config
        .module_levels
        .iter()
        .try_fold(EnvFilter::try_new(base)?, |filter, (target, level)| -> anyhow::Result<EnvFilter> {
            Ok(filter.add_directive(format!("{}={}", target, level).parse()?))
        })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let spans = if config.log_span_close { FmtSpan::CLOSE } else { FmtSpan::NONE };
    let base = fmt::layer()
        .with_span_events(spans)
        .with_file(config.with_location)
        .with_line_number(config.with_location);

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(build_filter(config)?)
        .try_init()?;
    Ok(())
}
