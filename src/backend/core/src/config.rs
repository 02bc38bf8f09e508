//! Configuration management.
//!
//! Sources, lowest precedence first: built-in defaults, an optional config
//! file, then `TASKFLOW__SECTION__KEY` environment variables.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::bus::RedisBusConfig;
use crate::consumer::ConsumerConfig;
use crate::error::{Result, TaskflowError};
use crate::events::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::live_sync::LiveSyncConfig;
use crate::reminders::ReminderConfig;
use crate::retry::RetryPolicy;
use crate::store::RedisStoreConfig;
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Event bus configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Redis connection shared by the Redis bus and store
    #[serde(default)]
    pub redis: RedisConfig,

    /// Idempotency ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Retry policy for publishing derived events and dead letters
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Consumer runtime configuration
    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub reminders: ReminderConfig,

    #[serde(default)]
    pub live_sync: LiveSyncConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long shutdown waits for consumers to finish their in-flight event
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| TaskflowError::configuration(format!("invalid server address: {}", e)))
    }
}

/// Which implementation backs the bus or the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process; state is lost on restart
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Partitions per topic
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Largest encoded record accepted by the codec
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Longest time after which the bus may still redeliver a record
    #[serde(default = "default_max_redelivery_window", with = "humantime_serde")]
    pub max_redelivery_window: Duration,

    /// Dead letters kept in memory for inspection
    #[serde(default = "default_dead_letter_history")]
    pub dead_letter_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            partitions: default_partitions(),
            max_payload_bytes: default_max_payload_bytes(),
            max_redelivery_window: default_max_redelivery_window(),
            dead_letter_history: default_dead_letter_history(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix of every key the engine writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Instance identity for consumer groups and partition leases (random when unset)
    #[serde(default)]
    pub instance_id: Option<String>,

    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    #[serde(default = "default_block_timeout", with = "humantime_serde")]
    pub block_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            instance_id: None,
            lease_ttl: default_lease_ttl(),
            block_timeout: default_block_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn bus_config(&self, bus: &BusConfig) -> RedisBusConfig {
        let defaults = RedisBusConfig::default();
        RedisBusConfig {
            url: self.url.clone(),
            key_prefix: self.key_prefix.clone(),
            partitions: bus.partitions,
            max_payload_bytes: bus.max_payload_bytes,
            instance_id: self.instance_id.clone().unwrap_or(defaults.instance_id),
            lease_ttl: self.lease_ttl,
            block_timeout: self.block_timeout,
        }
    }

    pub fn store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.url.clone(),
            key_prefix: self.key_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// How long applied records are kept; must exceed the bus redelivery window
    #[serde(default = "default_ledger_retention", with = "humantime_serde")]
    pub retention: Duration,

    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention: default_ledger_retention(),
            prune_interval: default_prune_interval(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_partitions() -> u32 { 8 }
fn default_max_payload_bytes() -> usize { DEFAULT_MAX_PAYLOAD_BYTES }
fn default_max_redelivery_window() -> Duration { Duration::from_secs(24 * 3600) }
fn default_dead_letter_history() -> usize { 100 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "taskflow".to_string() }
fn default_lease_ttl() -> Duration { Duration::from_secs(30) }
fn default_block_timeout() -> Duration { Duration::from_secs(2) }
fn default_ledger_retention() -> Duration { Duration::from_secs(7 * 24 * 3600) }
fn default_prune_interval() -> Duration { Duration::from_secs(3600) }

const ENV_PREFIX: &str = "TASKFLOW";

impl Config {
    /// Load from an optional config file plus the environment, then validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let cfg: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text (no environment overrides), then validate.
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.ledger.retention <= self.bus.max_redelivery_window {
            return Err(TaskflowError::configuration(format!(
                "ledger.retention ({:?}) must exceed bus.max_redelivery_window ({:?})",
                self.ledger.retention, self.bus.max_redelivery_window,
            )));
        }
        if self.bus.partitions == 0 {
            return Err(TaskflowError::configuration("bus.partitions must be at least 1"));
        }
        if self.bus.max_payload_bytes == 0 {
            return Err(TaskflowError::configuration("bus.max_payload_bytes must be positive"));
        }
        if self.reminders.batch_size == 0 {
            return Err(TaskflowError::configuration("reminders.batch_size must be at least 1"));
        }
        if self.reminders.poll_interval.is_zero() || self.ledger.prune_interval.is_zero() {
            return Err(TaskflowError::configuration("poll and prune intervals must be positive"));
        }
        if self.live_sync.capacity == 0 {
            return Err(TaskflowError::configuration("live_sync.capacity must be at least 1"));
        }
        if self.bus.backend == Backend::Redis && self.store.backend == Backend::Memory {
            tracing::warn!("Redis bus with an in-memory store: derived state will not survive a restart");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.bus.backend, Backend::Memory);
        assert!(config.ledger.retention > config.bus.max_redelivery_window);
    }

    #[test]
    fn test_from_toml_overrides_sections() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9000

            [bus]
            backend = "redis"
            partitions = 16
            max_redelivery_window = "2h"

            [ledger]
            retention = "3days"

            [reminders]
            lead_time = "15m"

            [live_sync]
            capacity = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.bus.backend, Backend::Redis);
        assert_eq!(config.bus.partitions, 16);
        assert_eq!(config.ledger.retention, Duration::from_secs(3 * 24 * 3600));
        assert_eq!(config.reminders.lead_time, Duration::from_secs(15 * 60));
        assert_eq!(config.reminders.batch_size, ReminderConfig::default().batch_size);
        assert_eq!(config.live_sync.capacity, 32);
    }

    #[test]
    fn test_retention_must_exceed_redelivery_window() {
        let err = Config::from_toml(
            r#"
            [bus]
            max_redelivery_window = "2days"

            [ledger]
            retention = "1day"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_redis_bus_config_inherits_bus_settings() {
        let config = Config {
            bus: BusConfig {
                partitions: 3,
                ..BusConfig::default()
            },
            redis: RedisConfig {
                instance_id: Some("engine-a".into()),
                ..RedisConfig::default()
            },
            ..Config::default()
        };
        let bus = config.redis.bus_config(&config.bus);
        assert_eq!(bus.partitions, 3);
        assert_eq!(bus.instance_id, "engine-a");
        assert_eq!(config.redis.store_config().key_prefix, "taskflow");
    }
}
