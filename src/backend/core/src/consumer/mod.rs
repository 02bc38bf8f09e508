//! Consumer runtime.
//!
//! A consumer is a named [`EventHandler`] attached to a topic. The runtime
//! runs one tokio task per partition; each task holds a single-partition
//! subscription and processes its deliveries strictly one at a time, so
//! per-key ordering on the bus becomes per-key ordering of effects.
//!
//! For each delivery the runtime:
//! 1. decodes the envelope (malformed records are dead-lettered and acked)
//! 2. claims the event in the idempotency ledger, when one is attached
//! 3. runs the handler under a deadline, retrying retryable failures with backoff
//! 4. commits the ledger claim and acks the record
//!
//! Poison errors and exhausted retries go to the dead-letter topic; the
//! consumer acks and moves on. Nothing is acked that was neither handled nor
//! dead-lettered.

mod runner;

pub use runner::ConsumerRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;
use crate::error::Result;
use crate::events::DomainEvent;
use crate::retry::RetryPolicy;

/// What the handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Side effects were applied.
    Applied,
    /// The event needed no effects from this consumer.
    Ignored,
}

/// Per-delivery context handed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub consumer: String,
    pub partition: u32,
    pub offset: u64,
    pub redelivered: bool,
    /// Retries of this delivery so far
    pub retry: u32,
    pub deadline: Deadline,
}

/// A consumer's event handling logic.
///
/// Handlers must be idempotent: after a crash the same event may be handled
/// again even though the ledger claimed it.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Event: DomainEvent;

    /// Consumer name; the ledger namespace and the consumer group.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Self::Event, ctx: &HandlerContext) -> Result<HandleOutcome>;
}

/// Runtime settings for a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Deadline for one handling attempt, ledger calls included
    #[serde(with = "humantime_serde")]
    pub handler_timeout: Duration,
    /// Delay before re-subscribing after a partition was unavailable or the subscription failed
    #[serde(with = "humantime_serde")]
    pub resubscribe_delay: Duration,
    /// Deadline for acking a record
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters for a running consumer. Clones share the counters.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Deliveries fully processed (acked)
    pub processed: Arc<AtomicU64>,
    /// Events whose effects were applied
    pub applied: Arc<AtomicU64>,
    /// Redeliveries skipped by the ledger
    pub duplicates: Arc<AtomicU64>,
    pub dead_lettered: Arc<AtomicU64>,
    pub retries: Arc<AtomicU64>,
    /// Partitions currently subscribed
    pub active_partitions: Arc<AtomicU64>,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn active_partitions(&self) -> u64 {
        self.active_partitions.load(Ordering::Relaxed)
    }

    /// Plain snapshot for health output.
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            processed: self.processed(),
            applied: self.applied(),
            duplicates: self.duplicates(),
            dead_lettered: self.dead_lettered(),
            retries: self.retries(),
            active_partitions: self.active_partitions(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStatsSnapshot {
    pub processed: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub active_partitions: u64,
}

/// Handle for controlling a running consumer.
pub struct ConsumerHandle {
    name: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: ConsumerStats,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Signal every partition task to stop after its in-flight event.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for every partition task to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(consumer = %self.name, error = %e, "Consumer task panicked");
            }
        }
        tracing::info!(consumer = %self.name, "Consumer stopped");
    }

    /// Shut down and wait, giving up after `timeout`.
    pub async fn shutdown_and_wait(self, timeout: Duration) -> bool {
        self.shutdown();
        let name = self.name.clone();
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(consumer = %name, "Consumer did not stop within the shutdown timeout");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_default() {
        let config = ConsumerConfig::default();
        assert_eq!(config.handler_timeout, Duration::from_secs(10));
        assert!(config.retry.max_retries > 0);
    }

    #[test]
    fn test_consumer_stats() {
        let stats = ConsumerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.duplicates(), 0);

        let shared = stats.clone();
        shared.processed.fetch_add(2, Ordering::Relaxed);
        assert_eq!(stats.snapshot().processed, 2);
    }
}
