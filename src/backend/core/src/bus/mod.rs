//! Partitioned, durable, at-least-once event bus.
//!
//! This module provides:
//! - **EventBus**: publish records to a topic, subscribe a named consumer to
//!   some or all of its partitions
//! - **Subscription / Delivery**: the pull side; a partition yields its next
//!   record only once the previous one is acked
//! - **InMemoryBus**: partitioned logs with per-consumer committed offsets
//! - **RedisStreamBus**: one Redis stream per partition with consumer groups
//! - **EventPublisher**: typed publishing with retry
//! - **DeadLetterRouter**: the `dead-letters` topic

pub mod dead_letter;
pub mod memory;
pub mod publisher;
pub mod redis;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::events::BusRecord;

pub use dead_letter::{DeadLetter, DeadLetterRouter, DEAD_LETTER_TOPIC};
pub use memory::InMemoryBus;
pub use publisher::EventPublisher;
pub use self::redis::{RedisBusConfig, RedisStreamBus};

/// Stable partition for a key: the first eight bytes of its SHA-256, modulo `partitions`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions as u64) as u32
}

/// Which partitions a subscription asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionAssignment {
    All,
    Only(Vec<u32>),
}

impl PartitionAssignment {
    /// Concrete, sorted, de-duplicated partition list for a topic with `partitions` partitions.
    pub fn resolve(&self, partitions: u32) -> Vec<u32> {
        let mut resolved: Vec<u32> = match self {
            Self::All => (0..partitions).collect(),
            Self::Only(list) => list.iter().copied().filter(|p| *p < partitions).collect(),
        };
        resolved.sort_unstable();
        resolved.dedup();
        resolved
    }
}

/// Acknowledgement of a published record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// Backend side of delivery settlement.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Commit `offset` on `partition`; the partition may then yield its next record.
    async fn ack(&self, partition: u32, offset: u64) -> Result<()>;

    /// Give the record back for redelivery. Must not block: it runs from `Drop`.
    fn release(&self, partition: u32, offset: u64);
}

/// One record handed to a consumer.
///
/// Dropping a delivery without acking it releases it for redelivery.
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub record: BusRecord,
    /// Whether this record was handed out before and not acked.
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
    settled: bool,
}

impl Delivery {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        offset: u64,
        record: BusRecord,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            record,
            redelivered,
            acker,
            settled: false,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.record.payload
    }

    pub fn key(&self) -> &str {
        &self.record.key
    }

    /// Commit the record.
    pub async fn ack(mut self) -> Result<()> {
        self.settled = true;
        self.acker.ack(self.partition, self.offset).await
    }

    /// Hand the record back for redelivery.
    pub fn nack(mut self) {
        self.settled = true;
        self.acker.release(self.partition, self.offset);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.acker.release(self.partition, self.offset);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.record.key)
            .field("bytes", &self.record.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Backend side of a subscription.
#[async_trait]
pub trait DeliverySource: Send {
    /// Wait for the next deliverable record. `Ok(None)` means closed.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses nothing.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Release partition ownership.
    async fn close(&mut self) -> Result<()>;
}

/// A consumer's claim on a set of partitions of one topic.
pub struct Subscription {
    topic: String,
    consumer: String,
    partitions: Vec<u32>,
    source: Box<dyn DeliverySource>,
    closed: bool,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        consumer: impl Into<String>,
        partitions: Vec<u32>,
        source: Box<dyn DeliverySource>,
    ) -> Self {
        Self {
            topic: topic.into(),
            consumer: consumer.into(),
            partitions,
            source,
            closed: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }

    /// Next delivery, or `None` once closed.
    pub async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.closed {
            return Ok(None);
        }
        self.source.next().await
    }

    /// Release the partitions. Unacked deliveries become redeliverable.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.source.close().await;
        tracing::debug!(
            topic = %self.topic,
            consumer = %self.consumer,
            partitions = ?self.partitions,
            "Subscription closed"
        );
        result
    }

    /// The subscription as a stream of deliveries.
    pub fn into_stream(self) -> impl Stream<Item = Result<Delivery>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            match sub.next().await {
                Ok(Some(delivery)) => Some((Ok(delivery), sub)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sub)),
            }
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("consumer", &self.consumer)
            .field("partitions", &self.partitions)
            .finish()
    }
}

/// A partitioned event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Number of partitions per topic.
    fn partitions(&self) -> u32;

    /// Append a record to the partition its key hashes to.
    ///
    /// `TransientBusError` is retryable; `FatalBusError` is not.
    async fn publish(&self, topic: &str, record: BusRecord) -> Result<PublishAck>;

    /// Subscribe `consumer` to `topic`.
    ///
    /// Fails with `PartitionUnavailable` if a requested partition is held by
    /// another live subscription of the same consumer name.
    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        assignment: PartitionAssignment,
    ) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_for_is_stable_and_in_range() {
        for key in ["a", "task-1", "7c1f6a9e-0000-4000-8000-000000000000"] {
            let p = partition_for(key, 8);
            assert!(p < 8);
            assert_eq!(p, partition_for(key, 8));
        }
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_partition_for_spreads_keys() {
        let used: std::collections::HashSet<u32> =
            (0..200).map(|i| partition_for(&format!("task-{}", i), 4)).collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_assignment_resolve() {
        assert_eq!(PartitionAssignment::All.resolve(3), vec![0, 1, 2]);
        assert_eq!(
            PartitionAssignment::Only(vec![2, 0, 2, 9]).resolve(3),
            vec![0, 2]
        );
    }
}
