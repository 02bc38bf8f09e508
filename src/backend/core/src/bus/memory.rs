//! In-memory event bus for tests and single-process deployments.
//!
//! Each topic is a set of append-only partition logs. Each consumer name has
//! its own committed offset per partition, exactly like a consumer group: two
//! differently named consumers each see every record, and two subscriptions
//! with the same name split the partitions between them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{
    partition_for, Acknowledger, Delivery, DeliverySource, EventBus, PartitionAssignment,
    PublishAck, Subscription,
};
use crate::error::{Result, TaskflowError};
use crate::events::{BusRecord, DEFAULT_MAX_PAYLOAD_BYTES};

#[derive(Default)]
struct GroupPartition {
    /// Next offset to deliver; everything below is committed.
    next: u64,
    in_flight: Option<u64>,
    owner: Option<u64>,
    /// Offsets that were released at least once.
    released: Vec<u64>,
}

#[derive(Default)]
struct BusState {
    logs: HashMap<String, Vec<Vec<BusRecord>>>,
    groups: HashMap<(String, String), Vec<GroupPartition>>,
}

impl BusState {
    fn log_mut(&mut self, topic: &str, partitions: u32) -> &mut Vec<Vec<BusRecord>> {
        self.logs
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| Vec::new()).collect())
    }

    fn group_mut(&mut self, topic: &str, consumer: &str, partitions: u32) -> &mut Vec<GroupPartition> {
        self.groups
            .entry((topic.to_string(), consumer.to_string()))
            .or_insert_with(|| (0..partitions).map(|_| GroupPartition::default()).collect())
    }
}

struct Shared {
    state: Mutex<BusState>,
    notify: Notify,
    partitions: u32,
    max_payload_bytes: usize,
    injected_failures: AtomicU32,
    next_subscription: AtomicU64,
}

/// In-memory partitioned bus. Clones share the same logs.
#[derive(Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    pub fn new(partitions: u32) -> Self {
        Self::with_max_payload(partitions, DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn with_max_payload(partitions: u32, max_payload_bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                notify: Notify::new(),
                partitions: partitions.max(1),
                max_payload_bytes,
                injected_failures: AtomicU32::new(0),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Make the next `count` publishes fail with `TransientBusError`.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Every record published to `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<BusRecord> {
        let state = self.shared.state.lock();
        state
            .logs
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of `topic` not yet committed by `consumer`.
    pub fn lag(&self, topic: &str, consumer: &str) -> u64 {
        let state = self.shared.state.lock();
        let Some(log) = state.logs.get(topic) else {
            return 0;
        };
        let group = state.groups.get(&(topic.to_string(), consumer.to_string()));
        log.iter()
            .enumerate()
            .map(|(p, records)| {
                let committed = group.and_then(|g| g.get(p)).map(|g| g.next).unwrap_or(0);
                (records.len() as u64).saturating_sub(committed)
            })
            .sum()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    fn partitions(&self) -> u32 {
        self.shared.partitions
    }

    async fn publish(&self, topic: &str, record: BusRecord) -> Result<PublishAck> {
        let injected = self
            .shared
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TaskflowError::transient_bus("injected publish failure"));
        }

        if record.payload.len() > self.shared.max_payload_bytes {
            return Err(TaskflowError::fatal_bus(format!(
                "record of {} bytes exceeds limit {}",
                record.payload.len(),
                self.shared.max_payload_bytes
            )));
        }

        let partition = partition_for(&record.key, self.shared.partitions);
        let offset = {
            let mut state = self.shared.state.lock();
            let log = &mut state.log_mut(topic, self.shared.partitions)[partition as usize];
            log.push(record);
            (log.len() - 1) as u64
        };
        self.shared.notify.notify_waiters();

        Ok(PublishAck {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        assignment: PartitionAssignment,
    ) -> Result<Subscription> {
        let partitions = assignment.resolve(self.shared.partitions);
        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.shared.state.lock();
            state.log_mut(topic, self.shared.partitions);
            let group = state.group_mut(topic, consumer, self.shared.partitions);
            if let Some(&held) = partitions.iter().find(|p| group[**p as usize].owner.is_some()) {
                return Err(TaskflowError::partition_unavailable(topic, consumer, held));
            }
            for p in &partitions {
                group[*p as usize].owner = Some(id);
            }
        }

        tracing::debug!(topic = %topic, consumer = %consumer, partitions = ?partitions, "Subscribed");

        let source = MemorySource {
            acker: Arc::new(MemoryAcker {
                shared: Arc::clone(&self.shared),
                topic: topic.to_string(),
                consumer: consumer.to_string(),
                subscription: id,
            }),
            partitions: partitions.clone(),
            cursor: 0,
        };
        Ok(Subscription::new(topic, consumer, partitions, Box::new(source)))
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    topic: String,
    consumer: String,
    subscription: u64,
}

impl MemoryAcker {
    fn with_partition<R>(&self, partition: u32, f: impl FnOnce(&mut GroupPartition) -> R) -> Option<R> {
        let mut state = self.shared.state.lock();
        let group = state
            .groups
            .get_mut(&(self.topic.clone(), self.consumer.clone()))?;
        let slot = group.get_mut(partition as usize)?;
        if slot.owner != Some(self.subscription) {
            return None;
        }
        Some(f(slot))
    }

    fn release_all(&self) {
        let mut state = self.shared.state.lock();
        if let Some(group) = state.groups.get_mut(&(self.topic.clone(), self.consumer.clone())) {
            for slot in group.iter_mut().filter(|s| s.owner == Some(self.subscription)) {
                if let Some(offset) = slot.in_flight.take() {
                    slot.released.push(offset);
                }
                slot.owner = None;
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, partition: u32, offset: u64) -> Result<()> {
        let committed = self.with_partition(partition, |slot| {
            if slot.in_flight == Some(offset) {
                slot.in_flight = None;
                slot.next = offset + 1;
                slot.released.retain(|o| *o > offset);
                true
            } else {
                false
            }
        });
        if committed != Some(true) {
            // The partition moved on without us; the record will be redelivered to its new owner.
            tracing::debug!(topic = %self.topic, partition, offset, "Ignoring stale ack");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn release(&self, partition: u32, offset: u64) {
        self.with_partition(partition, |slot| {
            if slot.in_flight == Some(offset) {
                slot.in_flight = None;
                slot.released.push(offset);
            }
        });
        self.shared.notify.notify_waiters();
    }
}

struct MemorySource {
    acker: Arc<MemoryAcker>,
    partitions: Vec<u32>,
    cursor: usize,
}

impl MemorySource {
    fn try_take(&mut self) -> Option<Delivery> {
        let shared = &self.acker.shared;
        let mut state = shared.state.lock();
        let BusState { logs, groups } = &mut *state;
        let log = logs.get(&self.acker.topic)?;
        let group = groups.get_mut(&(self.acker.topic.clone(), self.acker.consumer.clone()))?;

        for step in 0..self.partitions.len() {
            let partition = self.partitions[(self.cursor + step) % self.partitions.len()];
            let slot = &mut group[partition as usize];
            if slot.owner != Some(self.acker.subscription) || slot.in_flight.is_some() {
                continue;
            }
            let Some(record) = log[partition as usize].get(slot.next as usize) else {
                continue;
            };

            let offset = slot.next;
            slot.in_flight = Some(offset);
            let redelivered = slot.released.contains(&offset);
            self.cursor = (self.cursor + step + 1) % self.partitions.len();

            let acker: Arc<dyn Acknowledger> = Arc::clone(&self.acker) as Arc<dyn Acknowledger>;
            return Some(Delivery::new(
                self.acker.topic.clone(),
                partition,
                offset,
                record.clone(),
                redelivered,
                acker,
            ));
        }
        None
    }
}

#[async_trait]
impl DeliverySource for MemorySource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.partitions.is_empty() {
            return Ok(None);
        }
        let shared = Arc::clone(&self.acker.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.acker.release_all();
        self.partitions.clear();
        Ok(())
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        if !self.partitions.is_empty() {
            self.acker.release_all();
        }
    }
}
