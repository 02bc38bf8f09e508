//! Redis Streams event bus.
//!
//! Layout, for topic `t` and partition `p` under the configured prefix:
//! - `{prefix}:bus:t:p` is the partition stream. Entry ids are `0-{offset}`
//!   where the offset comes from `{prefix}:bus:t:p:seq`, so offsets are dense
//!   per partition and identical to the stream position.
//! - Each consumer name is a consumer group on every partition stream.
//! - `{prefix}:lease:t:{consumer}:p` holds the id of the instance that owns the
//!   partition for that consumer (`SET NX PX`). A background task renews it
//!   every third of its lifetime until the subscription closes, whether or not
//!   the consumer is pulling.
//!
//! Unacked entries stay in the group's pending list. A subscription re-reads
//! its own pending entries before new ones, and claims the pending entries of
//! a previous owner when it acquires the lease.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    partition_for, Acknowledger, Delivery, DeliverySource, EventBus, PartitionAssignment,
    PublishAck, Subscription,
};
use crate::error::{ErrorCode, Result, TaskflowError};
use crate::events::{BusRecord, DEFAULT_MAX_PAYLOAD_BYTES};

const PUBLISH_SCRIPT: &str = r#"
local n = redis.call('INCR', KEYS[2])
redis.call('XADD', KEYS[1], '0-' .. n, 'key', ARGV[1], 'payload', ARGV[2])
return n
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Settings for [`RedisStreamBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisBusConfig {
    pub url: String,
    pub key_prefix: String,
    /// Partitions per topic
    pub partitions: u32,
    pub max_payload_bytes: usize,
    /// Identity of this engine instance in consumer groups and leases
    pub instance_id: String,
    /// Partition lease lifetime; renewed at a third of it
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// How long one blocking read waits before re-checking leases
    #[serde(with = "humantime_serde")]
    pub block_timeout: Duration,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "taskflow".to_string(),
            partitions: 8,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            instance_id: uuid::Uuid::new_v4().to_string(),
            lease_ttl: Duration::from_secs(30),
            block_timeout: Duration::from_secs(2),
        }
    }
}

/// Redis Streams backed bus. Cheap to clone.
#[derive(Clone)]
pub struct RedisStreamBus {
    conn: ConnectionManager,
    config: Arc<RedisBusConfig>,
    publish_script: Script,
}

impl RedisStreamBus {
    pub fn new(conn: ConnectionManager, config: RedisBusConfig) -> Self {
        Self {
            conn,
            config: Arc::new(config),
            publish_script: Script::new(PUBLISH_SCRIPT),
        }
    }

    pub async fn connect(config: RedisBusConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            TaskflowError::transient_bus(format!("failed to connect bus to Redis: {}", e))
        })?;
        tracing::info!(
            instance_id = %config.instance_id,
            partitions = config.partitions,
            "Redis stream bus connected"
        );
        Ok(Self::new(conn, config))
    }

    fn stream_key(&self, topic: &str, partition: u32) -> String {
        format!("{}:bus:{}:{}", self.config.key_prefix, topic, partition)
    }

    fn lease_key(&self, topic: &str, consumer: &str, partition: u32) -> String {
        format!("{}:lease:{}:{}:{}", self.config.key_prefix, topic, consumer, partition)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(bus_error(e)),
        }
    }

    async fn acquire_lease(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(self.config.lease_ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(bus_error)?;
        Ok(acquired.is_some())
    }

    async fn release_leases(&self, keys: &[String]) {
        let script = Script::new(RELEASE_SCRIPT);
        let mut conn = self.conn.clone();
        for key in keys {
            let released: redis::RedisResult<i64> = script
                .key(key)
                .arg(&self.config.instance_id)
                .invoke_async(&mut conn)
                .await;
            if let Err(e) = released {
                tracing::warn!(lease = %key, error = %e, "Failed to release partition lease");
            }
        }
    }
}

/// Redis errors on the bus path are transient unless the server rejected the command.
fn bus_error(error: redis::RedisError) -> TaskflowError {
    if error.is_io_error() || error.is_timeout() || error.is_connection_dropped() {
        TaskflowError::transient_bus(error.to_string())
    } else {
        TaskflowError::from(error)
    }
}

#[async_trait]
impl EventBus for RedisStreamBus {
    fn partitions(&self) -> u32 {
        self.config.partitions
    }

    async fn publish(&self, topic: &str, record: BusRecord) -> Result<PublishAck> {
        if record.payload.len() > self.config.max_payload_bytes {
            return Err(TaskflowError::fatal_bus(format!(
                "record of {} bytes exceeds limit {}",
                record.payload.len(),
                self.config.max_payload_bytes
            )));
        }

        let partition = partition_for(&record.key, self.config.partitions);
        let stream = self.stream_key(topic, partition);
        let mut conn = self.conn.clone();
        let offset: u64 = self
            .publish_script
            .key(&stream)
            .key(format!("{}:seq", stream))
            .arg(&record.key)
            .arg(record.payload.as_slice())
            .invoke_async(&mut conn)
            .await
            .map_err(bus_error)?;

        tracing::trace!(topic = %topic, partition, offset, key = %record.key, "Published");
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
        let partitions = assignment.resolve(self.config.partitions);
        let mut leases = Vec::with_capacity(partitions.len());

        for &partition in &partitions {
            let lease = self.lease_key(topic, consumer, partition);
            if !self.acquire_lease(&lease).await? {
                self.release_leases(&leases).await;
                return Err(TaskflowError::partition_unavailable(topic, consumer, partition));
            }
            leases.push(lease);
        }

        let mut conn = self.conn.clone();
        for &partition in &partitions {
            let stream = self.stream_key(topic, partition);
            self.ensure_group(&stream, consumer).await?;
            // Take over whatever a previous owner left pending.
            let _: redis::Value = redis::cmd("XAUTOCLAIM")
                .arg(&stream)
                .arg(consumer)
                .arg(&self.config.instance_id)
                .arg(0)
                .arg("0-0")
                .arg("COUNT")
                .arg(10_000)
                .query_async(&mut conn)
                .await
                .map_err(bus_error)?;
        }

        tracing::info!(
            topic = %topic,
            consumer = %consumer,
            partitions = ?partitions,
            instance_id = %self.config.instance_id,
            "Acquired partitions"
        );

        let acker = Arc::new(StreamAcker {
            bus: self.clone(),
            topic: topic.to_string(),
            consumer: consumer.to_string(),
            in_flight: Mutex::new(HashSet::new()),
            pending_check: Mutex::new(partitions.iter().copied().collect()),
        });
        let renewal = Arc::new(StreamLeases {
            bus: self.clone(),
            keys: leases.clone(),
            partitions: partitions.clone(),
            script: Script::new(RENEW_SCRIPT),
        });
        let source = StreamSource {
            bus: self.clone(),
            acker,
            partitions: partitions.clone(),
            leases,
            keeper: Some(LeaseKeeper::spawn(renewal, self.config.lease_ttl / 3)),
        };
        Ok(Subscription::new(topic, consumer, partitions, Box::new(source)))
    }
}

struct StreamAcker {
    bus: RedisStreamBus,
    topic: String,
    consumer: String,
    in_flight: Mutex<HashSet<u32>>,
    /// Partitions that may have entries waiting in our pending list.
    pending_check: Mutex<HashSet<u32>>,
}

#[async_trait]
impl Acknowledger for StreamAcker {
    async fn ack(&self, partition: u32, offset: u64) -> Result<()> {
        let stream = self.bus.stream_key(&self.topic, partition);
        let mut conn = self.bus.conn.clone();
        let acked: redis::RedisResult<i64> = conn
            .xack(&stream, &self.consumer, &[format!("0-{}", offset)])
            .await;
        self.in_flight.lock().remove(&partition);
        // A pending read returns one entry at a time; look again before reading new entries.
        self.pending_check.lock().insert(partition);
        acked.map_err(bus_error)?;
        Ok(())
    }

    fn release(&self, partition: u32, _offset: u64) {
        // The entry stays in our pending list and is re-read first.
        self.in_flight.lock().remove(&partition);
        self.pending_check.lock().insert(partition);
    }
}

/// Extends a subscription's partition leases.
#[async_trait]
trait LeaseRenewal: Send + Sync {
    /// Renew every lease. `Ok(Some(p))` means partition `p` is owned elsewhere now.
    async fn renew(&self) -> Result<Option<u32>>;
}

struct StreamLeases {
    bus: RedisStreamBus,
    keys: Vec<String>,
    partitions: Vec<u32>,
    script: Script,
}

#[async_trait]
impl LeaseRenewal for StreamLeases {
    async fn renew(&self) -> Result<Option<u32>> {
        let mut conn = self.bus.conn.clone();
        for (lease, partition) in self.keys.iter().zip(&self.partitions) {
            let renewed: i64 = self
                .script
                .key(lease)
                .arg(&self.bus.config.instance_id)
                .arg(self.bus.config.lease_ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(bus_error)?;
            if renewed == 0 {
                return Ok(Some(*partition));
            }
        }
        Ok(None)
    }
}

/// Renews leases on a timer, so a slow handler cannot let them lapse.
struct LeaseKeeper {
    cancel: CancellationToken,
    lost: Arc<Mutex<Option<u32>>>,
    task: JoinHandle<()>,
}

impl LeaseKeeper {
    fn spawn(renewal: Arc<dyn LeaseRenewal>, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let lost = Arc::new(Mutex::new(None));
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let lost = Arc::clone(&lost);
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // Leases were just acquired.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match renewal.renew().await {
                        Ok(None) => {}
                        Ok(Some(partition)) => {
                            tracing::warn!(partition, "Partition lease lost");
                            *lost.lock() = Some(partition);
                            break;
                        }
                        // The lease outlives a few failed renewals.
                        Err(e) => tracing::warn!(error = %e, "Lease renewal failed"),
                    }
                }
            }
        });
        Self { cancel, lost, task }
    }

    fn lost_partition(&self) -> Option<u32> {
        *self.lost.lock()
    }

    /// Stop renewing and wait for an in-progress renewal to finish.
    async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct StreamSource {
    bus: RedisStreamBus,
    acker: Arc<StreamAcker>,
    partitions: Vec<u32>,
    leases: Vec<String>,
    keeper: Option<LeaseKeeper>,
}

impl StreamSource {
    fn check_leases(&self) -> Result<()> {
        match self.keeper.as_ref().and_then(LeaseKeeper::lost_partition) {
            Some(partition) => Err(TaskflowError::partition_unavailable(
                &self.acker.topic,
                &self.acker.consumer,
                partition,
            )),
            None => Ok(()),
        }
    }

    fn idle_partitions(&self) -> Vec<u32> {
        let in_flight = self.acker.in_flight.lock();
        self.partitions
            .iter()
            .copied()
            .filter(|p| !in_flight.contains(p))
            .collect()
    }

    fn to_delivery(&self, partition: u32, entry: &StreamId, redelivered: bool) -> Option<Delivery> {
        let offset = entry
            .id
            .split_once('-')
            .and_then(|(_, seq)| seq.parse::<u64>().ok())?;
        let key: String = entry.get("key")?;
        let payload: Vec<u8> = entry.get("payload")?;

        self.acker.in_flight.lock().insert(partition);
        let acker: Arc<dyn Acknowledger> = Arc::clone(&self.acker) as Arc<dyn Acknowledger>;
        Some(Delivery::new(
            self.acker.topic.clone(),
            partition,
            offset,
            BusRecord::new(key, payload),
            redelivered,
            acker,
        ))
    }

    async fn read(&self, partitions: &[u32], from: &str, block: Option<Duration>) -> Result<Option<Delivery>> {
        if partitions.is_empty() {
            return Ok(None);
        }
        let streams: Vec<String> = partitions
            .iter()
            .map(|p| self.bus.stream_key(&self.acker.topic, *p))
            .collect();
        let ids: Vec<&str> = vec![from; streams.len()];

        let mut opts = StreamReadOptions::default()
            .group(&self.acker.consumer, &self.bus.config.instance_id)
            .count(1);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let mut conn = self.bus.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&streams, &ids, &opts)
            .await
            .map_err(bus_error)?;
        let Some(reply) = reply else {
            return Ok(None);
        };

        let mut delivered = None;
        for stream in reply.keys {
            let Some(index) = streams.iter().position(|s| *s == stream.key) else {
                continue;
            };
            let partition = partitions[index];
            for entry in &stream.ids {
                if delivered.is_some() {
                    // Read into our pending list alongside the delivered entry.
                    self.acker.pending_check.lock().insert(partition);
                    break;
                }
                if let Some(delivery) = self.to_delivery(partition, entry, from == "0") {
                    delivered = Some(delivery);
                    break;
                }
                // A pending id whose entry was trimmed away can never be delivered.
                let _: redis::RedisResult<i64> = conn
                    .xack(&stream.key, &self.acker.consumer, &[entry.id.as_str()])
                    .await;
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl DeliverySource for StreamSource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.partitions.is_empty() {
            return Ok(None);
        }
        loop {
            self.check_leases()?;

            let idle = self.idle_partitions();
            if idle.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            // Entries already in our pending list come before new ones.
            let to_check: Vec<u32> = {
                let marked = self.acker.pending_check.lock();
                idle.iter().copied().filter(|p| marked.contains(p)).collect()
            };
            for partition in to_check {
                self.acker.pending_check.lock().remove(&partition);
                if let Some(delivery) = self.read(&[partition], "0", None).await? {
                    return Ok(Some(delivery));
                }
            }

            if let Some(delivery) = self
                .read(&idle, ">", Some(self.bus.config.block_timeout))
                .await?
            {
                return Ok(Some(delivery));
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(keeper) = self.keeper.take() {
            keeper.shutdown().await;
        }
        self.bus.release_leases(&self.leases).await;
        self.leases.clear();
        self.partitions.clear();
        Ok(())
    }
}
