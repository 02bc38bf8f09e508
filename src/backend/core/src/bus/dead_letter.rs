//! Dead-letter routing.
//!
//! Records a consumer cannot process (malformed envelopes, invalid recurrence
//! rules, transient failures that outlived their retry budget) are published to
//! the `dead-letters` topic with the original bytes, and the consumer moves on.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{EventBus, PublishAck};
use crate::error::{Result, TaskflowError};
use crate::events::BusRecord;
use crate::retry::RetryPolicy;
use crate::telemetry::ConsumerMetrics;

/// Topic dead letters are published to.
pub const DEAD_LETTER_TOPIC: &str = "dead-letters";

/// A record that was taken out of normal processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub partition_key: String,
    /// Error code that sent the record here
    pub reason: String,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// Original record bytes, base64
    pub payload: String,
}

impl DeadLetter {
    pub fn new(
        consumer: &str,
        topic: &str,
        partition: u32,
        offset: u64,
        record: &BusRecord,
        error: &TaskflowError,
        attempts: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            consumer: consumer.to_string(),
            topic: topic.to_string(),
            partition,
            offset,
            partition_key: record.key.clone(),
            reason: error.code().to_string(),
            message: error.reason().to_string(),
            attempts,
            failed_at,
            payload: BASE64.encode(&record.payload),
        }
    }

    /// The original record bytes.
    pub fn original_payload(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.payload)
            .map_err(|e| TaskflowError::malformed_envelope(format!("dead letter payload is not base64: {}", e)))
    }
}

/// Bounded buffer of the most recent dead letters, for inspection.
#[derive(Debug)]
struct RecentDeadLetters {
    letters: VecDeque<DeadLetter>,
    max_size: usize,
}

impl RecentDeadLetters {
    fn new(max_size: usize) -> Self {
        Self {
            letters: VecDeque::new(),
            max_size,
        }
    }

    fn push(&mut self, letter: DeadLetter) {
        if self.max_size == 0 {
            return;
        }
        if self.letters.len() >= self.max_size {
            self.letters.pop_front();
        }
        self.letters.push_back(letter);
    }
}

/// Publishes dead letters and remembers the most recent ones.
#[derive(Clone)]
pub struct DeadLetterRouter {
    bus: Arc<dyn EventBus>,
    retry: RetryPolicy,
    recent: Arc<Mutex<RecentDeadLetters>>,
}

impl DeadLetterRouter {
    pub fn new(bus: Arc<dyn EventBus>, retry: RetryPolicy, keep_recent: usize) -> Self {
        Self {
            bus,
            retry,
            recent: Arc::new(Mutex::new(RecentDeadLetters::new(keep_recent))),
        }
    }

    /// Publish a dead letter. Retries transient bus failures per the policy.
    pub async fn route(&self, letter: DeadLetter) -> Result<PublishAck> {
        tracing::error!(
            consumer = %letter.consumer,
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            reason = %letter.reason,
            message = %letter.message,
            attempts = letter.attempts,
            "Dead-lettering record"
        );
        ConsumerMetrics::dead_lettered(&letter.consumer, &letter.reason);

        let payload = serde_json::to_vec(&letter)?;
        let record = BusRecord::new(letter.partition_key.clone(), payload);
        let ack = self
            .retry
            .run("dead_letter.publish", || self.bus.publish(DEAD_LETTER_TOPIC, record.clone()))
            .await?;

        self.recent.lock().push(letter);
        Ok(ack)
    }

    /// The most recent dead letters, oldest first.
    pub fn recent(&self) -> Vec<DeadLetter> {
        self.recent.lock().letters.iter().cloned().collect()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.lock().letters.len()
    }
}
