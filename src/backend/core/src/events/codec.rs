//! Canonical envelope and codec for everything that travels on the bus.
//!
//! The envelope is the only wire shape: a schema version, the event identity,
//! a type tag, the partition key, the producer timestamp and a JSON body.
//! Decoding is the ingestion boundary; anything that does not parse into a
//! known, well-formed event is rejected as `MalformedEnvelope` and never
//! guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::EventId;
use crate::error::{Result, TaskflowError};

/// Current envelope schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// Default upper bound for an encoded record.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: u16,
    pub event_id: EventId,
    pub event_type: String,
    pub partition_key: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A record as the bus sees it: a partition key and opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub key: String,
    pub payload: Vec<u8>,
}

impl BusRecord {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// An event type that can be carried in an [`EventEnvelope`].
pub trait DomainEvent: Sized + Send + Sync + 'static {
    /// Topic this event type is published on.
    const TOPIC: &'static str;

    fn event_id(&self) -> EventId;

    fn event_type_name(&self) -> &'static str;

    /// Key that determines the partition (and therefore the ordering domain).
    fn partition_key(&self) -> String;

    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the type-specific body.
    fn to_data(&self) -> Result<serde_json::Value>;

    /// Validate and rebuild the event from a decoded envelope.
    fn from_envelope(envelope: EventEnvelope) -> Result<Self>;

    fn to_envelope(&self) -> Result<EventEnvelope> {
        Ok(EventEnvelope {
            schema_version: SCHEMA_VERSION,
            event_id: self.event_id(),
            event_type: self.event_type_name().to_string(),
            partition_key: self.partition_key(),
            occurred_at: self.occurred_at(),
            data: self.to_data()?,
        })
    }
}

/// Encoder/decoder with a payload size bound.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_payload_bytes: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl Codec {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Encode an event into a bus record keyed by its partition key.
    ///
    /// Oversized payloads fail with `FatalBusError`; the bus would refuse them anyway.
    pub fn encode<E: DomainEvent>(&self, event: &E) -> Result<BusRecord> {
        let envelope = event.to_envelope()?;
        let payload = serde_json::to_vec(&envelope)?;
        if payload.len() > self.max_payload_bytes {
            return Err(TaskflowError::fatal_bus(format!(
                "encoded {} is {} bytes, limit is {}",
                envelope.event_type,
                payload.len(),
                self.max_payload_bytes
            ))
            .with_context("event_id", envelope.event_id.to_string()));
        }
        Ok(BusRecord::new(envelope.partition_key, payload))
    }

    /// Parse only the envelope, without interpreting the body.
    pub fn peek(&self, bytes: &[u8]) -> Result<EventEnvelope> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| TaskflowError::malformed_envelope(format!("unparseable envelope: {}", e)))?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(TaskflowError::malformed_envelope(format!(
                "unsupported schema version {} (expected {})",
                envelope.schema_version, SCHEMA_VERSION
            )));
        }
        if envelope.partition_key.is_empty() {
            return Err(TaskflowError::malformed_envelope("empty partition key"));
        }
        Ok(envelope)
    }

    /// Decode and validate a typed event.
    pub fn decode<E: DomainEvent>(&self, bytes: &[u8]) -> Result<E> {
        if bytes.len() > self.max_payload_bytes {
            return Err(TaskflowError::malformed_envelope(format!(
                "record of {} bytes exceeds limit {}",
                bytes.len(),
                self.max_payload_bytes
            )));
        }
        E::from_envelope(self.peek(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::events::event::{
        IntervalUnit, OwnerId, RecurrenceRule, TaskDelta, TaskEvent, TaskId, TaskPayload, TaskSnapshot,
    };

    fn sample() -> TaskEvent {
        TaskEvent::created(
            TaskId::new(),
            OwnerId::new("owner-1"),
            Utc::now(),
            TaskSnapshot::new("water plants").with_description("balcony"),
        )
        .with_recurrence(RecurrenceRule::daily())
    }

    #[test]
    fn test_encode_uses_task_id_as_key() {
        let event = sample();
        let record = Codec::default().encode(&event).unwrap();
        assert_eq!(record.key, event.task_id.to_string());
    }

    #[test]
    fn test_decode_preserves_event() {
        let codec = Codec::default();
        let event = TaskEvent::updated(
            TaskId::new(),
            OwnerId::new("owner-2"),
            Utc::now(),
            TaskDelta {
                title: Some("renamed".into()),
                ..Default::default()
            },
        );
        let record = codec.encode(&event).unwrap();
        let decoded: TaskEvent = codec.decode(&record.payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_oversized_payload_is_fatal() {
        let codec = Codec::new(64);
        let err = codec.encode(&sample()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FatalBusError);
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let codec = Codec::default();
        let mut envelope = sample().to_envelope().unwrap();
        envelope.event_type = "Archived".to_string();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let err = codec.decode::<TaskEvent>(&bytes).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedEnvelope);
    }

    #[test]
    fn test_wrong_payload_shape_is_malformed() {
        let codec = Codec::default();
        let mut envelope = sample().to_envelope().unwrap();
        envelope.data["payload"] = serde_json::json!({ "title": 42 });
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let err = codec.decode::<TaskEvent>(&bytes).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedEnvelope);
    }

    #[test]
    fn test_non_positive_rule_is_rejected_for_every_event_type() {
        let codec = Codec::default();
        let created = TaskEvent::created(TaskId::new(), OwnerId::new("o"), Utc::now(), TaskSnapshot::new("x"))
            .with_recurrence(RecurrenceRule::new(IntervalUnit::Day, 0));
        let updated = TaskEvent::updated(TaskId::new(), OwnerId::new("o"), Utc::now(), TaskDelta::default())
            .with_recurrence(RecurrenceRule::new(IntervalUnit::Week, -3));

        for event in [created, updated] {
            let record = codec.encode(&event).unwrap();
            let err = codec.decode::<TaskEvent>(&record.payload).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidRecurrenceRule);
            assert!(err.is_poison());
        }
    }

    #[test]
    fn test_partition_key_mismatch_is_malformed() {
        let codec = Codec::default();
        let mut envelope = sample().to_envelope().unwrap();
        envelope.partition_key = TaskId::new().to_string();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let err = codec.decode::<TaskEvent>(&bytes).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedEnvelope);
    }

    #[test]
    fn test_garbage_and_future_schema_are_malformed() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode::<TaskEvent>(b"{not json").unwrap_err().code(),
            ErrorCode::MalformedEnvelope
        );

        let mut envelope = sample().to_envelope().unwrap();
        envelope.schema_version = 99;
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert_eq!(
            codec.decode::<TaskEvent>(&bytes).unwrap_err().code(),
            ErrorCode::MalformedEnvelope
        );
    }

    #[test]
    fn test_deleted_carries_no_payload() {
        let codec = Codec::default();
        let event = TaskEvent::deleted(TaskId::new(), OwnerId::new("o"), Utc::now());
        let record = codec.encode(&event).unwrap();
        let decoded: TaskEvent = codec.decode(&record.payload).unwrap();
        assert_eq!(decoded.payload, TaskPayload::Deleted);

        let mut envelope = event.to_envelope().unwrap();
        envelope.data["payload"] = serde_json::json!({ "title": "x" });
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(codec.decode::<TaskEvent>(&bytes).is_err());
    }
}
