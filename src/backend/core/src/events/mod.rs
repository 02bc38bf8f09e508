//! Event model and wire codec.
//!
//! - **`event`**: task-lifecycle events, reminder events, identifiers and the
//!   recurrence rule grammar.
//! - **`codec`**: the canonical `EventEnvelope`, the `DomainEvent` trait and the
//!   size-bounded `Codec` that is the ingestion boundary for every consumer.

pub mod codec;
pub mod event;

pub use codec::{BusRecord, Codec, DomainEvent, EventEnvelope, DEFAULT_MAX_PAYLOAD_BYTES, SCHEMA_VERSION};
pub use event::*;
