#![allow(clippy::result_large_err)]
//! # Taskflow Core
//!
//! Event-driven engine behind the task lifecycle. Independent consumers read
//! `task-events` from a partitioned, at-least-once bus and turn them into
//! exactly-once effects through an idempotency ledger and conditional writes.
//!
//! ## Architecture
//!
//! - **Events**: Versioned envelopes and the task/reminder event types
//! - **Bus**: Partitioned publish/subscribe over Redis Streams or in memory, with dead letters
//! - **Store**: Versioned key-value state with compare-and-set and ordered scans
//! - **Ledger**: Per-consumer record of applied events
//! - **Consumer**: Partition workers with retry, dead-lettering and graceful shutdown
//! - **Recurrence**: Next occurrence of a completed recurring task
//! - **Reminders**: Persisted schedule, fired by a CAS-guarded poll loop
//! - **Audit**: Gapless per-task history
//! - **Live sync**: Per-owner broadcast to WebSocket viewers
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod api;
pub mod audit;
pub mod bus;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod live_sync;
pub mod recurrence;
pub mod reminders;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, Result, TaskflowError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditLog, AuditVerification};
    pub use crate::bus::{
        DeadLetter, DeadLetterRouter, Delivery, EventBus, EventPublisher, InMemoryBus, PartitionAssignment,
        RedisStreamBus, Subscription,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::consumer::{ConsumerConfig, ConsumerHandle, ConsumerRunner, EventHandler, HandleOutcome, HandlerContext};
    pub use crate::deadline::Deadline;
    pub use crate::engine::{Engine, RunningEngine};
    pub use crate::error::{ErrorCode, Result, TaskflowError};
    pub use crate::events::{
        Codec, DomainEvent, EventId, IntervalUnit, OwnerId, RecurrenceRule, ReminderFired, ReminderId, TaskDelta,
        TaskEvent, TaskEventType, TaskId, TaskPayload, TaskSnapshot,
    };
    pub use crate::ledger::{ApplyOutcome, IdempotencyLedger};
    pub use crate::live_sync::{LiveSyncBroadcaster, ViewerStream};
    pub use crate::recurrence::RecurrenceEngine;
    pub use crate::reminders::{ReminderScheduler, ReminderStatus, ScheduledReminder};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{Expected, InMemoryStore, RedisStore, StateStore};
}
