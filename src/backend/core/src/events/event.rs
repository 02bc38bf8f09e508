//! Task-lifecycle events and the identifiers they carry.
//!
//! This module provides:
//! - Identifier newtypes (`EventId`, `TaskId`, `OwnerId`, `ReminderId`)
//! - `TaskEvent`, the immutable fact published by the request-serving API
//! - `ReminderFired`, the event the reminder scheduler emits
//! - `RecurrenceRule`, the fixed-interval recurrence grammar

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::codec::{DomainEvent, EventEnvelope};
use crate::error::{Result, TaskflowError};

/// Topic carrying task lifecycle events, partitioned by `task_id`.
pub const TASK_EVENTS_TOPIC: &str = "task-events";

/// Topic carrying fired reminders for the notification collaborator.
pub const REMINDER_EVENTS_TOPIC: &str = "reminder-events";

/// Namespace for identifiers the engine derives from other identifiers.
const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_9b7d_4c53_8e21_d0a7_35bf_14c9);

/// Derive a stable UUID from a seed and a purpose label.
///
/// Retried emissions of a derived event reuse the same identifiers, so
/// downstream idempotency ledgers see them as duplicates.
pub(crate) fn derive_uuid(seed: &Uuid, purpose: &str) -> Uuid {
    let mut name = Vec::with_capacity(16 + purpose.len());
    name.extend_from_slice(seed.as_bytes());
    name.extend_from_slice(purpose.as_bytes());
    Uuid::new_v5(&DERIVED_ID_NAMESPACE, &name)
}

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id! {
    /// Globally unique event identifier, assigned once by the producer.
    EventId
}

uuid_id! {
    /// Task identifier; the partition key of `task-events`.
    TaskId
}

uuid_id! {
    /// Reminder identifier.
    ReminderId
}

/// Identifier of the user owning a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Recurrence
// =============================================================================

/// Unit of a fixed recurrence interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

/// Fixed-interval recurrence: every `count` `unit`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub unit: IntervalUnit,
    pub count: i64,
}

impl RecurrenceRule {
    pub fn new(unit: IntervalUnit, count: i64) -> Self {
        Self { unit, count }
    }

    pub fn daily() -> Self {
        Self::new(IntervalUnit::Day, 1)
    }

    pub fn weekly() -> Self {
        Self::new(IntervalUnit::Week, 1)
    }

    /// Reject non-positive intervals.
    pub fn validate(&self) -> Result<()> {
        if self.count <= 0 {
            return Err(TaskflowError::invalid_recurrence_rule(format!(
                "interval count must be positive, got {} {:?}",
                self.count, self.unit
            )));
        }
        Ok(())
    }

    /// The occurrence one interval after `from`.
    ///
    /// Month steps are calendar-aware: Jan 31 + 1 month is the last day of February.
    pub fn advance(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.validate()?;
        let overflow = || {
            TaskflowError::invalid_recurrence_rule(format!(
                "interval {} {:?} overflows from {}",
                self.count, self.unit, from
            ))
        };

        let next = match self.unit {
            IntervalUnit::Minute => Duration::try_minutes(self.count).and_then(|d| from.checked_add_signed(d)),
            IntervalUnit::Hour => Duration::try_hours(self.count).and_then(|d| from.checked_add_signed(d)),
            IntervalUnit::Day => Duration::try_days(self.count).and_then(|d| from.checked_add_signed(d)),
            IntervalUnit::Week => Duration::try_weeks(self.count).and_then(|d| from.checked_add_signed(d)),
            IntervalUnit::Month => u32::try_from(self.count)
                .ok()
                .and_then(|months| from.checked_add_months(Months::new(months))),
        };

        next.ok_or_else(overflow)
    }
}

// =============================================================================
// Task Events
// =============================================================================

/// Discriminant of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEventType {
    Created,
    Updated,
    Completed,
    Deleted,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Completed => "Completed",
            Self::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEventType {
    type Err = TaskflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Created" => Ok(Self::Created),
            "Updated" => Ok(Self::Updated),
            "Completed" => Ok(Self::Completed),
            "Deleted" => Ok(Self::Deleted),
            other => Err(TaskflowError::malformed_envelope(format!(
                "unknown task event type '{}'",
                other
            ))),
        }
    }
}

/// Full task state, carried by `Created` and `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Root task of the recurring series this task belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<TaskId>,
}

impl TaskSnapshot {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            due_at: None,
            series_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

/// Partial update, carried by `Updated`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// The due date was removed.
    #[serde(default)]
    pub clear_due_at: bool,
}

/// Typed payload, one variant per event type.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    Created(TaskSnapshot),
    Updated(TaskDelta),
    Completed(TaskSnapshot),
    Deleted,
}

impl TaskPayload {
    pub fn event_type(&self) -> TaskEventType {
        match self {
            Self::Created(_) => TaskEventType::Created,
            Self::Updated(_) => TaskEventType::Updated,
            Self::Completed(_) => TaskEventType::Completed,
            Self::Deleted => TaskEventType::Deleted,
        }
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Created(snapshot) | Self::Completed(snapshot) => serde_json::to_value(snapshot),
            Self::Updated(delta) => serde_json::to_value(delta),
            Self::Deleted => Ok(serde_json::Value::Null),
        }
    }

    fn from_json(event_type: TaskEventType, value: serde_json::Value) -> Result<Self> {
        let shape_error = |e: serde_json::Error| {
            TaskflowError::malformed_envelope(format!("invalid {} payload: {}", event_type, e))
        };

        match event_type {
            TaskEventType::Created => serde_json::from_value(value).map(Self::Created).map_err(shape_error),
            TaskEventType::Updated => serde_json::from_value(value).map(Self::Updated).map_err(shape_error),
            TaskEventType::Completed => {
                serde_json::from_value(value).map(Self::Completed).map_err(shape_error)
            }
            TaskEventType::Deleted => match value {
                serde_json::Value::Null => Ok(Self::Deleted),
                serde_json::Value::Object(map) if map.is_empty() => Ok(Self::Deleted),
                _ => Err(TaskflowError::malformed_envelope(
                    "Deleted events carry no payload",
                )),
            },
        }
    }
}

/// An immutable task-lifecycle fact.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub event_id: EventId,
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    /// Producer timestamp.
    pub occurred_at: DateTime<Utc>,
    pub payload: TaskPayload,
    pub recurrence_rule: Option<RecurrenceRule>,
}

impl TaskEvent {
    fn build(task_id: TaskId, owner_id: OwnerId, occurred_at: DateTime<Utc>, payload: TaskPayload) -> Self {
        Self {
            event_id: EventId::new(),
            task_id,
            owner_id,
            occurred_at,
            payload,
            recurrence_rule: None,
        }
    }

    pub fn created(task_id: TaskId, owner_id: OwnerId, occurred_at: DateTime<Utc>, snapshot: TaskSnapshot) -> Self {
        Self::build(task_id, owner_id, occurred_at, TaskPayload::Created(snapshot))
    }

    pub fn updated(task_id: TaskId, owner_id: OwnerId, occurred_at: DateTime<Utc>, delta: TaskDelta) -> Self {
        Self::build(task_id, owner_id, occurred_at, TaskPayload::Updated(delta))
    }

    pub fn completed(task_id: TaskId, owner_id: OwnerId, occurred_at: DateTime<Utc>, snapshot: TaskSnapshot) -> Self {
        Self::build(task_id, owner_id, occurred_at, TaskPayload::Completed(snapshot))
    }

    pub fn deleted(task_id: TaskId, owner_id: OwnerId, occurred_at: DateTime<Utc>) -> Self {
        Self::build(task_id, owner_id, occurred_at, TaskPayload::Deleted)
    }

    pub fn with_recurrence(mut self, rule: RecurrenceRule) -> Self {
        self.recurrence_rule = Some(rule);
        self
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn event_type(&self) -> TaskEventType {
        self.payload.event_type()
    }

    /// The due date this event sets, if it sets one.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match &self.payload {
            TaskPayload::Created(snapshot) | TaskPayload::Completed(snapshot) => snapshot.due_at,
            TaskPayload::Updated(delta) => delta.due_at,
            TaskPayload::Deleted => None,
        }
    }

    /// Whether this event ends the task's life (no further reminders or recurrences).
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, TaskPayload::Completed(_) | TaskPayload::Deleted)
    }

    /// The payload rendered as JSON (the audit snapshot).
    pub fn payload_json(&self) -> serde_json::Value {
        self.payload.to_json().unwrap_or(serde_json::Value::Null)
    }
}

/// Wire layout of a task event's `data` field.
#[derive(Debug, Serialize, Deserialize)]
struct TaskEventData {
    task_id: TaskId,
    owner_id: OwnerId,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recurrence_rule: Option<RecurrenceRule>,
}

impl DomainEvent for TaskEvent {
    const TOPIC: &'static str = TASK_EVENTS_TOPIC;

    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn event_type_name(&self) -> &'static str {
        self.event_type().as_str()
    }

    fn partition_key(&self) -> String {
        self.task_id.to_string()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn to_data(&self) -> Result<serde_json::Value> {
        let data = TaskEventData {
            task_id: self.task_id,
            owner_id: self.owner_id.clone(),
            payload: self.payload.to_json()?,
            recurrence_rule: self.recurrence_rule,
        };
        Ok(serde_json::to_value(data)?)
    }

    fn from_envelope(envelope: EventEnvelope) -> Result<Self> {
        let event_type: TaskEventType = envelope.event_type.parse()?;
        let data: TaskEventData = serde_json::from_value(envelope.data)
            .map_err(|e| TaskflowError::malformed_envelope(format!("invalid task event data: {}", e)))?;

        if data.task_id.to_string() != envelope.partition_key {
            return Err(TaskflowError::malformed_envelope(format!(
                "partition key '{}' does not match task_id {}",
                envelope.partition_key, data.task_id
            )));
        }

        if let Some(rule) = &data.recurrence_rule {
            rule.validate()?;
        }

        Ok(Self {
            event_id: envelope.event_id,
            task_id: data.task_id,
            owner_id: data.owner_id,
            occurred_at: envelope.occurred_at,
            payload: TaskPayload::from_json(event_type, data.payload)?,
            recurrence_rule: data.recurrence_rule,
        })
    }
}

// =============================================================================
// Reminder Events
// =============================================================================

/// A reminder reached its fire time and was transitioned to `Fired`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderFired {
    pub event_id: EventId,
    pub reminder_id: ReminderId,
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub fire_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

impl ReminderFired {
    /// The event id is derived from the reminder id: one reminder, one event identity.
    pub fn event_id_for(reminder_id: ReminderId) -> EventId {
        EventId(derive_uuid(reminder_id.as_uuid(), "reminder-fired"))
    }
}

impl DomainEvent for ReminderFired {
    const TOPIC: &'static str = REMINDER_EVENTS_TOPIC;

    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn event_type_name(&self) -> &'static str {
        "ReminderFired"
    }

    fn partition_key(&self) -> String {
        self.task_id.to_string()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.fired_at
    }

    fn to_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_envelope(envelope: EventEnvelope) -> Result<Self> {
        if envelope.event_type != "ReminderFired" {
            return Err(TaskflowError::malformed_envelope(format!(
                "expected ReminderFired, got '{}'",
                envelope.event_type
            )));
        }
        let event: ReminderFired = serde_json::from_value(envelope.data)
            .map_err(|e| TaskflowError::malformed_envelope(format!("invalid ReminderFired data: {}", e)))?;
        if event.event_id != envelope.event_id {
            return Err(TaskflowError::malformed_envelope("envelope and body event ids differ"));
        }
        Ok(event)
    }
}
