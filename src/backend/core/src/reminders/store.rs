//! Persistent reminder schedule.
//!
//! Layout:
//! - `reminder/{id}`: the [`ScheduledReminder`], the compare-and-set target
//! - `schedule/{slot}/{id}`: due index, range-scanned by the poller. The slot
//!   is `fire_at`, or the republish time of a fired but unpublished reminder
//! - `reminder-task/{task_id}/{id}`: reminders of a task, for cancellation
//! - `reminder-closed/{task_id}`: the task was completed or deleted
//!
//! The primary record is always written before its index entries, so an index
//! entry whose primary is missing is an orphan and may be deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ErrorCode, Result, TaskflowError};
use crate::events::{derive_uuid, EventId, OwnerId, ReminderId, TaskId};
use crate::store::{keys, Expected, StateStore};

/// Reminder lifecycle. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Fired,
    Cancelled,
}

impl ReminderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A durable reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledReminder {
    pub reminder_id: ReminderId,
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub fire_at: DateTime<Utc>,
    pub status: ReminderStatus,
    /// Event that scheduled this reminder.
    pub source_event_id: EventId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
    /// When the bus accepted the `ReminderFired` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ScheduledReminder {
    /// A pending reminder scheduled by `source_event_id`.
    pub fn pending(
        task_id: TaskId,
        owner_id: OwnerId,
        fire_at: DateTime<Utc>,
        source_event_id: EventId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reminder_id: Self::id_for(source_event_id),
            task_id,
            owner_id,
            fire_at,
            status: ReminderStatus::Pending,
            source_event_id,
            created_at: now,
            fired_at: None,
            published_at: None,
            cancelled_at: None,
        }
    }

    /// Reminder id derived from the event that scheduled it.
    pub fn id_for(source_event_id: EventId) -> ReminderId {
        ReminderId(derive_uuid(source_event_id.as_uuid(), "reminder"))
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReminderStatus::Pending
    }

    /// Fired, but the `ReminderFired` event was not confirmed published.
    pub fn awaits_publish(&self) -> bool {
        self.status == ReminderStatus::Fired && self.published_at.is_none()
    }
}

/// Value of a due-index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub reminder_id: ReminderId,
    pub task_id: TaskId,
    pub fire_at: DateTime<Utc>,
    /// Set when the entry was moved past `fire_at` to wait for a republish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_until: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// Time segment of this entry's key.
    pub fn slot(&self) -> DateTime<Utc> {
        self.deferred_until.unwrap_or(self.fire_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskIndexEntry {
    reminder_id: ReminderId,
    fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskClosed {
    event_id: EventId,
    closed_at: DateTime<Utc>,
}

/// Typed access to the reminder layout.
#[derive(Clone)]
pub struct ReminderStore {
    store: Arc<dyn StateStore>,
}

impl ReminderStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: ReminderId) -> Result<Option<(u64, ScheduledReminder)>> {
        self.store.get_as(&keys::reminder(id)).await
    }

    /// Create a reminder and index it. Returns `false` if it already existed;
    /// a pending one is re-indexed in case an earlier attempt stopped halfway.
    pub async fn create(&self, reminder: &ScheduledReminder) -> Result<bool> {
        let created = match self
            .store
            .put_as(&keys::reminder(reminder.reminder_id), reminder, Expected::Absent)
            .await
        {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::VersionConflict => false,
            Err(e) => return Err(e),
        };

        let existing = if created {
            Some(reminder.clone())
        } else {
            self.get(reminder.reminder_id).await?.map(|(_, r)| r)
        };
        if let Some(existing) = existing.filter(ScheduledReminder::is_pending) {
            self.index(&existing).await?;
        }
        Ok(created)
    }

    async fn index(&self, reminder: &ScheduledReminder) -> Result<()> {
        let entry = TaskIndexEntry {
            reminder_id: reminder.reminder_id,
            fire_at: reminder.fire_at,
        };
        self.store
            .put_as(
                &keys::reminder_by_task(reminder.task_id, reminder.reminder_id),
                &entry,
                Expected::Any,
            )
            .await?;

        let entry = ScheduleEntry {
            reminder_id: reminder.reminder_id,
            task_id: reminder.task_id,
            fire_at: reminder.fire_at,
            deferred_until: None,
        };
        self.store
            .put_as(&keys::schedule(reminder.fire_at, reminder.reminder_id), &entry, Expected::Any)
            .await?;
        Ok(())
    }

    /// Write `reminder` if the stored record is still at `version`.
    ///
    /// A lost race surfaces as `ScheduleConflict`.
    pub async fn compare_and_set(&self, version: u64, reminder: &ScheduledReminder) -> Result<u64> {
        self.store
            .put_as(&keys::reminder(reminder.reminder_id), reminder, Expected::Version(version))
            .await
            .map_err(|e| {
                if e.code() == ErrorCode::VersionConflict {
                    TaskflowError::schedule_conflict(reminder.reminder_id)
                } else {
                    e
                }
            })
    }

    /// Due-index entries with `fire_at <= now`, earliest first.
    pub async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleEntry>> {
        self.store
            .scan_range(keys::SCHEDULE_PREFIX, &keys::schedule_due_bound(now), Some(limit))
            .await?
            .into_iter()
            .map(|(key, stored)| {
                serde_json::from_value(stored.value)
                    .map_err(|e| TaskflowError::from(e).with_context("key", key))
            })
            .collect()
    }

    /// Every reminder indexed for a task, with versions.
    pub async fn for_task(&self, task_id: TaskId) -> Result<Vec<(u64, ScheduledReminder)>> {
        let entries = self
            .store
            .scan_as::<TaskIndexEntry>(&keys::reminder_by_task_prefix(task_id), None)
            .await?;

        let mut reminders = Vec::with_capacity(entries.len());
        for (_, _, entry) in entries {
            if let Some(found) = self.get(entry.reminder_id).await? {
                reminders.push(found);
            }
        }
        Ok(reminders)
    }

    /// Drop both index entries of a reminder that no longer needs firing.
    pub async fn unindex(&self, reminder: &ScheduledReminder) -> Result<()> {
        self.remove_schedule_entry(reminder.fire_at, reminder.reminder_id).await?;
        self.store
            .delete(&keys::reminder_by_task(reminder.task_id, reminder.reminder_id), None)
            .await?;
        Ok(())
    }

    pub async fn remove_schedule_entry(&self, slot: DateTime<Utc>, id: ReminderId) -> Result<()> {
        self.store.delete(&keys::schedule(slot, id), None).await?;
        Ok(())
    }

    /// Move a due entry to `until`, out of the scans before it. The new entry
    /// is written first; a crash in between leaves a duplicate, not a loss.
    pub async fn defer(&self, entry: &ScheduleEntry, until: DateTime<Utc>) -> Result<ScheduleEntry> {
        let moved = ScheduleEntry {
            deferred_until: Some(until),
            ..entry.clone()
        };
        if entry.slot() == until {
            return Ok(moved);
        }
        self.store
            .put_as(&keys::schedule(until, entry.reminder_id), &moved, Expected::Any)
            .await?;
        self.remove_schedule_entry(entry.slot(), entry.reminder_id).await?;
        Ok(moved)
    }

    /// Record that a task was completed or deleted.
    pub async fn mark_closed(&self, task_id: TaskId, event_id: EventId, at: DateTime<Utc>) -> Result<()> {
        let closed = TaskClosed {
            event_id,
            closed_at: at,
        };
        match self
            .store
            .put_as(&keys::reminder_task_closed(task_id), &closed, Expected::Absent)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::VersionConflict => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn is_closed(&self, task_id: TaskId) -> Result<bool> {
        Ok(self.store.get(&keys::reminder_task_closed(task_id)).await?.is_some())
    }

    /// Drop closed markers older than `cutoff`. Past the ledger retention no
    /// redelivered event of the task can arrive to be suppressed.
    pub async fn prune_closed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store
            .delete_where::<TaskClosed, _>(keys::REMINDER_CLOSED_PREFIX, |closed| closed.closed_at < cutoff)
            .await
    }
}
