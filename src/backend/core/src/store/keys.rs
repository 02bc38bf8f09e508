//! Key layout shared by every component that writes to the state store.
//!
//! Time-ordered keys embed zero-padded epoch milliseconds so a lexicographic
//! range scan is also a chronological one.

use chrono::{DateTime, Utc};

use crate::events::{EventId, ReminderId, TaskId};

/// Width of zero-padded numeric key segments.
const PAD: usize = 20;

/// Epoch milliseconds as a fixed-width key segment. Pre-epoch instants clamp to zero.
pub fn time_segment(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis().max(0) as u64;
    format!("{:0width$}", millis, width = PAD)
}

pub fn seq_segment(seq: u64) -> String {
    format!("{:0width$}", seq, width = PAD)
}

// Ledger

pub fn ledger(consumer: &str, event_id: EventId) -> String {
    format!("ledger/{}/{}", consumer, event_id)
}

pub fn ledger_prefix(consumer: &str) -> String {
    format!("ledger/{}/", consumer)
}

// Recurrence

pub fn recurrence_cursor(series_id: TaskId) -> String {
    format!("recurrence/{}", series_id)
}

pub const RECURRENCE_STOP_PREFIX: &str = "recurrence-stop/";

pub fn recurrence_stop(task_id: TaskId) -> String {
    format!("{}{}", RECURRENCE_STOP_PREFIX, task_id)
}

// Reminders

pub fn reminder(id: ReminderId) -> String {
    format!("reminder/{}", id)
}

pub const SCHEDULE_PREFIX: &str = "schedule/";

pub fn schedule(fire_at: DateTime<Utc>, id: ReminderId) -> String {
    format!("{}{}/{}", SCHEDULE_PREFIX, time_segment(fire_at), id)
}

/// Exclusive upper bound of the due index for everything firing at or before `now`.
pub fn schedule_due_bound(now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis().max(0) as u64 + 1;
    format!("{}{:0width$}", SCHEDULE_PREFIX, millis, width = PAD)
}

pub fn reminder_by_task(task_id: TaskId, id: ReminderId) -> String {
    format!("reminder-task/{}/{}", task_id, id)
}

pub fn reminder_by_task_prefix(task_id: TaskId) -> String {
    format!("reminder-task/{}/", task_id)
}

pub const REMINDER_CLOSED_PREFIX: &str = "reminder-closed/";

pub fn reminder_task_closed(task_id: TaskId) -> String {
    format!("{}{}", REMINDER_CLOSED_PREFIX, task_id)
}

// Audit

pub fn audit_entry(task_id: TaskId, seq: u64) -> String {
    format!("audit/{}/{}", task_id, seq_segment(seq))
}

pub fn audit_prefix(task_id: TaskId) -> String {
    format!("audit/{}/", task_id)
}

pub fn audit_event(task_id: TaskId, event_id: EventId) -> String {
    format!("audit-event/{}/{}", task_id, event_id)
}

pub fn audit_head(task_id: TaskId) -> String {
    format!("audit-head/{}", task_id)
}
