//! Reminder scheduler.
//!
//! Task events with a due date schedule a durable reminder; a poll loop fires
//! the reminders whose time has come. Firing is a compare-and-set transition
//! `Pending -> Fired` on the persisted record, followed by a `ReminderFired`
//! publish, so several engine instances can poll the same schedule and every
//! reminder still fires once, never before its `fire_at`.

pub mod scheduler;
pub mod store;

pub use scheduler::{FireReport, ReminderConfig, ReminderScheduler, REMINDER_CONSUMER};
pub use store::{ReminderStatus, ReminderStore, ScheduleEntry, ScheduledReminder};
