//! Reminder scheduling and firing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::store::{ReminderStatus, ReminderStore, ScheduleEntry, ScheduledReminder};
use crate::bus::EventPublisher;
use crate::clock::Clock;
use crate::consumer::{EventHandler, HandleOutcome, HandlerContext};
use crate::deadline::Deadline;
use crate::error::{ErrorCode, Result, TaskflowError};
use crate::events::{ReminderFired, TaskEvent, TaskId, TaskPayload};
use crate::store::{keys, StateStore};
use crate::telemetry::ReminderMetrics;

/// Consumer name of the reminder scheduler.
pub const REMINDER_CONSUMER: &str = "reminder-scheduler";

/// Attempts at cancelling a reminder that keeps changing underneath us.
const CANCEL_ATTEMPTS: usize = 3;

/// Reminder scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    /// How often the poller looks for due reminders
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum due entries handled per poll batch
    pub batch_size: usize,
    /// How long before the due date a reminder fires
    #[serde(with = "humantime_serde")]
    pub lead_time: Duration,
    /// Deadline for publishing one `ReminderFired`
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    /// Deadline for the due scan, and for firing one reminder end to end
    /// (store reads, conditional writes and the publish)
    #[serde(with = "humantime_serde")]
    pub fire_timeout: Duration,
    /// Age after which a fired but unpublished reminder is republished
    #[serde(with = "humantime_serde")]
    pub republish_after: Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            lead_time: Duration::ZERO,
            publish_timeout: Duration::from_secs(5),
            fire_timeout: Duration::from_secs(10),
            republish_after: Duration::from_secs(30),
        }
    }
}

/// Result of one [`ReminderScheduler::fire_due`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FireReport {
    /// Due entries examined
    pub scanned: usize,
    /// Reminders this instance transitioned to `Fired` and published
    pub fired: usize,
    /// Fired reminders whose event was published on a later pass
    pub republished: usize,
    /// Reminders another instance got to first
    pub conflicts: usize,
    /// Fired reminders moved forward to wait out the republish grace
    pub deferred: usize,
    /// Entries that failed and stay due
    pub failed: usize,
}

enum Fire {
    Fired,
    Republished,
    Conflict,
    Deferred,
    Skipped,
}

impl FireReport {
    /// Whether this pass removed anything from the front of the due index
    /// by publishing it.
    fn published_any(&self) -> bool {
        self.fired + self.republished > 0
    }
}

/// Schedules reminders from task events and fires them when due.
pub struct ReminderScheduler {
    reminders: ReminderStore,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        config: ReminderConfig,
    ) -> Self {
        Self {
            reminders: ReminderStore::new(store),
            publisher,
            clock,
            config,
        }
    }

    pub fn reminders(&self) -> &ReminderStore {
        &self.reminders
    }

    pub fn config(&self) -> &ReminderConfig {
        &self.config
    }

    fn republish_grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.republish_after).unwrap_or_default()
    }

    fn fire_at(&self, due_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.lead_time)
            .ok()
            .and_then(|lead| due_at.checked_sub_signed(lead))
            .unwrap_or(due_at)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Task events
    // ═══════════════════════════════════════════════════════════════════════

    async fn schedule(&self, event: &TaskEvent, due_at: DateTime<Utc>) -> Result<HandleOutcome> {
        let fire_at = self.fire_at(due_at);
        let existing = self.reminders.for_task(event.task_id).await?;

        let mut kept = false;
        for (version, reminder) in existing.into_iter().filter(|(_, r)| r.is_pending()) {
            if reminder.fire_at == fire_at && !kept {
                // Unchanged due date. Re-create to repair a half-written index.
                self.reminders.create(&reminder).await?;
                kept = true;
            } else {
                self.cancel_reminder(version, reminder).await?;
            }
        }
        if kept {
            return Ok(HandleOutcome::Ignored);
        }

        let reminder = ScheduledReminder::pending(
            event.task_id,
            event.owner_id.clone(),
            fire_at,
            event.event_id,
            self.clock.now(),
        );
        if self.reminders.create(&reminder).await? {
            ReminderMetrics::scheduled();
            tracing::info!(
                task_id = %event.task_id,
                reminder_id = %reminder.reminder_id,
                fire_at = %fire_at,
                "Reminder scheduled"
            );
        }
        Ok(HandleOutcome::Applied)
    }

    /// Cancel every pending reminder of a task. Returns how many were cancelled.
    pub async fn cancel_for_task(&self, task_id: TaskId) -> Result<usize> {
        let mut cancelled = 0;
        for (version, reminder) in self.reminders.for_task(task_id).await? {
            if reminder.is_pending() && self.cancel_reminder(version, reminder).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Pending -> Cancelled. A reminder that already fired is left alone.
    async fn cancel_reminder(&self, mut version: u64, mut reminder: ScheduledReminder) -> Result<bool> {
        for _ in 0..CANCEL_ATTEMPTS {
            if reminder.status == ReminderStatus::Fired {
                tracing::debug!(
                    reminder_id = %reminder.reminder_id,
                    "Reminder already fired; cancellation does not retract it"
                );
                return Ok(false);
            }
            if reminder.status == ReminderStatus::Cancelled {
                self.reminders.unindex(&reminder).await?;
                return Ok(false);
            }

            let cancelled = ScheduledReminder {
                status: ReminderStatus::Cancelled,
                cancelled_at: Some(self.clock.now()),
                ..reminder.clone()
            };
            match self.reminders.compare_and_set(version, &cancelled).await {
                Ok(_) => {
                    self.reminders.unindex(&cancelled).await?;
                    ReminderMetrics::cancelled();
                    tracing::info!(
                        task_id = %cancelled.task_id,
                        reminder_id = %cancelled.reminder_id,
                        "Reminder cancelled"
                    );
                    return Ok(true);
                }
                Err(e) if e.code() == ErrorCode::ScheduleConflict => {
                    ReminderMetrics::conflict();
                    match self.reminders.get(reminder.reminder_id).await? {
                        Some((v, current)) => {
                            version = v;
                            reminder = current;
                        }
                        None => return Ok(false),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        // Still contended; hand back a retryable conflict.
        Err(TaskflowError::version_conflict(
            &keys::reminder(reminder.reminder_id),
            Some(version),
            None,
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Firing
    // ═══════════════════════════════════════════════════════════════════════

    /// Fire every reminder due at `now`, up to one batch.
    ///
    /// Each reminder is moved Pending -> Fired by compare-and-set before its
    /// event is published, so concurrent pollers fire it once. A fired
    /// reminder whose publish failed is moved forward in the due index to its
    /// republish time, so it never hides later due reminders from the scan.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<FireReport> {
        let due = Deadline::after(self.config.fire_timeout)
            .run("reminder.scan", self.reminders.due(now, self.config.batch_size))
            .await?;
        let mut report = FireReport {
            scanned: due.len(),
            ..FireReport::default()
        };

        for entry in due {
            let fired = Deadline::after(self.config.fire_timeout)
                .run("reminder.fire", self.fire_one(&entry, now))
                .await;
            match fired {
                Ok(Fire::Fired) => report.fired += 1,
                Ok(Fire::Republished) => report.republished += 1,
                Ok(Fire::Conflict) => report.conflicts += 1,
                Ok(Fire::Deferred) => report.deferred += 1,
                Ok(Fire::Skipped) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        reminder_id = %entry.reminder_id,
                        fire_at = %entry.fire_at,
                        error = %e,
                        "Failed to fire reminder; will retry on a later poll"
                    );
                }
            }
        }

        if report.scanned > 0 {
            tracing::debug!(
                scanned = report.scanned,
                fired = report.fired,
                republished = report.republished,
                conflicts = report.conflicts,
                deferred = report.deferred,
                failed = report.failed,
                "Reminder poll complete"
            );
        }
        Ok(report)
    }

    async fn fire_one(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> Result<Fire> {
        let Some((version, reminder)) = self.reminders.get(entry.reminder_id).await? else {
            self.reminders
                .remove_schedule_entry(entry.slot(), entry.reminder_id)
                .await?;
            return Ok(Fire::Skipped);
        };

        match reminder.status {
            ReminderStatus::Pending => {
                if reminder.fire_at > now {
                    return Ok(Fire::Skipped);
                }
                let fired = ScheduledReminder {
                    status: ReminderStatus::Fired,
                    fired_at: Some(now),
                    ..reminder
                };
                let version = match self.reminders.compare_and_set(version, &fired).await {
                    Ok(v) => v,
                    Err(e) if e.code() == ErrorCode::ScheduleConflict => {
                        ReminderMetrics::conflict();
                        tracing::debug!(reminder_id = %entry.reminder_id, "Reminder handled by another instance");
                        return Ok(Fire::Conflict);
                    }
                    Err(e) => return Err(e),
                };
                ReminderMetrics::fired();
                self.publish_or_defer(version, fired, entry, now).await?;
                Ok(Fire::Fired)
            }
            ReminderStatus::Fired if reminder.published_at.is_none() => {
                let retry_at = reminder.fired_at.unwrap_or(reminder.fire_at) + self.republish_grace();
                if now < retry_at {
                    self.reminders.defer(entry, retry_at).await?;
                    return Ok(Fire::Deferred);
                }
                tracing::warn!(reminder_id = %reminder.reminder_id, "Republishing unconfirmed reminder");
                self.publish_or_defer(version, reminder, entry, now).await?;
                Ok(Fire::Republished)
            }
            ReminderStatus::Fired | ReminderStatus::Cancelled => {
                self.reminders.unindex(&reminder).await?;
                self.drop_deferred(entry).await?;
                Ok(Fire::Skipped)
            }
        }
    }

    /// Publish, or on failure park the entry until the republish grace has passed.
    async fn publish_or_defer(
        &self,
        version: u64,
        reminder: ScheduledReminder,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reminder_id = reminder.reminder_id;
        match self.publish(version, reminder).await {
            Ok(()) => self.drop_deferred(entry).await,
            Err(e) => {
                if let Err(defer_error) = self.reminders.defer(entry, now + self.republish_grace()).await {
                    tracing::warn!(reminder_id = %reminder_id, error = %defer_error, "Could not defer unpublished reminder");
                }
                Err(e)
            }
        }
    }

    async fn drop_deferred(&self, entry: &ScheduleEntry) -> Result<()> {
        if entry.deferred_until.is_some() {
            self.reminders
                .remove_schedule_entry(entry.slot(), entry.reminder_id)
                .await?;
        }
        Ok(())
    }

    /// Publish `ReminderFired`, then record the outbox confirmation and drop the index entries.
    async fn publish(&self, version: u64, reminder: ScheduledReminder) -> Result<()> {
        let event = ReminderFired {
            event_id: ReminderFired::event_id_for(reminder.reminder_id),
            reminder_id: reminder.reminder_id,
            task_id: reminder.task_id,
            owner_id: reminder.owner_id.clone(),
            fire_at: reminder.fire_at,
            fired_at: reminder.fired_at.unwrap_or(reminder.fire_at),
        };
        let deadline = Deadline::after(self.config.publish_timeout);
        self.publisher.publish(&event, &deadline).await?;

        let published = ScheduledReminder {
            published_at: Some(self.clock.now()),
            ..reminder
        };
        match self.reminders.compare_and_set(version, &published).await {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::ScheduleConflict => {
                tracing::debug!(reminder_id = %published.reminder_id, "Publish already confirmed");
            }
            Err(e) => return Err(e),
        }
        self.reminders.unindex(&published).await?;

        tracing::info!(
            task_id = %published.task_id,
            reminder_id = %published.reminder_id,
            fire_at = %published.fire_at,
            "Reminder fired"
        );
        Ok(())
    }

    /// Run the poll loop until `shutdown` is cancelled.
    pub fn start_poller(self: Arc<Self>, shutdown: &CancellationToken) -> JoinHandle<()> {
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "Reminder poller started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Keep draining only while full batches are being published;
                // anything else waits for the next tick.
                loop {
                    match self.fire_due(self.clock.now()).await {
                        Ok(report)
                            if report.scanned == self.config.batch_size
                                && report.failed == 0
                                && report.published_any() =>
                        {
                            if cancel.is_cancelled() {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                        Ok(_) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Reminder poll failed");
                            break;
                        }
                    }
                }
            }
            tracing::info!("Reminder poller stopped");
        })
    }
}

#[async_trait]
impl EventHandler for ReminderScheduler {
    type Event = TaskEvent;

    fn name(&self) -> &str {
        REMINDER_CONSUMER
    }

    async fn handle(&self, event: &TaskEvent, _ctx: &HandlerContext) -> Result<HandleOutcome> {
        match &event.payload {
            TaskPayload::Completed(_) | TaskPayload::Deleted => {
                self.reminders
                    .mark_closed(event.task_id, event.event_id, self.clock.now())
                    .await?;
                let cancelled = self.cancel_for_task(event.task_id).await?;
                Ok(if cancelled > 0 {
                    HandleOutcome::Applied
                } else {
                    HandleOutcome::Ignored
                })
            }
            TaskPayload::Created(_) | TaskPayload::Updated(_) => {
                if self.reminders.is_closed(event.task_id).await? {
                    return Ok(HandleOutcome::Ignored);
                }
                if let TaskPayload::Updated(delta) = &event.payload {
                    if delta.clear_due_at {
                        self.cancel_for_task(event.task_id).await?;
                        return Ok(HandleOutcome::Applied);
                    }
                }
                match event.due_at() {
                    Some(due_at) => self.schedule(event, due_at).await,
                    None => Ok(HandleOutcome::Ignored),
                }
            }
        }
    }
}
