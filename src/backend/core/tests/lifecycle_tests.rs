//! End-to-end tests of the engine over the in-memory bus and store.
//!
//! Tests cover:
//! - Duplicate completion delivery producing one next occurrence
//! - Reminder scheduling, firing and cancellation through the consumers
//! - Gapless audit history under redelivery
//! - Dead-lettering of malformed records
//! - Live-sync delivery to a subscribed viewer

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use taskflow_core::audit::AUDIT_CONSUMER;
use taskflow_core::bus::{EventBus, InMemoryBus, DEAD_LETTER_TOPIC};
use taskflow_core::clock::{Clock, ManualClock};
use taskflow_core::config::Config;
use taskflow_core::deadline::Deadline;
use taskflow_core::engine::{Engine, RunningEngine};
use taskflow_core::events::{
    BusRecord, Codec, OwnerId, RecurrenceRule, ReminderFired, TaskEvent, TaskEventType, TaskId, TaskSnapshot,
    REMINDER_EVENTS_TOPIC, TASK_EVENTS_TOPIC,
};
use taskflow_core::recurrence::{RecurrenceEngine, RECURRENCE_CONSUMER};
use taskflow_core::reminders::{ReminderStatus, ScheduledReminder, REMINDER_CONSUMER};
use taskflow_core::store::InMemoryStore;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    bus: InMemoryBus,
    clock: ManualClock,
    engine: Engine,
    shutdown: CancellationToken,
    running: Option<RunningEngine>,
}

impl Harness {
    fn start(now: DateTime<Utc>) -> Self {
        let mut config = Config::default();
        config.bus.partitions = 4;
        config.reminders.poll_interval = Duration::from_millis(10);
        config.consumer.resubscribe_delay = Duration::from_millis(10);

        let bus = InMemoryBus::new(config.bus.partitions);
        let clock = ManualClock::new(now);
        let engine = Engine::new(
            config,
            Arc::new(bus.clone()),
            Arc::new(InMemoryStore::new()),
            Arc::new(clock.clone()),
        );
        let shutdown = CancellationToken::new();
        let running = Some(engine.start(&shutdown));

        Self {
            bus,
            clock,
            engine,
            shutdown,
            running,
        }
    }

    async fn publish(&self, event: &TaskEvent) {
        self.engine
            .publisher()
            .publish(event, &Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    /// Poll `condition` until it holds, for at most five seconds.
    async fn wait_until(&self, mut condition: impl FnMut(&Self) -> bool) {
        for _ in 0..500 {
            if condition(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 5s");
    }

    /// Wait until every ledgered consumer has committed everything on `task-events`.
    async fn drained(&self) {
        let consumers = [RECURRENCE_CONSUMER, REMINDER_CONSUMER, AUDIT_CONSUMER];
        self.wait_until(|h| {
            consumers
                .iter()
                .all(|consumer| h.bus.lag(TASK_EVENTS_TOPIC, consumer) == 0)
        })
        .await;
    }

    async fn reminders_for(&self, task_id: TaskId) -> Vec<ScheduledReminder> {
        self.engine
            .reminders()
            .reminders()
            .for_task(task_id)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, reminder)| reminder)
            .collect()
    }

    fn task_events(&self) -> Vec<TaskEvent> {
        decode_all(&self.bus.records(TASK_EVENTS_TOPIC))
    }

    fn fired(&self) -> Vec<ReminderFired> {
        decode_all(&self.bus.records(REMINDER_EVENTS_TOPIC))
    }

    async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(running) = self.running.take() {
            assert!(running.shutdown(Duration::from_secs(5)).await);
        }
    }
}

fn decode_all<E: taskflow_core::events::DomainEvent>(records: &[BusRecord]) -> Vec<E> {
    let codec = Codec::default();
    records.iter().map(|r| codec.decode(&r.payload).unwrap()).collect()
}

fn day0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

// ============================================================================
// Recurrence
// ============================================================================

#[tokio::test]
async fn test_duplicate_completion_creates_one_next_occurrence() {
    let h = Harness::start(day0() - ChronoDuration::hours(1));
    let owner = OwnerId::new("alice");
    let t1 = TaskId::new();
    let snapshot = TaskSnapshot::new("Water plants").with_due_at(day0());

    let created = TaskEvent::created(t1, owner.clone(), day0() - ChronoDuration::hours(1), snapshot.clone())
        .with_recurrence(RecurrenceRule::daily());
    h.publish(&created).await;
    let completed =
        TaskEvent::completed(t1, owner.clone(), day0(), snapshot.clone()).with_recurrence(RecurrenceRule::daily());
    // The bus redelivers the same completion.
    h.publish(&completed).await;
    h.publish(&completed).await;

    h.wait_until(|h| h.task_events().len() >= 4).await;
    h.drained().await;

    let created: Vec<TaskEvent> = h
        .task_events()
        .into_iter()
        .filter(|e| e.event_type() == TaskEventType::Created && e.task_id != t1)
        .collect();
    assert_eq!(created.len(), 1);
    let t2 = &created[0];
    assert_eq!(t2.due_at(), Some(day0() + ChronoDuration::days(1)));
    assert_eq!(t2.owner_id, owner);
    assert_eq!(t2.recurrence_rule, Some(RecurrenceRule::daily()));

    assert!(h
        .engine
        .ledger()
        .is_applied(RECURRENCE_CONSUMER, completed.event_id)
        .await
        .unwrap());

    let stats = h.running.as_ref().unwrap().consumer_stats();
    let (_, recurrence) = stats.iter().find(|(name, _)| name == RECURRENCE_CONSUMER).unwrap();
    assert_eq!(recurrence.duplicates(), 1);

    let cursor = h.engine.recurrence().cursor(t1).await.unwrap().unwrap();
    assert_eq!(cursor.occurrences, 1);
    assert_eq!(cursor.next_task_id, t2.task_id);

    h.stop().await;
}

// ============================================================================
// Reminders
// ============================================================================

#[tokio::test]
async fn test_deleted_before_fire_time_cancels_reminder() {
    let day1_0900 = day0() + ChronoDuration::days(1);
    let h = Harness::start(day0());
    let owner = OwnerId::new("bob");
    let t1 = TaskId::new();
    let snapshot = TaskSnapshot::new("Standup notes").with_due_at(day0());

    let completed =
        TaskEvent::completed(t1, owner.clone(), day0(), snapshot.clone()).with_recurrence(RecurrenceRule::daily());
    let next = RecurrenceEngine::next_occurrence(&completed, &snapshot, RecurrenceRule::daily()).unwrap();
    let t2 = next.task_id;
    assert_eq!(next.due_at(), Some(day1_0900));

    h.publish(&completed).await;
    for _ in 0..500 {
        if h.reminders_for(t2).await.iter().any(|r| r.is_pending()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.reminders_for(t2).await.len(), 1);

    h.clock.set(day1_0900 - ChronoDuration::minutes(1));
    h.publish(&TaskEvent::deleted(t2, owner, h.clock.now())).await;
    h.drained().await;

    let reminders = h.reminders_for(t2).await;
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].status, ReminderStatus::Cancelled);

    // Well past the due time; the poller keeps running.
    h.clock.set(day1_0900 + ChronoDuration::hours(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.fired().iter().all(|f| f.task_id != t2));

    h.stop().await;
}

#[tokio::test]
async fn test_reminder_fires_once_at_due_time() {
    let due = day0() + ChronoDuration::hours(2);
    let h = Harness::start(day0());
    let task_id = TaskId::new();

    h.publish(&TaskEvent::created(
        task_id,
        OwnerId::new("carol"),
        day0(),
        TaskSnapshot::new("Call dentist").with_due_at(due),
    ))
    .await;
    h.drained().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.fired().is_empty());

    h.clock.set(due);
    h.wait_until(|h| !h.fired().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fired = h.fired();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].task_id, task_id);
    assert_eq!(fired[0].fire_at, due);
    assert!(fired[0].fired_at >= due);

    h.stop().await;
}

#[tokio::test]
async fn test_completion_after_fire_does_not_retract() {
    let due = day0() + ChronoDuration::minutes(30);
    let h = Harness::start(day0());
    let owner = OwnerId::new("dave");
    let task_id = TaskId::new();
    let snapshot = TaskSnapshot::new("Submit report").with_due_at(due);

    h.publish(&TaskEvent::created(task_id, owner.clone(), day0(), snapshot.clone())).await;
    h.drained().await;
    h.clock.set(due + ChronoDuration::minutes(1));
    h.wait_until(|h| !h.fired().is_empty()).await;

    h.publish(&TaskEvent::completed(task_id, owner, h.clock.now(), snapshot)).await;
    h.drained().await;

    let reminders = h.reminders_for(task_id).await;
    assert!(!reminders.is_empty());
    assert!(reminders.iter().all(|r| r.status == ReminderStatus::Fired));
    assert_eq!(h.fired().len(), 1);

    h.stop().await;
}

// ============================================================================
// Audit
// ============================================================================

#[tokio::test]
async fn test_audit_is_gapless_under_redelivery() {
    let h = Harness::start(day0());
    let owner = OwnerId::new("erin");
    let task_id = TaskId::new();
    let created = TaskEvent::created(task_id, owner.clone(), day0(), TaskSnapshot::new("Draft"));
    let completed = TaskEvent::completed(task_id, owner.clone(), day0(), TaskSnapshot::new("Draft"));
    let deleted = TaskEvent::deleted(task_id, owner, day0());

    for event in [&created, &created, &completed, &created, &completed, &deleted] {
        h.publish(event).await;
    }
    h.drained().await;

    let history = h.engine.audit().history(task_id).await.unwrap();
    let seqs: Vec<u64> = history.iter().map(|e| e.sequence_no).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    let types: Vec<TaskEventType> = history.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![TaskEventType::Created, TaskEventType::Completed, TaskEventType::Deleted]);
    assert!(h.engine.audit().verify(task_id).await.unwrap().is_consistent());

    h.stop().await;
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_malformed_record_is_dead_lettered_and_processing_continues() {
    let h = Harness::start(day0());
    let task_id = TaskId::new();

    h.bus
        .publish(TASK_EVENTS_TOPIC, BusRecord::new(task_id.to_string(), b"{not json".to_vec()))
        .await
        .unwrap();
    let good = TaskEvent::created(task_id, OwnerId::new("frank"), day0(), TaskSnapshot::new("After garbage"));
    h.publish(&good).await;
    h.drained().await;

    // Each of the four consumers dead-letters its own copy.
    h.wait_until(|h| h.bus.records(DEAD_LETTER_TOPIC).len() == 4).await;
    assert_eq!(h.engine.dead_letters().recent_count(), 4);
    assert_eq!(h.engine.audit().history(task_id).await.unwrap().len(), 1);

    h.stop().await;
}

// ============================================================================
// Live sync
// ============================================================================

#[tokio::test]
async fn test_viewer_receives_owner_events() {
    let h = Harness::start(day0());
    let owner = OwnerId::new("grace");
    let mut viewer = h.engine.live_sync().subscribe(owner.clone());

    let event = TaskEvent::created(TaskId::new(), owner, day0(), TaskSnapshot::new("Live"));
    h.publish(&event).await;

    let received = tokio::time::timeout(Duration::from_secs(5), viewer.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.event_id, event.event_id);

    drop(viewer);
    h.stop().await;
}
