//! Recurrence engine.
//!
//! Consumes `task-events` as `recurrence-engine`. When a task carrying a
//! recurrence rule is completed, the engine emits a `Created` event for the
//! next occurrence and advances the series cursor. The next task's ids are
//! derived from the completion's event id, so a retried emission publishes
//! the same event and downstream ledgers drop it.
//!
//! A `Deleted` task leaves a stop marker; completions of a stopped task
//! generate nothing. Markers are pruned with the ledger once no redelivery
//! can reach them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::bus::EventPublisher;
use crate::clock::Clock;
use crate::consumer::{EventHandler, HandleOutcome, HandlerContext};
use crate::error::{ErrorCode, Result};
use crate::events::{derive_uuid, EventId, RecurrenceRule, TaskEvent, TaskId, TaskPayload, TaskSnapshot};
use crate::store::{keys, Expected, StateStore};
use crate::telemetry::LifecycleMetrics;

/// Consumer name of the recurrence engine.
pub const RECURRENCE_CONSUMER: &str = "recurrence-engine";

/// Attempts at advancing a cursor before the conflict is handed back for retry.
const CURSOR_CAS_ATTEMPTS: usize = 3;

/// Progress of a recurring series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceCursor {
    /// Root task of the series.
    pub series_id: TaskId,
    pub last_completed_occurrence_at: DateTime<Utc>,
    pub next_due_at: DateTime<Utc>,
    /// Completion event that last advanced the cursor.
    pub last_event_id: EventId,
    /// Task created for the next occurrence.
    pub next_task_id: TaskId,
    pub occurrences: u64,
    pub rule: RecurrenceRule,
}

/// Marks a task whose recurrence ended by deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceStop {
    pub task_id: TaskId,
    pub event_id: EventId,
    pub stopped_at: DateTime<Utc>,
}

/// Generates next occurrences of recurring tasks.
pub struct RecurrenceEngine {
    store: Arc<dyn StateStore>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
}

impl RecurrenceEngine {
    pub fn new(store: Arc<dyn StateStore>, publisher: EventPublisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            publisher,
            clock,
        }
    }

    /// Current cursor of a series.
    pub async fn cursor(&self, series_id: TaskId) -> Result<Option<RecurrenceCursor>> {
        Ok(self
            .store
            .get_as::<RecurrenceCursor>(&keys::recurrence_cursor(series_id))
            .await?
            .map(|(_, cursor)| cursor))
    }

    /// Whether recurrence was stopped for a task.
    pub async fn is_stopped(&self, task_id: TaskId) -> Result<bool> {
        Ok(self.store.get(&keys::recurrence_stop(task_id)).await?.is_some())
    }

    /// Drop stop markers written before `cutoff`. Returns how many were removed.
    pub async fn prune_stops(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store
            .delete_where::<RecurrenceStop, _>(keys::RECURRENCE_STOP_PREFIX, |stop| stop.stopped_at < cutoff)
            .await
    }

    /// The `Created` event for the occurrence after `completion`.
    pub fn next_occurrence(completion: &TaskEvent, snapshot: &TaskSnapshot, rule: RecurrenceRule) -> Result<TaskEvent> {
        let next_due_at = rule.advance(completion.occurred_at)?;
        let seed = completion.event_id.as_uuid();
        let next_task_id = TaskId(derive_uuid(seed, "recurrence-task"));
        let next_event_id = EventId(derive_uuid(seed, "recurrence-created"));

        let next = TaskSnapshot {
            title: snapshot.title.clone(),
            description: snapshot.description.clone(),
            due_at: Some(next_due_at),
            series_id: Some(snapshot.series_id.unwrap_or(completion.task_id)),
        };

        Ok(TaskEvent::created(next_task_id, completion.owner_id.clone(), completion.occurred_at, next)
            .with_recurrence(rule)
            .with_event_id(next_event_id))
    }

    async fn on_completed(
        &self,
        event: &TaskEvent,
        snapshot: &TaskSnapshot,
        rule: RecurrenceRule,
        ctx: &HandlerContext,
    ) -> Result<HandleOutcome> {
        if self.is_stopped(event.task_id).await? {
            tracing::info!(task_id = %event.task_id, "Recurrence stopped; not generating next occurrence");
            return Ok(HandleOutcome::Ignored);
        }

        let next = Self::next_occurrence(event, snapshot, rule)?;
        let series_id = snapshot.series_id.unwrap_or(event.task_id);
        let next_due_at = next.due_at().unwrap_or(event.occurred_at);

        self.publisher.publish(&next, &ctx.deadline).await?;
        LifecycleMetrics::recurrence_emitted();

        self.advance_cursor(series_id, event, &next, next_due_at, rule).await?;

        tracing::info!(
            series_id = %series_id,
            completed_task = %event.task_id,
            next_task = %next.task_id,
            next_due_at = %next_due_at,
            "Next occurrence emitted"
        );
        Ok(HandleOutcome::Applied)
    }

    async fn advance_cursor(
        &self,
        series_id: TaskId,
        completion: &TaskEvent,
        next: &TaskEvent,
        next_due_at: DateTime<Utc>,
        rule: RecurrenceRule,
    ) -> Result<()> {
        let key = keys::recurrence_cursor(series_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let current = self.store.get_as::<RecurrenceCursor>(&key).await?;

            let (expected, cursor) = match current {
                Some((_, cursor)) if cursor.last_event_id == completion.event_id => return Ok(()),
                Some((version, cursor)) => {
                    // Occurrences of a series live on different partitions;
                    // a late completion counts but does not move the cursor back.
                    let newer = completion.occurred_at >= cursor.last_completed_occurrence_at;
                    let advanced = RecurrenceCursor {
                        series_id,
                        last_completed_occurrence_at: if newer {
                            completion.occurred_at
                        } else {
                            cursor.last_completed_occurrence_at
                        },
                        next_due_at: if newer { next_due_at } else { cursor.next_due_at },
                        last_event_id: completion.event_id,
                        next_task_id: if newer { next.task_id } else { cursor.next_task_id },
                        occurrences: cursor.occurrences + 1,
                        rule,
                    };
                    (Expected::Version(version), advanced)
                }
                None => (
                    Expected::Absent,
                    RecurrenceCursor {
                        series_id,
                        last_completed_occurrence_at: completion.occurred_at,
                        next_due_at,
                        last_event_id: completion.event_id,
                        next_task_id: next.task_id,
                        occurrences: 1,
                        rule,
                    },
                ),
            };

            match self.store.put_as(&key, &cursor, expected).await {
                Ok(_) => return Ok(()),
                Err(e) if e.code() == ErrorCode::VersionConflict && attempt < CURSOR_CAS_ATTEMPTS => {
                    tracing::debug!(series_id = %series_id, attempt, "Cursor changed concurrently; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_deleted(&self, event: &TaskEvent) -> Result<HandleOutcome> {
        let stop = RecurrenceStop {
            task_id: event.task_id,
            event_id: event.event_id,
            stopped_at: self.clock.now(),
        };
        match self
            .store
            .put_as(&keys::recurrence_stop(event.task_id), &stop, Expected::Absent)
            .await
        {
            Ok(_) => {
                tracing::debug!(task_id = %event.task_id, "Recurrence stop marker written");
                Ok(HandleOutcome::Applied)
            }
            Err(e) if e.code() == ErrorCode::VersionConflict => Ok(HandleOutcome::Ignored),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EventHandler for RecurrenceEngine {
    type Event = TaskEvent;

    fn name(&self) -> &str {
        RECURRENCE_CONSUMER
    }

    async fn handle(&self, event: &TaskEvent, ctx: &HandlerContext) -> Result<HandleOutcome> {
        if let Some(rule) = &event.recurrence_rule {
            rule.validate()?;
        }
        match (&event.payload, event.recurrence_rule) {
            (TaskPayload::Completed(snapshot), Some(rule)) => self.on_completed(event, snapshot, rule, ctx).await,
            (TaskPayload::Deleted, _) => self.on_deleted(event).await,
            _ => Ok(HandleOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InMemoryBus};
    use crate::clock::ManualClock;
    use crate::deadline::Deadline;
    use crate::events::{Codec, IntervalUnit, OwnerId, TaskDelta, TASK_EVENTS_TOPIC};
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        bus: InMemoryBus,
        engine: RecurrenceEngine,
    }

    fn fixture() -> Fixture {
        let bus = InMemoryBus::new(2);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let publisher = EventPublisher::new(Arc::new(bus.clone()), Codec::default(), RetryPolicy::immediate(2));
        let engine = RecurrenceEngine::new(Arc::new(InMemoryStore::new()), publisher, clock);
        Fixture { bus, engine }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            consumer: RECURRENCE_CONSUMER.to_string(),
            partition: 0,
            offset: 0,
            redelivered: false,
            retry: 0,
            deadline: Deadline::after(std::time::Duration::from_secs(5)),
        }
    }

    fn emitted(bus: &InMemoryBus) -> Vec<TaskEvent> {
        bus.records(TASK_EVENTS_TOPIC)
            .iter()
            .map(|record| Codec::default().decode::<TaskEvent>(&record.payload).unwrap())
            .collect()
    }

    fn completion(rule: RecurrenceRule) -> TaskEvent {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        TaskEvent::completed(
            TaskId::new(),
            OwnerId::new("owner-1"),
            at,
            TaskSnapshot::new("Water plants").with_description("balcony"),
        )
        .with_recurrence(rule)
    }

    #[tokio::test]
    async fn test_daily_completion_creates_next_day() {
        let f = fixture();
        let event = completion(RecurrenceRule::daily());

        let outcome = f.engine.handle(&event, &ctx()).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Applied);

        let created = emitted(&f.bus);
        assert_eq!(created.len(), 1);
        let next = &created[0];
        assert_eq!(next.due_at(), Some(event.occurred_at + Duration::days(1)));
        assert_eq!(next.recurrence_rule, Some(RecurrenceRule::daily()));
        assert_eq!(next.owner_id, event.owner_id);
        match &next.payload {
            TaskPayload::Created(snapshot) => {
                assert_eq!(snapshot.title, "Water plants");
                assert_eq!(snapshot.description.as_deref(), Some("balcony"));
                assert_eq!(snapshot.series_id, Some(event.task_id));
            }
            other => panic!("expected Created, got {:?}", other),
        }

        let cursor = f.engine.cursor(event.task_id).await.unwrap().unwrap();
        assert_eq!(cursor.occurrences, 1);
        assert_eq!(cursor.next_due_at, event.occurred_at + Duration::days(1));
        assert_eq!(cursor.next_task_id, next.task_id);
    }

    #[tokio::test]
    async fn test_retried_emission_reuses_derived_ids() {
        let f = fixture();
        let event = completion(RecurrenceRule::weekly());

        f.engine.handle(&event, &ctx()).await.unwrap();
        f.engine.handle(&event, &ctx()).await.unwrap();

        let created = emitted(&f.bus);
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].event_id, created[1].event_id);
        assert_eq!(created[0].task_id, created[1].task_id);

        let cursor = f.engine.cursor(event.task_id).await.unwrap().unwrap();
        assert_eq!(cursor.occurrences, 1);
    }

    #[tokio::test]
    async fn test_series_id_carries_forward() {
        let f = fixture();
        let first = completion(RecurrenceRule::daily());
        f.engine.handle(&first, &ctx()).await.unwrap();
        let next = emitted(&f.bus).remove(0);

        let snapshot = match &next.payload {
            TaskPayload::Created(snapshot) => snapshot.clone(),
            other => panic!("expected Created, got {:?}", other),
        };
        let second = TaskEvent::completed(
            next.task_id,
            next.owner_id.clone(),
            first.occurred_at + Duration::days(1),
            snapshot,
        )
        .with_recurrence(RecurrenceRule::daily());
        f.engine.handle(&second, &ctx()).await.unwrap();

        let cursor = f.engine.cursor(first.task_id).await.unwrap().unwrap();
        assert_eq!(cursor.occurrences, 2);
        assert_eq!(cursor.next_due_at, first.occurred_at + Duration::days(2));
    }

    #[tokio::test]
    async fn test_monthly_rule_clamps_to_month_end() {
        let event = TaskEvent::completed(
            TaskId::new(),
            OwnerId::new("o"),
            Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap(),
            TaskSnapshot::new("Rent"),
        );
        let next =
            RecurrenceEngine::next_occurrence(&event, &TaskSnapshot::new("Rent"), RecurrenceRule::new(IntervalUnit::Month, 1))
                .unwrap();
        assert_eq!(next.due_at(), Some(Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_invalid_rule_is_poison() {
        let f = fixture();
        let event = completion(RecurrenceRule::new(IntervalUnit::Day, 0));

        let err = f.engine.handle(&event, &ctx()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRecurrenceRule);
        assert!(err.is_poison());
        assert!(emitted(&f.bus).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected_on_created_and_updated() {
        let f = fixture();
        let created = TaskEvent::created(TaskId::new(), OwnerId::new("o"), Utc::now(), TaskSnapshot::new("x"))
            .with_recurrence(RecurrenceRule::new(IntervalUnit::Day, 0));
        let updated = TaskEvent::updated(TaskId::new(), OwnerId::new("o"), Utc::now(), TaskDelta::default())
            .with_recurrence(RecurrenceRule::new(IntervalUnit::Hour, -3));

        for event in [created, updated] {
            let err = f.engine.handle(&event, &ctx()).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidRecurrenceRule);
        }
        assert!(emitted(&f.bus).is_empty());
    }

    #[tokio::test]
    async fn test_stop_markers_pruned_after_cutoff() {
        let f = fixture();
        let task_id = TaskId::new();
        let deleted = TaskEvent::deleted(task_id, OwnerId::new("o"), Utc::now());
        f.engine.handle(&deleted, &ctx()).await.unwrap();

        let written_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(f.engine.prune_stops(written_at).await.unwrap(), 0);
        assert!(f.engine.is_stopped(task_id).await.unwrap());

        assert_eq!(f.engine.prune_stops(written_at + Duration::seconds(1)).await.unwrap(), 1);
        assert!(!f.engine.is_stopped(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_task_stops_recurrence() {
        let f = fixture();
        let event = completion(RecurrenceRule::daily());
        let deleted = TaskEvent::deleted(event.task_id, event.owner_id.clone(), event.occurred_at);

        assert_eq!(f.engine.handle(&deleted, &ctx()).await.unwrap(), HandleOutcome::Applied);
        assert_eq!(f.engine.handle(&deleted, &ctx()).await.unwrap(), HandleOutcome::Ignored);
        assert_eq!(f.engine.handle(&event, &ctx()).await.unwrap(), HandleOutcome::Ignored);

        assert!(emitted(&f.bus).is_empty());
        assert!(f.engine.cursor(event.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completion_without_rule_is_ignored() {
        let f = fixture();
        let event = TaskEvent::completed(TaskId::new(), OwnerId::new("o"), Utc::now(), TaskSnapshot::new("once"));
        assert_eq!(f.engine.handle(&event, &ctx()).await.unwrap(), HandleOutcome::Ignored);
        assert_eq!(f.bus.partitions(), 2);
        assert!(emitted(&f.bus).is_empty());
    }
}
