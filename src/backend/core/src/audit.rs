//! Audit consumer.
//!
//! Appends every task event to a per-task, gapless, append-only log as
//! `audit-log`. Entries are create-only writes at `audit/{task_id}/{seq}`;
//! the head record only remembers where the next entry probably goes, so a
//! crash between the entry write and the head update is repaired by the next
//! append instead of leaving a gap or a duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::consumer::{EventHandler, HandleOutcome, HandlerContext};
use crate::error::{ErrorCode, Result, TaskflowError};
use crate::events::{EventId, OwnerId, TaskEvent, TaskEventType, TaskId};
use crate::store::{keys, Expected, StateStore};

/// Consumer name of the audit log.
pub const AUDIT_CONSUMER: &str = "audit-log";

/// Taken slots skipped past a stale head before giving the append back for retry.
const MAX_SLOTS_PER_APPEND: usize = 16;

/// One immutable audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub task_id: TaskId,
    pub event_id: EventId,
    pub event_type: TaskEventType,
    pub owner_id: OwnerId,
    pub occurred_at: DateTime<Utc>,
    pub snapshot: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct AuditHead {
    next_seq: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct EventIndex {
    sequence_no: u64,
}

/// Result of [`AuditLog::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditVerification {
    pub task_id: TaskId,
    pub entries: usize,
    pub last_sequence_no: Option<u64>,
    /// Sequence numbers missing between 1 and the last entry
    pub gaps: Vec<u64>,
    /// Events recorded under more than one sequence number
    pub duplicate_events: Vec<EventId>,
}

impl AuditVerification {
    pub fn is_consistent(&self) -> bool {
        self.gaps.is_empty() && self.duplicate_events.is_empty()
    }
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    New(u64),
    Existing(u64),
}

impl Appended {
    pub fn sequence_no(&self) -> u64 {
        match self {
            Self::New(seq) | Self::Existing(seq) => *seq,
        }
    }
}

/// The per-task audit log.
pub struct AuditLog {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append `event` to its task's log unless it is already there.
    pub async fn append(&self, event: &TaskEvent) -> Result<Appended> {
        let task_id = event.task_id;
        let index_key = keys::audit_event(task_id, event.event_id);
        if let Some((_, index)) = self.store.get_as::<EventIndex>(&index_key).await? {
            return Ok(Appended::Existing(index.sequence_no));
        }

        let head_key = keys::audit_head(task_id);
        let (mut head_version, mut seq) = match self.store.get_as::<AuditHead>(&head_key).await? {
            Some((version, head)) => (Some(version), head.next_seq),
            None => (None, 1),
        };

        for _ in 0..MAX_SLOTS_PER_APPEND {
            let entry = AuditEntry {
                sequence_no: seq,
                task_id,
                event_id: event.event_id,
                event_type: event.event_type(),
                owner_id: event.owner_id.clone(),
                occurred_at: event.occurred_at,
                snapshot: event.payload_json(),
                recorded_at: self.clock.now(),
            };

            let appended = match self
                .store
                .put_as(&keys::audit_entry(task_id, seq), &entry, Expected::Absent)
                .await
            {
                Ok(_) => Appended::New(seq),
                Err(e) if e.code() == ErrorCode::VersionConflict => {
                    let existing = self
                        .store
                        .get_as::<AuditEntry>(&keys::audit_entry(task_id, seq))
                        .await?;
                    match existing {
                        // An earlier attempt wrote the entry and stopped.
                        Some((_, found)) if found.event_id == event.event_id => Appended::Existing(seq),
                        _ => {
                            seq += 1;
                            continue;
                        }
                    }
                }
                Err(e) => return Err(e),
            };

            self.store
                .put_as(&index_key, &EventIndex { sequence_no: seq }, Expected::Any)
                .await?;
            self.advance_head(task_id, head_version, seq + 1).await?;

            tracing::debug!(task_id = %task_id, event_id = %event.event_id, sequence_no = seq, "Audit entry recorded");
            return Ok(appended);
        }

        // Every slot tried is taken, so the head may skip past them. The
        // retried append then resumes at `seq` instead of the stale head.
        self.advance_head(task_id, head_version, seq).await?;
        head_version = self.store.get(&head_key).await?.map(|v| v.version);
        tracing::debug!(task_id = %task_id, next_seq = seq, "Audit head far behind; advanced before retry");
        Err(TaskflowError::version_conflict(&head_key, head_version, None))
    }

    async fn advance_head(&self, task_id: TaskId, observed: Option<u64>, next_seq: u64) -> Result<()> {
        let expected = match observed {
            Some(version) => Expected::Version(version),
            None => Expected::Absent,
        };
        match self
            .store
            .put_as(&keys::audit_head(task_id), &AuditHead { next_seq }, expected)
            .await
        {
            Ok(_) => Ok(()),
            // A lagging head only costs the next append an extra read.
            Err(e) if e.code() == ErrorCode::VersionConflict => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All entries for a task, in sequence order.
    pub async fn history(&self, task_id: TaskId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .store
            .scan_as::<AuditEntry>(&keys::audit_prefix(task_id), None)
            .await?
            .into_iter()
            .map(|(_, _, entry)| entry)
            .collect())
    }

    /// Check a task's log for gaps and double-recorded events.
    pub async fn verify(&self, task_id: TaskId) -> Result<AuditVerification> {
        let history = self.history(task_id).await?;
        let mut gaps = Vec::new();
        let mut expected = 1;
        for entry in &history {
            while expected < entry.sequence_no {
                gaps.push(expected);
                expected += 1;
            }
            expected = entry.sequence_no + 1;
        }

        let mut seen = std::collections::HashSet::new();
        let duplicate_events = history
            .iter()
            .filter(|entry| !seen.insert(entry.event_id))
            .map(|entry| entry.event_id)
            .collect();

        Ok(AuditVerification {
            task_id,
            entries: history.len(),
            last_sequence_no: history.last().map(|entry| entry.sequence_no),
            gaps,
            duplicate_events,
        })
    }
}

#[async_trait]
impl EventHandler for AuditLog {
    type Event = TaskEvent;

    fn name(&self) -> &str {
        AUDIT_CONSUMER
    }

    async fn handle(&self, event: &TaskEvent, ctx: &HandlerContext) -> Result<HandleOutcome> {
        match ctx.deadline.run("audit.append", self.append(event)).await? {
            Appended::New(_) => Ok(HandleOutcome::Applied),
            Appended::Existing(_) => Ok(HandleOutcome::Ignored),
        }
    }
}
