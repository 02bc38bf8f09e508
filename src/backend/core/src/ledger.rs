//! Idempotency ledger.
//!
//! Records, per `(consumer, event_id)`, that a consumer has applied an event's
//! side effects. The check and the claim are a single create-only write, so
//! two deliveries of the same event can never both observe "not applied".
//!
//! A claim moves `InProgress -> Done`. A claim left `InProgress` by a crash is
//! taken over by compare-and-set when the event is redelivered; consumers keep
//! their effects idempotent so re-running them after a takeover is harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::deadline::Deadline;
use crate::error::{ErrorCode, Result, TaskflowError};
use crate::events::EventId;
use crate::store::{keys, Expected, StateStore};

/// Claim state of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    InProgress,
    Done,
}

/// Persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub state: ClaimState,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// How many times the event was claimed (1 unless a crash forced a takeover).
    pub claims: u32,
}

/// Proof that the caller holds the claim for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a claim must be committed once effects succeed"]
pub struct LedgerClaim {
    consumer: String,
    event_id: EventId,
    version: u64,
    takeover: bool,
}

impl LedgerClaim {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Whether this claim took over an unfinished earlier attempt.
    pub fn is_takeover(&self) -> bool {
        self.takeover
    }
}

/// Outcome of [`IdempotencyLedger::try_apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The caller must apply the effects, then commit the claim.
    Applied(LedgerClaim),
    /// The effects were already applied; skip.
    AlreadyApplied,
}

/// Shared idempotency ledger over the state store.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Claim `event_id` for `consumer`, or report it already applied.
    pub async fn try_apply(&self, consumer: &str, event_id: EventId, deadline: &Deadline) -> Result<ApplyOutcome> {
        deadline
            .run("ledger.try_apply", self.claim(consumer, event_id))
            .await
    }

    async fn claim(&self, consumer: &str, event_id: EventId) -> Result<ApplyOutcome> {
        let key = keys::ledger(consumer, event_id);
        let now = self.clock.now();
        let fresh = LedgerRecord {
            state: ClaimState::InProgress,
            claimed_at: now,
            applied_at: None,
            claims: 1,
        };

        match self.store.put_as(&key, &fresh, Expected::Absent).await {
            Ok(version) => {
                return Ok(ApplyOutcome::Applied(LedgerClaim {
                    consumer: consumer.to_string(),
                    event_id,
                    version,
                    takeover: false,
                }))
            }
            Err(e) if e.code() == ErrorCode::VersionConflict => {}
            Err(e) => return Err(e),
        }

        let Some((version, existing)) = self.store.get_as::<LedgerRecord>(&key).await? else {
            // Pruned between the two calls; the event is older than retention.
            return Ok(ApplyOutcome::AlreadyApplied);
        };

        match existing.state {
            ClaimState::Done => Ok(ApplyOutcome::AlreadyApplied),
            ClaimState::InProgress => {
                let takeover = LedgerRecord {
                    claimed_at: now,
                    claims: existing.claims + 1,
                    ..existing
                };
                let version = self
                    .store
                    .put_as(&key, &takeover, Expected::Version(version))
                    .await?;
                tracing::warn!(
                    consumer = %consumer,
                    event_id = %event_id,
                    claims = takeover.claims,
                    "Taking over unfinished ledger claim"
                );
                Ok(ApplyOutcome::Applied(LedgerClaim {
                    consumer: consumer.to_string(),
                    event_id,
                    version,
                    takeover: true,
                }))
            }
        }
    }

    /// Mark a claimed event as applied.
    ///
    /// Fails with `VersionConflict` if another instance took the claim over in
    /// the meantime; the effects are idempotent, so the caller may treat the
    /// event as handled.
    pub async fn commit(&self, claim: LedgerClaim, deadline: &Deadline) -> Result<()> {
        deadline
            .run("ledger.commit", async {
                let key = keys::ledger(&claim.consumer, claim.event_id);
                let Some((_, record)) = self.store.get_as::<LedgerRecord>(&key).await? else {
                    return Err(TaskflowError::not_found("ledger record", key));
                };
                let done = LedgerRecord {
                    state: ClaimState::Done,
                    applied_at: Some(self.clock.now()),
                    ..record
                };
                self.store
                    .put_as(&key, &done, Expected::Version(claim.version))
                    .await?;
                Ok(())
            })
            .await
    }

    /// Whether `consumer` has committed `event_id`.
    pub async fn is_applied(&self, consumer: &str, event_id: EventId) -> Result<bool> {
        let record = self
            .store
            .get_as::<LedgerRecord>(&keys::ledger(consumer, event_id))
            .await?;
        Ok(matches!(record, Some((_, r)) if r.state == ClaimState::Done))
    }

    /// Delete committed records applied before `now - retention`. Returns how many were removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| TaskflowError::configuration(format!("ledger retention out of range: {}", e)))?;
        let cutoff = now - retention;

        let removed = self
            .store
            .delete_where::<LedgerRecord, _>("ledger/", |record| {
                record.state == ClaimState::Done && record.applied_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .await?;

        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Pruned ledger records");
        }
        Ok(removed)
    }
}
