//! Engine wiring.
//!
//! Builds the bus, the state store and the four consumers from
//! configuration, and runs them together with the reminder poller, the retention
//! pruner and the live-sync channel pruner under one shutdown token.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::bus::{DeadLetterRouter, EventBus, EventPublisher, InMemoryBus, RedisStreamBus};
use crate::clock::{Clock, SystemClock};
use crate::config::{Backend, Config};
use crate::consumer::{ConsumerHandle, ConsumerRunner, ConsumerStats, EventHandler};
use crate::error::Result;
use crate::events::Codec;
use crate::ledger::IdempotencyLedger;
use crate::live_sync::LiveSyncBroadcaster;
use crate::recurrence::RecurrenceEngine;
use crate::reminders::ReminderScheduler;
use crate::store::{InMemoryStore, RedisStore, StateStore};

/// Every component of a configured engine, not yet running.
pub struct Engine {
    config: Config,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    codec: Codec,
    publisher: EventPublisher,
    dead_letters: DeadLetterRouter,
    ledger: IdempotencyLedger,
    recurrence: Arc<RecurrenceEngine>,
    reminders: Arc<ReminderScheduler>,
    audit: Arc<AuditLog>,
    live_sync: Arc<LiveSyncBroadcaster>,
}

impl Engine {
    /// Connect the configured backends and assemble the engine.
    pub async fn connect(config: Config) -> Result<Self> {
        let bus: Arc<dyn EventBus> = match config.bus.backend {
            Backend::Memory => Arc::new(InMemoryBus::with_max_payload(
                config.bus.partitions,
                config.bus.max_payload_bytes,
            )),
            Backend::Redis => Arc::new(RedisStreamBus::connect(config.redis.bus_config(&config.bus)).await?),
        };
        let store: Arc<dyn StateStore> = match config.store.backend {
            Backend::Memory => Arc::new(InMemoryStore::new()),
            Backend::Redis => Arc::new(RedisStore::connect(&config.redis.store_config()).await?),
        };

        tracing::info!(
            bus = ?config.bus.backend,
            store = ?config.store.backend,
            partitions = config.bus.partitions,
            "Engine backends connected"
        );
        Ok(Self::new(config, bus, store, Arc::new(SystemClock)))
    }

    /// Assemble the engine over existing backends.
    pub fn new(config: Config, bus: Arc<dyn EventBus>, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let codec = Codec::new(config.bus.max_payload_bytes);
        let publisher = EventPublisher::new(Arc::clone(&bus), codec, config.retry.clone());
        let dead_letters = DeadLetterRouter::new(Arc::clone(&bus), config.retry.clone(), config.bus.dead_letter_history);
        let ledger = IdempotencyLedger::new(Arc::clone(&store), Arc::clone(&clock), config.ledger.retention);

        let recurrence = Arc::new(RecurrenceEngine::new(
            Arc::clone(&store),
            publisher.clone(),
            Arc::clone(&clock),
        ));
        let reminders = Arc::new(ReminderScheduler::new(
            Arc::clone(&store),
            publisher.clone(),
            Arc::clone(&clock),
            config.reminders.clone(),
        ));
        let audit = Arc::new(AuditLog::new(Arc::clone(&store), Arc::clone(&clock)));
        let live_sync = Arc::new(LiveSyncBroadcaster::new(&config.live_sync));

        Self {
            config,
            bus,
            store,
            clock,
            codec,
            publisher,
            dead_letters,
            ledger,
            recurrence,
            reminders,
            audit,
            live_sync,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dead_letters
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn recurrence(&self) -> &Arc<RecurrenceEngine> {
        &self.recurrence
    }

    pub fn reminders(&self) -> &Arc<ReminderScheduler> {
        &self.reminders
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn live_sync(&self) -> &Arc<LiveSyncBroadcaster> {
        &self.live_sync
    }

    fn runner<H: EventHandler>(&self, handler: &Arc<H>) -> ConsumerRunner<H> {
        ConsumerRunner::new(
            Arc::clone(handler),
            Arc::clone(&self.bus),
            self.codec,
            self.dead_letters.clone(),
            Arc::clone(&self.clock),
            self.config.consumer.clone(),
        )
    }

    /// Start every consumer and background loop.
    pub fn start(&self, shutdown: &CancellationToken) -> RunningEngine {
        let cancel = shutdown.child_token();

        let consumers = vec![
            self.runner(&self.recurrence)
                .with_ledger(self.ledger.clone())
                .start(&cancel),
            self.runner(&self.reminders)
                .with_ledger(self.ledger.clone())
                .start(&cancel),
            self.runner(&self.audit)
                .with_ledger(self.ledger.clone())
                .start(&cancel),
            self.runner(&self.live_sync).start(&cancel),
        ];

        let background = vec![
            Arc::clone(&self.reminders).start_poller(&cancel),
            Arc::clone(&self.live_sync).start_pruner(self.config.live_sync.prune_interval, &cancel),
            spawn_retention_pruner(
                self.ledger.clone(),
                Arc::clone(&self.reminders),
                Arc::clone(&self.recurrence),
                Arc::clone(&self.clock),
                self.config.ledger.prune_interval,
                &cancel,
            ),
        ];

        tracing::info!(consumers = consumers.len(), "Engine started");
        RunningEngine {
            cancel,
            consumers,
            background,
        }
    }
}

/// Periodically drop ledger records and the closed/stop markers that only
/// matter while a redelivery of their task's events is still possible.
fn spawn_retention_pruner(
    ledger: IdempotencyLedger,
    reminders: Arc<ReminderScheduler>,
    recurrence: Arc<RecurrenceEngine>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    let cancel = shutdown.child_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; nothing is old enough yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = clock.now();
                    match ledger.prune(now).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "Pruned idempotency ledger"),
                        Err(e) => tracing::warn!(error = %e, "Ledger prune failed"),
                    }
                    let Some(cutoff) = chrono::Duration::from_std(ledger.retention())
                        .ok()
                        .and_then(|retention| now.checked_sub_signed(retention))
                    else {
                        continue;
                    };
                    let markers = match reminders.reminders().prune_closed(cutoff).await {
                        Ok(closed) => recurrence.prune_stops(cutoff).await.map(|stops| closed + stops),
                        Err(e) => Err(e),
                    };
                    match markers {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, cutoff = %cutoff, "Pruned task markers"),
                        Err(e) => tracing::warn!(error = %e, "Marker prune failed"),
                    }
                }
            }
        }
    })
}

/// A started engine.
pub struct RunningEngine {
    cancel: CancellationToken,
    consumers: Vec<ConsumerHandle>,
    background: Vec<JoinHandle<()>>,
}

impl RunningEngine {
    /// Stats of every consumer, by name.
    pub fn consumer_stats(&self) -> Vec<(String, ConsumerStats)> {
        self.consumers
            .iter()
            .map(|handle| (handle.name().to_string(), handle.stats().clone()))
            .collect()
    }

    /// Stop pulling events, let in-flight events finish, release partitions.
    ///
    /// Returns `false` if something was still running after `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        tracing::info!("Engine shutting down");
        self.cancel.cancel();

        let mut clean = true;
        for consumer in self.consumers {
            clean &= consumer.shutdown_and_wait(timeout).await;
        }

        let background = futures::future::join_all(self.background);
        match tokio::time::timeout(timeout, background).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Background task panicked");
                        clean = false;
                    }
                }
            }
            Err(_) => {
                tracing::warn!("Background tasks did not stop within the shutdown timeout");
                clean = false;
            }
        }

        tracing::info!(clean, "Engine stopped");
        clean
    }
}
