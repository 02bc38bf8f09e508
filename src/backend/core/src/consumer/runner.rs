//! Per-partition consumer tasks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::Instrument;

use super::{ConsumerConfig, ConsumerHandle, ConsumerStats, EventHandler, HandleOutcome, HandlerContext};
use crate::bus::{DeadLetter, DeadLetterRouter, Delivery, EventBus, PartitionAssignment};
use crate::clock::Clock;
use crate::deadline::Deadline;
use crate::error::{ErrorCode, Result, TaskflowError};
use crate::events::{Codec, DomainEvent};
use crate::ledger::{ApplyOutcome, IdempotencyLedger};
use crate::telemetry::ConsumerMetrics;
use tokio_util::sync::CancellationToken;

enum Attempt {
    Handled(HandleOutcome),
    Duplicate,
}

/// Drives an [`EventHandler`] over the partitions of its topic.
pub struct ConsumerRunner<H: EventHandler> {
    handler: Arc<H>,
    bus: Arc<dyn EventBus>,
    codec: Codec,
    dead_letters: DeadLetterRouter,
    ledger: Option<IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    assignment: PartitionAssignment,
    stats: ConsumerStats,
}

impl<H: EventHandler> ConsumerRunner<H> {
    pub fn new(
        handler: Arc<H>,
        bus: Arc<dyn EventBus>,
        codec: Codec,
        dead_letters: DeadLetterRouter,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            handler,
            bus,
            codec,
            dead_letters,
            ledger: None,
            clock,
            config,
            assignment: PartitionAssignment::All,
            stats: ConsumerStats::new(),
        }
    }

    /// Skip events the ledger has already seen for this consumer.
    pub fn with_ledger(mut self, ledger: IdempotencyLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_partitions(mut self, assignment: PartitionAssignment) -> Self {
        self.assignment = assignment;
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.clone()
    }

    /// Spawn one task per partition. Cancelling `shutdown` stops them all.
    pub fn start(self, shutdown: &CancellationToken) -> ConsumerHandle {
        let cancel = shutdown.child_token();
        let partitions = self.assignment.resolve(self.bus.partitions());
        let name = self.handler.name().to_string();
        let stats = self.stats.clone();
        let runner = Arc::new(self);

        tracing::info!(
            consumer = %name,
            topic = %H::Event::TOPIC,
            partitions = partitions.len(),
            ledger = runner.ledger.is_some(),
            "Consumer started"
        );

        let tasks = partitions
            .into_iter()
            .map(|partition| tokio::spawn(Arc::clone(&runner).run_partition(partition, cancel.clone())))
            .collect();

        ConsumerHandle {
            name,
            cancel,
            tasks,
            stats,
        }
    }

    async fn run_partition(self: Arc<Self>, partition: u32, cancel: CancellationToken) {
        let name = self.handler.name().to_string();
        let topic = H::Event::TOPIC;

        while !cancel.is_cancelled() {
            let mut subscription = match self
                .bus
                .subscribe(topic, &name, PartitionAssignment::Only(vec![partition]))
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    if e.code() == ErrorCode::PartitionUnavailable {
                        tracing::debug!(consumer = %name, partition, "Partition held elsewhere; waiting");
                    } else {
                        tracing::warn!(consumer = %name, partition, error = %e, "Subscribe failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.resubscribe_delay) => continue,
                    }
                }
            };

            self.stats.active_partitions.fetch_add(1, Ordering::Relaxed);
            let mut resubscribe = false;
            while !resubscribe {
                // Cancellation is only observed between deliveries.
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = subscription.next() => next,
                };
                match next {
                    Ok(Some(delivery)) => self.process(delivery).await,
                    Ok(None) => resubscribe = true,
                    Err(e) => {
                        tracing::warn!(consumer = %name, partition, error = %e, "Subscription failed");
                        resubscribe = true;
                    }
                }
            }
            self.stats.active_partitions.fetch_sub(1, Ordering::Relaxed);

            if let Err(e) = subscription.close().await {
                tracing::warn!(consumer = %name, partition, error = %e, "Failed to close subscription");
            }
            if resubscribe {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.resubscribe_delay) => {}
                }
            }
        }

        tracing::debug!(consumer = %name, partition, "Partition task stopped");
    }

    /// Process one delivery to completion: handled and acked, dead-lettered
    /// and acked, or released for redelivery.
    async fn process(&self, delivery: Delivery) {
        let started = std::time::Instant::now();
        let event = match self.codec.decode::<H::Event>(delivery.payload()) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(
                    consumer = %self.handler.name(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %error,
                    "Undecodable record"
                );
                self.dead_letter(delivery, &error, 1).await;
                return;
            }
        };

        let span = tracing::info_span!(
            "consume",
            consumer = %self.handler.name(),
            partition = delivery.partition,
            offset = delivery.offset,
            event_id = %event.event_id(),
        );

        async move {
            let name = self.handler.name();
            let retry = &self.config.retry;
            let began = tokio::time::Instant::now();
            let mut retries = 0u32;

            let result = loop {
                let ctx = HandlerContext {
                    consumer: name.to_string(),
                    partition: delivery.partition,
                    offset: delivery.offset,
                    redelivered: delivery.redelivered,
                    retry: retries,
                    deadline: Deadline::after(self.config.handler_timeout),
                };
                match self.attempt(&event, &ctx).await {
                    Ok(attempt) => break Ok(attempt),
                    Err(e) if !e.is_poison() && retry.should_retry(retries, &e, began) => {
                        let delay = retry.next_retry_delay(retries);
                        tracing::warn!(
                            retry = retries + 1,
                            delay_ms = delay.as_millis() as u64,
                            code = %e.code(),
                            error = %e,
                            "Handler failed; retrying"
                        );
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        ConsumerMetrics::retried(name);
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    Err(e) => break Err(e),
                }
            };

            match result {
                Ok(Attempt::Duplicate) => {
                    tracing::debug!("Already applied; skipping");
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    ConsumerMetrics::duplicate(name);
                    ConsumerMetrics::processed(name, "duplicate");
                    self.ack(delivery).await;
                }
                Ok(Attempt::Handled(outcome)) => {
                    let label = match outcome {
                        HandleOutcome::Applied => {
                            self.stats.applied.fetch_add(1, Ordering::Relaxed);
                            "applied"
                        }
                        HandleOutcome::Ignored => "ignored",
                    };
                    ConsumerMetrics::processed(name, label);
                    self.ack(delivery).await;
                }
                Err(error) => {
                    error.log();
                    ConsumerMetrics::processed(name, "failed");
                    self.dead_letter(delivery, &error, retries + 1).await;
                }
            }

            ConsumerMetrics::handling_duration(name, started.elapsed().as_secs_f64());
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, event: &H::Event, ctx: &HandlerContext) -> Result<Attempt> {
        let claim = match &self.ledger {
            Some(ledger) => match ledger
                .try_apply(self.handler.name(), event.event_id(), &ctx.deadline)
                .await?
            {
                ApplyOutcome::AlreadyApplied => return Ok(Attempt::Duplicate),
                ApplyOutcome::Applied(claim) => Some(claim),
            },
            None => None,
        };

        let outcome = ctx
            .deadline
            .run("consumer.handle", self.handler.handle(event, ctx))
            .await?;

        if let (Some(ledger), Some(claim)) = (&self.ledger, claim) {
            match ledger.commit(claim, &ctx.deadline).await {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::VersionConflict => {
                    tracing::debug!("Ledger claim was taken over; effects are idempotent");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Attempt::Handled(outcome))
    }

    async fn ack(&self, delivery: Delivery) {
        let (partition, offset) = (delivery.partition, delivery.offset);
        let deadline = Deadline::after(self.config.ack_timeout);
        match deadline.run("bus.ack", delivery.ack()).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Redelivery is absorbed by the ledger.
                tracing::warn!(partition, offset, error = %e, "Ack failed; record will be redelivered");
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, error: &TaskflowError, attempts: u32) {
        let letter = DeadLetter::new(
            self.handler.name(),
            &delivery.topic,
            delivery.partition,
            delivery.offset,
            &delivery.record,
            error,
            attempts,
            self.clock.now(),
        );
        match self.dead_letters.route(letter).await {
            Ok(_) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.ack(delivery).await;
            }
            Err(e) => {
                tracing::error!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "Dead-letter publish failed; releasing record for redelivery"
                );
                tokio::time::sleep(self.config.resubscribe_delay).await;
                delivery.nack();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, DEAD_LETTER_TOPIC};
    use crate::clock::SystemClock;
    use crate::events::{EventId, OwnerId, TaskEvent, TaskId, TaskSnapshot, TASK_EVENTS_TOPIC};
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records handled events; fails the first `fail_first` attempts with `code`.
    struct Recorder {
        seen: Mutex<Vec<EventId>>,
        fail_first: Mutex<u32>,
        code: ErrorCode,
    }

    impl Recorder {
        fn new(fail_first: u32, code: ErrorCode) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
                code,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        type Event = TaskEvent;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: &TaskEvent, _ctx: &HandlerContext) -> Result<HandleOutcome> {
            {
                let mut remaining = self.fail_first.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TaskflowError::new(self.code, "injected"));
                }
            }
            self.seen.lock().push(event.event_id);
            Ok(HandleOutcome::Applied)
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            handler_timeout: Duration::from_secs(5),
            resubscribe_delay: Duration::from_millis(10),
            ack_timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(3),
        }
    }

    fn runner(bus: &InMemoryBus, handler: Arc<Recorder>) -> ConsumerRunner<Recorder> {
        let bus: Arc<dyn EventBus> = Arc::new(bus.clone());
        let dead_letters = DeadLetterRouter::new(Arc::clone(&bus), RetryPolicy::immediate(3), 16);
        ConsumerRunner::new(handler, bus, Codec::default(), dead_letters, Arc::new(SystemClock), config())
    }

    fn created() -> TaskEvent {
        TaskEvent::created(TaskId::new(), OwnerId::new("u"), Utc::now(), TaskSnapshot::new("t"))
    }

    async fn publish(bus: &InMemoryBus, event: &TaskEvent) {
        bus.publish(TASK_EVENTS_TOPIC, Codec::default().encode(event).unwrap())
            .await
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition within two seconds");
    }

    #[tokio::test]
    async fn test_handles_and_acks_every_partition() {
        let bus = InMemoryBus::new(4);
        let handler = Recorder::new(0, ErrorCode::InternalError);
        let shutdown = CancellationToken::new();
        let handle = runner(&bus, Arc::clone(&handler)).start(&shutdown);

        for _ in 0..10 {
            publish(&bus, &created()).await;
        }
        wait_until(|| handler.seen.lock().len() == 10).await;
        wait_until(|| bus.lag(TASK_EVENTS_TOPIC, "recorder") == 0).await;

        assert!(handle.shutdown_and_wait(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_ledger_skips_redelivered_duplicates() {
        let bus = InMemoryBus::new(1);
        let handler = Recorder::new(0, ErrorCode::InternalError);
        let ledger = IdempotencyLedger::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            Duration::from_secs(3600),
        );
        let shutdown = CancellationToken::new();
        let handle = runner(&bus, Arc::clone(&handler))
            .with_ledger(ledger)
            .start(&shutdown);

        let event = created();
        publish(&bus, &event).await;
        publish(&bus, &event).await;

        wait_until(|| handle.stats().processed() == 2).await;
        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(handle.stats().duplicates(), 1);
        shutdown.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let bus = InMemoryBus::new(1);
        let handler = Recorder::new(2, ErrorCode::StoreUnavailable);
        let shutdown = CancellationToken::new();
        let handle = runner(&bus, Arc::clone(&handler)).start(&shutdown);

        publish(&bus, &created()).await;
        wait_until(|| handler.seen.lock().len() == 1).await;
        assert_eq!(handle.stats().retries(), 2);
        assert_eq!(handle.stats().dead_lettered(), 0);
        handle.shutdown_and_wait(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_poison_and_malformed_records_are_dead_lettered() {
        let bus = InMemoryBus::new(1);
        let handler = Recorder::new(1, ErrorCode::InvalidRecurrenceRule);
        let shutdown = CancellationToken::new();
        let handle = runner(&bus, Arc::clone(&handler)).start(&shutdown);

        bus.publish(TASK_EVENTS_TOPIC, crate::events::BusRecord::new("k", b"garbage".to_vec()))
            .await
            .unwrap();
        publish(&bus, &created()).await;
        publish(&bus, &created()).await;

        wait_until(|| handle.stats().processed() == 3).await;
        assert_eq!(handle.stats().dead_lettered(), 2);
        assert_eq!(handle.stats().retries(), 0);
        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(bus.records(DEAD_LETTER_TOPIC).len(), 2);
        handle.shutdown_and_wait(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered() {
        let bus = InMemoryBus::new(1);
        let handler = Recorder::new(100, ErrorCode::TransientBusError);
        let shutdown = CancellationToken::new();
        let handle = runner(&bus, Arc::clone(&handler)).start(&shutdown);

        publish(&bus, &created()).await;
        wait_until(|| handle.stats().dead_lettered() == 1).await;
        assert_eq!(handle.stats().retries(), 3);
        handle.shutdown_and_wait(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_partitions() {
        let bus = InMemoryBus::new(2);
        let handler = Recorder::new(0, ErrorCode::InternalError);
        let shutdown = CancellationToken::new();
        let handle = runner(&bus, handler).start(&shutdown);

        wait_until(|| handle.stats().active_partitions() == 2).await;
        shutdown.cancel();
        handle.join().await;

        assert!(bus
            .subscribe(TASK_EVENTS_TOPIC, "recorder", PartitionAssignment::All)
            .await
            .is_ok());
    }
}
