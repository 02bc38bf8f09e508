//! Typed publishing with bounded retry.

use std::sync::Arc;

use super::{EventBus, PublishAck};
use crate::deadline::Deadline;
use crate::error::Result;
use crate::events::{Codec, DomainEvent};
use crate::retry::RetryPolicy;
use crate::telemetry::BusMetrics;

/// Encodes domain events and publishes them to their topic.
///
/// `TransientBusError` is retried with backoff until the policy or the
/// deadline runs out; `FatalBusError` is returned immediately.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    codec: Codec,
    retry: RetryPolicy,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, codec: Codec, retry: RetryPolicy) -> Self {
        Self { bus, codec, retry }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub async fn publish<E: DomainEvent>(&self, event: &E, deadline: &Deadline) -> Result<PublishAck> {
        let record = self.codec.encode(event)?;
        let topic = E::TOPIC;
        let event_id = event.event_id();

        let mut attempts = 0u32;
        let ack = deadline
            .run(
                "bus.publish",
                self.retry.run("bus.publish", || {
                    attempts += 1;
                    if attempts > 1 {
                        BusMetrics::publish_retry(topic);
                    }
                    self.bus.publish(topic, record.clone())
                }),
            )
            .await?;

        BusMetrics::published(topic);
        tracing::debug!(
            topic = %topic,
            event_id = %event_id,
            partition = ack.partition,
            offset = ack.offset,
            attempts,
            "Event published"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::error::ErrorCode;
    use crate::events::{OwnerId, TaskEvent, TaskId, TaskSnapshot, TASK_EVENTS_TOPIC};
    use chrono::Utc;
    use std::time::Duration;

    fn event() -> TaskEvent {
        TaskEvent::created(TaskId::new(), OwnerId::new("u"), Utc::now(), TaskSnapshot::new("t"))
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let bus = InMemoryBus::new(4);
        bus.fail_next_publishes(2);
        let publisher = EventPublisher::new(Arc::new(bus.clone()), Codec::default(), RetryPolicy::immediate(3));

        let ack = publisher
            .publish(&event(), &Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(ack.topic, TASK_EVENTS_TOPIC);
        assert_eq!(bus.records(TASK_EVENTS_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_surfaces_exhausted_retries() {
        let bus = InMemoryBus::new(1);
        bus.fail_next_publishes(10);
        let publisher = EventPublisher::new(Arc::new(bus), Codec::default(), RetryPolicy::immediate(1));

        let err = publisher
            .publish(&event(), &Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransientBusError);
    }
}
