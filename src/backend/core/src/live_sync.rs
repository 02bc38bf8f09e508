//! Live-sync broadcaster.
//!
//! Fans task events out to connected viewers, one broadcast channel per
//! owner. Delivery is best effort: no ledger, no retry, and a viewer that
//! falls behind the channel capacity skips what it missed and reconciles
//! through the request-serving API.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consumer::{EventHandler, HandleOutcome, HandlerContext};
use crate::error::Result;
use crate::events::{OwnerId, TaskEvent};
use crate::telemetry::LifecycleMetrics;

/// Consumer name of the broadcaster.
pub const LIVE_SYNC_CONSUMER: &str = "live-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSyncConfig {
    /// Per-owner channel capacity; slower viewers skip ahead
    pub capacity: usize,
    /// How often channels without viewers are dropped
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for LiveSyncConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Broadcaster counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveSyncStats {
    pub channels: usize,
    pub viewers: usize,
    /// Events handed to at least one viewer
    pub broadcasts: u64,
    /// Sum of viewers reached over all broadcasts
    pub delivered: u64,
    /// Events for owners nobody was watching
    pub unobserved: u64,
    /// Updates viewers skipped by lagging
    pub lagged: u64,
}

/// Stream of task events for one owner. Dropping it disconnects the viewer.
pub struct ViewerStream {
    owner_id: OwnerId,
    inner: BroadcastStream<Arc<TaskEvent>>,
    lagged: Arc<AtomicU64>,
}

impl ViewerStream {
    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }
}

impl Stream for ViewerStream {
    type Item = Arc<TaskEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    this.lagged.fetch_add(missed, Ordering::Relaxed);
                    LifecycleMetrics::live_updates_dropped(missed);
                    debug!(owner = %this.owner_id, missed, "Viewer lagged; skipping missed updates");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Registry of per-owner broadcast channels.
pub struct LiveSyncBroadcaster {
    channels: DashMap<OwnerId, broadcast::Sender<Arc<TaskEvent>>>,
    capacity: usize,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    unobserved: AtomicU64,
    lagged: Arc<AtomicU64>,
}

impl LiveSyncBroadcaster {
    pub fn new(config: &LiveSyncConfig) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: config.capacity.max(1),
            broadcasts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start watching an owner's tasks.
    pub fn subscribe(&self, owner_id: OwnerId) -> ViewerStream {
        let receiver = self
            .channels
            .entry(owner_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        LifecycleMetrics::set_live_viewers(self.total_viewers());
        debug!(owner = %owner_id, "Viewer subscribed");

        ViewerStream {
            owner_id,
            inner: BroadcastStream::new(receiver),
            lagged: Arc::clone(&self.lagged),
        }
    }

    /// Send an event to the owner's viewers. Returns how many were reached.
    pub fn broadcast(&self, event: TaskEvent) -> usize {
        let Some(sender) = self.channels.get(&event.owner_id).map(|s| s.value().clone()) else {
            self.unobserved.fetch_add(1, Ordering::Relaxed);
            return 0;
        };

        match sender.send(Arc::new(event)) {
            Ok(reached) => {
                self.broadcasts.fetch_add(1, Ordering::Relaxed);
                self.delivered.fetch_add(reached as u64, Ordering::Relaxed);
                reached
            }
            Err(_) => {
                // Every viewer left since the last prune.
                self.unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn viewer_count(&self, owner_id: &OwnerId) -> usize {
        self.channels
            .get(owner_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn total_viewers(&self) -> usize {
        self.channels.iter().map(|entry| entry.receiver_count()).sum()
    }

    /// Drop channels nobody is watching. Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|owner_id, sender| {
            let keep = sender.receiver_count() > 0;
            if !keep {
                debug!(owner = %owner_id, "Removing idle live-sync channel");
            }
            keep
        });
        LifecycleMetrics::set_live_viewers(self.total_viewers());
        before.saturating_sub(self.channels.len())
    }

    pub fn stats(&self) -> LiveSyncStats {
        LiveSyncStats {
            channels: self.channels.len(),
            viewers: self.total_viewers(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            unobserved: self.unobserved.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }

    /// Periodically prune idle channels until `shutdown` is cancelled.
    pub fn start_pruner(self: Arc<Self>, interval: Duration, shutdown: &CancellationToken) -> JoinHandle<()> {
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = self.prune_idle();
                        if pruned > 0 {
                            debug!(pruned, "Pruned idle live-sync channels");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl EventHandler for LiveSyncBroadcaster {
    type Event = TaskEvent;

    fn name(&self) -> &str {
        LIVE_SYNC_CONSUMER
    }

    async fn handle(&self, event: &TaskEvent, _ctx: &HandlerContext) -> Result<HandleOutcome> {
        Ok(if self.broadcast(event.clone()) > 0 {
            HandleOutcome::Applied
        } else {
            HandleOutcome::Ignored
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TaskId, TaskSnapshot};
    use chrono::Utc;
    use futures::StreamExt;

    fn event(owner: &str) -> TaskEvent {
        TaskEvent::created(TaskId::new(), OwnerId::new(owner), Utc::now(), TaskSnapshot::new("t"))
    }

    #[tokio::test]
    async fn test_viewers_receive_only_their_owner() {
        let live = LiveSyncBroadcaster::new(&LiveSyncConfig::default());
        let mut alice = live.subscribe(OwnerId::new("alice"));
        let mut bob = live.subscribe(OwnerId::new("bob"));

        let sent = event("alice");
        assert_eq!(live.broadcast(sent.clone()), 1);

        let received = alice.next().await.unwrap();
        assert_eq!(received.event_id, sent.event_id);

        let nothing = tokio::time::timeout(Duration::from_millis(20), bob.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_lagging_viewer_skips_missed_updates() {
        let live = LiveSyncBroadcaster::new(&LiveSyncConfig {
            capacity: 2,
            ..LiveSyncConfig::default()
        });
        let mut viewer = live.subscribe(OwnerId::new("o"));

        let events: Vec<TaskEvent> = (0..5).map(|_| event("o")).collect();
        for e in &events {
            live.broadcast(e.clone());
        }

        let first = viewer.next().await.unwrap();
        assert_eq!(first.event_id, events[3].event_id);
        assert_eq!(viewer.next().await.unwrap().event_id, events[4].event_id);
        assert_eq!(live.stats().lagged, 3);
    }

    #[tokio::test]
    async fn test_dropped_viewers_are_pruned() {
        let live = LiveSyncBroadcaster::new(&LiveSyncConfig::default());
        let owner = OwnerId::new("o");
        let a = live.subscribe(owner.clone());
        let b = live.subscribe(owner.clone());
        assert_eq!(live.viewer_count(&owner), 2);

        drop(a);
        assert_eq!(live.viewer_count(&owner), 1);
        assert_eq!(live.prune_idle(), 0);

        drop(b);
        assert_eq!(live.viewer_count(&owner), 0);
        assert_eq!(live.prune_idle(), 1);
        assert_eq!(live.stats().channels, 0);
    }

    #[tokio::test]
    async fn test_unwatched_owner_is_not_an_error() {
        let live = LiveSyncBroadcaster::new(&LiveSyncConfig::default());
        let ctx = HandlerContext {
            consumer: LIVE_SYNC_CONSUMER.into(),
            partition: 0,
            offset: 0,
            redelivered: false,
            retry: 0,
            deadline: crate::deadline::Deadline::after(Duration::from_secs(1)),
        };
        let outcome = live.handle(&event("nobody"), &ctx).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Ignored);
        assert_eq!(live.stats().unobserved, 1);
    }
}
