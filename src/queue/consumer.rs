//! Single-flight queue consumer
//!
//! ```text
//! Idle ──run──▶ Consuming ──delivery──▶ Processing ──▶ Acking ──┐
//!                  ▲                                            │
//!                  └────────────────────────────────────────────┘
//! stop signal / queue closed ──▶ Stopped
//! ```
//!
//! A queue has at most one consumer and at most one message in flight. Every
//! delivery is acknowledged after
//! processing whatever the outcome; failures are logged with the payload and
//! counted, never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ConsumerClaim, Delivery, MessageQueue, QueueError, QueueResult};
use crate::engine::{Applied, SyncEngine};
use crate::error::Result;

/// Lifecycle state of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Processing,
    Acking,
    Stopped,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    acked: AtomicU64,
}

/// Counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages applied successfully
    pub processed: u64,
    /// Messages dropped after a failure
    pub failed: u64,
    pub acked: u64,
}

/// Applies queued mutations through the engine
pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    engine: Arc<SyncEngine>,
    state: watch::Sender<ConsumerState>,
    stats: Arc<ConsumerStats>,
    _claim: ConsumerClaim,
}

impl Consumer {
    /// Claim the queue; fails while another consumer holds it
    pub fn new(queue: Arc<dyn MessageQueue>, engine: Arc<SyncEngine>) -> QueueResult<Self> {
        let claim = queue.claim()?;
        let (state, _) = watch::channel(ConsumerState::Idle);
        Ok(Self {
            queue,
            engine,
            state,
            stats: Arc::new(ConsumerStats::default()),
            _claim: claim,
        })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        snapshot(&self.stats)
    }

    /// Parse and apply one delivery, without acknowledging it
    pub async fn process(&self, delivery: &Delivery) -> Result<Applied> {
        let message = plandoc::parse_message(&delivery.body)?;
        self.engine.apply(&message).await
    }

    /// Process every message currently queued, then return
    ///
    /// Returns the number of deliveries handled.
    pub async fn drain(&self) -> QueueResult<usize> {
        let mut handled = 0;
        self.state.send_replace(ConsumerState::Consuming);
        while let Some(delivery) = self.queue.try_next().await? {
            self.handle(delivery).await?;
            handled += 1;
            self.state.send_replace(ConsumerState::Consuming);
        }
        self.state.send_replace(ConsumerState::Idle);
        Ok(handled)
    }

    /// Consume until the stop signal flips to `true` or the queue closes
    ///
    /// A message already being processed finishes before the loop exits.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        tracing::info!(queue = %self.queue.name(), "Consumer started");
        self.state.send_replace(ConsumerState::Consuming);

        while !stop_requested(&stop) {
            let next = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.queue.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle(delivery).await {
                        tracing::error!(error = %e, "Failed to acknowledge delivery");
                    }
                    self.state.send_replace(ConsumerState::Consuming);
                }
                Ok(None) => {
                    tracing::info!(queue = %self.queue.name(), "Queue closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue unavailable, stopping consumer");
                    break;
                }
            }
        }

        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!(stats = ?self.stats(), "Consumer stopped");
    }

    /// Run on a spawned task
    pub fn spawn(self) -> ConsumerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let stats = self.stats.clone();
        let task = tokio::spawn(async move { self.run(stop_rx).await });
        ConsumerHandle {
            stop,
            state,
            stats,
            task,
        }
    }

    async fn handle(&self, delivery: Delivery) -> QueueResult<()> {
        self.state.send_replace(ConsumerState::Processing);
        match self.process(&delivery).await {
            Ok(applied) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(tag = delivery.tag, outcome = ?applied, "Processed message");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    tag = delivery.tag,
                    error = %e,
                    payload = %String::from_utf8_lossy(&delivery.body),
                    "Dropping message"
                );
            }
        }

        self.state.send_replace(ConsumerState::Acking);
        self.queue.ack(delivery.tag).await?;
        self.stats.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Handle to a consumer running on its own task
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<ConsumerState>,
    stats: Arc<ConsumerStats>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        snapshot(&self.stats)
    }

    /// Wait until the consumer reaches a state
    pub async fn wait_for(&mut self, state: ConsumerState) -> QueueResult<()> {
        self.state
            .wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| QueueError::Unavailable("consumer task ended".to_string()))
    }

    /// Signal stop and wait for the in-flight message to finish
    pub async fn stop(self) -> QueueResult<StatsSnapshot> {
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|e| QueueError::Unavailable(format!("consumer task failed: {}", e)))?;
        Ok(snapshot(&self.stats))
    }
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

fn snapshot(stats: &ConsumerStats) -> StatsSnapshot {
    StatsSnapshot {
        processed: stats.processed.load(Ordering::Relaxed),
        failed: stats.failed.load(Ordering::Relaxed),
        acked: stats.acked.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::queue::ChannelQueue;
    use crate::schema::PlanSchema;
    use crate::storage::{MemoryStore, PrimaryStore};
    use plandoc::QueueMessage;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, Arc<ChannelQueue>, Consumer) {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new("plans"));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            index,
            Arc::new(PlanSchema::builtin()),
        ));
        let queue = Arc::new(ChannelQueue::new("plans", 16));
        let consumer = Consumer::new(queue.clone(), engine).unwrap();
        (store, queue, consumer)
    }

    fn create(id: &str) -> Vec<u8> {
        let plan = json!({
            "objectId": id,
            "objectType": "plan",
            "planCostShares": {"objectId": format!("cs-{}", id), "objectType": "membercostshare"},
            "linkedPlanServices": []
        });
        QueueMessage::create(plan.as_object().cloned().unwrap())
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn test_drain_acks_everything() {
        let (store, queue, consumer) = setup();
        queue.publish(create("p1")).await.unwrap();
        queue.publish(b"{not json".to_vec()).await.unwrap();
        queue.publish(create("p1")).await.unwrap();

        assert_eq!(consumer.drain().await.unwrap(), 3);
        assert_eq!(
            consumer.stats(),
            StatsSnapshot { processed: 2, failed: 1, acked: 3 }
        );
        assert_eq!(queue.unacked(), 0);
        assert_eq!(consumer.state(), ConsumerState::Idle);
        assert!(store.exists("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_consumer_stops() {
        let (store, queue, consumer) = setup();
        let mut handle = consumer.spawn();
        handle.wait_for(ConsumerState::Consuming).await.unwrap();

        queue.publish(create("p1")).await.unwrap();
        queue.publish(create("p2")).await.unwrap();
        while handle.stats().acked < 2 {
            tokio::task::yield_now().await;
        }

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert!(store.exists("p2").await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_queue_stops_consumer() {
        let (_store, queue, consumer) = setup();
        queue.publish(create("p1")).await.unwrap();
        queue.close();

        let (_stop, stop_rx) = watch::channel(false);
        consumer.run(stop_rx).await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(consumer.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_one_consumer_per_queue() {
        let (store, queue, consumer) = setup();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            Arc::new(MemoryIndex::new("plans")),
            Arc::new(PlanSchema::builtin()),
        ));
        assert!(matches!(
            Consumer::new(queue.clone(), engine.clone()),
            Err(QueueError::ConsumerActive(_))
        ));

        // The claim moves with the consumer onto its task and ends with it
        let handle = consumer.spawn();
        assert!(Consumer::new(queue.clone(), engine.clone()).is_err());
        handle.stop().await.unwrap();
        assert!(!queue.is_claimed());
        assert!(Consumer::new(queue, engine).is_ok());
    }
}
