//! Mutation queue
//!
//! Request handlers publish mutations here; a single [`Consumer`] applies
//! them one at a time. Deliveries carry a tag that must be acknowledged once
//! the consumer is done with them.
//!
//! A consumer holds the queue's [`ConsumerClaim`] for as long as it exists,
//! so a second consumer on the same queue is refused rather than interleaved.

pub mod consumer;

pub use consumer::{Consumer, ConsumerHandle, ConsumerState, StatsSnapshot};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a queue adapter
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Delivery {0} is not awaiting acknowledgement")]
    UnknownDelivery(u64),

    #[error("Queue '{0}' already has a consumer")]
    ConsumerActive(String),

    #[error("{0}")]
    Unavailable(String),
}

/// Result type alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// A message handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Exclusive right to consume from a queue, released on drop
#[derive(Debug)]
pub struct ConsumerClaim {
    held: Arc<AtomicBool>,
}

impl ConsumerClaim {
    /// Take the claim behind `flag`, failing if someone already holds it
    pub fn acquire(flag: &Arc<AtomicBool>, queue: &str) -> QueueResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| QueueError::ConsumerActive(queue.to_string()))?;
        Ok(Self { held: flag.clone() })
    }
}

impl Drop for ConsumerClaim {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Durable-style work queue with explicit acknowledgement
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Publish a message body
    async fn publish(&self, body: Vec<u8>) -> QueueResult<()>;

    /// Wait for the next delivery; `None` once the queue is closed and drained
    async fn next(&self) -> QueueResult<Option<Delivery>>;

    /// Take the next delivery if one is ready
    async fn try_next(&self) -> QueueResult<Option<Delivery>>;

    /// Acknowledge a delivery
    async fn ack(&self, tag: u64) -> QueueResult<()>;

    /// Become the queue's only consumer
    fn claim(&self) -> QueueResult<ConsumerClaim>;
}

/// In-process queue over a bounded tokio channel
pub struct ChannelQueue {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    next_tag: AtomicU64,
    unacked: Mutex<BTreeSet<u64>>,
    acked: AtomicU64,
    claimed: Arc<AtomicBool>,
}

impl ChannelQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(BTreeSet::new()),
            acked: AtomicU64::new(0),
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a consumer currently owns this queue
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Stop accepting messages; already queued ones are still delivered
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    /// Deliveries handed out but not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.unacked.lock().map(|u| u.len()).unwrap_or(0)
    }

    /// Total acknowledged deliveries
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    fn deliver(&self, body: Vec<u8>) -> QueueResult<Delivery> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.unacked
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))?
            .insert(tag);
        Ok(Delivery { tag, body })
    }
}

#[async_trait]
impl MessageQueue for ChannelQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: Vec<u8>) -> QueueResult<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;
        sender
            .send(body)
            .await
            .map_err(|_| QueueError::Closed(self.name.clone()))?;
        tracing::debug!(queue = %self.name, "Published message");
        Ok(())
    }

    async fn next(&self) -> QueueResult<Option<Delivery>> {
        let body = self.receiver.lock().await.recv().await;
        body.map(|b| self.deliver(b)).transpose()
    }

    async fn try_next(&self) -> QueueResult<Option<Delivery>> {
        // A receiver parked in `next` holds the lock; nothing is ready for us
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return Ok(None);
        };
        match receiver.try_recv() {
            Ok(body) => self.deliver(body).map(Some),
            Err(mpsc::error::TryRecvError::Empty) | Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
        }
    }

    async fn ack(&self, tag: u64) -> QueueResult<()> {
        let removed = self
            .unacked
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))?
            .remove(&tag);
        if !removed {
            return Err(QueueError::UnknownDelivery(tag));
        }
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn claim(&self) -> QueueResult<ConsumerClaim> {
        ConsumerClaim::acquire(&self.claimed, &self.name)
    }
}
