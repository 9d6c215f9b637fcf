//! Bounded buffers between virtual consumer workers and the pull interface.
//!
//! Producers are worker tasks (many); the consumer is the coordinator poller
//! (one). `put` blocks on capacity and is the backpressure edge of the whole
//! engine; `poll` never blocks.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{SpoutError, SpoutResult};
use crate::message::{Message, VirtualConsumerId};

/// Multi-producer single-consumer bounded message queue over named producers.
#[async_trait]
pub trait MessageBuffer: Send + Sync + fmt::Debug {
    /// Announce a producer. Implementations may ignore this and create
    /// sub-queues lazily on `put`.
    fn register_producer(&self, id: VirtualConsumerId);

    /// Remove a producer and its queued messages.
    fn deregister_producer(&self, id: &VirtualConsumerId);

    /// Enqueue a message, blocking while the target queue is at capacity.
    async fn put(&self, message: Message) -> SpoutResult<()>;

    /// Dequeue the next message, never blocking.
    fn poll(&self) -> Option<Message>;

    /// Total messages currently buffered.
    fn size(&self) -> usize;
}

/// A single bounded queue shared by all producers; strict insertion order.
///
/// Simple, but a chatty producer can starve the others.
pub struct FifoBuffer {
    queue: Mutex<VecDeque<Message>>,
    capacity: Semaphore,
}

impl FifoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Semaphore::new(capacity),
        }
    }
}

impl fmt::Debug for FifoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoBuffer")
            .field("size", &self.queue.lock().len())
            .finish()
    }
}

#[async_trait]
impl MessageBuffer for FifoBuffer {
    fn register_producer(&self, _id: VirtualConsumerId) {}

    fn deregister_producer(&self, _id: &VirtualConsumerId) {}

    async fn put(&self, message: Message) -> SpoutResult<()> {
        let permit = self
            .capacity
            .acquire()
            .await
            .map_err(|_| SpoutError::Channel("buffer closed".to_string()))?;
        permit.forget();
        self.queue.lock().push_back(message);
        Ok(())
    }

    fn poll(&self) -> Option<Message> {
        let message = self.queue.lock().pop_front()?;
        self.capacity.add_permits(1);
        Some(message)
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }
}

struct SubQueue {
    queue: Mutex<VecDeque<Message>>,
    capacity: Semaphore,
}

impl SubQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Semaphore::new(capacity),
        }
    }
}

/// One bounded sub-queue per producer, drained round-robin.
///
/// The poll cursor advances by one position per call so no producer can
/// monopolize the pull interface. The configured capacity applies per
/// sub-queue. Producers appearing or disappearing between polls only affect
/// the snapshot taken by the next poll.
pub struct RoundRobinBuffer {
    capacity_per_producer: usize,
    queues: RwLock<HashMap<VirtualConsumerId, Arc<SubQueue>>>,
    keys: RwLock<Vec<VirtualConsumerId>>,
    cursor: AtomicUsize,
}

impl RoundRobinBuffer {
    pub fn new(capacity_per_producer: usize) -> Self {
        Self {
            capacity_per_producer,
            queues: RwLock::new(HashMap::new()),
            keys: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    fn queue_for(&self, id: &VirtualConsumerId) -> Arc<SubQueue> {
        if let Some(queue) = self.queues.read().get(id) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write();
        // Re-check under the write lock; another producer may have won.
        if let Some(queue) = queues.get(id) {
            return Arc::clone(queue);
        }
        let queue = Arc::new(SubQueue::new(self.capacity_per_producer));
        queues.insert(id.clone(), Arc::clone(&queue));
        self.keys.write().push(id.clone());
        queue
    }
}

impl fmt::Debug for RoundRobinBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinBuffer")
            .field("producers", &self.keys.read().len())
            .field("size", &self.size())
            .finish()
    }
}

#[async_trait]
impl MessageBuffer for RoundRobinBuffer {
    fn register_producer(&self, id: VirtualConsumerId) {
        self.queue_for(&id);
    }

    fn deregister_producer(&self, id: &VirtualConsumerId) {
        let removed = self.queues.write().remove(id);
        self.keys.write().retain(|key| key != id);
        if let Some(queue) = removed {
            let remaining = queue.queue.lock().len();
            if remaining > 0 {
                warn!(%id, remaining, "dropping buffered messages for removed producer");
            }
        }
    }

    async fn put(&self, message: Message) -> SpoutResult<()> {
        let queue = self.queue_for(&message.id().src_consumer_id);
        let permit = queue
            .capacity
            .acquire()
            .await
            .map_err(|_| SpoutError::Channel("buffer closed".to_string()))?;
        permit.forget();
        queue.queue.lock().push_back(message);
        Ok(())
    }

    fn poll(&self) -> Option<Message> {
        let keys = self.keys.read().clone();
        if keys.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for step in 0..keys.len() {
            let key = &keys[(start + step) % keys.len()];
            let Some(queue) = self.queues.read().get(key).cloned() else {
                continue;
            };
            let popped = queue.queue.lock().pop_front();
            if let Some(message) = popped {
                queue.capacity.add_permits(1);
                return Some(message);
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.queues
            .read()
            .values()
            .map(|queue| queue.queue.lock().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use serde_json::json;
    use std::time::Duration;

    fn message(producer: &str, offset: i64) -> Message {
        Message::new(
            MessageId::new("topic", 0, offset, VirtualConsumerId::from(producer)),
            vec![json!(offset)],
        )
    }

    #[tokio::test]
    async fn fifo_preserves_insertion_order() {
        let buffer = FifoBuffer::new(16);
        buffer.put(message("a", 1)).await.unwrap();
        buffer.put(message("b", 2)).await.unwrap();
        buffer.put(message("a", 3)).await.unwrap();

        assert_eq!(buffer.size(), 3);
        assert_eq!(buffer.poll().unwrap().offset(), 1);
        assert_eq!(buffer.poll().unwrap().offset(), 2);
        assert_eq!(buffer.poll().unwrap().offset(), 3);
        assert!(buffer.poll().is_none());
    }

    #[tokio::test]
    async fn fifo_put_blocks_at_capacity() {
        let buffer = Arc::new(FifoBuffer::new(1));
        buffer.put(message("a", 1)).await.unwrap();

        let blocked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.put(message("a", 2)).await })
        };

        // The second put cannot complete until something is polled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(buffer.poll().unwrap().offset(), 1);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("put should unblock")
            .unwrap()
            .unwrap();
        assert_eq!(buffer.poll().unwrap().offset(), 2);
    }

    #[tokio::test]
    async fn round_robin_alternates_between_producers() {
        let buffer = RoundRobinBuffer::new(16);
        buffer.put(message("a", 1)).await.unwrap();
        buffer.put(message("a", 2)).await.unwrap();
        buffer.put(message("b", 10)).await.unwrap();
        buffer.put(message("b", 11)).await.unwrap();

        let drained: Vec<(String, i64)> = std::iter::from_fn(|| buffer.poll())
            .map(|m| (m.id().src_consumer_id.to_string(), m.offset()))
            .collect();

        assert_eq!(drained.len(), 4);
        // Each producer's messages stay in order.
        let a: Vec<i64> = drained.iter().filter(|(p, _)| p == "a").map(|(_, o)| *o).collect();
        let b: Vec<i64> = drained.iter().filter(|(p, _)| p == "b").map(|(_, o)| *o).collect();
        assert_eq!(a, vec![1, 2]);
        assert_eq!(b, vec![10, 11]);
        // And the cursor interleaves them rather than draining one first.
        assert_ne!(drained[0].0, drained[1].0);
    }

    #[tokio::test]
    async fn round_robin_capacity_is_per_producer() {
        let buffer = Arc::new(RoundRobinBuffer::new(1));
        buffer.put(message("a", 1)).await.unwrap();
        // A different producer is not blocked by a's full queue.
        tokio::time::timeout(Duration::from_millis(100), buffer.put(message("b", 2)))
            .await
            .expect("b must not block")
            .unwrap();

        let blocked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.put(message("a", 3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        while buffer.poll().is_some() {}
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("put should unblock")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn round_robin_survives_producer_removal_between_polls() {
        let buffer = RoundRobinBuffer::new(8);
        buffer.put(message("a", 1)).await.unwrap();
        buffer.put(message("b", 2)).await.unwrap();

        buffer.deregister_producer(&VirtualConsumerId::from("a"));

        let mut seen = Vec::new();
        while let Some(m) = buffer.poll() {
            seen.push(m.offset());
        }
        assert_eq!(seen, vec![2]);
        assert_eq!(buffer.size(), 0);
    }

    #[tokio::test]
    async fn round_robin_poll_on_empty_returns_none() {
        let buffer = RoundRobinBuffer::new(8);
        assert!(buffer.poll().is_none());
        buffer.register_producer(VirtualConsumerId::from("a"));
        assert!(buffer.poll().is_none());
    }
}
