//! The boundary to the underlying partitioned log.

use async_trait::async_trait;

use crate::error::SpoutResult;
use crate::message::{ConsumerState, TopicPartition};

/// One raw record read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A client over the external log, scoped to one virtual consumer.
///
/// Provides poll/seek/commit/assign primitives and owns the committed state:
/// commits are buffered via [`LogConsumer::commit_offset`] and made durable by
/// [`LogConsumer::flush_state`]. Implementations persist committed offsets
/// under the owning consumer's id so a restarted consumer resumes where the
/// previous incarnation left off.
#[async_trait]
pub trait LogConsumer: Send {
    /// Connect and position the consumer.
    ///
    /// Starting offsets resolve in order: previously persisted state for this
    /// consumer id, then `starting_state`, then the log's default position.
    async fn open(&mut self, starting_state: Option<&ConsumerState>) -> SpoutResult<()>;

    /// Read the next record, non-blocking. `None` when nothing is available.
    async fn next_record(&mut self) -> SpoutResult<Option<Record>>;

    /// Record a new commit point for a partition. Buffered until flush.
    fn commit_offset(&mut self, tp: &TopicPartition, offset: i64);

    /// Make buffered commit points durable and return the committed state.
    async fn flush_state(&mut self) -> SpoutResult<ConsumerState>;

    /// The committed state: last reported commit points, not the in-flight
    /// leading edge.
    fn current_state(&self) -> ConsumerState;

    /// Remove all persisted offsets for this consumer id.
    async fn remove_state(&mut self) -> SpoutResult<()>;

    /// Stop consuming a partition. Returns whether it was assigned.
    fn unsubscribe_partition(&mut self, tp: &TopicPartition) -> bool;

    /// Partitions currently assigned.
    fn assignment(&self) -> Vec<TopicPartition>;

    /// Release the connection. Idempotent.
    async fn close(&mut self) -> SpoutResult<()>;
}
