//! An in-process partitioned log and a [`LogConsumer`] over it.
//!
//! Backs the test suites and local recovery drills with the same semantics
//! the Kafka client provides: offset-addressed partitions, seekable cursors,
//! committed state persisted under the consumer id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::consumer::client::{LogConsumer, Record};
use crate::error::{SpoutError, SpoutResult};
use crate::message::{ConsumerState, TopicPartition, VirtualConsumerId};
use crate::persistence::PersistenceAdapter;

/// An append-only, offset-addressed topic store shared by any number of
/// consumers.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    partitions: RwLock<HashMap<TopicPartition, Vec<Record>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record at an explicit offset. Offsets within a partition must
    /// be appended in ascending order.
    pub fn produce_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) {
        let tp = TopicPartition::new(topic, partition);
        let mut partitions = self.partitions.write();
        let records = partitions.entry(tp).or_default();
        debug_assert!(
            records.last().map(|last| last.offset < offset).unwrap_or(true),
            "offsets must be appended in ascending order"
        );
        records.push(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(<[u8]>::to_vec),
            value: value.map(<[u8]>::to_vec),
        });
    }

    /// Append a record at the next offset of the partition.
    pub fn produce(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: Option<&[u8]>) {
        let next = self
            .partitions
            .read()
            .get(&TopicPartition::new(topic, partition))
            .and_then(|records| records.last())
            .map(|record| record.offset + 1)
            .unwrap_or(0);
        self.produce_at(topic, partition, next, key, value);
    }

    /// Ensure a partition exists even if empty.
    pub fn create_partition(&self, topic: &str, partition: i32) {
        self.partitions
            .write()
            .entry(TopicPartition::new(topic, partition))
            .or_default();
    }

    /// Partitions known for `topic`.
    pub fn partitions_for(&self, topic: &str) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self
            .partitions
            .read()
            .keys()
            .filter(|tp| tp.topic == topic)
            .cloned()
            .collect();
        partitions.sort();
        partitions
    }

    /// First record of the partition at or after `offset`.
    fn read_from(&self, tp: &TopicPartition, offset: i64) -> Option<Record> {
        let partitions = self.partitions.read();
        let records = partitions.get(tp)?;
        let index = records.partition_point(|record| record.offset < offset);
        records.get(index).cloned()
    }

    /// Offset of the first record in the partition, if any.
    fn earliest_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions
            .read()
            .get(tp)
            .and_then(|records| records.first())
            .map(|record| record.offset)
    }
}

/// [`LogConsumer`] over an [`InMemoryLog`].
#[derive(Debug)]
pub struct InMemoryLogConsumer {
    log: Arc<InMemoryLog>,
    consumer_id: VirtualConsumerId,
    persistence: Arc<dyn PersistenceAdapter>,
    topic: String,
    assignment: BTreeSet<TopicPartition>,
    /// Next offset to read, per assigned partition.
    positions: HashMap<TopicPartition, i64>,
    /// Where each partition started, for state reporting before any commit.
    starting_positions: HashMap<TopicPartition, i64>,
    /// Last reported commit point, per partition.
    commit_points: BTreeMap<TopicPartition, i64>,
    /// Round-robin cursor over the assignment.
    cursor: usize,
    opened: bool,
    closed: bool,
}

impl InMemoryLogConsumer {
    pub fn new(
        log: Arc<InMemoryLog>,
        topic: impl Into<String>,
        consumer_id: VirtualConsumerId,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self {
            log,
            consumer_id,
            persistence,
            topic: topic.into(),
            assignment: BTreeSet::new(),
            positions: HashMap::new(),
            starting_positions: HashMap::new(),
            commit_points: BTreeMap::new(),
            cursor: 0,
            opened: false,
            closed: false,
        }
    }
}

#[async_trait]
impl LogConsumer for InMemoryLogConsumer {
    async fn open(&mut self, starting_state: Option<&ConsumerState>) -> SpoutResult<()> {
        if self.opened {
            return Err(SpoutError::IllegalState(
                "log consumer already opened".to_string(),
            ));
        }
        let persisted = self
            .persistence
            .retrieve_consumer_state(&self.consumer_id)?
            .filter(|state| !state.is_empty());

        for tp in self.log.partitions_for(&self.topic) {
            let position = persisted
                .as_ref()
                .and_then(|state| state.offset(&tp))
                .or_else(|| starting_state.and_then(|state| state.offset(&tp)))
                .or_else(|| self.log.earliest_offset(&tp))
                .unwrap_or(0);
            self.positions.insert(tp.clone(), position);
            self.starting_positions.insert(tp.clone(), position);
            self.assignment.insert(tp);
        }
        self.opened = true;
        Ok(())
    }

    async fn next_record(&mut self) -> SpoutResult<Option<Record>> {
        if self.assignment.is_empty() {
            return Ok(None);
        }
        let assigned: Vec<TopicPartition> = self.assignment.iter().cloned().collect();
        for step in 0..assigned.len() {
            let tp = &assigned[(self.cursor + step) % assigned.len()];
            let position = self.positions.get(tp).copied().unwrap_or(0);
            if let Some(record) = self.log.read_from(tp, position) {
                self.positions.insert(tp.clone(), record.offset + 1);
                self.cursor = (self.cursor + step + 1) % assigned.len();
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn commit_offset(&mut self, tp: &TopicPartition, offset: i64) {
        self.commit_points.insert(tp.clone(), offset);
    }

    async fn flush_state(&mut self) -> SpoutResult<ConsumerState> {
        let state = self.current_state();
        self.persistence
            .persist_consumer_state(&self.consumer_id, &state)?;
        Ok(state)
    }

    fn current_state(&self) -> ConsumerState {
        let mut builder = ConsumerState::builder();
        for tp in &self.assignment {
            // Committed offsets only; an unacked read does not move the state.
            let offset = self
                .commit_points
                .get(tp)
                .copied()
                .or_else(|| self.starting_positions.get(tp).copied())
                .unwrap_or(0);
            builder = builder.with_partition(tp.clone(), offset);
        }
        // Partitions already unsubscribed keep their final commit point.
        for (tp, offset) in &self.commit_points {
            if !self.assignment.contains(tp) {
                builder = builder.with_partition(tp.clone(), *offset);
            }
        }
        builder.build()
    }

    async fn remove_state(&mut self) -> SpoutResult<()> {
        self.persistence.clear_consumer_state(&self.consumer_id)?;
        Ok(())
    }

    fn unsubscribe_partition(&mut self, tp: &TopicPartition) -> bool {
        self.assignment.remove(tp)
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.iter().cloned().collect()
    }

    async fn close(&mut self) -> SpoutResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        Ok(())
    }
}
