//! Kafka-backed [`LogConsumer`] over an rdkafka `StreamConsumer`.
//!
//! Partitions are assigned manually with explicit start offsets; group
//! rebalancing stays out of the picture so a virtual consumer's assignment is
//! exactly what its state says. Committed state lives in the persistence
//! adapter (the source of truth for resume) and is mirrored to the broker for
//! lag tooling.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::KafkaSourceConfig;
use crate::consumer::client::{LogConsumer, Record};
use crate::error::{SpoutError, SpoutResult};
use crate::message::{ConsumerState, TopicPartition, VirtualConsumerId};
use crate::persistence::PersistenceAdapter;

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// [`LogConsumer`] implementation over Kafka.
pub struct KafkaLogConsumer {
    config: KafkaSourceConfig,
    consumer_id: VirtualConsumerId,
    persistence: Arc<dyn PersistenceAdapter>,
    consumer: Option<StreamConsumer>,
    assignment: BTreeSet<TopicPartition>,
    /// Next offset expected per assigned partition.
    positions: HashMap<TopicPartition, i64>,
    /// Where each partition started, for state reporting before any commit.
    starting_positions: HashMap<TopicPartition, i64>,
    /// Last reported commit point per partition.
    commit_points: BTreeMap<TopicPartition, i64>,
    poll_timeout: Duration,
    opened: bool,
}

impl fmt::Debug for KafkaLogConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaLogConsumer")
            .field("consumer_id", &self.consumer_id)
            .field("topic", &self.config.topic)
            .field("assignment", &self.assignment)
            .finish()
    }
}

impl KafkaLogConsumer {
    pub fn new(
        config: KafkaSourceConfig,
        consumer_id: VirtualConsumerId,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self {
            config,
            consumer_id,
            persistence,
            consumer: None,
            assignment: BTreeSet::new(),
            positions: HashMap::new(),
            starting_positions: HashMap::new(),
            commit_points: BTreeMap::new(),
            poll_timeout: Duration::from_millis(100),
            opened: false,
        }
    }

    fn consumer(&self) -> SpoutResult<&StreamConsumer> {
        self.consumer
            .as_ref()
            .ok_or_else(|| SpoutError::IllegalState("log consumer is not open".to_string()))
    }

    fn assignment_list(&self) -> SpoutResult<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        for tp in &self.assignment {
            let offset = self
                .positions
                .get(tp)
                .map(|position| Offset::Offset(*position))
                .unwrap_or(Offset::Beginning);
            tpl.add_partition_offset(&tp.topic, tp.partition, offset)?;
        }
        Ok(tpl)
    }
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    async fn open(&mut self, starting_state: Option<&ConsumerState>) -> SpoutResult<()> {
        if self.opened {
            return Err(SpoutError::IllegalState(
                "log consumer already opened".to_string(),
            ));
        }

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", self.consumer_id.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest");
        for (key, value) in &self.config.properties {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer = client_config.create()?;

        let metadata = consumer.fetch_metadata(Some(&self.config.topic), METADATA_TIMEOUT)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == self.config.topic)
            .ok_or_else(|| {
                SpoutError::LogConsumer(format!("topic {} not found", self.config.topic))
            })?;

        let persisted = self
            .persistence
            .retrieve_consumer_state(&self.consumer_id)?
            .filter(|state| !state.is_empty());

        let mut tpl = TopicPartitionList::new();
        for partition in topic_metadata.partitions() {
            let tp = TopicPartition::new(self.config.topic.clone(), partition.id());
            let start = persisted
                .as_ref()
                .and_then(|state| state.offset(&tp))
                .or_else(|| starting_state.and_then(|state| state.offset(&tp)));
            match start {
                Some(offset) => {
                    tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(offset))?;
                    self.positions.insert(tp.clone(), offset);
                    self.starting_positions.insert(tp.clone(), offset);
                }
                None => {
                    tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Beginning)?;
                }
            }
            self.assignment.insert(tp);
        }
        consumer.assign(&tpl)?;

        info!(
            consumer_id = %self.consumer_id,
            topic = %self.config.topic,
            partitions = self.assignment.len(),
            "opened kafka log consumer"
        );

        self.consumer = Some(consumer);
        self.opened = true;
        Ok(())
    }

    async fn next_record(&mut self) -> SpoutResult<Option<Record>> {
        if self.assignment.is_empty() {
            return Ok(None);
        }
        let record = {
            let consumer = self.consumer()?;
            let message = match tokio::time::timeout(self.poll_timeout, consumer.recv()).await {
                Err(_) => return Ok(None),
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(message)) => message,
            };
            Record {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                value: message.payload().map(<[u8]>::to_vec),
            }
        };

        let tp = record.topic_partition();
        if !self.assignment.contains(&tp) {
            // A fetch buffered before an unsubscribe can still surface here.
            debug!(%tp, offset = record.offset, "dropping record from unassigned partition");
            return Ok(None);
        }
        self.positions.insert(tp, record.offset + 1);
        Ok(Some(record))
    }

    fn commit_offset(&mut self, tp: &TopicPartition, offset: i64) {
        self.commit_points.insert(tp.clone(), offset);
    }

    async fn flush_state(&mut self) -> SpoutResult<ConsumerState> {
        let state = self.current_state();
        self.persistence
            .persist_consumer_state(&self.consumer_id, &state)?;

        if !self.commit_points.is_empty() {
            // Kafka commits name the next offset to read.
            let mut tpl = TopicPartitionList::new();
            for (tp, offset) in &self.commit_points {
                tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(offset + 1))?;
            }
            if let Err(err) = self.consumer()?.commit(&tpl, CommitMode::Sync) {
                // The adapter already has the state; the broker mirror is best effort.
                warn!(consumer_id = %self.consumer_id, %err, "broker offset commit failed");
            }
        }
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
        if !self.assignment.remove(tp) {
            return false;
        }
        match self
            .assignment_list()
            .and_then(|tpl| self.consumer()?.assign(&tpl).map_err(SpoutError::from))
        {
            Ok(()) => true,
            Err(err) => {
                warn!(consumer_id = %self.consumer_id, %tp, %err, "failed to shrink assignment");
                true
            }
        }
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.iter().cloned().collect()
    }

    async fn close(&mut self) -> SpoutResult<()> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            debug!(consumer_id = %self.consumer_id, "closed kafka log consumer");
        }
        Ok(())
    }
}
