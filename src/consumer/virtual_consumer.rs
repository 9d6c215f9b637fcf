//! The per-consumer state machine behind every emitted tuple.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{RetryManagerConfig, SpoutConfig};
use crate::consumer::client::{LogConsumer, Record};
use crate::deserializer::Deserializer;
use crate::error::{SpoutError, SpoutResult};
use crate::factory::ComponentFactory;
use crate::filter::FilterChain;
use crate::message::{ConsumerState, Message, MessageId, TopicPartition, VirtualConsumerId};
use crate::metrics::SpoutMetrics;
use crate::offset::PartitionOffsetTracker;
use crate::persistence::PersistenceAdapter;
use crate::retry::RetryManager;
use crate::sideline::SidelineRequestIdentifier;

/// One independent, bounded-offset consumer over the log.
///
/// The firehose is a virtual consumer with no ending state; replay consumers
/// carry both a starting and an ending state plus a negated filter chain.
/// `next_message`, `ack` and `fail` are serialized by the owning worker task;
/// only `request_stop`/`is_stop_requested` may be called from elsewhere.
pub struct VirtualConsumer {
    id: VirtualConsumerId,
    config: Arc<SpoutConfig>,
    factory: ComponentFactory,
    metrics: Arc<SpoutMetrics>,
    persistence: Arc<dyn PersistenceAdapter>,

    filter_chain: Arc<RwLock<FilterChain>>,
    retry_config: RetryManagerConfig,
    starting_state: Option<ConsumerState>,
    ending_state: Option<ConsumerState>,
    sideline_request_id: Option<SidelineRequestIdentifier>,

    // Populated by open().
    log_consumer: Option<Box<dyn LogConsumer>>,
    injected_log_consumer: Option<Box<dyn LogConsumer>>,
    deserializer: Option<Box<dyn Deserializer>>,
    retry_manager: Option<Box<dyn RetryManager>>,

    trackers: HashMap<TopicPartition, PartitionOffsetTracker>,
    /// Emitted-but-unfinalized messages, kept for retry re-emission.
    in_flight: HashMap<MessageId, Message>,
    /// Partitions already unsubscribed after passing their ending offset.
    partitions_at_end: BTreeSet<TopicPartition>,

    stop_requested: Arc<AtomicBool>,
    opened: bool,
    closed: bool,
    completed: bool,
}

impl std::fmt::Debug for VirtualConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConsumer")
            .field("id", &self.id)
            .field("opened", &self.opened)
            .field("completed", &self.completed)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl VirtualConsumer {
    pub fn new(
        id: VirtualConsumerId,
        config: Arc<SpoutConfig>,
        factory: ComponentFactory,
        metrics: Arc<SpoutMetrics>,
        persistence: Arc<dyn PersistenceAdapter>,
        starting_state: Option<ConsumerState>,
        ending_state: Option<ConsumerState>,
    ) -> Self {
        let retry_config = config.retry_manager.clone();
        Self {
            id,
            config,
            factory,
            metrics,
            persistence,
            filter_chain: Arc::new(RwLock::new(FilterChain::new())),
            retry_config,
            starting_state,
            ending_state,
            sideline_request_id: None,
            log_consumer: None,
            injected_log_consumer: None,
            deserializer: None,
            retry_manager: None,
            trackers: HashMap::new(),
            in_flight: HashMap::new(),
            partitions_at_end: BTreeSet::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            opened: false,
            closed: false,
            completed: false,
        }
    }

    /// Use a pre-built log consumer instead of asking the factory at open.
    pub fn with_log_consumer(mut self, log_consumer: Box<dyn LogConsumer>) -> Self {
        self.injected_log_consumer = Some(log_consumer);
        self
    }

    /// Override the retry manager variant (replay consumers use
    /// [`RetryManagerConfig::FailedTuplesFirst`] regardless of the firehose
    /// configuration).
    pub fn with_retry_manager(mut self, retry_config: RetryManagerConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Share a filter chain built elsewhere.
    pub fn with_filter_chain(mut self, filter_chain: Arc<RwLock<FilterChain>>) -> Self {
        self.filter_chain = filter_chain;
        self
    }

    /// Associate this consumer with the sideline request it replays.
    pub fn with_sideline_request(mut self, id: SidelineRequestIdentifier) -> Self {
        self.sideline_request_id = Some(id);
        self
    }

    pub fn id(&self) -> &VirtualConsumerId {
        &self.id
    }

    pub fn filter_chain(&self) -> Arc<RwLock<FilterChain>> {
        Arc::clone(&self.filter_chain)
    }

    pub fn sideline_request_id(&self) -> Option<&SidelineRequestIdentifier> {
        self.sideline_request_id.as_ref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    /// Cooperative stop flag, checked by the worker between polls.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    /// Handle the coordinator uses to request a stop from outside the worker.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    #[cfg(test)]
    pub(crate) fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
    }

    /// One-shot initialization: acquire the log client, deserializer and
    /// retry manager, then seek to the starting state.
    pub async fn open(&mut self) -> SpoutResult<()> {
        if self.opened {
            return Err(SpoutError::IllegalState(format!(
                "virtual consumer {} already opened",
                self.id
            )));
        }

        let mut retry_manager = self.factory.create_retry_manager(&self.retry_config);
        retry_manager.open(&self.retry_config);
        self.retry_manager = Some(retry_manager);

        self.deserializer = Some(self.factory.create_deserializer());

        let mut log_consumer = match self.injected_log_consumer.take() {
            Some(log_consumer) => log_consumer,
            None => self.factory.create_log_consumer(&self.id)?,
        };
        log_consumer.open(self.starting_state.as_ref()).await?;
        self.log_consumer = Some(log_consumer);

        info!(
            id = %self.id,
            has_ending_state = self.ending_state.is_some(),
            "opened virtual consumer"
        );
        self.opened = true;
        Ok(())
    }

    fn log_consumer_mut(&mut self) -> SpoutResult<&mut Box<dyn LogConsumer>> {
        self.log_consumer
            .as_mut()
            .ok_or_else(|| SpoutError::IllegalState(format!("consumer {} is not open", self.id)))
    }

    fn retry_manager_mut(&mut self) -> &mut Box<dyn RetryManager> {
        self.retry_manager
            .as_mut()
            .expect("retry manager exists after open")
    }

    /// Whether `offset` on `tp` lies beyond the ending state.
    ///
    /// An offset equal to the bound is still delivered. A partition missing
    /// from a defined ending state is an illegal state.
    fn exceeds_ending_offset(&self, tp: &TopicPartition, offset: i64) -> SpoutResult<bool> {
        let Some(ending_state) = &self.ending_state else {
            return Ok(false);
        };
        let end = ending_state.offset(tp).ok_or_else(|| {
            SpoutError::IllegalState(format!(
                "partition {tp} is not covered by the ending state of {}",
                self.id
            ))
        })?;
        Ok(offset > end)
    }

    /// A bounded consumer is done once every partition passed its end and all
    /// emitted messages are finalized.
    fn maybe_complete(&mut self) {
        if self.completed || self.ending_state.is_none() {
            return;
        }
        let assignment_empty = self
            .log_consumer
            .as_ref()
            .map(|log_consumer| log_consumer.assignment().is_empty())
            .unwrap_or(false);
        if assignment_empty && self.in_flight.is_empty() {
            info!(id = %self.id, "virtual consumer drained, marking completed");
            self.completed = true;
        }
    }

    /// Finalize a record that will never be emitted (filtered or
    /// unparseable) so the commit point advances without regressing past any
    /// earlier in-flight offset.
    fn skip_and_commit(&mut self, tp: &TopicPartition, offset: i64) -> SpoutResult<()> {
        let tracker = self
            .trackers
            .entry(tp.clone())
            .or_insert_with(|| PartitionOffsetTracker::new(offset));
        tracker.start_tracking(offset);
        tracker.finish(offset);
        let commit = tracker.commit_offset();
        self.log_consumer_mut()?.commit_offset(tp, commit);
        Ok(())
    }

    fn drop_past_end(&mut self, record: &Record) -> SpoutResult<()> {
        let tp = record.topic_partition();
        debug!(
            id = %self.id,
            %tp,
            offset = record.offset,
            "record past ending offset, dropping without commit"
        );
        if !self.partitions_at_end.contains(&tp) {
            self.log_consumer_mut()?.unsubscribe_partition(&tp);
            self.partitions_at_end.insert(tp);
        }
        self.maybe_complete();
        Ok(())
    }

    /// Single non-blocking step of the consumer loop.
    ///
    /// Retries first, then a fresh poll; filtered and unparseable records
    /// auto-commit so the consumer keeps advancing.
    pub async fn next_message(&mut self) -> SpoutResult<Option<Message>> {
        if !self.opened {
            return Err(SpoutError::IllegalState(format!(
                "consumer {} is not open",
                self.id
            )));
        }
        if self.completed {
            return Ok(None);
        }

        // A failed tuple that is due again takes priority over new input.
        if let Some(id) = self.retry_manager_mut().next_failed_message_to_retry() {
            match self.in_flight.get(&id) {
                Some(message) => {
                    let message = message.clone();
                    if let Some(tracker) = self.trackers.get_mut(&id.topic_partition()) {
                        tracker.start_tracking(id.offset);
                    }
                    debug!(%id, "re-emitting failed tuple");
                    return Ok(Some(message));
                }
                None => {
                    warn!(%id, "retry requested for unknown message, skipping");
                    return Ok(None);
                }
            }
        }

        let Some(record) = self.log_consumer_mut()?.next_record().await? else {
            return Ok(None);
        };
        let tp = record.topic_partition();

        if self.exceeds_ending_offset(&tp, record.offset)? {
            self.drop_past_end(&record)?;
            return Ok(None);
        }

        let values = self
            .deserializer
            .as_ref()
            .expect("deserializer exists after open")
            .deserialize(
                &record.topic,
                record.partition,
                record.offset,
                record.key.as_deref(),
                record.value.as_deref(),
            );
        let Some(values) = values else {
            // Unparseable: skip it and move the commit point forward.
            self.metrics
                .deserialization_failures
                .fetch_add(1, Ordering::Relaxed);
            self.skip_and_commit(&tp, record.offset)?;
            return Ok(None);
        };

        let message = Message::new(
            MessageId::new(
                record.topic.clone(),
                record.partition,
                record.offset,
                self.id.clone(),
            ),
            values,
        );

        if self.filter_chain.read().test(&message) {
            self.metrics.filtered.fetch_add(1, Ordering::Relaxed);
            self.skip_and_commit(&tp, record.offset)?;
            return Ok(None);
        }

        self.trackers
            .entry(tp)
            .or_insert_with(|| PartitionOffsetTracker::new(record.offset))
            .start_tracking(record.offset);
        self.in_flight
            .insert(message.id().clone(), message.clone());
        Ok(Some(message))
    }

    fn finalize(&mut self, id: &MessageId) -> SpoutResult<()> {
        let tp = id.topic_partition();
        let commit = match self.trackers.get_mut(&tp) {
            Some(tracker) => {
                tracker.finish(id.offset);
                Some(tracker.commit_offset())
            }
            None => {
                warn!(%id, "finalize for untracked partition");
                None
            }
        };
        if let Some(commit) = commit {
            self.log_consumer_mut()?.commit_offset(&tp, commit);
        }
        self.in_flight.remove(id);
        self.maybe_complete();
        Ok(())
    }

    /// The tuple was fully processed downstream.
    pub fn ack(&mut self, id: &MessageId) -> SpoutResult<()> {
        if !self.opened {
            return Err(SpoutError::IllegalState(format!(
                "consumer {} is not open",
                self.id
            )));
        }
        self.retry_manager_mut().acked(id);
        self.finalize(id)
    }

    /// The tuple failed downstream. Retries if the retry manager allows,
    /// otherwise abandons (counts as acked for commit purposes).
    pub fn fail(&mut self, id: &MessageId) -> SpoutResult<()> {
        if !self.opened {
            return Err(SpoutError::IllegalState(format!(
                "consumer {} is not open",
                self.id
            )));
        }
        if !self.retry_manager_mut().retry_further(id) {
            warn!(%id, "not retrying further, abandoning");
            self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
            return self.ack(id);
        }
        self.retry_manager_mut().failed(id.clone());
        Ok(())
    }

    /// Make buffered commit points durable.
    pub async fn flush(&mut self) -> SpoutResult<ConsumerState> {
        self.log_consumer_mut()?.flush_state().await
    }

    /// The committed state, not the in-flight leading edge.
    pub fn current_state(&self) -> SpoutResult<ConsumerState> {
        Ok(self
            .log_consumer
            .as_ref()
            .ok_or_else(|| SpoutError::IllegalState(format!("consumer {} is not open", self.id)))?
            .current_state())
    }

    pub fn unsubscribe_partition(&mut self, tp: &TopicPartition) -> SpoutResult<bool> {
        Ok(self.log_consumer_mut()?.unsubscribe_partition(tp))
    }

    /// Tear down. A completed consumer clears its persisted offsets and
    /// purges its sideline payload; an interrupted one flushes state for the
    /// next incarnation. The log client always closes last. Idempotent.
    pub async fn close(&mut self) -> SpoutResult<()> {
        if self.closed || !self.opened {
            return Ok(());
        }

        if self.completed {
            self.log_consumer_mut()?.remove_state().await?;
            if let Some(request_id) = self.sideline_request_id.clone() {
                info!(id = %self.id, %request_id, "purging drained sideline request");
                self.persistence.clear_sideline_request(&request_id)?;
            }
        } else if let Err(err) = self.flush().await {
            error!(id = %self.id, %err, "failed to flush state on close");
        }

        self.log_consumer_mut()?.close().await?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeserializerConfig;
    use crate::consumer::InMemoryLog;
    use crate::factory::{ComponentFactory, InMemoryLogConsumerFactory};
    use crate::filter::StaticMessageFilter;
    use crate::persistence::{InMemoryPersistenceAdapter, SidelinePayload, SidelineType};
    use serde_json::json;

    struct Fixture {
        log: Arc<InMemoryLog>,
        persistence: Arc<InMemoryPersistenceAdapter>,
        config: Arc<SpoutConfig>,
        metrics: Arc<SpoutMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Arc::new(
                SpoutConfig::builder()
                    .consumer_id_prefix("MyConsumerId")
                    .topic("MyTopic")
                    .deserializer(DeserializerConfig::Utf8String)
                    .build(),
            );
            Self {
                log: Arc::new(InMemoryLog::new()),
                persistence: Arc::new(InMemoryPersistenceAdapter::new()),
                config,
                metrics: Arc::new(SpoutMetrics::new()),
            }
        }

        fn factory(&self) -> ComponentFactory {
            let persistence: Arc<dyn PersistenceAdapter> =
                Arc::clone(&self.persistence) as Arc<dyn PersistenceAdapter>;
            ComponentFactory::new(
                Arc::clone(&self.config),
                Arc::new(InMemoryLogConsumerFactory::new(
                    Arc::clone(&self.log),
                    "MyTopic",
                    persistence,
                )),
            )
        }

        fn consumer(
            &self,
            starting_state: Option<ConsumerState>,
            ending_state: Option<ConsumerState>,
        ) -> VirtualConsumer {
            VirtualConsumer::new(
                VirtualConsumerId::from("MyConsumerId"),
                Arc::clone(&self.config),
                self.factory(),
                Arc::clone(&self.metrics),
                Arc::clone(&self.persistence) as Arc<dyn PersistenceAdapter>,
                starting_state,
                ending_state,
            )
        }

        fn committed_state(&self, id: &str) -> Option<ConsumerState> {
            self.persistence
                .retrieve_consumer_state(&VirtualConsumerId::from(id))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn open_twice_is_an_illegal_state() {
        let fixture = Fixture::new();
        fixture.log.create_partition("MyTopic", 0);
        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();
        assert!(matches!(
            consumer.open().await,
            Err(SpoutError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn next_message_is_none_when_log_is_empty() {
        let fixture = Fixture::new();
        fixture.log.create_partition("MyTopic", 0);
        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();
        assert!(consumer.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn emits_deserialized_records_with_routable_ids() {
        let fixture = Fixture::new();
        fixture
            .log
            .produce_at("MyTopic", 3, 434323, Some(b"MyKey"), Some(b"MyValue"));

        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();

        let message = consumer.next_message().await.unwrap().unwrap();
        assert_eq!(message.topic(), "MyTopic");
        assert_eq!(message.partition(), 3);
        assert_eq!(message.offset(), 434323);
        assert_eq!(message.values(), &[json!("MyKey"), json!("MyValue")]);
        assert_eq!(
            message.id().src_consumer_id,
            VirtualConsumerId::from("MyConsumerId")
        );
    }

    /// Records before and at the ending offset pass; records beyond it are
    /// silently dropped, the partition is unsubscribed exactly once and no
    /// commit is issued for the dropped offsets.
    #[tokio::test]
    async fn ending_state_bound_is_inclusive() {
        let fixture = Fixture::new();
        let ending_offset = 4444;
        for offset in [4344, 4444, 4544, 4545] {
            fixture
                .log
                .produce_at("MyTopic", 4, offset, None, Some(b"v"));
        }
        let ending = ConsumerState::builder()
            .with_partition(TopicPartition::new("MyTopic", 4), ending_offset)
            .build();

        let mut consumer = fixture.consumer(None, Some(ending));
        consumer.open().await.unwrap();

        let first = consumer.next_message().await.unwrap().unwrap();
        assert_eq!(first.offset(), 4344);
        let second = consumer.next_message().await.unwrap().unwrap();
        assert_eq!(second.offset(), 4444);

        assert!(consumer.next_message().await.unwrap().is_none());
        assert!(consumer.next_message().await.unwrap().is_none());

        // The partition is gone from the assignment.
        assert!(consumer
            .log_consumer
            .as_ref()
            .unwrap()
            .assignment()
            .is_empty());

        // Nothing past the bound was committed.
        consumer.ack(first.id()).unwrap();
        consumer.ack(second.id()).unwrap();
        let state = consumer.flush().await.unwrap();
        assert_eq!(
            state.offset(&TopicPartition::new("MyTopic", 4)),
            Some(4444)
        );
        assert!(consumer.is_completed());
    }

    #[tokio::test]
    async fn partition_outside_ending_state_is_an_illegal_state() {
        let fixture = Fixture::new();
        fixture.log.produce_at("MyTopic", 0, 1, None, Some(b"v"));
        fixture.log.produce_at("MyTopic", 1, 1, None, Some(b"v"));
        let ending = ConsumerState::builder()
            .with_partition(TopicPartition::new("MyTopic", 0), 10)
            .build();

        let mut consumer = fixture.consumer(None, Some(ending));
        consumer.open().await.unwrap();

        let mut saw_illegal_state = false;
        for _ in 0..2 {
            if matches!(
                consumer.next_message().await,
                Err(SpoutError::IllegalState(_))
            ) {
                saw_illegal_state = true;
            }
        }
        assert!(saw_illegal_state);
    }

    #[tokio::test]
    async fn filtered_records_commit_and_yield_nothing() {
        let fixture = Fixture::new();
        fixture
            .log
            .produce_at("MyTopic", 3, 434323, None, Some(b"v"));

        let mut consumer = fixture.consumer(None, None);
        consumer.filter_chain.write().add_steps(
            SidelineRequestIdentifier::new(),
            vec![Arc::new(StaticMessageFilter::drop_all())],
        );
        consumer.open().await.unwrap();

        assert!(consumer.next_message().await.unwrap().is_none());

        let state = consumer.flush().await.unwrap();
        assert_eq!(
            state.offset(&TopicPartition::new("MyTopic", 3)),
            Some(434323)
        );
        assert_eq!(
            fixture.metrics.filtered.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn unparseable_records_commit_and_yield_nothing() {
        let fixture = Fixture::new();
        // Invalid UTF-8 value makes the Utf8StringDeserializer return None.
        fixture
            .log
            .produce_at("MyTopic", 3, 434323, None, Some(&[0xff, 0xfe]));

        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();

        assert!(consumer.next_message().await.unwrap().is_none());
        let state = consumer.flush().await.unwrap();
        assert_eq!(
            state.offset(&TopicPartition::new("MyTopic", 3)),
            Some(434323)
        );
    }

    #[tokio::test]
    async fn failed_tuple_is_re_emitted_then_new_input_resumes() {
        let fixture = Fixture::new();
        fixture.log.produce_at("MyTopic", 3, 100, None, Some(b"a"));
        fixture.log.produce_at("MyTopic", 3, 101, None, Some(b"b"));

        let mut consumer = fixture
            .consumer(None, None)
            .with_retry_manager(RetryManagerConfig::FailedTuplesFirst);
        consumer.open().await.unwrap();

        let first = consumer.next_message().await.unwrap().unwrap();
        assert_eq!(first.offset(), 100);

        consumer.fail(first.id()).unwrap();

        // The failed tuple comes back before any new record.
        let retried = consumer.next_message().await.unwrap().unwrap();
        assert_eq!(retried.id(), first.id());
        assert_eq!(retried.values(), first.values());

        let second = consumer.next_message().await.unwrap().unwrap();
        assert_eq!(second.offset(), 101);
    }

    /// A fail the retry manager rejects behaves exactly like an ack.
    #[tokio::test]
    async fn fail_without_retry_budget_is_abandoned() {
        let fixture = Fixture::new();
        fixture
            .log
            .produce_at("MyTopic", 3, 434323, None, Some(b"v"));

        let mut consumer = fixture
            .consumer(None, None)
            .with_retry_manager(RetryManagerConfig::Never);
        consumer.open().await.unwrap();

        let message = consumer.next_message().await.unwrap().unwrap();
        consumer.fail(message.id()).unwrap();

        let state = consumer.flush().await.unwrap();
        assert_eq!(
            state.offset(&TopicPartition::new("MyTopic", 3)),
            Some(434323)
        );
        assert_eq!(fixture.metrics.abandoned.load(Ordering::Relaxed), 1);
        // Nothing left to retry.
        assert!(consumer.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acks_advance_commit_point_only_contiguously() {
        let fixture = Fixture::new();
        for offset in 0..3 {
            fixture
                .log
                .produce_at("MyTopic", 0, offset, None, Some(b"v"));
        }

        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();

        let m0 = consumer.next_message().await.unwrap().unwrap();
        let m1 = consumer.next_message().await.unwrap().unwrap();
        let m2 = consumer.next_message().await.unwrap().unwrap();

        let tp = TopicPartition::new("MyTopic", 0);

        consumer.ack(m2.id()).unwrap();
        let state = consumer.flush().await.unwrap();
        // 0 and 1 still outstanding; nothing contiguous finalized yet.
        assert_eq!(state.offset(&tp), Some(-1));

        consumer.ack(m0.id()).unwrap();
        let state = consumer.flush().await.unwrap();
        assert_eq!(state.offset(&tp), Some(0));

        consumer.ack(m1.id()).unwrap();
        let state = consumer.flush().await.unwrap();
        assert_eq!(state.offset(&tp), Some(2));
    }

    #[tokio::test]
    async fn close_without_completion_flushes_state() {
        let fixture = Fixture::new();
        fixture.log.produce_at("MyTopic", 0, 5, None, Some(b"v"));

        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();
        let message = consumer.next_message().await.unwrap().unwrap();
        consumer.ack(message.id()).unwrap();

        consumer.close().await.unwrap();
        // State flushed, not cleared.
        let state = fixture.committed_state("MyConsumerId").unwrap();
        assert_eq!(state.offset(&TopicPartition::new("MyTopic", 0)), Some(5));

        // Idempotent.
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_after_completion_clears_state_and_purges_sideline() {
        let fixture = Fixture::new();
        fixture.log.create_partition("MyTopic", 0);
        let request_id = SidelineRequestIdentifier::new();
        fixture
            .persistence
            .persist_sideline_request(&SidelinePayload {
                id: request_id.clone(),
                sideline_type: SidelineType::Stop,
                steps: Vec::new(),
                starting_state: ConsumerState::default(),
                ending_state: Some(ConsumerState::default()),
            })
            .unwrap();
        fixture
            .persistence
            .persist_consumer_state(
                &VirtualConsumerId::from("MyConsumerId"),
                &ConsumerState::builder()
                    .with_partition(TopicPartition::new("MyTopic", 0), 3)
                    .build(),
            )
            .unwrap();

        let mut consumer = fixture
            .consumer(None, None)
            .with_sideline_request(request_id.clone());
        consumer.open().await.unwrap();
        consumer.set_completed(true);
        consumer.close().await.unwrap();

        assert!(fixture.committed_state("MyConsumerId").is_none());
        assert!(fixture
            .persistence
            .retrieve_sideline_request(&request_id)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn close_after_completion_without_sideline_keeps_other_payloads() {
        let fixture = Fixture::new();
        fixture.log.create_partition("MyTopic", 0);
        let unrelated = SidelineRequestIdentifier::new();
        fixture
            .persistence
            .persist_sideline_request(&SidelinePayload {
                id: unrelated.clone(),
                sideline_type: SidelineType::Start,
                steps: Vec::new(),
                starting_state: ConsumerState::default(),
                ending_state: None,
            })
            .unwrap();

        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();
        consumer.set_completed(true);
        consumer.close().await.unwrap();

        assert!(fixture
            .persistence
            .retrieve_sideline_request(&unrelated)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn current_state_reports_committed_not_leading_edge() {
        let fixture = Fixture::new();
        for offset in 0..3 {
            fixture
                .log
                .produce_at("MyTopic", 0, offset, None, Some(b"v"));
        }

        let mut consumer = fixture.consumer(None, None);
        consumer.open().await.unwrap();

        let m0 = consumer.next_message().await.unwrap().unwrap();
        let _m1 = consumer.next_message().await.unwrap().unwrap();
        consumer.ack(m0.id()).unwrap();

        let state = consumer.current_state().unwrap();
        // Offset 1 is in flight; the committed state stops at 0.
        assert_eq!(state.offset(&TopicPartition::new("MyTopic", 0)), Some(0));
    }
}
