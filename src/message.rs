//! Core value types: message identifiers, tuples, and consumer state

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A (topic, partition) pair addressing one partition of the source log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Identifies one virtual consumer within a process.
///
/// Derived from the configured consumer id prefix, an optional suffix (for
/// replay consumers, the sideline request id) and the task index. Two live
/// consumers with the same id are a programmer error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualConsumerId(String);

impl VirtualConsumerId {
    /// Build an id as `<prefix>[-<suffix>]-<task_index>`.
    pub fn new(prefix: &str, suffix: Option<&str>, task_index: u32) -> Self {
        let mut id = prefix.to_string();
        if let Some(suffix) = suffix {
            if !suffix.is_empty() {
                id.push('-');
                id.push_str(suffix);
            }
        }
        id.push('-');
        id.push_str(&task_index.to_string());
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VirtualConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VirtualConsumerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies a single emitted tuple.
///
/// Carried downstream so that a later ack or fail can be routed back to the
/// virtual consumer that emitted it. Equality is by all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub src_consumer_id: VirtualConsumerId,
}

impl MessageId {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        src_consumer_id: VirtualConsumerId,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            src_consumer_id,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}@{} from {}",
            self.topic, self.partition, self.offset, self.src_consumer_id
        )
    }
}

/// A deserialized tuple ready to be handed to the host runtime.
///
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    values: Vec<Value>,
}

impl Message {
    pub fn new(id: MessageId, values: Vec<Value>) -> Self {
        Self { id, values }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn topic(&self) -> &str {
        &self.id.topic
    }

    pub fn partition(&self) -> i32 {
        self.id.partition
    }

    pub fn offset(&self) -> i64 {
        self.id.offset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEntry {
    topic: String,
    partition: i32,
    offset: i64,
}

/// A per-partition offset map.
///
/// Used both as a starting state (seek targets) and as an ending state
/// (inclusive upper bound per partition). Immutable; build via
/// [`ConsumerState::builder`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<StateEntry>", into = "Vec<StateEntry>")]
pub struct ConsumerState {
    entries: BTreeMap<TopicPartition, i64>,
}

impl ConsumerState {
    pub fn builder() -> ConsumerStateBuilder {
        ConsumerStateBuilder::default()
    }

    pub fn offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.entries.get(tp).copied()
    }

    pub fn contains(&self, tp: &TopicPartition) -> bool {
        self.entries.contains_key(tp)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, i64)> {
        self.entries.iter().map(|(tp, offset)| (tp, *offset))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<Vec<StateEntry>> for ConsumerState {
    fn from(entries: Vec<StateEntry>) -> Self {
        let mut state = ConsumerState::default();
        for entry in entries {
            state
                .entries
                .insert(TopicPartition::new(entry.topic, entry.partition), entry.offset);
        }
        state
    }
}

impl From<ConsumerState> for Vec<StateEntry> {
    fn from(state: ConsumerState) -> Self {
        state
            .entries
            .into_iter()
            .map(|(tp, offset)| StateEntry {
                topic: tp.topic,
                partition: tp.partition,
                offset,
            })
            .collect()
    }
}

/// Builder for [`ConsumerState`].
#[derive(Debug, Default)]
pub struct ConsumerStateBuilder {
    entries: BTreeMap<TopicPartition, i64>,
}

impl ConsumerStateBuilder {
    pub fn with_partition(mut self, tp: TopicPartition, offset: i64) -> Self {
        self.entries.insert(tp, offset);
        self
    }

    pub fn build(self) -> ConsumerState {
        ConsumerState {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_id_equality_is_by_all_fields() {
        let a = MessageId::new("topic", 1, 42, VirtualConsumerId::from("vc-1"));
        let b = MessageId::new("topic", 1, 42, VirtualConsumerId::from("vc-1"));
        let c = MessageId::new("topic", 1, 42, VirtualConsumerId::from("vc-2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn virtual_consumer_id_format() {
        let firehose = VirtualConsumerId::new("prefix", Some("main"), 3);
        assert_eq!(firehose.as_str(), "prefix-main-3");

        let plain = VirtualConsumerId::new("prefix", None, 0);
        assert_eq!(plain.as_str(), "prefix-0");
    }

    #[test]
    fn consumer_state_builder_and_lookup() {
        let state = ConsumerState::builder()
            .with_partition(TopicPartition::new("topic", 0), 100)
            .with_partition(TopicPartition::new("topic", 1), 250)
            .build();

        assert_eq!(state.offset(&TopicPartition::new("topic", 0)), Some(100));
        assert_eq!(state.offset(&TopicPartition::new("topic", 1)), Some(250));
        assert_eq!(state.offset(&TopicPartition::new("topic", 2)), None);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn consumer_state_serde_round_trip() {
        let state = ConsumerState::builder()
            .with_partition(TopicPartition::new("events", 4), 4444)
            .build();

        let raw = serde_json::to_string(&state).unwrap();
        let back: ConsumerState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn message_accessors() {
        let id = MessageId::new("topic", 2, 7, VirtualConsumerId::from("vc"));
        let message = Message::new(id.clone(), vec![json!("key"), json!("value")]);
        assert_eq!(message.topic(), "topic");
        assert_eq!(message.partition(), 2);
        assert_eq!(message.offset(), 7);
        assert_eq!(message.id(), &id);
        assert_eq!(message.values().len(), 2);
    }
}
