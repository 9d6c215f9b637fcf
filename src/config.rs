//! Spout configuration structures.
//!
//! Component implementations are selected by closed enum tags rather than by
//! class name; construction is a match over the variant set (see
//! `factory.rs`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SpoutError, SpoutResult};

/// Selects the retry manager variant for a virtual consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetryManagerConfig {
    /// Disable retries; every failure is abandoned.
    Never,
    /// Replay failures immediately, in failure order.
    FailedTuplesFirst,
    /// Exponential backoff with cap and attempt ceiling.
    ExponentialBackoff {
        initial_delay_ms: u64,
        delay_multiplier: f64,
        max_delay_ms: u64,
        /// Negative means unbounded.
        max_attempts: i32,
    },
}

impl Default for RetryManagerConfig {
    fn default() -> Self {
        RetryManagerConfig::ExponentialBackoff {
            initial_delay_ms: 1_000,
            delay_multiplier: 2.0,
            max_delay_ms: 600_000,
            max_attempts: 25,
        }
    }
}

/// Message buffer discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferKind {
    /// One shared bounded queue, strict insertion order.
    Fifo,
    /// One bounded sub-queue per producer, polled round-robin.
    RoundRobin,
}

/// Message buffer selection and sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub kind: BufferKind,
    /// For round-robin buffers the capacity applies per sub-queue.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            kind: BufferKind::RoundRobin,
            capacity: 2_000,
        }
    }
}

/// Persistence back-end selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PersistenceConfig {
    /// Process-local map; state does not survive restarts. Tests and drills.
    InMemory,
    /// JSON files under a root directory.
    Filesystem { root: PathBuf },
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig::InMemory
    }
}

/// Deserializer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeserializerConfig {
    /// Key and value as UTF-8 strings.
    Utf8String,
    /// Value parsed as a JSON document.
    Json,
}

impl Default for DeserializerConfig {
    fn default() -> Self {
        DeserializerConfig::Utf8String
    }
}

/// Connection details for the backing Kafka log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Broker addresses, comma-separated.
    pub brokers: String,
    /// Topic the firehose subscribes to.
    pub topic: String,
    /// Extra librdkafka properties passed through verbatim.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Default for KafkaSourceConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "events".to_string(),
            properties: HashMap::new(),
        }
    }
}

/// Top-level spout configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoutConfig {
    /// Required, non-empty. Virtual consumer ids derive from it.
    pub consumer_id_prefix: String,

    /// Index of this spout task within the host topology.
    pub task_index: u32,

    /// Stream id tuples are emitted on.
    pub output_stream_id: String,

    pub kafka: KafkaSourceConfig,

    pub retry_manager: RetryManagerConfig,

    pub buffer: BufferConfig,

    pub persistence: PersistenceConfig,

    pub deserializer: DeserializerConfig,

    /// Monitor task tick.
    pub monitor_interval_ms: u64,

    /// Worker sleep when its consumer yields nothing.
    pub worker_idle_sleep_ms: u64,

    /// Bounded grace period for workers on close.
    pub shutdown_grace_ms: u64,

    /// How often each worker makes its buffered commit points durable.
    pub commit_flush_interval_ms: u64,

    /// Progress report interval.
    pub metrics_interval_ms: u64,

    /// Capacity of each per-consumer ack/fail queue.
    pub ack_queue_capacity: usize,
}

impl Default for SpoutConfig {
    fn default() -> Self {
        Self {
            consumer_id_prefix: String::new(),
            task_index: 0,
            output_stream_id: "default".to_string(),
            kafka: KafkaSourceConfig::default(),
            retry_manager: RetryManagerConfig::default(),
            buffer: BufferConfig::default(),
            persistence: PersistenceConfig::default(),
            deserializer: DeserializerConfig::default(),
            monitor_interval_ms: 2_000,
            worker_idle_sleep_ms: 10,
            shutdown_grace_ms: 10_000,
            commit_flush_interval_ms: 5_000,
            metrics_interval_ms: 60_000,
            ack_queue_capacity: 10_000,
        }
    }
}

impl SpoutConfig {
    pub fn builder() -> SpoutConfigBuilder {
        SpoutConfigBuilder::default()
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn worker_idle_sleep(&self) -> Duration {
        Duration::from_millis(self.worker_idle_sleep_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn commit_flush_interval(&self) -> Duration {
        Duration::from_millis(self.commit_flush_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Validate the configuration. Fatal at open.
    pub fn validate(&self) -> SpoutResult<()> {
        if self.consumer_id_prefix.is_empty() {
            return Err(SpoutError::ConfigMissing("consumer_id_prefix"));
        }
        if self.kafka.topic.is_empty() {
            return Err(SpoutError::ConfigMissing("kafka.topic"));
        }
        if self.buffer.capacity == 0 {
            return Err(SpoutError::ConfigInvalid(
                "buffer.capacity must be greater than 0".to_string(),
            ));
        }
        if self.ack_queue_capacity == 0 {
            return Err(SpoutError::ConfigInvalid(
                "ack_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if let RetryManagerConfig::ExponentialBackoff {
            delay_multiplier, ..
        } = self.retry_manager
        {
            if !delay_multiplier.is_finite() || delay_multiplier < 1.0 {
                return Err(SpoutError::ConfigInvalid(
                    "retry delay_multiplier must be finite and >= 1.0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`SpoutConfig`].
#[derive(Debug, Default)]
pub struct SpoutConfigBuilder {
    config: SpoutConfig,
}

impl SpoutConfigBuilder {
    pub fn consumer_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.consumer_id_prefix = prefix.into();
        self
    }

    pub fn task_index(mut self, task_index: u32) -> Self {
        self.config.task_index = task_index;
        self
    }

    pub fn output_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.config.output_stream_id = stream_id.into();
        self
    }

    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.kafka.brokers = brokers.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.kafka.topic = topic.into();
        self
    }

    pub fn kafka_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.kafka.properties.insert(key.into(), value.into());
        self
    }

    pub fn retry_manager(mut self, retry_manager: RetryManagerConfig) -> Self {
        self.config.retry_manager = retry_manager;
        self
    }

    pub fn buffer(mut self, kind: BufferKind, capacity: usize) -> Self {
        self.config.buffer = BufferConfig { kind, capacity };
        self
    }

    pub fn persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.config.persistence = persistence;
        self
    }

    pub fn deserializer(mut self, deserializer: DeserializerConfig) -> Self {
        self.config.deserializer = deserializer;
        self
    }

    pub fn monitor_interval_ms(mut self, interval: u64) -> Self {
        self.config.monitor_interval_ms = interval;
        self
    }

    pub fn worker_idle_sleep_ms(mut self, sleep: u64) -> Self {
        self.config.worker_idle_sleep_ms = sleep;
        self
    }

    pub fn shutdown_grace_ms(mut self, grace: u64) -> Self {
        self.config.shutdown_grace_ms = grace;
        self
    }

    pub fn build(self) -> SpoutConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_consumer_id_prefix() {
        let config = SpoutConfig::default();
        assert!(matches!(
            config.validate(),
            Err(SpoutError::ConfigMissing("consumer_id_prefix"))
        ));

        let config = SpoutConfig::builder().consumer_id_prefix("spout").build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let config = SpoutConfig::builder()
            .consumer_id_prefix("spout")
            .buffer(BufferKind::Fifo, 0)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_sub_one_multiplier() {
        let config = SpoutConfig::builder()
            .consumer_id_prefix("spout")
            .retry_manager(RetryManagerConfig::ExponentialBackoff {
                initial_delay_ms: 10,
                delay_multiplier: 0.5,
                max_delay_ms: 100,
                max_attempts: 3,
            })
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_serde_round_trip() {
        let config = SpoutConfig::builder()
            .consumer_id_prefix("spout")
            .topic("firehose")
            .buffer(BufferKind::RoundRobin, 128)
            .persistence(PersistenceConfig::Filesystem {
                root: PathBuf::from("/var/lib/spout"),
            })
            .build();

        let raw = serde_json::to_string(&config).unwrap();
        let back: SpoutConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config, back);
    }
}
