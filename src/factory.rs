//! Enum-dispatched construction of configurable components.
//!
//! Replaces by-name dynamic class loading: the configuration names a variant
//! and construction is a match over the closed set. The factory is an
//! explicitly constructed value threaded through the spout, coordinator and
//! sideline controller; no globals.

use std::sync::Arc;

use crate::buffer::{FifoBuffer, MessageBuffer, RoundRobinBuffer};
use crate::config::{
    BufferKind, DeserializerConfig, PersistenceConfig, RetryManagerConfig, SpoutConfig,
};
use crate::consumer::{InMemoryLog, InMemoryLogConsumer, KafkaLogConsumer, LogConsumer};
use crate::deserializer::{Deserializer, JsonDeserializer, Utf8StringDeserializer};
use crate::error::SpoutResult;
use crate::message::VirtualConsumerId;
use crate::persistence::{
    FilesystemPersistenceAdapter, InMemoryPersistenceAdapter, PersistenceAdapter,
};
use crate::retry::{
    ExponentialBackoffRetryManager, FailedTuplesFirstRetryManager, NeverRetryManager, RetryManager,
};

/// Mints log-consumer clients for virtual consumers.
///
/// Every virtual consumer gets its own client; replay consumers are created at
/// runtime, so the factory outlives any one of them.
pub trait LogConsumerFactory: Send + Sync {
    fn create(&self, id: &VirtualConsumerId) -> SpoutResult<Box<dyn LogConsumer>>;
}

/// Kafka-backed clients, the production default.
#[derive(Debug)]
pub struct KafkaLogConsumerFactory {
    config: Arc<SpoutConfig>,
    persistence: Arc<dyn PersistenceAdapter>,
}

impl KafkaLogConsumerFactory {
    pub fn new(config: Arc<SpoutConfig>, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            config,
            persistence,
        }
    }
}

impl LogConsumerFactory for KafkaLogConsumerFactory {
    fn create(&self, id: &VirtualConsumerId) -> SpoutResult<Box<dyn LogConsumer>> {
        Ok(Box::new(KafkaLogConsumer::new(
            self.config.kafka.clone(),
            id.clone(),
            Arc::clone(&self.persistence),
        )))
    }
}

/// Clients over an in-process log, for tests and local drills.
#[derive(Debug)]
pub struct InMemoryLogConsumerFactory {
    log: Arc<InMemoryLog>,
    topic: String,
    persistence: Arc<dyn PersistenceAdapter>,
}

impl InMemoryLogConsumerFactory {
    pub fn new(
        log: Arc<InMemoryLog>,
        topic: impl Into<String>,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self {
            log,
            topic: topic.into(),
            persistence,
        }
    }
}

impl LogConsumerFactory for InMemoryLogConsumerFactory {
    fn create(&self, id: &VirtualConsumerId) -> SpoutResult<Box<dyn LogConsumer>> {
        Ok(Box::new(InMemoryLogConsumer::new(
            Arc::clone(&self.log),
            self.topic.clone(),
            id.clone(),
            Arc::clone(&self.persistence),
        )))
    }
}

/// Builds components from their configured variant tags.
#[derive(Clone)]
pub struct ComponentFactory {
    config: Arc<SpoutConfig>,
    log_consumers: Arc<dyn LogConsumerFactory>,
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("config", &self.config)
            .finish()
    }
}

impl ComponentFactory {
    pub fn new(config: Arc<SpoutConfig>, log_consumers: Arc<dyn LogConsumerFactory>) -> Self {
        Self {
            config,
            log_consumers,
        }
    }

    pub fn config(&self) -> &Arc<SpoutConfig> {
        &self.config
    }

    /// Build the persistence adapter named by the configuration.
    pub fn create_persistence_adapter(
        config: &PersistenceConfig,
    ) -> Arc<dyn PersistenceAdapter> {
        match config {
            PersistenceConfig::InMemory => Arc::new(InMemoryPersistenceAdapter::new()),
            PersistenceConfig::Filesystem { root } => {
                Arc::new(FilesystemPersistenceAdapter::new(root.clone()))
            }
        }
    }

    pub fn create_retry_manager(&self, config: &RetryManagerConfig) -> Box<dyn RetryManager> {
        match config {
            RetryManagerConfig::Never => Box::new(NeverRetryManager),
            RetryManagerConfig::FailedTuplesFirst => Box::new(FailedTuplesFirstRetryManager::new()),
            RetryManagerConfig::ExponentialBackoff { .. } => {
                Box::new(ExponentialBackoffRetryManager::new())
            }
        }
    }

    pub fn create_deserializer(&self) -> Box<dyn Deserializer> {
        match self.config.deserializer {
            DeserializerConfig::Utf8String => Box::new(Utf8StringDeserializer),
            DeserializerConfig::Json => Box::new(JsonDeserializer),
        }
    }

    pub fn create_message_buffer(&self) -> Arc<dyn MessageBuffer> {
        match self.config.buffer.kind {
            BufferKind::Fifo => Arc::new(FifoBuffer::new(self.config.buffer.capacity)),
            BufferKind::RoundRobin => Arc::new(RoundRobinBuffer::new(self.config.buffer.capacity)),
        }
    }

    pub fn create_log_consumer(&self, id: &VirtualConsumerId) -> SpoutResult<Box<dyn LogConsumer>> {
        self.log_consumers.create(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;

    fn factory(config: SpoutConfig) -> ComponentFactory {
        let config = Arc::new(config);
        let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistenceAdapter::new());
        let log = Arc::new(InMemoryLog::new());
        let log_consumers = Arc::new(InMemoryLogConsumerFactory::new(
            log,
            config.kafka.topic.clone(),
            persistence,
        ));
        ComponentFactory::new(config, log_consumers)
    }

    #[test]
    fn retry_manager_dispatch_matches_variant() {
        let factory = factory(SpoutConfig::default());
        let manager = factory.create_retry_manager(&RetryManagerConfig::Never);
        assert!(format!("{manager:?}").contains("NeverRetryManager"));

        let manager = factory.create_retry_manager(&RetryManagerConfig::FailedTuplesFirst);
        assert!(format!("{manager:?}").contains("FailedTuplesFirst"));

        let manager = factory.create_retry_manager(&RetryManagerConfig::default());
        assert!(format!("{manager:?}").contains("ExponentialBackoff"));
    }

    #[test]
    fn buffer_dispatch_matches_variant() {
        let mut config = SpoutConfig::default();
        config.buffer = BufferConfig {
            kind: BufferKind::Fifo,
            capacity: 4,
        };
        let buffer = factory(config).create_message_buffer();
        assert!(format!("{buffer:?}").contains("FifoBuffer"));

        let buffer = factory(SpoutConfig::default()).create_message_buffer();
        assert!(format!("{buffer:?}").contains("RoundRobinBuffer"));
    }

    #[test]
    fn persistence_dispatch_matches_variant() {
        let adapter = ComponentFactory::create_persistence_adapter(&PersistenceConfig::InMemory);
        assert!(format!("{adapter:?}").contains("InMemoryPersistenceAdapter"));

        let dir = tempfile::tempdir().unwrap();
        let adapter = ComponentFactory::create_persistence_adapter(&PersistenceConfig::Filesystem {
            root: dir.path().to_path_buf(),
        });
        assert!(format!("{adapter:?}").contains("FilesystemPersistenceAdapter"));
    }
}
