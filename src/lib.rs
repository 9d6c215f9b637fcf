//! Dynamic, multiplexed Kafka ingestion with runtime sidelining.
//!
//! A firehose consumer streams a partitioned topic into a pull interface for
//! a host streaming runtime. Operators can, at runtime, sideline a
//! filter-defined subset of the stream and later replay exactly that subset
//! over its original offset range, with at-least-once delivery and
//! per-partition commit tracking. Sideline requests survive restarts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sideline_spout::{
//!     DynamicSpout, FieldEqualsFilter, FilterChainStep, MessageId, SidelineRequest,
//!     SpoutConfig, TupleEmitter,
//! };
//!
//! struct PrintEmitter;
//!
//! impl TupleEmitter for PrintEmitter {
//!     fn emit(&mut self, stream: &str, values: &[serde_json::Value], id: MessageId) {
//!         println!("{stream}: {values:?} ({id})");
//!     }
//! }
//!
//! # fn main() -> Result<(), sideline_spout::SpoutError> {
//! let config = SpoutConfig::builder()
//!     .consumer_id_prefix("my-spout")
//!     .brokers("localhost:9092")
//!     .topic("events")
//!     .build();
//!
//! let mut spout = DynamicSpout::new(config);
//! spout.open(Box::new(PrintEmitter))?;
//!
//! // Divert everything from one tenant for later replay.
//! let steps: Vec<Arc<dyn FilterChainStep>> =
//!     vec![Arc::new(FieldEqualsFilter::new("tenant", json!("acme")))];
//! let request = SidelineRequest::new(steps);
//! spout.start_sidelining(&request)?;
//!
//! loop {
//!     spout.next_tuple();
//!     // ... host runtime drives ack/fail with the emitted MessageIds ...
//! }
//! # }
//! ```

#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod deserializer;
pub mod error;
pub mod factory;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod offset;
pub mod persistence;
pub mod retry;
pub mod sideline;
pub mod spout;
pub mod telemetry;

pub use buffer::{FifoBuffer, MessageBuffer, RoundRobinBuffer};
pub use config::{
    BufferConfig, BufferKind, DeserializerConfig, KafkaSourceConfig, PersistenceConfig,
    RetryManagerConfig, SpoutConfig,
};
pub use consumer::{
    InMemoryLog, InMemoryLogConsumer, KafkaLogConsumer, LogConsumer, Record, VirtualConsumer,
};
pub use coordinator::SpoutCoordinator;
pub use deserializer::{Deserializer, JsonDeserializer, Utf8StringDeserializer};
pub use error::{SpoutError, SpoutResult};
pub use factory::{
    ComponentFactory, InMemoryLogConsumerFactory, KafkaLogConsumerFactory, LogConsumerFactory,
};
pub use filter::{
    FieldEqualsFilter, FilterChain, FilterChainStep, FilterStepRegistry, NegatingFilterChainStep,
    PersistedStep, StaticMessageFilter,
};
pub use message::{ConsumerState, Message, MessageId, TopicPartition, VirtualConsumerId};
pub use metrics::SpoutMetrics;
pub use offset::PartitionOffsetTracker;
pub use persistence::{
    FilesystemPersistenceAdapter, InMemoryPersistenceAdapter, PersistenceAdapter, SidelinePayload,
    SidelineType,
};
pub use retry::{
    ExponentialBackoffRetryManager, FailedTuplesFirstRetryManager, NeverRetryManager, RetryManager,
};
pub use sideline::{SidelineController, SidelineRequest, SidelineRequestIdentifier};
pub use spout::{DynamicSpout, TupleEmitter};
