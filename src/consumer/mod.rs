//! Virtual consumers and the log-client boundary they sit on.

mod client;
mod kafka;
mod memory;
mod virtual_consumer;

pub use client::{LogConsumer, Record};
pub use kafka::KafkaLogConsumer;
pub use memory::{InMemoryLog, InMemoryLogConsumer};
pub use virtual_consumer::VirtualConsumer;
