//! Counters for the spout and its virtual consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::message::VirtualConsumerId;

/// Per-consumer emit/ack/fail counts.
#[derive(Debug, Default)]
pub struct ConsumerCounters {
    pub emitted: AtomicU64,
    pub acked: AtomicU64,
    pub failed: AtomicU64,
}

/// Process-wide spout metrics.
///
/// An explicitly constructed value shared by `Arc`; the same instance is
/// threaded through the spout, coordinator and every virtual consumer.
#[derive(Debug)]
pub struct SpoutMetrics {
    /// Tuples handed to the host runtime.
    pub emitted: AtomicU64,
    /// Acks received from the host runtime.
    pub acked: AtomicU64,
    /// Fails received from the host runtime.
    pub failed: AtomicU64,
    /// Messages dropped by a filter chain.
    pub filtered: AtomicU64,
    /// Records the deserializer could not parse.
    pub deserialization_failures: AtomicU64,
    /// Failed tuples given up on.
    pub abandoned: AtomicU64,
    /// Transient worker errors.
    pub transient_errors: AtomicU64,
    /// Sideline requests started / stopped.
    pub sidelines_started: AtomicU64,
    pub sidelines_stopped: AtomicU64,
    per_consumer: RwLock<HashMap<VirtualConsumerId, Arc<ConsumerCounters>>>,
    start_time: Instant,
}

impl Default for SpoutMetrics {
    fn default() -> Self {
        Self {
            emitted: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            deserialization_failures: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            sidelines_started: AtomicU64::new(0),
            sidelines_stopped: AtomicU64::new(0),
            per_consumer: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }
}

impl SpoutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one virtual consumer, created on first use.
    pub fn consumer(&self, id: &VirtualConsumerId) -> Arc<ConsumerCounters> {
        if let Some(counters) = self.per_consumer.read().get(id) {
            return Arc::clone(counters);
        }
        let mut per_consumer = self.per_consumer.write();
        Arc::clone(per_consumer.entry(id.clone()).or_default())
    }

    pub fn count_emit(&self, id: &VirtualConsumerId) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.consumer(id).emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_ack(&self, id: &VirtualConsumerId) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.consumer(id).acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fail(&self, id: &VirtualConsumerId) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.consumer(id).failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Snapshot of per-consumer counts for progress logs.
    pub fn consumer_snapshot(&self) -> Vec<(VirtualConsumerId, u64, u64, u64)> {
        let mut snapshot: Vec<_> = self
            .per_consumer
            .read()
            .iter()
            .map(|(id, counters)| {
                (
                    id.clone(),
                    counters.emitted.load(Ordering::Relaxed),
                    counters.acked.load(Ordering::Relaxed),
                    counters.failed.load(Ordering::Relaxed),
                )
            })
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}
