//! Retry managers deciding whether and when failed tuples are replayed.
//!
//! A retry manager instance is owned by exactly one virtual consumer and all
//! calls on it are serialized by that consumer's worker task, so no internal
//! locking is needed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RetryManagerConfig;
use crate::message::MessageId;

/// Tracks failed message ids and decides their fate.
///
/// Contract: `failed` on an unknown id registers it. `acked` removes all retry
/// state. `next_failed_message_to_retry` hands the returned id out as
/// "in flight" — it will not be returned again until a new `failed` call
/// re-marks it.
pub trait RetryManager: Send + fmt::Debug {
    /// Apply configuration. Called once by the owning consumer's `open()`.
    fn open(&mut self, config: &RetryManagerConfig) {
        let _ = config;
    }

    /// Record a failure for `id`.
    fn failed(&mut self, id: MessageId);

    /// Drop all retry state for `id`.
    fn acked(&mut self, id: &MessageId);

    /// Whether `id` deserves another delivery attempt.
    fn retry_further(&mut self, id: &MessageId) -> bool;

    /// The next id that is due for a retry, if any.
    fn next_failed_message_to_retry(&mut self) -> Option<MessageId>;
}

/// Disables retries entirely: every failure is abandoned.
#[derive(Debug, Default)]
pub struct NeverRetryManager;

impl RetryManager for NeverRetryManager {
    fn failed(&mut self, _id: MessageId) {}

    fn acked(&mut self, _id: &MessageId) {}

    fn retry_further(&mut self, _id: &MessageId) -> bool {
        false
    }

    fn next_failed_message_to_retry(&mut self) -> Option<MessageId> {
        None
    }
}

/// Replays every failed tuple as soon as possible, in failure order.
///
/// Used by replay consumers, which must re-emit every failure to uphold
/// at-least-once delivery for the sidelined range.
#[derive(Debug, Default)]
pub struct FailedTuplesFirstRetryManager {
    failed_message_ids: VecDeque<MessageId>,
    in_flight: HashSet<MessageId>,
}

impl FailedTuplesFirstRetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn is_tracked(&self, id: &MessageId) -> bool {
        self.failed_message_ids.contains(id) || self.in_flight.contains(id)
    }
}

impl RetryManager for FailedTuplesFirstRetryManager {
    fn failed(&mut self, id: MessageId) {
        self.in_flight.remove(&id);
        if !self.failed_message_ids.contains(&id) {
            self.failed_message_ids.push_back(id);
        }
    }

    fn acked(&mut self, id: &MessageId) {
        self.in_flight.remove(id);
        self.failed_message_ids.retain(|failed| failed != id);
    }

    fn retry_further(&mut self, _id: &MessageId) -> bool {
        true
    }

    fn next_failed_message_to_retry(&mut self) -> Option<MessageId> {
        let id = self.failed_message_ids.pop_front()?;
        self.in_flight.insert(id.clone());
        Some(id)
    }
}

#[derive(Debug, Clone)]
struct RetryRecord {
    attempts: u32,
    first_failed_at: Instant,
    retry_at: Instant,
}

/// Exponential backoff with a delay cap and an optional attempt ceiling.
///
/// The k-th failure of an id schedules its retry `initial * multiplier^(k-1)`
/// after the failure, never more than `max_delay` out.
#[derive(Debug)]
pub struct ExponentialBackoffRetryManager {
    initial_delay: Duration,
    delay_multiplier: f64,
    max_delay: Duration,
    max_attempts: i32,
    records: HashMap<MessageId, RetryRecord>,
    in_flight: HashSet<MessageId>,
}

impl Default for ExponentialBackoffRetryManager {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            delay_multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            max_attempts: 25,
            records: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }
}

impl ExponentialBackoffRetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Large exponents saturate at the cap rather than overflowing.
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let multiplier = self.delay_multiplier.powi(exponent);
        if !multiplier.is_finite() {
            return self.max_delay;
        }
        let delay = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay).min(self.max_delay)
    }
}

impl RetryManager for ExponentialBackoffRetryManager {
    fn open(&mut self, config: &RetryManagerConfig) {
        if let RetryManagerConfig::ExponentialBackoff {
            initial_delay_ms,
            delay_multiplier,
            max_delay_ms,
            max_attempts,
        } = config
        {
            self.initial_delay = Duration::from_millis(*initial_delay_ms);
            self.delay_multiplier = *delay_multiplier;
            self.max_delay = Duration::from_millis(*max_delay_ms);
            self.max_attempts = *max_attempts;
        }
    }

    fn failed(&mut self, id: MessageId) {
        self.in_flight.remove(&id);
        let now = Instant::now();
        let record = self.records.entry(id.clone()).or_insert(RetryRecord {
            attempts: 0,
            first_failed_at: now,
            retry_at: now,
        });
        record.attempts += 1;
        let attempts = record.attempts;
        let delay = self.delay_for_attempt(attempts);
        let record = self.records.get_mut(&id).expect("record just inserted");
        record.retry_at = now + delay;
        debug!(%id, attempts = record.attempts, ?delay, "scheduled retry");
    }

    fn acked(&mut self, id: &MessageId) {
        self.in_flight.remove(id);
        self.records.remove(id);
    }

    fn retry_further(&mut self, id: &MessageId) -> bool {
        if self.max_attempts < 0 {
            return true;
        }
        let attempts = self.records.get(id).map(|record| record.attempts).unwrap_or(0);
        (attempts as i64) < self.max_attempts as i64
    }

    fn next_failed_message_to_retry(&mut self) -> Option<MessageId> {
        let now = Instant::now();
        let id = self
            .records
            .iter()
            .filter(|(id, record)| !self.in_flight.contains(*id) && record.retry_at <= now)
            .min_by_key(|(_, record)| (record.retry_at, record.first_failed_at))
            .map(|(id, _)| id.clone())?;
        self.in_flight.insert(id.clone());
        Some(id)
    }
}
