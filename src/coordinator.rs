//! Runs the virtual consumers and multiplexes their output.
//!
//! One worker task per virtual consumer, one monitor task for bookkeeping.
//! `next_message`, `ack` and `fail` are synchronous and callable from the host
//! runtime thread; ack/fail route through bounded per-consumer queues so that
//! `next_message`, `ack` and `fail` on any one consumer stay serialized on its
//! worker task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::MessageBuffer;
use crate::config::SpoutConfig;
use crate::consumer::VirtualConsumer;
use crate::error::{SpoutError, SpoutResult};
use crate::message::{Message, MessageId, VirtualConsumerId};
use crate::metrics::SpoutMetrics;

enum ConsumerOp {
    Ack(MessageId),
    Fail(MessageId),
}

struct ConsumerHandle {
    ops_tx: mpsc::Sender<ConsumerOp>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct PendingConsumer {
    id: VirtualConsumerId,
    consumer: Arc<Mutex<VirtualConsumer>>,
    ops_rx: mpsc::Receiver<ConsumerOp>,
}

/// Owns the virtual consumer fleet and the shared message buffer.
pub struct SpoutCoordinator {
    config: Arc<SpoutConfig>,
    metrics: Arc<SpoutMetrics>,
    buffer: Arc<dyn MessageBuffer>,
    registry: Arc<RwLock<HashMap<VirtualConsumerId, ConsumerHandle>>>,
    pending_tx: mpsc::UnboundedSender<PendingConsumer>,
    pending_rx: SyncMutex<Option<mpsc::UnboundedReceiver<PendingConsumer>>>,
    monitor: SyncMutex<Option<JoinHandle<()>>>,
    opened: AtomicBool,
}

impl SpoutCoordinator {
    pub fn new(
        config: Arc<SpoutConfig>,
        metrics: Arc<SpoutMetrics>,
        buffer: Arc<dyn MessageBuffer>,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            config,
            metrics,
            buffer,
            registry: Arc::new(RwLock::new(HashMap::new())),
            pending_tx,
            pending_rx: SyncMutex::new(Some(pending_rx)),
            monitor: SyncMutex::new(None),
            opened: AtomicBool::new(false),
        }
    }

    /// Start the monitor task. One-shot.
    pub fn open(&self) -> SpoutResult<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(SpoutError::IllegalState(
                "coordinator already opened".to_string(),
            ));
        }
        let pending_rx = self
            .pending_rx
            .lock()
            .take()
            .ok_or_else(|| SpoutError::IllegalState("coordinator reopened".to_string()))?;

        let monitor = tokio::spawn(run_monitor(
            pending_rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.buffer),
            Arc::clone(&self.metrics),
            Arc::clone(&self.config),
        ));
        *self.monitor.lock() = Some(monitor);
        info!("coordinator opened");
        Ok(())
    }

    /// Submit a consumer; its worker starts on the next monitor pass.
    pub async fn add_virtual_consumer(&self, consumer: VirtualConsumer) -> SpoutResult<()> {
        self.add_shared_virtual_consumer(Arc::new(Mutex::new(consumer)))
            .await
    }

    /// Submit a consumer somebody else also holds (the firehose, which the
    /// sideline controller snapshots state from).
    pub async fn add_shared_virtual_consumer(
        &self,
        consumer: Arc<Mutex<VirtualConsumer>>,
    ) -> SpoutResult<()> {
        let (id, stop) = {
            let consumer = consumer.lock().await;
            (consumer.id().clone(), consumer.stop_handle())
        };

        {
            let mut registry = self.registry.write();
            if registry.contains_key(&id) {
                return Err(SpoutError::IllegalState(format!(
                    "virtual consumer {id} is already registered"
                )));
            }
            let (ops_tx, ops_rx) = mpsc::channel(self.config.ack_queue_capacity);
            registry.insert(
                id.clone(),
                ConsumerHandle {
                    ops_tx,
                    stop,
                    join: None,
                },
            );
            self.pending_tx
                .send(PendingConsumer {
                    id: id.clone(),
                    consumer,
                    ops_rx,
                })
                .map_err(|_| SpoutError::Channel("coordinator is shut down".to_string()))?;
        }

        debug!(%id, "virtual consumer submitted");
        Ok(())
    }

    /// Whether a consumer with this id is registered (pending or running).
    pub fn has_consumer(&self, id: &VirtualConsumerId) -> bool {
        self.registry.read().contains_key(id)
    }

    /// Ids of all registered consumers.
    pub fn consumer_ids(&self) -> Vec<VirtualConsumerId> {
        let mut ids: Vec<_> = self.registry.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pull the next multiplexed message, if any. Never blocks.
    pub fn next_message(&self) -> Option<Message> {
        self.buffer.poll()
    }

    /// Route an ack to the consumer that emitted the tuple.
    pub fn ack(&self, id: &MessageId) {
        self.route(id, ConsumerOp::Ack(id.clone()));
    }

    /// Route a fail to the consumer that emitted the tuple.
    pub fn fail(&self, id: &MessageId) {
        self.route(id, ConsumerOp::Fail(id.clone()));
    }

    fn route(&self, id: &MessageId, op: ConsumerOp) {
        let registry = self.registry.read();
        let Some(handle) = registry.get(&id.src_consumer_id) else {
            warn!(%id, "ack/fail for unknown virtual consumer, dropping");
            return;
        };
        match handle.ops_tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%id, "ack/fail queue full, dropping; tuple stays in flight");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%id, "ack/fail for finished virtual consumer, dropping");
            }
        }
    }

    /// Stop every consumer, wait out the grace period, abort stragglers.
    pub async fn close(&self) {
        info!("closing coordinator");
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        let handles: Vec<(VirtualConsumerId, Option<JoinHandle<()>>)> = {
            let mut registry = self.registry.write();
            registry
                .iter_mut()
                .map(|(id, handle)| {
                    handle.stop.store(true, Ordering::Relaxed);
                    (id.clone(), handle.join.take())
                })
                .collect()
        };

        let deadline = Instant::now() + self.config.shutdown_grace();
        for (id, join) in handles {
            let Some(join) = join else { continue };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, join).await {
                Ok(_) => debug!(%id, "worker stopped"),
                Err(_) => {
                    warn!(%id, "worker did not stop within the grace period, aborting");
                }
            }
        }

        self.registry.write().clear();
        info!("coordinator closed");
    }
}

impl std::fmt::Debug for SpoutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoutCoordinator")
            .field("consumers", &self.registry.read().len())
            .field("buffered", &self.buffer.size())
            .finish()
    }
}

/// Bookkeeping task: starts workers for newly submitted consumers, reaps
/// finished ones and reports progress.
async fn run_monitor(
    mut pending_rx: mpsc::UnboundedReceiver<PendingConsumer>,
    registry: Arc<RwLock<HashMap<VirtualConsumerId, ConsumerHandle>>>,
    buffer: Arc<dyn MessageBuffer>,
    metrics: Arc<SpoutMetrics>,
    config: Arc<SpoutConfig>,
) {
    let mut ticker = tokio::time::interval(config.monitor_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            pending = pending_rx.recv() => {
                let Some(pending) = pending else {
                    debug!("pending queue closed, monitor exiting");
                    break;
                };
                let join = tokio::spawn(run_worker(
                    pending.consumer,
                    pending.ops_rx,
                    Arc::clone(&buffer),
                    Arc::clone(&metrics),
                    Arc::clone(&config),
                ));
                if let Some(handle) = registry.write().get_mut(&pending.id) {
                    handle.join = Some(join);
                }
                info!(id = %pending.id, "worker started");
            }
            _ = ticker.tick() => {
                reap_finished(&registry, &buffer);
                if last_report.elapsed() >= config.metrics_interval() {
                    report_progress(&registry, &buffer, &metrics);
                    last_report = Instant::now();
                }
            }
        }
    }
}

fn reap_finished(
    registry: &RwLock<HashMap<VirtualConsumerId, ConsumerHandle>>,
    buffer: &Arc<dyn MessageBuffer>,
) {
    let finished: Vec<VirtualConsumerId> = registry
        .read()
        .iter()
        .filter(|(_, handle)| {
            handle
                .join
                .as_ref()
                .map(|join| join.is_finished())
                .unwrap_or(false)
        })
        .map(|(id, _)| id.clone())
        .collect();

    if finished.is_empty() {
        return;
    }
    let mut registry = registry.write();
    for id in finished {
        registry.remove(&id);
        buffer.deregister_producer(&id);
        info!(%id, "reaped finished virtual consumer");
    }
}

fn report_progress(
    registry: &RwLock<HashMap<VirtualConsumerId, ConsumerHandle>>,
    buffer: &Arc<dyn MessageBuffer>,
    metrics: &Arc<SpoutMetrics>,
) {
    info!(
        consumers = registry.read().len(),
        buffered = buffer.size(),
        emitted = metrics.emitted.load(Ordering::Relaxed),
        acked = metrics.acked.load(Ordering::Relaxed),
        failed = metrics.failed.load(Ordering::Relaxed),
        "spout progress"
    );
    for (id, emitted, acked, failed) in metrics.consumer_snapshot() {
        debug!(%id, emitted, acked, failed, "consumer progress");
    }
}

/// Dedicated loop for one virtual consumer: process queued acks/fails, then
/// poll; a full buffer blocks here and backpressures the consumer.
async fn run_worker(
    consumer: Arc<Mutex<VirtualConsumer>>,
    mut ops_rx: mpsc::Receiver<ConsumerOp>,
    buffer: Arc<dyn MessageBuffer>,
    metrics: Arc<SpoutMetrics>,
    config: Arc<SpoutConfig>,
) {
    let id = {
        let mut consumer = consumer.lock().await;
        let id = consumer.id().clone();
        // Consumers built at runtime (replays) are opened here, on the task
        // that will drive them; the firehose arrives already open.
        if !consumer.is_opened() {
            if let Err(err) = consumer.open().await {
                error!(%id, %err, "failed to open virtual consumer, giving up");
                return;
            }
        }
        id
    };
    buffer.register_producer(id.clone());

    let idle_sleep = config.worker_idle_sleep();
    let flush_interval = config.commit_flush_interval();
    let mut last_flush = Instant::now();

    loop {
        let next = {
            let mut consumer = consumer.lock().await;

            while let Ok(op) = ops_rx.try_recv() {
                let outcome = match op {
                    ConsumerOp::Ack(message_id) => consumer.ack(&message_id),
                    ConsumerOp::Fail(message_id) => consumer.fail(&message_id),
                };
                if let Err(err) = outcome {
                    warn!(%id, %err, "ack/fail processing failed");
                }
            }

            if consumer.is_stop_requested() || consumer.is_completed() {
                if let Err(err) = consumer.close().await {
                    error!(%id, %err, "error closing virtual consumer");
                }
                break;
            }

            if last_flush.elapsed() >= flush_interval {
                if let Err(err) = consumer.flush().await {
                    metrics.transient_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%id, %err, "commit flush failed, will retry");
                }
                last_flush = Instant::now();
            }

            consumer.next_message().await
        };

        match next {
            Ok(Some(message)) => {
                if let Err(err) = buffer.put(message).await {
                    error!(%id, %err, "buffer rejected message, stopping worker");
                    let mut consumer = consumer.lock().await;
                    if let Err(err) = consumer.close().await {
                        error!(%id, %err, "error closing virtual consumer");
                    }
                    break;
                }
            }
            Ok(None) => {
                tokio::time::sleep(idle_sleep).await;
            }
            Err(err) if err.is_transient() => {
                metrics.transient_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%id, %err, "transient consumer error, retrying next tick");
                tokio::time::sleep(idle_sleep).await;
            }
            Err(err) => {
                error!(%id, %err, "fatal consumer error, stopping worker");
                let mut consumer = consumer.lock().await;
                if let Err(err) = consumer.close().await {
                    error!(%id, %err, "error closing virtual consumer");
                }
                break;
            }
        }
    }
    debug!(%id, "worker exited");
}
