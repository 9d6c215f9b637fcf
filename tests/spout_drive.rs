//! Driving the host-facing spout surface end to end over an in-process log,
//! with filesystem persistence surviving a simulated restart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use sideline_spout::{
    DeserializerConfig, DynamicSpout, FieldEqualsFilter, FilesystemPersistenceAdapter,
    FilterChainStep, InMemoryLog, InMemoryLogConsumerFactory, MessageId, PersistenceAdapter,
    PersistenceConfig, SidelineRequest, SpoutConfig, TupleEmitter,
};

const TOPIC: &str = "events";

#[derive(Clone, Default)]
struct CollectingEmitter {
    tuples: Arc<Mutex<Vec<(String, Vec<Value>, MessageId)>>>,
}

impl TupleEmitter for CollectingEmitter {
    fn emit(&mut self, stream_id: &str, values: &[Value], message_id: MessageId) {
        self.tuples
            .lock()
            .push((stream_id.to_string(), values.to_vec(), message_id));
    }
}

struct SpoutUnderTest {
    spout: DynamicSpout,
    emitter: CollectingEmitter,
}

impl SpoutUnderTest {
    fn open(log: &Arc<InMemoryLog>, persistence_root: &std::path::Path) -> Self {
        let config = SpoutConfig::builder()
            .consumer_id_prefix("drive")
            .topic(TOPIC)
            .deserializer(DeserializerConfig::Json)
            .persistence(PersistenceConfig::Filesystem {
                root: persistence_root.to_path_buf(),
            })
            .monitor_interval_ms(20)
            .worker_idle_sleep_ms(5)
            .shutdown_grace_ms(2_000)
            .build();

        // The injected log-consumer factory shares the spout's persisted
        // state through the same filesystem root.
        let factory_persistence: Arc<dyn PersistenceAdapter> =
            Arc::new(FilesystemPersistenceAdapter::new(persistence_root));
        factory_persistence.open().unwrap();

        let mut spout = DynamicSpout::new(config).with_log_consumer_factory(Arc::new(
            InMemoryLogConsumerFactory::new(Arc::clone(log), TOPIC, factory_persistence),
        ));

        let emitter = CollectingEmitter::default();
        spout.open(Box::new(emitter.clone())).unwrap();
        Self { spout, emitter }
    }

    /// Pump `next_tuple` until `predicate` over all collected tuples holds.
    fn pump_until<F>(&mut self, timeout: Duration, predicate: F)
    where
        F: Fn(&[(String, Vec<Value>, MessageId)]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.spout.next_tuple();
            {
                let tuples = self.emitter.tuples.lock();
                if predicate(&tuples) {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn emitted_offsets(&self) -> Vec<i64> {
        let mut offsets: Vec<i64> = self
            .emitter
            .tuples
            .lock()
            .iter()
            .map(|(_, _, id)| id.offset)
            .collect();
        offsets.sort_unstable();
        offsets
    }

    fn ack_all(&self) {
        for (_, _, id) in self.emitter.tuples.lock().iter() {
            self.spout.ack(id);
        }
    }
}

fn tenant_record(tenant: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({ "tenant": tenant })).unwrap()
}

fn acme_request() -> SidelineRequest {
    let steps: Vec<Arc<dyn FilterChainStep>> =
        vec![Arc::new(FieldEqualsFilter::new("tenant", json!("acme")))];
    SidelineRequest::new(steps)
}

#[test]
fn emits_acks_and_declares_fields() {
    let log = Arc::new(InMemoryLog::new());
    let root = tempfile::tempdir().unwrap();
    for offset in 0..5 {
        log.produce_at(TOPIC, 0, offset, None, Some(&tenant_record("zenith")));
    }

    let mut driver = SpoutUnderTest::open(&log, root.path());
    assert_eq!(driver.spout.declared_output_fields(), vec!["document"]);
    assert_eq!(driver.spout.output_stream_id(), "default");
    driver.spout.activate();

    driver.pump_until(Duration::from_secs(5), |tuples| tuples.len() == 5);
    assert_eq!(driver.emitted_offsets(), vec![0, 1, 2, 3, 4]);
    for (stream, values, _) in driver.emitter.tuples.lock().iter() {
        assert_eq!(stream, "default");
        assert_eq!(values[0]["tenant"], json!("zenith"));
    }

    driver.ack_all();
    driver.spout.deactivate();
    driver.spout.close();
}

/// Sidelined messages stop flowing, replay after stop, and a START that was
/// never stopped keeps filtering after a restart.
#[test]
fn sideline_and_restart_recovery_through_the_spout_surface() {
    let log = Arc::new(InMemoryLog::new());
    let root = tempfile::tempdir().unwrap();
    for offset in 0..4 {
        log.produce_at(TOPIC, 0, offset, None, Some(&tenant_record("zenith")));
    }

    let mut driver = SpoutUnderTest::open(&log, root.path());
    driver.pump_until(Duration::from_secs(5), |tuples| tuples.len() == 4);
    driver.ack_all();

    // Divert acme.
    let request = acme_request();
    driver.spout.start_sidelining(&request).unwrap();

    log.produce_at(TOPIC, 0, 4, None, Some(&tenant_record("acme")));
    log.produce_at(TOPIC, 0, 5, None, Some(&tenant_record("zenith")));
    driver.pump_until(Duration::from_secs(5), |tuples| tuples.len() == 5);
    driver.ack_all();

    // Only the zenith record came through while the sideline is active.
    assert_eq!(driver.emitted_offsets(), vec![0, 1, 2, 3, 5]);

    // Stop: the diverted acme record replays from the sideline range.
    driver.spout.stop_sidelining(&request).unwrap();
    driver.pump_until(Duration::from_secs(10), |tuples| {
        tuples
            .iter()
            .any(|(_, values, id)| id.offset == 4 && values[0]["tenant"] == json!("acme"))
    });
    driver.ack_all();
    driver.spout.close();

    // Restart with a fresh START left active: it must filter immediately.
    let mut restarted = SpoutUnderTest::open(&log, root.path());
    let standing = acme_request();
    restarted.spout.start_sidelining(&standing).unwrap();
    restarted.spout.close();

    log.produce_at(TOPIC, 0, 6, None, Some(&tenant_record("acme")));
    log.produce_at(TOPIC, 0, 7, None, Some(&tenant_record("zenith")));

    let mut recovered = SpoutUnderTest::open(&log, root.path());
    recovered.pump_until(Duration::from_secs(5), |tuples| {
        tuples.iter().any(|(_, _, id)| id.offset == 7)
    });
    // The recovered filter kept the acme record out of the stream.
    assert!(recovered
        .emitter
        .tuples
        .lock()
        .iter()
        .all(|(_, _, id)| id.offset != 6));
    recovered.ack_all();
    recovered.spout.close();
}

#[test]
fn double_open_and_double_close_are_tolerated() {
    let log = Arc::new(InMemoryLog::new());
    log.create_partition(TOPIC, 0);
    let root = tempfile::tempdir().unwrap();

    let mut driver = SpoutUnderTest::open(&log, root.path());
    // A second open warns and refuses instead of rebuilding anything.
    driver
        .spout
        .open(Box::new(CollectingEmitter::default()))
        .unwrap();
    driver.spout.close();
    // Closing twice is a no-op.
    driver.spout.close();
}
