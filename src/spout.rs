//! Host-runtime adapter: the pull-based spout surface.
//!
//! The host drives `next_tuple`/`ack`/`fail` from its own thread; everything
//! async lives on a runtime owned by the spout. Embedders that already run
//! tokio can use [`SpoutCoordinator`] and [`SidelineController`] directly.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SpoutConfig;
use crate::consumer::VirtualConsumer;
use crate::coordinator::SpoutCoordinator;
use crate::error::{SpoutError, SpoutResult};
use crate::factory::{ComponentFactory, KafkaLogConsumerFactory, LogConsumerFactory};
use crate::filter::{FilterChain, FilterStepRegistry};
use crate::message::{MessageId, VirtualConsumerId};
use crate::metrics::SpoutMetrics;
use crate::persistence::PersistenceAdapter;
use crate::sideline::{SidelineController, SidelineRequest, SidelineRequestIdentifier};

/// Receives emitted tuples from [`DynamicSpout::next_tuple`].
pub trait TupleEmitter: Send {
    fn emit(&mut self, stream_id: &str, values: &[Value], message_id: MessageId);
}

/// A spout multiplexing a dynamic set of virtual consumers behind the host
/// runtime's pull contract.
pub struct DynamicSpout {
    config: Arc<SpoutConfig>,
    registry: FilterStepRegistry,
    metrics: Arc<SpoutMetrics>,
    log_consumers: Option<Arc<dyn LogConsumerFactory>>,
    runtime: Option<tokio::runtime::Runtime>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    coordinator: Option<Arc<SpoutCoordinator>>,
    controller: Option<Arc<SidelineController>>,
    emitter: Option<Box<dyn TupleEmitter>>,
    opened: bool,
}

impl DynamicSpout {
    pub fn new(config: SpoutConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: FilterStepRegistry::with_builtins(),
            metrics: Arc::new(SpoutMetrics::new()),
            log_consumers: None,
            runtime: None,
            persistence: None,
            coordinator: None,
            controller: None,
            emitter: None,
            opened: false,
        }
    }

    /// Register plugin filter steps before open so recovery can revive them.
    pub fn with_filter_step_registry(mut self, registry: FilterStepRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the Kafka-backed log-consumer factory (tests, drills).
    pub fn with_log_consumer_factory(mut self, factory: Arc<dyn LogConsumerFactory>) -> Self {
        self.log_consumers = Some(factory);
        self
    }

    fn firehose_id(&self) -> VirtualConsumerId {
        VirtualConsumerId::new(
            &self.config.consumer_id_prefix,
            Some("main"),
            self.config.task_index,
        )
    }

    /// Bring the whole engine up: persistence, coordinator, firehose and
    /// recovery of persisted sideline requests.
    pub fn open(&mut self, emitter: Box<dyn TupleEmitter>) -> SpoutResult<()> {
        if self.opened {
            warn!("spout already opened, refusing to open again");
            return Ok(());
        }
        self.config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sideline-spout")
            .build()?;

        let persistence =
            ComponentFactory::create_persistence_adapter(&self.config.persistence);
        persistence.open()?;

        let log_consumers = self.log_consumers.clone().unwrap_or_else(|| {
            Arc::new(KafkaLogConsumerFactory::new(
                Arc::clone(&self.config),
                Arc::clone(&persistence),
            ))
        });
        let factory = ComponentFactory::new(Arc::clone(&self.config), log_consumers);

        let buffer = factory.create_message_buffer();
        let coordinator = Arc::new(SpoutCoordinator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            buffer,
        ));

        let firehose_chain = Arc::new(RwLock::new(FilterChain::new()));
        let mut firehose = VirtualConsumer::new(
            self.firehose_id(),
            Arc::clone(&self.config),
            factory.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&persistence),
            None,
            None,
        )
        .with_filter_chain(Arc::clone(&firehose_chain));

        let controller = runtime.block_on(async {
            coordinator.open()?;
            firehose.open().await?;
            let firehose = Arc::new(Mutex::new(firehose));

            let controller = Arc::new(SidelineController::new(
                Arc::clone(&self.config),
                factory.clone(),
                Arc::clone(&self.metrics),
                Arc::clone(&persistence),
                self.registry.clone(),
                Arc::clone(&firehose),
                firehose_chain,
                Arc::clone(&coordinator),
            ));
            // Recover persisted sidelines before the firehose starts polling
            // so resumed filters never miss a record.
            controller.recover_on_open().await?;
            coordinator
                .add_shared_virtual_consumer(firehose)
                .await?;
            Ok::<_, SpoutError>(controller)
        })?;

        info!(id = %self.firehose_id(), "spout opened");
        self.runtime = Some(runtime);
        self.persistence = Some(persistence);
        self.coordinator = Some(coordinator);
        self.controller = Some(controller);
        self.emitter = Some(emitter);
        self.opened = true;
        Ok(())
    }

    /// Emit at most one tuple via the emitter.
    pub fn next_tuple(&mut self) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        let Some(message) = coordinator.next_message() else {
            return;
        };
        self.metrics.count_emit(&message.id().src_consumer_id);
        if let Some(emitter) = &mut self.emitter {
            emitter.emit(
                &self.config.output_stream_id,
                message.values(),
                message.id().clone(),
            );
        }
    }

    /// The tuple was fully processed by the topology.
    pub fn ack(&self, message_id: &MessageId) {
        self.metrics.count_ack(&message_id.src_consumer_id);
        if let Some(coordinator) = &self.coordinator {
            coordinator.ack(message_id);
        }
    }

    /// The tuple failed somewhere downstream.
    pub fn fail(&self, message_id: &MessageId) {
        warn!(%message_id, "failed tuple");
        self.metrics.count_fail(&message_id.src_consumer_id);
        if let Some(coordinator) = &self.coordinator {
            coordinator.fail(message_id);
        }
    }

    /// Field names for the host's output declaration, per the configured
    /// deserializer.
    pub fn declared_output_fields(&self) -> Vec<String> {
        use crate::config::DeserializerConfig;
        use crate::deserializer::{Deserializer, JsonDeserializer, Utf8StringDeserializer};
        match self.config.deserializer {
            DeserializerConfig::Utf8String => Utf8StringDeserializer.output_fields(),
            DeserializerConfig::Json => JsonDeserializer.output_fields(),
        }
    }

    pub fn output_stream_id(&self) -> &str {
        &self.config.output_stream_id
    }

    /// Begin diverting the subset matched by the request's steps.
    pub fn start_sidelining(
        &self,
        request: &SidelineRequest,
    ) -> SpoutResult<SidelineRequestIdentifier> {
        let (runtime, controller) = self.runtime_and_controller()?;
        runtime.block_on(controller.start(request))
    }

    /// Stop diverting and replay the diverted range.
    pub fn stop_sidelining(
        &self,
        request: &SidelineRequest,
    ) -> SpoutResult<Option<SidelineRequestIdentifier>> {
        let (runtime, controller) = self.runtime_and_controller()?;
        runtime.block_on(controller.stop(request))
    }

    fn runtime_and_controller(
        &self,
    ) -> SpoutResult<(&tokio::runtime::Runtime, &Arc<SidelineController>)> {
        match (&self.runtime, &self.controller) {
            (Some(runtime), Some(controller)) => Ok((runtime, controller)),
            _ => Err(SpoutError::IllegalState("spout is not open".to_string())),
        }
    }

    /// No-op hook for host activation.
    pub fn activate(&self) {
        debug!("activating spout");
    }

    /// No-op hook for host deactivation.
    pub fn deactivate(&self) {
        debug!("deactivating spout");
    }

    pub fn metrics(&self) -> &Arc<SpoutMetrics> {
        &self.metrics
    }

    /// Stop all consumers and release every resource. Idempotent.
    pub fn close(&mut self) {
        if !self.opened {
            warn!("spout is not open, nothing to close");
            return;
        }
        info!("stopping the coordinator and closing all consumers");

        if let (Some(runtime), Some(coordinator)) = (&self.runtime, &self.coordinator) {
            runtime.block_on(coordinator.close());
        }
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.close() {
                warn!(%err, "error closing persistence adapter");
            }
        }

        self.coordinator = None;
        self.controller = None;
        self.emitter = None;
        self.persistence = None;
        self.runtime = None;
        self.opened = false;
    }
}

impl Drop for DynamicSpout {
    fn drop(&mut self) {
        if self.opened {
            self.close();
        }
    }
}

impl std::fmt::Debug for DynamicSpout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicSpout")
            .field("opened", &self.opened)
            .field("firehose", &self.firehose_id())
            .finish()
    }
}
