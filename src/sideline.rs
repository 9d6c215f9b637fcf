//! Sideline requests: divert a filtered subset of the firehose now, replay it
//! later over exactly the diverted offset range.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{RetryManagerConfig, SpoutConfig};
use crate::consumer::VirtualConsumer;
use crate::coordinator::SpoutCoordinator;
use crate::error::{SpoutError, SpoutResult};
use crate::factory::ComponentFactory;
use crate::filter::{
    FilterChain, FilterChainStep, FilterStepRegistry, NegatingFilterChainStep, PersistedStep,
};
use crate::message::{ConsumerState, VirtualConsumerId};
use crate::metrics::SpoutMetrics;
use crate::persistence::{PersistenceAdapter, SidelinePayload, SidelineType};

/// Identifies one sideline request across restarts.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SidelineRequestIdentifier(Uuid);

impl SidelineRequestIdentifier {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SidelineRequestIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SidelineRequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SidelineRequestIdentifier {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(value)?))
    }
}

/// An operator-issued diversion request: an identifier plus the ordered
/// predicates describing what to divert.
///
/// The step list is the identity used to locate an active request at stop
/// time, via [`FilterChainStep::step_eq`].
#[derive(Debug, Clone)]
pub struct SidelineRequest {
    pub id: SidelineRequestIdentifier,
    pub steps: Vec<Arc<dyn FilterChainStep>>,
}

impl SidelineRequest {
    pub fn new(steps: Vec<Arc<dyn FilterChainStep>>) -> Self {
        Self {
            id: SidelineRequestIdentifier::new(),
            steps,
        }
    }

    fn persisted_steps(&self) -> Vec<PersistedStep> {
        self.steps.iter().map(|step| step.persisted()).collect()
    }
}

/// Drives the sideline lifecycle: start/stop requests, persistence and
/// replay-consumer spawning, plus recovery on open.
///
/// May be called from any thread; filter-chain mutations go through the
/// shared lock so they serialize with firehose reads.
pub struct SidelineController {
    config: Arc<SpoutConfig>,
    factory: ComponentFactory,
    metrics: Arc<SpoutMetrics>,
    persistence: Arc<dyn PersistenceAdapter>,
    registry: FilterStepRegistry,
    firehose: Arc<Mutex<VirtualConsumer>>,
    firehose_chain: Arc<RwLock<FilterChain>>,
    coordinator: Arc<SpoutCoordinator>,
}

impl fmt::Debug for SidelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidelineController")
            .field("active_filters", &self.firehose_chain.read().len())
            .finish()
    }
}

impl SidelineController {
    pub fn new(
        config: Arc<SpoutConfig>,
        factory: ComponentFactory,
        metrics: Arc<SpoutMetrics>,
        persistence: Arc<dyn PersistenceAdapter>,
        registry: FilterStepRegistry,
        firehose: Arc<Mutex<VirtualConsumer>>,
        firehose_chain: Arc<RwLock<FilterChain>>,
        coordinator: Arc<SpoutCoordinator>,
    ) -> Self {
        Self {
            config,
            factory,
            metrics,
            persistence,
            registry,
            firehose,
            firehose_chain,
            coordinator,
        }
    }

    fn replay_consumer_id(&self, request_id: &SidelineRequestIdentifier) -> VirtualConsumerId {
        VirtualConsumerId::new(
            &self.config.consumer_id_prefix,
            Some(&request_id.to_string()),
            self.config.task_index,
        )
    }

    /// Begin diverting: snapshot the firehose position, persist the request
    /// and attach its filter steps to the firehose.
    pub async fn start(&self, request: &SidelineRequest) -> SpoutResult<SidelineRequestIdentifier> {
        let id = request.id.clone();
        info!(%id, steps = request.steps.len(), "starting sideline request");

        let starting_state = self.firehose.lock().await.current_state()?;

        self.persistence.persist_sideline_request(&SidelinePayload {
            id: id.clone(),
            sideline_type: SidelineType::Start,
            steps: request.persisted_steps(),
            starting_state: starting_state.clone(),
            ending_state: None,
        })?;

        self.firehose_chain
            .write()
            .add_steps(id.clone(), request.steps.clone());

        self.metrics.sidelines_started.fetch_add(1, Ordering::Relaxed);
        warn!(
            %id,
            ?starting_state,
            "sideline active; log retention must cover the diverted range until replay"
        );
        Ok(id)
    }

    /// Stop diverting: detach the filter, persist the STOP payload and spawn
    /// a replay consumer over the diverted range with negated steps.
    ///
    /// Returns `None` (and logs) when no active request matches the steps.
    pub async fn stop(
        &self,
        request: &SidelineRequest,
    ) -> SpoutResult<Option<SidelineRequestIdentifier>> {
        let Some(id) = self.firehose_chain.read().find_label(&request.steps) else {
            warn!(
                "no filter chain steps match this stop request; check the step \
                 equality implementation"
            );
            return Ok(None);
        };
        info!(%id, "stopping sideline request");

        let steps = self
            .firehose_chain
            .write()
            .remove_steps(&id)
            .unwrap_or_default();

        let starting_state = self
            .persistence
            .retrieve_sideline_request(&id)?
            .ok_or_else(|| {
                SpoutError::Persistence(format!("no persisted payload for sideline request {id}"))
            })?
            .starting_state;
        let ending_state = self.firehose.lock().await.current_state()?;

        // The payload keeps the ORIGINAL steps; negation happens only when a
        // replay consumer is constructed.
        self.persistence.persist_sideline_request(&SidelinePayload {
            id: id.clone(),
            sideline_type: SidelineType::Stop,
            steps: steps.iter().map(|step| step.persisted()).collect(),
            starting_state: starting_state.clone(),
            ending_state: Some(ending_state.clone()),
        })?;

        let replay = self.build_replay_consumer(&id, &steps, starting_state, ending_state);
        self.coordinator.add_virtual_consumer(replay).await?;

        self.metrics.sidelines_stopped.fetch_add(1, Ordering::Relaxed);
        Ok(Some(id))
    }

    fn build_replay_consumer(
        &self,
        id: &SidelineRequestIdentifier,
        original_steps: &[Arc<dyn FilterChainStep>],
        starting_state: ConsumerState,
        ending_state: ConsumerState,
    ) -> VirtualConsumer {
        let negated: Vec<Arc<dyn FilterChainStep>> = original_steps
            .iter()
            .map(|step| {
                Arc::new(NegatingFilterChainStep::new(Arc::clone(step)))
                    as Arc<dyn FilterChainStep>
            })
            .collect();
        let mut chain = FilterChain::new();
        chain.add_steps(id.clone(), negated);

        VirtualConsumer::new(
            self.replay_consumer_id(id),
            Arc::clone(&self.config),
            self.factory.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.persistence),
            Some(starting_state),
            Some(ending_state),
        )
        .with_retry_manager(RetryManagerConfig::FailedTuplesFirst)
        .with_filter_chain(Arc::new(RwLock::new(chain)))
        .with_sideline_request(id.clone())
    }

    /// Re-establish persisted sideline state after a restart.
    ///
    /// STARTs re-attach their filters to the firehose; STOPs respawn replay
    /// consumers, resuming from their own committed state when one exists.
    /// Idempotent: running it twice produces the same live state.
    pub async fn recover_on_open(&self) -> SpoutResult<()> {
        let ids = self.persistence.list_sideline_requests()?;
        info!(count = ids.len(), "resuming persisted sideline requests");

        for id in ids {
            let Some(payload) = self.persistence.retrieve_sideline_request(&id)? else {
                continue;
            };
            let steps = self.registry.revive_all(&payload.steps)?;

            match payload.sideline_type {
                SidelineType::Start => {
                    if self.firehose_chain.read().has_label(&id) {
                        continue;
                    }
                    info!(%id, "resuming START sideline, re-attaching filter");
                    self.firehose_chain.write().add_steps(id.clone(), steps);
                }
                SidelineType::Stop => {
                    if self.coordinator.has_consumer(&self.replay_consumer_id(&id)) {
                        continue;
                    }
                    let Some(ending_state) = payload.ending_state.clone() else {
                        warn!(%id, "STOP payload without ending state, skipping");
                        continue;
                    };
                    info!(%id, "resuming STOP sideline, spawning replay consumer");
                    // The log client prefers this consumer's own committed
                    // state over the payload's starting state at open.
                    let replay = self.build_replay_consumer(
                        &id,
                        &steps,
                        payload.starting_state.clone(),
                        ending_state,
                    );
                    self.coordinator.add_virtual_consumer(replay).await?;
                }
            }
        }
        Ok(())
    }
}
