//! Persistence of consumer state and sideline requests.

mod filesystem;
mod memory;

pub use filesystem::FilesystemPersistenceAdapter;
pub use memory::InMemoryPersistenceAdapter;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SpoutResult;
use crate::filter::PersistedStep;
use crate::message::{ConsumerState, VirtualConsumerId};
use crate::sideline::SidelineRequestIdentifier;

/// Lifecycle stage a persisted sideline request is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SidelineType {
    Start,
    Stop,
}

/// The persisted form of a sideline request.
///
/// The steps stored here are always the ORIGINAL, non-negated predicates, for
/// both START and STOP; replay-time negation is derived from the type. That
/// keeps the persisted form a fixed point across recovery cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidelinePayload {
    pub id: SidelineRequestIdentifier,
    pub sideline_type: SidelineType,
    pub steps: Vec<PersistedStep>,
    pub starting_state: ConsumerState,
    /// Set at STOP time; absent for START.
    pub ending_state: Option<ConsumerState>,
}

/// Key-value store for committed consumer state and sideline payloads.
///
/// Logical layout under a configured root:
/// `consumers/<virtualConsumerId>/<partition>` for committed offsets and
/// `sideline/<requestId>` for payloads.
pub trait PersistenceAdapter: Send + Sync + fmt::Debug {
    /// Connect/initialize. Called once before any other method.
    fn open(&self) -> SpoutResult<()>;

    /// Release resources. Idempotent.
    fn close(&self) -> SpoutResult<()>;

    fn persist_consumer_state(
        &self,
        id: &VirtualConsumerId,
        state: &ConsumerState,
    ) -> SpoutResult<()>;

    fn retrieve_consumer_state(&self, id: &VirtualConsumerId)
        -> SpoutResult<Option<ConsumerState>>;

    fn clear_consumer_state(&self, id: &VirtualConsumerId) -> SpoutResult<()>;

    fn persist_sideline_request(&self, payload: &SidelinePayload) -> SpoutResult<()>;

    fn retrieve_sideline_request(
        &self,
        id: &SidelineRequestIdentifier,
    ) -> SpoutResult<Option<SidelinePayload>>;

    fn list_sideline_requests(&self) -> SpoutResult<Vec<SidelineRequestIdentifier>>;

    fn clear_sideline_request(&self, id: &SidelineRequestIdentifier) -> SpoutResult<()>;
}
