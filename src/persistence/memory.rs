//! Process-local persistence for tests and single-process drills.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::SpoutResult;
use crate::message::{ConsumerState, VirtualConsumerId};
use crate::persistence::{PersistenceAdapter, SidelinePayload};
use crate::sideline::SidelineRequestIdentifier;

/// Keeps everything in maps. State does not survive a restart, but sharing
/// one instance across components inside a process gives the full recovery
/// flow something real to run against.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceAdapter {
    consumer_state: RwLock<HashMap<VirtualConsumerId, ConsumerState>>,
    sideline_requests: RwLock<HashMap<SidelineRequestIdentifier, SidelinePayload>>,
}

impl InMemoryPersistenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceAdapter for InMemoryPersistenceAdapter {
    fn open(&self) -> SpoutResult<()> {
        Ok(())
    }

    fn close(&self) -> SpoutResult<()> {
        Ok(())
    }

    fn persist_consumer_state(
        &self,
        id: &VirtualConsumerId,
        state: &ConsumerState,
    ) -> SpoutResult<()> {
        self.consumer_state
            .write()
            .insert(id.clone(), state.clone());
        Ok(())
    }

    fn retrieve_consumer_state(
        &self,
        id: &VirtualConsumerId,
    ) -> SpoutResult<Option<ConsumerState>> {
        Ok(self.consumer_state.read().get(id).cloned())
    }

    fn clear_consumer_state(&self, id: &VirtualConsumerId) -> SpoutResult<()> {
        self.consumer_state.write().remove(id);
        Ok(())
    }

    fn persist_sideline_request(&self, payload: &SidelinePayload) -> SpoutResult<()> {
        self.sideline_requests
            .write()
            .insert(payload.id.clone(), payload.clone());
        Ok(())
    }

    fn retrieve_sideline_request(
        &self,
        id: &SidelineRequestIdentifier,
    ) -> SpoutResult<Option<SidelinePayload>> {
        Ok(self.sideline_requests.read().get(id).cloned())
    }

    fn list_sideline_requests(&self) -> SpoutResult<Vec<SidelineRequestIdentifier>> {
        let mut ids: Vec<_> = self.sideline_requests.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn clear_sideline_request(&self, id: &SidelineRequestIdentifier) -> SpoutResult<()> {
        self.sideline_requests.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TopicPartition;
    use crate::persistence::SidelineType;

    #[test]
    fn consumer_state_round_trip() {
        let adapter = InMemoryPersistenceAdapter::new();
        adapter.open().unwrap();

        let id = VirtualConsumerId::from("spout-main-0");
        assert!(adapter.retrieve_consumer_state(&id).unwrap().is_none());

        let state = ConsumerState::builder()
            .with_partition(TopicPartition::new("topic", 0), 123)
            .build();
        adapter.persist_consumer_state(&id, &state).unwrap();
        assert_eq!(adapter.retrieve_consumer_state(&id).unwrap(), Some(state));

        adapter.clear_consumer_state(&id).unwrap();
        assert!(adapter.retrieve_consumer_state(&id).unwrap().is_none());
    }

    #[test]
    fn sideline_request_round_trip() {
        let adapter = InMemoryPersistenceAdapter::new();
        let id = SidelineRequestIdentifier::new();
        let payload = SidelinePayload {
            id: id.clone(),
            sideline_type: SidelineType::Start,
            steps: Vec::new(),
            starting_state: ConsumerState::default(),
            ending_state: None,
        };

        adapter.persist_sideline_request(&payload).unwrap();
        assert_eq!(
            adapter.retrieve_sideline_request(&id).unwrap(),
            Some(payload)
        );
        assert_eq!(adapter.list_sideline_requests().unwrap(), vec![id.clone()]);

        adapter.clear_sideline_request(&id).unwrap();
        assert!(adapter.list_sideline_requests().unwrap().is_empty());
    }
}
