//! JSON-file persistence under a root directory.
//!
//! Layout mirrors the logical one: `consumers/<id>/<topic>-<partition>.json`
//! holds one committed offset entry, `sideline/<requestId>.json` holds a
//! payload. Writes go through a temp file and rename so readers never see a
//! torn document.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SpoutError, SpoutResult};
use crate::message::{ConsumerState, TopicPartition, VirtualConsumerId};
use crate::persistence::{PersistenceAdapter, SidelinePayload};
use crate::sideline::SidelineRequestIdentifier;

#[derive(Debug, Serialize, Deserialize)]
struct OffsetEntry {
    topic: String,
    partition: i32,
    offset: i64,
}

/// Filesystem-backed [`PersistenceAdapter`].
#[derive(Debug)]
pub struct FilesystemPersistenceAdapter {
    root: PathBuf,
    // Serializes multi-file writes (one consumer state spans several files).
    write_lock: Mutex<()>,
}

impl FilesystemPersistenceAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn consumers_dir(&self) -> PathBuf {
        self.root.join("consumers")
    }

    fn consumer_dir(&self, id: &VirtualConsumerId) -> PathBuf {
        self.consumers_dir().join(id.as_str())
    }

    fn sideline_dir(&self) -> PathBuf {
        self.root.join("sideline")
    }

    fn sideline_file(&self, id: &SidelineRequestIdentifier) -> PathBuf {
        self.sideline_dir().join(format!("{id}.json"))
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> SpoutResult<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl PersistenceAdapter for FilesystemPersistenceAdapter {
    fn open(&self) -> SpoutResult<()> {
        fs::create_dir_all(self.consumers_dir())?;
        fs::create_dir_all(self.sideline_dir())?;
        debug!(root = %self.root.display(), "opened filesystem persistence");
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
        let _guard = self.write_lock.lock();
        let dir = self.consumer_dir(id);
        fs::create_dir_all(&dir)?;
        for (tp, offset) in state.iter() {
            let entry = OffsetEntry {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset,
            };
            Self::write_json(&dir.join(format!("{tp}.json")), &entry)?;
        }
        Ok(())
    }

    fn retrieve_consumer_state(
        &self,
        id: &VirtualConsumerId,
    ) -> SpoutResult<Option<ConsumerState>> {
        let dir = self.consumer_dir(id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut builder = ConsumerState::builder();
        let mut found = false;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json") != Some(true) {
                continue;
            }
            let raw = fs::read(&path)?;
            let entry: OffsetEntry = serde_json::from_slice(&raw)?;
            builder = builder.with_partition(
                TopicPartition::new(entry.topic, entry.partition),
                entry.offset,
            );
            found = true;
        }
        if !found {
            return Ok(None);
        }
        Ok(Some(builder.build()))
    }

    fn clear_consumer_state(&self, id: &VirtualConsumerId) -> SpoutResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.consumer_dir(id);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn persist_sideline_request(&self, payload: &SidelinePayload) -> SpoutResult<()> {
        let _guard = self.write_lock.lock();
        fs::create_dir_all(self.sideline_dir())?;
        Self::write_json(&self.sideline_file(&payload.id), payload)
    }

    fn retrieve_sideline_request(
        &self,
        id: &SidelineRequestIdentifier,
    ) -> SpoutResult<Option<SidelinePayload>> {
        let path = self.sideline_file(id);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn list_sideline_requests(&self) -> SpoutResult<Vec<SidelineRequestIdentifier>> {
        let dir = self.sideline_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if path.extension().map(|ext| ext == "json") != Some(true) {
                continue;
            }
            let id = stem.parse::<SidelineRequestIdentifier>().map_err(|err| {
                SpoutError::Persistence(format!("unparseable sideline file {stem}: {err}"))
            })?;
            ids.push(id);
        }
        ids.sort();
        Ok(ids)
    }

    fn clear_sideline_request(&self, id: &SidelineRequestIdentifier) -> SpoutResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.sideline_file(id);
        if path.is_file() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FieldEqualsFilter, FilterChainStep};
    use crate::persistence::SidelineType;
    use serde_json::json;

    fn adapter() -> (tempfile::TempDir, FilesystemPersistenceAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FilesystemPersistenceAdapter::new(dir.path());
        adapter.open().unwrap();
        (dir, adapter)
    }

    #[test]
    fn consumer_state_survives_reopen() {
        let (dir, adapter) = adapter();
        let id = VirtualConsumerId::from("spout-main-0");
        let state = ConsumerState::builder()
            .with_partition(TopicPartition::new("events", 0), 100)
            .with_partition(TopicPartition::new("events", 1), 250)
            .build();
        adapter.persist_consumer_state(&id, &state).unwrap();

        // A second adapter over the same root sees the state.
        let reopened = FilesystemPersistenceAdapter::new(dir.path());
        reopened.open().unwrap();
        assert_eq!(reopened.retrieve_consumer_state(&id).unwrap(), Some(state));

        reopened.clear_consumer_state(&id).unwrap();
        assert!(adapter.retrieve_consumer_state(&id).unwrap().is_none());
    }

    #[test]
    fn sideline_payload_round_trip_with_steps() {
        let (_dir, adapter) = adapter();
        let id = SidelineRequestIdentifier::new();
        let step = FieldEqualsFilter::new("tenant", json!("acme"));
        let payload = SidelinePayload {
            id: id.clone(),
            sideline_type: SidelineType::Stop,
            steps: vec![step.persisted()],
            starting_state: ConsumerState::builder()
                .with_partition(TopicPartition::new("events", 0), 100)
                .build(),
            ending_state: Some(
                ConsumerState::builder()
                    .with_partition(TopicPartition::new("events", 0), 150)
                    .build(),
            ),
        };

        adapter.persist_sideline_request(&payload).unwrap();
        assert_eq!(adapter.list_sideline_requests().unwrap(), vec![id.clone()]);
        assert_eq!(
            adapter.retrieve_sideline_request(&id).unwrap(),
            Some(payload)
        );

        adapter.clear_sideline_request(&id).unwrap();
        assert!(adapter.retrieve_sideline_request(&id).unwrap().is_none());
    }

    #[test]
    fn missing_entries_read_as_none() {
        let (_dir, adapter) = adapter();
        assert!(adapter
            .retrieve_consumer_state(&VirtualConsumerId::from("nobody"))
            .unwrap()
            .is_none());
        assert!(adapter
            .retrieve_sideline_request(&SidelineRequestIdentifier::new())
            .unwrap()
            .is_none());
        assert!(adapter.list_sideline_requests().unwrap().is_empty());
    }
}
