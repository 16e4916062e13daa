use crate::events::RuntimeEvent;
use crate::model::ProcessDefinition;
use crate::store::{ProcessStore, RevisionConflict};
use crate::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory [`ProcessStore`]. Instances are kept as JSON snapshots so every
/// load returns a fresh copy, the way a database-backed store would.
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<Uuid, (u64, String)>>,
    definitions: RwLock<HashMap<[u8; 32], ProcessDefinition>>,
    events: RwLock<HashMap<Uuid, Vec<RuntimeEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    // ── Instance ──

    async fn save_instance(&self, instance: &ProcessInstance, expected_revision: u64) -> Result<u64> {
        let mut instances = self.instances.write().await;
        let actual = instances
            .get(&instance.instance_id)
            .map(|(rev, _)| *rev)
            .unwrap_or(0);
        if actual != expected_revision {
            return Err(RevisionConflict {
                instance_id: instance.instance_id,
                expected: expected_revision,
                actual,
            }
            .into());
        }
        let revision = actual + 1;
        let mut stored = instance.clone();
        stored.revision = revision;
        let snapshot = serde_json::to_string(&stored).context("serializing process instance")?;
        instances.insert(instance.instance_id, (revision, snapshot));
        Ok(revision)
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let instances = self.instances.read().await;
        instances
            .get(&id)
            .map(|(_, snapshot)| serde_json::from_str(snapshot).context("deserializing process instance"))
            .transpose()
    }

    async fn list_instances(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.instances.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    // ── Definitions ──

    async fn store_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(definition.version, definition.clone());
        Ok(())
    }

    async fn load_definition(&self, version: [u8; 32]) -> Result<Option<ProcessDefinition>> {
        Ok(self.definitions.read().await.get(&version).cloned())
    }

    // ── Event log ──

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut events = self.events.write().await;
        let log = events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_events(&self, instance_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>> {
        let events = self.events.read().await;
        Ok(events
            .get(&instance_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from_seq as usize)
                    .map(|(seq, e)| (seq as u64, e.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ExecutionTree;

    fn instance() -> ProcessInstance {
        let mut tree = ExecutionTree::new();
        let root = tree.create_process_instance("p", None).unwrap();
        tree.set_variable(root, "x", Value::I64(1)).unwrap();
        ProcessInstance {
            instance_id: Uuid::now_v7(),
            process_key: "p".into(),
            definition_version: [7u8; 32],
            state: ProcessState::Running,
            tree,
            revision: 0,
            created_at: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = MemoryStore::new();
        let inst = instance();
        assert_eq!(store.save_instance(&inst, 0).await.unwrap(), 1);
        let loaded = store.load_instance(inst.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.tree, inst.tree);
        assert_eq!(store.list_instances().await.unwrap(), vec![inst.instance_id]);
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let store = MemoryStore::new();
        let inst = instance();
        store.save_instance(&inst, 0).await.unwrap();
        store.save_instance(&inst, 1).await.unwrap();
        let err = store.save_instance(&inst, 1).await.unwrap_err();
        let conflict = err.downcast_ref::<RevisionConflict>().unwrap();
        assert_eq!((conflict.expected, conflict.actual), (1, 2));
    }

    #[tokio::test]
    async fn test_event_log_reads_from_sequence() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        for reason in ["a", "b", "c"] {
            store
                .append_event(id, &RuntimeEvent::Cancelled { reason: reason.into() })
                .await
                .unwrap();
        }
        let tail = store.read_events(id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 1);
        assert!(store.read_events(Uuid::now_v7(), 0).await.unwrap().is_empty());
    }
}
