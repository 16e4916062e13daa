use crate::events::RuntimeEvent;
use crate::model::ProcessDefinition;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence for process instances, deployed definitions and the event log.
///
/// The engine saves a whole instance (execution tree, subscriptions and
/// buffered messages included) in one call, so a trigger is either fully
/// visible or not at all. Revisions give optimistic concurrency: a save
/// succeeds only when the stored revision still equals `expected_revision`.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Instance ──

    /// Persist `instance` if the stored revision equals `expected_revision`
    /// (0 for a new instance). Returns the new revision.
    async fn save_instance(&self, instance: &ProcessInstance, expected_revision: u64) -> Result<u64>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn list_instances(&self) -> Result<Vec<Uuid>>;

    // ── Definitions (versioned) ──

    async fn store_definition(&self, definition: &ProcessDefinition) -> Result<()>;
    async fn load_definition(&self, version: [u8; 32]) -> Result<Option<ProcessDefinition>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(&self, instance_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>>;
}

/// Returned (inside `anyhow::Error`) when a save lost an optimistic-lock race.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("instance {instance_id}: expected revision {expected}, found {actual}")]
pub struct RevisionConflict {
    pub instance_id: Uuid,
    pub expected: u64,
    pub actual: u64,
}
