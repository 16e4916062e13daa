use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events: the diagnostic trail of every engine decision.
///
/// Events are collected while a trigger runs and appended to the store only
/// after the trigger committed. Nothing in the engine reads them back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        process_key: String,
        definition_version: [u8; 32],
    },
    ActivityStarted {
        execution: ExecutionId,
        activity: ActivityId,
    },
    FlowTaken {
        execution: ExecutionId,
        flow: FlowId,
        source: ActivityId,
        target: ActivityId,
    },
    Forked {
        activity: ActivityId,
        executions: Vec<ExecutionId>,
        flows: Vec<FlowId>,
    },
    JoinArrived {
        gateway: ActivityId,
        execution: ExecutionId,
    },
    JoinFired {
        gateway: ActivityId,
        joined: Vec<ExecutionId>,
    },
    /// Join evaluated but not satisfied yet.
    JoinWaiting {
        gateway: ActivityId,
        execution: ExecutionId,
    },
    SubscriptionCreated {
        subscription: u64,
        execution: ExecutionId,
        event_type: String,
        activity: ActivityId,
    },
    SubscriptionTriggered {
        subscription: u64,
        activity: ActivityId,
    },
    /// A message arrived with no subscriber and was kept for later.
    MessageBuffered {
        name: String,
    },
    MultiInstanceStarted {
        activity: ActivityId,
        instances: i64,
        sequential: bool,
    },
    MultiInstanceCompleted {
        activity: ActivityId,
        completed: i64,
        cancelled: usize,
    },
    ErrorCaught {
        code: Option<String>,
        handler: ActivityId,
        execution: ExecutionId,
    },
    EscalationCaught {
        code: String,
        handler: ActivityId,
        execution: ExecutionId,
    },
    /// Declarative error ended its execution silently (no handler).
    ErrorUnhandled {
        code: String,
        execution: ExecutionId,
    },
    /// The hierarchy walk itself failed; the original condition surfaced instead.
    PropagationFailed {
        condition: String,
        reason: String,
    },
    CompensationThrown {
        execution: ExecutionId,
        handlers: Vec<ActivityId>,
    },
    CompensationCompleted {
        execution: ExecutionId,
    },
    ScopeCancelled {
        execution: ExecutionId,
        reason: String,
    },
    CallActivityStarted {
        activity: ActivityId,
        called_element: String,
        sub_instance: ExecutionId,
    },
    Completed {
        at: Timestamp,
    },
    Terminated {
        at: Timestamp,
        activity: ActivityId,
    },
    Cancelled {
        reason: String,
    },
}
