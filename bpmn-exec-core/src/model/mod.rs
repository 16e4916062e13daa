//! Static process model: activities, sequence flows, declared catch
//! definitions and the repository of deployed definitions.
//!
//! Definitions are immutable once built. The runtime only ever reads them.

pub mod builder;
pub mod dto;
mod validate;

pub use builder::ProcessBuilder;

use crate::error::EngineError;
use crate::expr::Expression;
use crate::types::{ActivityId, FlowId, ScopeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Suffix of the synthetic activity wrapping a multi-instance activity.
pub const MULTI_INSTANCE_BODY_SUFFIX: &str = "#multiInstanceBody";

// ─── Flows ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: FlowId,
    pub source: ActivityId,
    pub target: ActivityId,
    /// Guard; `None` always passes.
    pub condition: Option<Expression>,
}

// ─── Events ───────────────────────────────────────────────────

/// What an event waits for (catching) or carries (start events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventTrigger {
    None,
    Message(String),
    Signal(String),
    /// Timer definition text; firing is driven by the external scheduler.
    Timer(String),
    Conditional(Expression),
    /// Error code; `None` catches every error.
    Error(Option<String>),
    /// Escalation code; `None` catches every escalation.
    Escalation(Option<String>),
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchKind {
    Error,
    Escalation,
}

/// A catchable error or escalation declared at a static scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchDefinition {
    pub kind: CatchKind,
    /// Boundary event or event sub-process start event that handles it.
    pub handler: ActivityId,
    /// `None` matches any code.
    pub code: Option<String>,
    pub cancel_activity: bool,
    pub code_variable: Option<String>,
    pub message_variable: Option<String>,
}

impl CatchDefinition {
    pub fn matches(&self, code: Option<&str>) -> bool {
        match (&self.code, code) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
        }
    }
}

// ─── Activities ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceImplementation {
    /// Name of a handler in the service registry.
    Delegate(String),
    /// Evaluate an expression and optionally store the result.
    Expression {
        expression: Expression,
        result_variable: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    pub sequential: bool,
    pub cardinality: Option<Expression>,
    pub collection: Option<Expression>,
    pub collection_variable: Option<String>,
    pub element_variable: Option<String>,
    pub completion_condition: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityKind {
    StartEvent {
        trigger: EventTrigger,
        interrupting: bool,
    },
    NoneEndEvent,
    TerminateEndEvent,
    ErrorEndEvent {
        code: String,
        message: Option<String>,
    },
    /// Intermediate throw (`end == false`) or end event throwing an escalation.
    EscalationThrow {
        code: String,
        end: bool,
    },
    /// Throws compensation for one activity, or for the whole enclosing scope.
    CompensationThrow {
        activity_ref: Option<ActivityId>,
        end: bool,
    },
    Task,
    UserTask,
    ReceiveTask {
        message: Option<String>,
    },
    ServiceTask(ServiceImplementation),
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    IntermediateCatch {
        trigger: EventTrigger,
    },
    Boundary {
        attached_to: ActivityId,
        trigger: EventTrigger,
        cancel_activity: bool,
    },
    SubProcess,
    EventSubProcess,
    CallActivity {
        called_element: String,
        pass_variables: bool,
    },
    MultiInstanceBody {
        spec: MultiInstanceSpec,
        inner: ActivityId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub kind: ActivityKind,
    /// Scope the activity's tokens flow in.
    pub flow_scope: ScopeId,
    /// Whether entering the activity creates its own scope execution.
    pub is_scope: bool,
    pub outgoing: Vec<FlowId>,
    pub incoming: Vec<FlowId>,
    pub default_flow: Option<FlowId>,
    pub compensation_handler: Option<ActivityId>,
    pub is_compensation_handler: bool,
    /// Boundary events attached to this activity, in declaration order.
    pub boundary_events: Vec<ActivityId>,
    /// Error and escalation catches declared on this activity as a scope.
    pub catches: Vec<CatchDefinition>,
}

impl Activity {
    pub fn is_event_sub_process(&self) -> bool {
        matches!(self.kind, ActivityKind::EventSubProcess)
    }

    /// True for kinds that contain child activities.
    pub fn is_container(&self) -> bool {
        matches!(
            self.kind,
            ActivityKind::SubProcess
                | ActivityKind::EventSubProcess
                | ActivityKind::MultiInstanceBody { .. }
        )
    }
}

// ─── Definition ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub key: String,
    /// SHA-256 over the canonical JSON form of the definition body.
    pub version: [u8; 32],
    pub activities: BTreeMap<ActivityId, Activity>,
    pub flows: BTreeMap<FlowId, SequenceFlow>,
    /// Catches declared by process-level event sub-processes.
    pub process_catches: Vec<CatchDefinition>,
}

impl ProcessDefinition {
    pub fn activity(&self, id: &str) -> Result<&Activity, EngineError> {
        self.activities
            .get(id)
            .ok_or_else(|| EngineError::UnknownActivity {
                definition: self.key.clone(),
                activity: id.to_string(),
            })
    }

    pub fn flow(&self, id: &str) -> Result<&SequenceFlow, EngineError> {
        self.flows.get(id).ok_or_else(|| EngineError::UnknownFlow {
            definition: self.key.clone(),
            flow: id.to_string(),
        })
    }

    pub fn outgoing(&self, activity: &str) -> Result<Vec<&SequenceFlow>, EngineError> {
        let act = self.activity(activity)?;
        act.outgoing.iter().map(|f| self.flow(f)).collect()
    }

    pub fn incoming(&self, activity: &str) -> Result<Vec<&SequenceFlow>, EngineError> {
        let act = self.activity(activity)?;
        act.incoming.iter().map(|f| self.flow(f)).collect()
    }

    pub fn flow_scope(&self, activity: &str) -> Result<&ScopeId, EngineError> {
        Ok(&self.activity(activity)?.flow_scope)
    }

    /// Activities whose flow scope is `scope`.
    pub fn children_of<'a>(&'a self, scope: &ScopeId) -> impl Iterator<Item = &'a Activity> + 'a {
        let scope = scope.clone();
        self.activities.values().filter(move |a| a.flow_scope == scope)
    }

    /// The none start event of a process or (event) sub-process scope.
    pub fn start_event(&self, scope: &ScopeId) -> Result<&Activity, EngineError> {
        self.children_of(scope)
            .find(|a| {
                matches!(
                    a.kind,
                    ActivityKind::StartEvent {
                        trigger: EventTrigger::None,
                        ..
                    }
                )
            })
            .ok_or_else(|| EngineError::NoStartEvent {
                definition: self.key.clone(),
                scope: scope.to_string(),
            })
    }

    /// The single start event of an event sub-process, whatever its trigger.
    pub fn event_sub_process_start(&self, esp: &str) -> Result<&Activity, EngineError> {
        let scope = ScopeId::Activity(esp.to_string());
        self.children_of(&scope)
            .find(|a| matches!(a.kind, ActivityKind::StartEvent { .. }))
            .ok_or_else(|| EngineError::NoStartEvent {
                definition: self.key.clone(),
                scope: esp.to_string(),
            })
    }

    /// Error/escalation catches declared at a scope, specific codes first.
    pub fn catch_definitions(&self, scope: &ScopeId) -> Result<&[CatchDefinition], EngineError> {
        match scope {
            ScopeId::Process => Ok(&self.process_catches),
            ScopeId::Activity(id) => Ok(&self.activity(id)?.catches),
        }
    }

    /// The enclosing scopes of an activity, innermost first, ending with the process.
    pub fn scope_chain(&self, activity: &str) -> Result<Vec<ScopeId>, EngineError> {
        let mut chain = Vec::new();
        let mut current = self.activity(activity)?.flow_scope.clone();
        loop {
            chain.push(current.clone());
            match current {
                ScopeId::Process => break,
                ScopeId::Activity(id) => current = self.activity(&id)?.flow_scope.clone(),
            }
        }
        Ok(chain)
    }

    /// Whether `scope` is `activity` itself or one of its enclosing scopes.
    pub fn is_ancestor_scope(&self, scope: &str, activity: &str) -> Result<bool, EngineError> {
        if scope == activity {
            return Ok(true);
        }
        Ok(self
            .scope_chain(activity)?
            .iter()
            .any(|s| s.activity_id() == Some(scope)))
    }

    /// Subscriptions a scope execution must register when it is created:
    /// non-error boundary events of the scope activity and the start events of
    /// event sub-processes nested directly in it.
    pub fn subscription_declarations(
        &self,
        scope: &ScopeId,
    ) -> Result<Vec<SubscriptionDeclaration>, EngineError> {
        let mut declarations = Vec::new();
        if let ScopeId::Activity(id) = scope {
            for boundary_id in &self.activity(id)?.boundary_events {
                if let ActivityKind::Boundary { trigger, .. } = &self.activity(boundary_id)?.kind {
                    if let Some(decl) = SubscriptionDeclaration::from_trigger(boundary_id, trigger) {
                        declarations.push(decl);
                    }
                }
            }
        }
        for esp in self.children_of(scope).filter(|a| a.is_event_sub_process()) {
            let start = self.event_sub_process_start(&esp.id)?;
            if let ActivityKind::StartEvent { trigger, .. } = &start.kind {
                if let Some(decl) = SubscriptionDeclaration::from_trigger(&start.id, trigger) {
                    declarations.push(decl);
                }
            }
        }
        Ok(declarations)
    }

    /// The compensation event sub-process nested directly in `scope`, if any.
    pub fn compensation_event_sub_process(&self, scope: &ScopeId) -> Option<&Activity> {
        self.children_of(scope).filter(|a| a.is_event_sub_process()).find(|esp| {
            self.event_sub_process_start(&esp.id)
                .map(|start| {
                    matches!(
                        start.kind,
                        ActivityKind::StartEvent {
                            trigger: EventTrigger::Compensation,
                            ..
                        }
                    )
                })
                .unwrap_or(false)
        })
    }
}

/// A subscription to create when a scope execution is entered.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDeclaration {
    pub activity: ActivityId,
    pub event_type: crate::tree::EventType,
    pub event_name: Option<String>,
    pub condition: Option<Expression>,
}

impl SubscriptionDeclaration {
    pub fn from_trigger(activity: &str, trigger: &EventTrigger) -> Option<Self> {
        use crate::tree::EventType;
        let (event_type, event_name, condition) = match trigger {
            EventTrigger::Message(name) => (EventType::Message, Some(name.clone()), None),
            EventTrigger::Signal(name) => (EventType::Signal, Some(name.clone()), None),
            EventTrigger::Timer(spec) => (EventType::Timer, Some(spec.clone()), None),
            EventTrigger::Conditional(expr) => (EventType::Conditional, None, Some(expr.clone())),
            EventTrigger::None
            | EventTrigger::Error(_)
            | EventTrigger::Escalation(_)
            | EventTrigger::Compensation => return None,
        };
        Some(Self {
            activity: activity.to_string(),
            event_type,
            event_name,
            condition,
        })
    }
}

// ─── Repository ───────────────────────────────────────────────

/// Deployed definitions, latest version per key.
#[derive(Debug, Clone, Default)]
pub struct Repository {
    definitions: BTreeMap<String, Arc<ProcessDefinition>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&mut self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let def = Arc::new(definition);
        self.definitions.insert(def.key.clone(), def.clone());
        def
    }

    pub fn get(&self, key: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}
