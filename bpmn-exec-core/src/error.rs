use crate::expr::EvalError;
use crate::types::{ActivityId, ExecutionId};
use std::fmt;

/// Failures surfaced by the execution engine.
///
/// Configuration errors and structural violations are fatal for the trigger
/// that raised them; the tree mutations of that trigger are discarded.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ──
    #[error("activity '{activity}': invalid multi-instance cardinality: {detail}")]
    InvalidCardinality { activity: ActivityId, detail: String },

    #[error("activity '{activity}': multi-instance collection could not be resolved: {detail}")]
    UnresolvableCollection { activity: ActivityId, detail: String },

    #[error("activity '{activity}': multi-instance needs a cardinality or a collection")]
    MissingMultiInstanceSource { activity: ActivityId },

    #[error("activity '{activity}': default flow '{flow}' does not resolve to an outgoing flow")]
    MissingDefaultFlow { activity: ActivityId, flow: String },

    #[error("activity '{activity}': no conditional flow could be selected")]
    NoConditionalFlow { activity: ActivityId },

    #[error("activity '{activity}': completion condition did not evaluate to a boolean")]
    NonBooleanCompletion { activity: ActivityId },

    #[error("activity '{activity}' has no outgoing flow (stuck execution)")]
    StuckExecution { activity: ActivityId },

    #[error("unknown process definition '{0}'")]
    UnknownDefinition(String),

    #[error("unknown activity '{activity}' in definition '{definition}'")]
    UnknownActivity { definition: String, activity: String },

    #[error("unknown sequence flow '{flow}' in definition '{definition}'")]
    UnknownFlow { definition: String, flow: String },

    #[error("scope '{scope}' of definition '{definition}' has no none start event")]
    NoStartEvent { definition: String, scope: String },

    #[error("no service handler registered under '{0}'")]
    UnknownDelegate(String),

    #[error("operation limit of {0} exceeded while processing one trigger")]
    OperationLimit(usize),

    #[error(transparent)]
    Expression(#[from] EvalError),

    #[error(transparent)]
    Model(#[from] ModelError),

    // ── Unhandled business conditions ──
    #[error("unhandled BPMN error '{code}'{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    UnhandledError {
        code: String,
        message: Option<String>,
    },

    #[error("activity '{activity}' failed: {source}")]
    Delegate {
        activity: ActivityId,
        #[source]
        source: anyhow::Error,
    },

    // ── Structural ──
    #[error("{0} has already ended")]
    ExecutionEnded(ExecutionId),

    #[error("{0} is not active")]
    ExecutionInactive(ExecutionId),

    #[error("{0} does not exist")]
    UnknownExecution(ExecutionId),

    #[error("{0} is not a scope execution")]
    NotAScope(ExecutionId),

    #[error("{execution} cannot be removed: it still has live children")]
    LiveChildren { execution: ExecutionId },

    #[error("{execution} at '{activity}' does not accept signals")]
    SignalRejected {
        execution: ExecutionId,
        activity: String,
    },

    #[error("no active execution at activity '{0}'")]
    NoExecutionAt(String),

    #[error("event subscription {0} does not exist")]
    UnknownSubscription(u64),

    #[error("process instance {0} not found")]
    InstanceNotFound(uuid::Uuid),

    #[error("process instance {0} has already ended")]
    InstanceEnded(uuid::Uuid),

    #[error("hierarchy walk failed: {0}")]
    Walk(String),

    // ── Collaborators ──
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A single failed rule while building a process definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// All rule violations found for one process definition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("process '{process}' failed validation:\n{}", render(.errors))]
pub struct ModelError {
    pub process: String,
    pub errors: Vec<ValidationError>,
}

fn render(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl ModelError {
    pub fn has_rule(&self, rule: &str) -> bool {
        self.errors.iter().any(|e| e.rule == rule)
    }
}
