//! Extension point for service tasks backed by externally supplied code.

use crate::error::EngineError;
use crate::expr::{DefaultEvaluator, ExpressionEvaluator};
use crate::types::{ActivityId, ExecutionId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a service task sees of the running process.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub activity: ActivityId,
    pub execution: ExecutionId,
    /// Snapshot of every variable visible from the execution.
    pub variables: BTreeMap<String, Value>,
    /// Written back with normal variable semantics once the handler returns.
    pub outputs: BTreeMap<String, Value>,
}

impl TaskContext {
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_output(&mut self, name: &str, value: impl Into<Value>) {
        self.outputs.insert(name.to_string(), value.into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Leave the task right away.
    Complete,
    /// Park the task until it is signalled.
    Wait,
    /// Throw a BPMN error from the task.
    BpmnError {
        code: String,
        message: Option<String>,
    },
    /// Throw an escalation from the task.
    Escalation { code: String },
}

/// A technical failure carrying an error code that error catches can match.
///
/// Any other `anyhow::Error` returned by a handler is a failure without code,
/// which only catch-all definitions intercept.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
}

pub trait ServiceHandler: Send + Sync {
    fn execute(&self, ctx: &mut TaskContext) -> anyhow::Result<HandlerOutcome>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&mut TaskContext) -> anyhow::Result<HandlerOutcome> + Send + Sync,
{
    fn execute(&self, ctx: &mut TaskContext) -> anyhow::Result<HandlerOutcome> {
        self(ctx)
    }
}

/// Collaborators the interpreter calls out to: named service handlers and the
/// expression evaluator.
#[derive(Clone)]
pub struct Services {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl Services {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            evaluator: Arc::new(DefaultEvaluator),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn register_handler(mut self, name: &str, handler: impl ServiceHandler + 'static) -> Self {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Register a closure handler.
    pub fn register<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut TaskContext) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.register_handler(name, handler)
    }

    pub fn handler(&self, name: &str) -> Result<Arc<dyn ServiceHandler>, EngineError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDelegate(name.to_string()))
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator.as_ref()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_handler_writes_outputs() {
        let services = Services::new().register("double", |ctx: &mut TaskContext| {
            let n = ctx.variable("n").and_then(Value::as_i64).unwrap_or(0);
            ctx.set_output("n", n * 2);
            Ok(HandlerOutcome::Complete)
        });
        let mut ctx = TaskContext {
            activity: "t".into(),
            execution: ExecutionId(0),
            variables: BTreeMap::from([("n".to_string(), Value::I64(21))]),
            outputs: BTreeMap::new(),
        };
        let handler = services.handler("double").unwrap();
        assert_eq!(handler.execute(&mut ctx).unwrap(), HandlerOutcome::Complete);
        assert_eq!(ctx.outputs.get("n"), Some(&Value::I64(42)));
    }

    #[test]
    fn test_unknown_handler() {
        assert!(matches!(
            Services::new().handler("missing"),
            Err(EngineError::UnknownDelegate(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_task_failure_code_survives_anyhow() {
        let err: anyhow::Error = TaskFailure {
            code: "TIMEOUT".into(),
            message: "upstream".into(),
        }
        .into();
        let code = err.downcast_ref::<TaskFailure>().map(|f| f.code.as_str());
        assert_eq!(code, Some("TIMEOUT"));
    }
}
