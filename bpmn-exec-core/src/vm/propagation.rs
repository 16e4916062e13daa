//! Error and escalation propagation.
//!
//! A thrown condition walks outward through the enclosing scopes (crossing
//! call activities into the caller) until a scope declares a matching catch.
//! The catching scope's execution comes from the walk's scope mapping.

use super::{Operation, Vm};
use crate::config::UnhandledErrorPolicy;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{CatchDefinition, CatchKind, ProcessDefinition};
use crate::types::{ExecutionId, ScopeId, Value};
use crate::walker::{HierarchyWalker, ScopeExecutionMapping, ScopeVisitor, WalkStep};

/// A condition raised by an activity that the enclosing scopes may catch.
#[derive(Debug)]
pub enum Thrown {
    /// Declarative BPMN error.
    Error {
        code: String,
        message: Option<String>,
    },
    /// Technical failure of a service handler.
    Failure {
        code: Option<String>,
        source: anyhow::Error,
    },
    Escalation {
        code: String,
    },
}

impl Thrown {
    pub fn kind(&self) -> CatchKind {
        match self {
            Thrown::Error { .. } | Thrown::Failure { .. } => CatchKind::Error,
            Thrown::Escalation { .. } => CatchKind::Escalation,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Thrown::Error { code, .. } | Thrown::Escalation { code } => Some(code),
            Thrown::Failure { code, .. } => code.as_deref(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Thrown::Error { code, .. } => format!("error '{code}'"),
            Thrown::Failure { code, source } => match code {
                Some(code) => format!("failure '{code}': {source}"),
                None => format!("failure: {source}"),
            },
            Thrown::Escalation { code } => format!("escalation '{code}'"),
        }
    }

    fn message(&self) -> Option<String> {
        match self {
            Thrown::Error { message, .. } => message.clone(),
            Thrown::Failure { source, .. } => Some(source.to_string()),
            Thrown::Escalation { .. } => None,
        }
    }
}

/// Finds the innermost catch matching the thrown condition.
struct CatchVisitor<'t> {
    kind: CatchKind,
    code: Option<&'t str>,
    origin_definition: &'t str,
    origin_activity: &'t str,
    found: Option<(WalkStep, CatchDefinition)>,
}

impl CatchVisitor<'_> {
    /// An event sub-process does not catch what is thrown inside itself.
    fn handler_encloses_origin(
        &self,
        step: &WalkStep,
        definition: &ProcessDefinition,
        catch: &CatchDefinition,
    ) -> Result<bool, EngineError> {
        if step.definition_key != self.origin_definition {
            return Ok(false);
        }
        let handler = definition.activity(&catch.handler)?;
        let ScopeId::Activity(container) = &handler.flow_scope else {
            return Ok(false);
        };
        if !definition.activity(container)?.is_event_sub_process() {
            return Ok(false);
        }
        definition.is_ancestor_scope(container, self.origin_activity)
    }
}

impl ScopeVisitor for CatchVisitor<'_> {
    fn visit(&mut self, step: &WalkStep, definition: &ProcessDefinition) -> Result<(), EngineError> {
        if self.found.is_some() {
            return Ok(());
        }
        for catch in definition.catch_definitions(&step.scope)? {
            if catch.kind != self.kind || !catch.matches(self.code) {
                continue;
            }
            if self.handler_encloses_origin(step, definition, catch)? {
                continue;
            }
            self.found = Some((step.clone(), catch.clone()));
            return Ok(());
        }
        Ok(())
    }

    fn satisfied(&self) -> bool {
        self.found.is_some()
    }
}

impl Vm<'_> {
    fn find_handler(
        &self,
        origin: ExecutionId,
        activity: &str,
        thrown: &Thrown,
    ) -> Result<Option<(ExecutionId, CatchDefinition)>, EngineError> {
        let origin_definition = self.tree.get(origin)?.definition_key.clone();
        let mut catcher = CatchVisitor {
            kind: thrown.kind(),
            code: thrown.code(),
            origin_definition: &origin_definition,
            origin_activity: activity,
            found: None,
        };
        let mut mapping = ScopeExecutionMapping::new();
        let mut walker = HierarchyWalker::new(&*self.tree, self.repository, origin, activity)?;
        {
            let visitors: &mut [&mut dyn ScopeVisitor] = &mut [&mut catcher, &mut mapping];
            walker.walk_until(visitors, |_| false)?;
        }
        let Some((step, catch)) = catcher.found else {
            return Ok(None);
        };
        let owner = mapping
            .execution_for(&step.definition_key, &step.scope)
            .ok_or_else(|| EngineError::Walk(format!("no execution mapped for scope {}", step.scope)))?;
        Ok(Some((owner, catch)))
    }

    /// Hand a condition thrown by `activity` (run by `origin`) to the
    /// innermost matching catch, or apply the unhandled behavior.
    pub(super) fn propagate(
        &mut self,
        origin: ExecutionId,
        activity: &str,
        thrown: Thrown,
    ) -> Result<(), EngineError> {
        match self.find_handler(origin, activity, &thrown) {
            Ok(Some((owner, catch))) => self.handle_caught(origin, owner, catch, thrown),
            Ok(None) => self.unhandled(origin, activity, thrown),
            // the thrown condition outlives any failure to look up its handler
            Err(e) => {
                let reason = match e {
                    EngineError::Walk(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(execution = %origin, activity, reason = %reason, "propagation walk failed");
                self.emit(RuntimeEvent::PropagationFailed {
                    condition: thrown.describe(),
                    reason,
                });
                match thrown {
                    Thrown::Error { code, message } => Err(EngineError::UnhandledError { code, message }),
                    Thrown::Failure { source, .. } => Err(EngineError::Delegate {
                        activity: activity.to_string(),
                        source,
                    }),
                    Thrown::Escalation { .. } => {
                        self.agenda.push_back(Operation::Leave { execution: origin });
                        Ok(())
                    }
                }
            }
        }
    }

    fn handle_caught(
        &mut self,
        origin: ExecutionId,
        owner: ExecutionId,
        catch: CatchDefinition,
        thrown: Thrown,
    ) -> Result<(), EngineError> {
        tracing::debug!(%origin, %owner, handler = %catch.handler, condition = %thrown.describe(), "caught");
        let handler = self.execute_event_handler(owner, &catch.handler)?;
        self.bind_catch_variables(handler, &catch, &thrown)?;
        let code = thrown.code().map(str::to_string);
        match thrown.kind() {
            CatchKind::Error => self.emit(RuntimeEvent::ErrorCaught {
                code,
                handler: catch.handler.clone(),
                execution: handler,
            }),
            CatchKind::Escalation => {
                self.emit(RuntimeEvent::EscalationCaught {
                    code: code.unwrap_or_default(),
                    handler: catch.handler.clone(),
                    execution: handler,
                });
                if !catch.cancel_activity {
                    self.agenda.push_back(Operation::Leave { execution: origin });
                }
            }
        }
        Ok(())
    }

    fn bind_catch_variables(
        &mut self,
        handler: ExecutionId,
        catch: &CatchDefinition,
        thrown: &Thrown,
    ) -> Result<(), EngineError> {
        if let (Some(name), Some(code)) = (&catch.code_variable, thrown.code()) {
            self.tree.set_variable_local(handler, name, Value::from(code))?;
        }
        if let (Some(name), Some(message)) = (&catch.message_variable, thrown.message()) {
            self.tree.set_variable_local(handler, name, Value::Str(message))?;
        }
        Ok(())
    }

    fn unhandled(&mut self, origin: ExecutionId, activity: &str, thrown: Thrown) -> Result<(), EngineError> {
        match thrown {
            Thrown::Failure { source, .. } => Err(EngineError::Delegate {
                activity: activity.to_string(),
                source,
            }),
            Thrown::Error { code, message } => match self.config.unhandled_error {
                UnhandledErrorPolicy::Fail => Err(EngineError::UnhandledError { code, message }),
                UnhandledErrorPolicy::EndSilently => {
                    tracing::warn!(execution = %origin, activity, code = %code, "unhandled error ends execution");
                    self.emit(RuntimeEvent::ErrorUnhandled {
                        code,
                        execution: origin,
                    });
                    let token = self.release_scope(origin, activity)?;
                    self.end_execution(token)
                }
            },
            // nobody listens: carry on as if nothing was thrown
            Thrown::Escalation { .. } => {
                self.agenda.push_back(Operation::Leave { execution: origin });
                Ok(())
            }
        }
    }

    /// When `origin` is the scope execution of `activity`, exit that scope.
    fn release_scope(&mut self, origin: ExecutionId, activity: &str) -> Result<ExecutionId, EngineError> {
        let owns_scope = self.tree.get(origin)?.scope.as_ref().and_then(ScopeId::activity_id) == Some(activity);
        if !owns_scope {
            return Ok(origin);
        }
        let definition = self.definition_of(origin)?;
        let act = definition.activity(activity)?;
        self.exit_scope(origin, &definition, act)
    }
}
