//! Multi-instance bodies.
//!
//! The body's scope execution carries the instance counters. Sequential
//! bodies run one inner scope execution at a time below the body itself;
//! parallel bodies create one concurrent child per instance, each holding the
//! inner activity's scope execution.

use super::Vm;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{Activity, ActivityKind, MultiInstanceSpec, ProcessDefinition};
use crate::types::{ExecutionId, Value};

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

impl Vm<'_> {
    pub(super) fn start_multi_instance(
        &mut self,
        body: ExecutionId,
        act: &Activity,
        spec: &MultiInstanceSpec,
        inner: &str,
    ) -> Result<(), EngineError> {
        let instances = self.resolve_cardinality(body, act, spec)?;
        let active = if spec.sequential { instances.min(1) } else { instances };
        self.set_local(body, NR_OF_INSTANCES, instances)?;
        self.set_local(body, NR_OF_COMPLETED_INSTANCES, 0)?;
        self.set_local(body, NR_OF_ACTIVE_INSTANCES, active)?;
        self.emit(RuntimeEvent::MultiInstanceStarted {
            activity: act.id.clone(),
            instances,
            sequential: spec.sequential,
        });

        if instances == 0 {
            self.emit(RuntimeEvent::MultiInstanceCompleted {
                activity: act.id.clone(),
                completed: 0,
                cancelled: 0,
            });
            return self.leave(body);
        }

        if spec.sequential {
            self.set_local(body, LOOP_COUNTER, 0)?;
            let instance = self.spawn_instance(body, act, spec, inner, 0)?;
            self.push_execute(instance, inner);
            return Ok(());
        }

        let mut spawned = Vec::new();
        for index in 0..instances {
            let child = self.tree.create_child(body, true, None)?;
            spawned.push(self.spawn_instance(child, act, spec, inner, index)?);
        }
        self.tree.inactivate(body)?;
        for instance in spawned {
            self.push_execute(instance, inner);
        }
        Ok(())
    }

    /// Create the inner scope execution for instance `index` below `parent`.
    fn spawn_instance(
        &mut self,
        parent: ExecutionId,
        act: &Activity,
        spec: &MultiInstanceSpec,
        inner: &str,
        index: i64,
    ) -> Result<ExecutionId, EngineError> {
        let instance = self.create_scope_execution(parent, inner)?;
        self.set_local(instance, LOOP_COUNTER, index)?;
        if let Some(name) = &spec.element_variable {
            let element = self.element_at(parent, act, spec, index)?.unwrap_or(Value::Null);
            self.set_local(instance, name, element)?;
        }
        Ok(instance)
    }

    /// An instance of the inner activity ended with `execution` positioned
    /// at it.
    pub(super) fn instance_completed(
        &mut self,
        execution: ExecutionId,
        definition: &ProcessDefinition,
        inner: &Activity,
    ) -> Result<(), EngineError> {
        let body_id = inner
            .flow_scope
            .activity_id()
            .ok_or(EngineError::NotAScope(execution))?
            .to_string();
        let body_act = definition.activity(&body_id)?;
        let ActivityKind::MultiInstanceBody { spec, .. } = &body_act.kind else {
            return Err(EngineError::NotAScope(execution));
        };

        if spec.sequential {
            let body = execution;
            let completed = self.counter(body, NR_OF_COMPLETED_INSTANCES) + 1;
            self.set_local(body, NR_OF_COMPLETED_INSTANCES, completed)?;
            let next = self.counter(body, LOOP_COUNTER) + 1;
            if self.completion_condition_met(body, body_act, spec)?
                || next >= self.counter(body, NR_OF_INSTANCES)
            {
                self.set_local(body, NR_OF_ACTIVE_INSTANCES, 0)?;
                self.emit(RuntimeEvent::MultiInstanceCompleted {
                    activity: body_id.clone(),
                    completed,
                    cancelled: 0,
                });
                self.tree.set_activity(body, Some(&body_id))?;
                return self.leave(body);
            }
            self.set_local(body, LOOP_COUNTER, next)?;
            let instance = self.spawn_instance(body, body_act, spec, &inner.id, next)?;
            self.push_execute(instance, &inner.id);
            return Ok(());
        }

        let body = self
            .tree
            .get(execution)?
            .parent
            .ok_or(EngineError::NotAScope(execution))?;
        self.tree.remove(execution)?;
        let completed = self.counter(body, NR_OF_COMPLETED_INSTANCES) + 1;
        let active = self.counter(body, NR_OF_ACTIVE_INSTANCES) - 1;
        self.set_local(body, NR_OF_COMPLETED_INSTANCES, completed)?;
        self.set_local(body, NR_OF_ACTIVE_INSTANCES, active)?;

        let remaining = self.tree.non_event_scope_children(body)?;
        if !remaining.is_empty() && !self.completion_condition_met(body, body_act, spec)? {
            return Ok(());
        }
        let cancelled = remaining.len();
        for instance in remaining {
            self.cancel_execution(instance, "multi-instance completion condition")?;
        }
        self.set_local(body, NR_OF_ACTIVE_INSTANCES, 0)?;
        tracing::debug!(activity = %body_id, completed, cancelled, "multi-instance body completed");
        self.emit(RuntimeEvent::MultiInstanceCompleted {
            activity: body_id.clone(),
            completed,
            cancelled,
        });
        self.tree.activate(body)?;
        self.tree.set_activity(body, Some(&body_id))?;
        self.leave(body)
    }

    fn resolve_cardinality(
        &self,
        body: ExecutionId,
        act: &Activity,
        spec: &MultiInstanceSpec,
    ) -> Result<i64, EngineError> {
        if let Some(expr) = &spec.cardinality {
            return match self.evaluate(body, expr)? {
                Value::I64(n) if n >= 0 => Ok(n),
                other => Err(EngineError::InvalidCardinality {
                    activity: act.id.clone(),
                    detail: format!("expected a non-negative integer, got {other:?}"),
                }),
            };
        }
        self.collection(body, act, spec)?
            .map(|items| items.len() as i64)
            .ok_or_else(|| EngineError::MissingMultiInstanceSource {
                activity: act.id.clone(),
            })
    }

    fn collection(
        &self,
        body: ExecutionId,
        act: &Activity,
        spec: &MultiInstanceSpec,
    ) -> Result<Option<Vec<Value>>, EngineError> {
        if let Some(expr) = &spec.collection {
            return match self.evaluate(body, expr)? {
                Value::List(items) => Ok(Some(items)),
                other => Err(EngineError::UnresolvableCollection {
                    activity: act.id.clone(),
                    detail: format!("expression evaluated to {other:?}"),
                }),
            };
        }
        let Some(name) = &spec.collection_variable else {
            return Ok(None);
        };
        match self.tree.variable(body, name) {
            Some(Value::List(items)) => Ok(Some(items.clone())),
            other => Err(EngineError::UnresolvableCollection {
                activity: act.id.clone(),
                detail: format!("variable '{name}' is {other:?}"),
            }),
        }
    }

    fn element_at(
        &self,
        body: ExecutionId,
        act: &Activity,
        spec: &MultiInstanceSpec,
        index: i64,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self
            .collection(body, act, spec)?
            .and_then(|items| usize::try_from(index).ok().and_then(|i| items.get(i).cloned())))
    }

    fn completion_condition_met(
        &self,
        body: ExecutionId,
        act: &Activity,
        spec: &MultiInstanceSpec,
    ) -> Result<bool, EngineError> {
        let Some(condition) = &spec.completion_condition else {
            return Ok(false);
        };
        match self.evaluate(body, condition)? {
            Value::Bool(done) => Ok(done),
            _ => Err(EngineError::NonBooleanCompletion {
                activity: act.id.clone(),
            }),
        }
    }

    fn counter(&self, body: ExecutionId, name: &str) -> i64 {
        self.tree
            .local_variable(body, name)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    fn set_local(&mut self, execution: ExecutionId, name: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        self.tree
            .get_mut(execution)?
            .variables
            .insert(name.to_string(), value.into());
        Ok(())
    }
}
