//! Leaving activities: outgoing flow selection, forking, scope exit and the
//! end of executions, scopes and process instances.

use super::{Operation, Vm};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{Activity, ActivityKind, ProcessDefinition};
use crate::tree::EventType;
use crate::types::{now_ms, ExecutionId, FlowId, ProcessState, ScopeId};

/// How [`Vm::take_outgoing`] selects flows.
#[derive(Debug, Clone, Default)]
pub struct LeaveOptions {
    /// Take every outgoing flow regardless of its guard (parallel gateway).
    pub ignore_conditions: bool,
    /// Stop at the first passing guard (exclusive gateway).
    pub exclusive: bool,
    /// Joined executions whose tokens are consumed by the transition.
    pub reusable: Vec<ExecutionId>,
}

impl LeaveOptions {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn ignoring_conditions() -> Self {
        Self {
            ignore_conditions: true,
            ..Self::default()
        }
    }
}

pub(super) fn in_multi_instance_body(
    definition: &ProcessDefinition,
    act: &Activity,
) -> Result<bool, EngineError> {
    Ok(match &act.flow_scope {
        ScopeId::Process => false,
        ScopeId::Activity(scope) => matches!(
            definition.activity(scope)?.kind,
            ActivityKind::MultiInstanceBody { .. }
        ),
    })
}

fn ends_silently(definition: &ProcessDefinition, act: &Activity) -> Result<bool, EngineError> {
    let end_kind = matches!(
        act.kind,
        ActivityKind::NoneEndEvent
            | ActivityKind::TerminateEndEvent
            | ActivityKind::ErrorEndEvent { .. }
            | ActivityKind::EscalationThrow { end: true, .. }
            | ActivityKind::CompensationThrow { end: true, .. }
            | ActivityKind::EventSubProcess
    );
    Ok(end_kind || in_multi_instance_body(definition, act)?)
}

impl Vm<'_> {
    /// The activity `execution` is positioned at has completed: exit its
    /// scope if it has one, then continue along the outgoing flows.
    pub(super) fn leave(&mut self, execution: ExecutionId) -> Result<(), EngineError> {
        let definition = self.definition_of(execution)?;
        let activity = self.activity_of(execution)?;
        let act = definition.activity(&activity)?;

        let owns_scope = self.tree.get(execution)?.scope.as_ref().and_then(ScopeId::activity_id)
            == Some(activity.as_str());
        let token = if act.is_scope && owns_scope {
            self.exit_scope(execution, &definition, act)?
        } else {
            execution
        };

        if let Some(handler) = &act.compensation_handler {
            if !act.is_compensation_handler {
                self.tree.add_subscription(
                    token,
                    EventType::Compensate,
                    handler,
                    Some(activity.clone()),
                    None,
                    None,
                )?;
            }
        }
        self.take_outgoing(token, &activity, LeaveOptions::default())
    }

    /// Remove (or keep for compensation) the scope execution of a completed
    /// scope activity and hand the token back to its parent.
    pub(super) fn exit_scope(
        &mut self,
        scope_exec: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
    ) -> Result<ExecutionId, EngineError> {
        let parent = self
            .tree
            .get(scope_exec)?
            .parent
            .ok_or(EngineError::NotAScope(scope_exec))?;
        if !self.preserve_compensation_scope(scope_exec, parent, definition, act)? {
            self.tree.remove(scope_exec)?;
        }
        self.tree.activate(parent)?;
        self.tree.set_activity(parent, Some(&act.id))?;
        Ok(parent)
    }

    /// Keep a completed container's execution as an event scope when it holds
    /// compensation state, and subscribe the enclosing scope to it.
    fn preserve_compensation_scope(
        &mut self,
        scope_exec: ExecutionId,
        parent: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
    ) -> Result<bool, EngineError> {
        if !act.is_container() || act.compensation_handler.is_some() {
            return Ok(false);
        }
        let has_subscriptions = self
            .tree
            .subscriptions_of(scope_exec)
            .iter()
            .any(|s| s.event_type == EventType::Compensate);
        let has_event_scopes = self
            .tree
            .get(scope_exec)?
            .children
            .iter()
            .any(|c| self.tree.get(*c).map(|x| x.is_event_scope).unwrap_or(false));
        let has_handler = definition
            .compensation_event_sub_process(&ScopeId::Activity(act.id.clone()))
            .is_some();
        if !(has_subscriptions || has_event_scopes || has_handler) {
            return Ok(false);
        }

        self.tree.clear_event_subscriptions(scope_exec);
        {
            let exec = self.tree.get_mut(scope_exec)?;
            exec.is_event_scope = true;
            exec.is_active = false;
            exec.is_concurrent = false;
            exec.activity = Some(act.id.clone());
        }
        let owner = self.tree.scope_execution(parent)?;
        self.tree.set_parent(scope_exec, owner)?;
        let compensated = match &act.kind {
            ActivityKind::MultiInstanceBody { inner, .. } => inner.clone(),
            _ => act.id.clone(),
        };
        self.tree.add_subscription(
            owner,
            EventType::Compensate,
            &act.id,
            Some(compensated),
            None,
            Some(scope_exec),
        )?;
        tracing::debug!(execution = %scope_exec, scope = %act.id, "kept scope for compensation");
        Ok(true)
    }

    /// Select the outgoing flows of `activity` and leave through them.
    pub fn take_outgoing(
        &mut self,
        execution: ExecutionId,
        activity: &str,
        options: LeaveOptions,
    ) -> Result<(), EngineError> {
        if !self.tree.live(execution)?.is_active {
            return Err(EngineError::ExecutionInactive(execution));
        }
        let definition = self.definition_of(execution)?;
        let act = definition.activity(activity)?;

        let mut selected: Vec<FlowId> = Vec::new();
        for flow_id in &act.outgoing {
            if act.default_flow.as_ref() == Some(flow_id) {
                continue;
            }
            let flow = definition.flow(flow_id)?;
            let passes = match &flow.condition {
                Some(condition) if !options.ignore_conditions => {
                    self.evaluate(execution, condition)?.is_truthy()
                }
                _ => true,
            };
            if passes {
                selected.push(flow_id.clone());
                if options.exclusive {
                    break;
                }
            }
        }

        if selected.is_empty() {
            if let Some(default) = &act.default_flow {
                if !act.outgoing.contains(default) {
                    return Err(EngineError::MissingDefaultFlow {
                        activity: act.id.clone(),
                        flow: default.clone(),
                    });
                }
                selected.push(default.clone());
            } else if !act.outgoing.is_empty() {
                return Err(EngineError::NoConditionalFlow {
                    activity: act.id.clone(),
                });
            } else {
                return self.implicit_end(execution, &definition, act);
            }
        }
        self.leave_via_transitions(execution, activity, selected, options.reusable)
    }

    fn implicit_end(
        &mut self,
        execution: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
    ) -> Result<(), EngineError> {
        if act.is_compensation_handler {
            return self.end_compensation(execution);
        }
        if self.config.fail_on_stuck_execution && !ends_silently(definition, act)? {
            return Err(EngineError::StuckExecution {
                activity: act.id.clone(),
            });
        }
        self.end_execution(execution)
    }

    fn leave_via_transitions(
        &mut self,
        execution: ExecutionId,
        activity: &str,
        flows: Vec<FlowId>,
        reusable: Vec<ExecutionId>,
    ) -> Result<(), EngineError> {
        for other in reusable {
            if other != execution && self.tree.contains(other) {
                self.tree.remove(other)?;
            }
        }
        let exec = self.tree.get(execution)?;
        if exec.is_concurrent {
            let parent = exec.parent.ok_or(EngineError::NotAScope(execution))?;
            self.tree.try_prune_last_concurrent_child(parent)?;
        }

        let prop = self.tree.resolve(execution);
        self.tree.activate(prop)?;
        self.tree.set_activity(prop, Some(activity))?;

        if let [flow] = flows.as_slice() {
            self.queue_flow(prop, flow.clone())?;
            return Ok(());
        }

        let mut branches = Vec::with_capacity(flows.len());
        let scope = if self.tree.get(prop)?.is_concurrent {
            branches.push(prop);
            self.tree.get(prop)?.parent.ok_or(EngineError::NotAScope(prop))?
        } else {
            let expansion = self.tree.create_concurrent_child(prop)?;
            let replacement = expansion
                .replacement
                .ok_or(EngineError::LiveChildren { execution: prop })?;
            branches.push(replacement);
            branches.push(expansion.child);
            prop
        };
        while branches.len() < flows.len() {
            branches.push(self.tree.create_concurrent_child(scope)?.child);
        }

        for (branch, flow) in branches.iter().zip(&flows) {
            self.tree.set_activity(*branch, Some(activity))?;
            self.tree.activate(*branch)?;
            self.queue_flow(*branch, flow.clone())?;
        }
        self.emit(RuntimeEvent::Forked {
            activity: activity.to_string(),
            executions: branches,
            flows,
        });
        Ok(())
    }

    fn queue_flow(&mut self, execution: ExecutionId, flow: FlowId) -> Result<(), EngineError> {
        self.tree.get_mut(execution)?.pending_transition = Some(flow.clone());
        self.agenda.push_back(Operation::TakeFlow { execution, flow });
        Ok(())
    }

    pub(super) fn take_flow(&mut self, execution: ExecutionId, flow_id: &str) -> Result<(), EngineError> {
        let definition = self.definition_of(execution)?;
        let flow = definition.flow(flow_id)?;
        {
            let exec = self.tree.get_mut(execution)?;
            exec.pending_transition = None;
            exec.arrived_via = Some(flow.id.clone());
            exec.activity = Some(flow.target.clone());
        }
        self.emit(RuntimeEvent::FlowTaken {
            execution,
            flow: flow.id.clone(),
            source: flow.source.clone(),
            target: flow.target.clone(),
        });
        self.execute_activity(execution, &flow.target)
    }

    /// The token of `execution` is consumed without continuing.
    pub(super) fn end_execution(&mut self, execution: ExecutionId) -> Result<(), EngineError> {
        let definition = self.definition_of(execution)?;
        let activity = self.activity_of(execution)?;
        let act = definition.activity(&activity)?;
        if in_multi_instance_body(&definition, act)? {
            return self.instance_completed(execution, &definition, act);
        }

        let exec = self.tree.get(execution)?;
        if !exec.is_concurrent {
            return self.scope_completed(execution);
        }
        let parent = exec.parent.ok_or(EngineError::NotAScope(execution))?;
        self.tree.remove(execution)?;
        if self.tree.non_event_scope_children(parent)?.is_empty() {
            self.scope_completed(parent)
        } else {
            self.tree.try_prune_last_concurrent_child(parent)?;
            Ok(())
        }
    }

    /// Every token inside the scope represented by `scope_exec` has ended.
    pub(super) fn scope_completed(&mut self, scope_exec: ExecutionId) -> Result<(), EngineError> {
        let scope = self
            .tree
            .get(scope_exec)?
            .scope
            .clone()
            .ok_or(EngineError::NotAScope(scope_exec))?;
        let id = match scope {
            ScopeId::Process => return self.process_end(scope_exec),
            ScopeId::Activity(id) => id,
        };
        let definition = self.definition_of(scope_exec)?;
        let act = definition.activity(&id)?;
        if act.is_event_sub_process()
            && definition.compensation_event_sub_process(&act.flow_scope).map(|a| &a.id) == Some(&act.id)
        {
            let parent = self.tree.get(scope_exec)?.parent;
            self.tree.remove(scope_exec)?;
            if let Some(parent) = parent {
                self.compensation_done(parent)?;
            }
            return Ok(());
        }
        self.tree.set_activity(scope_exec, Some(&id))?;
        self.tree.activate(scope_exec)?;
        self.leave(scope_exec)
    }

    fn process_end(&mut self, root: ExecutionId) -> Result<(), EngineError> {
        let exec = self.tree.get(root)?;
        let Some(call) = exec.super_execution else {
            self.tree.end_process_instance(root)?;
            if self.terminal.is_none() {
                self.terminal = Some(ProcessState::Completed);
            }
            self.emit(RuntimeEvent::Completed { at: now_ms() });
            return Ok(());
        };

        let variables = exec.variables.clone();
        let caller = self.definition_of(call)?;
        let call_activity = self.activity_of(call)?;
        let pass = matches!(
            caller.activity(&call_activity)?.kind,
            ActivityKind::CallActivity {
                pass_variables: true,
                ..
            }
        );
        self.tree.delete_cascade(root)?;
        if pass {
            self.write_variables(call, variables)?;
        }
        tracing::debug!(%root, %call, "called process instance completed");
        self.agenda.push_back(Operation::Leave { execution: call });
        Ok(())
    }

    /// Terminate end event: cancel every token of the enclosing scope.
    pub(super) fn terminate(&mut self, execution: ExecutionId, act: &Activity) -> Result<(), EngineError> {
        let scope_exec = self.tree.flow_scope_execution(execution, &act.flow_scope)?;
        for child in self.tree.non_event_scope_children(scope_exec)? {
            self.cancel_execution(child, "terminated")?;
        }
        let top_level = act.flow_scope == ScopeId::Process
            && self.tree.get(scope_exec)?.super_execution.is_none();
        if top_level {
            self.emit(RuntimeEvent::Terminated {
                at: now_ms(),
                activity: act.id.clone(),
            });
            self.terminal = Some(ProcessState::Terminated);
            return self.tree.end_process_instance(scope_exec);
        }
        self.tree.activate(scope_exec)?;
        self.scope_completed(scope_exec)
    }
}
