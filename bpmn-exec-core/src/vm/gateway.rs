//! Joining gateways and the event-based gateway.

use super::{LeaveOptions, Vm};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{Activity, ActivityKind, EventTrigger, ProcessDefinition, SubscriptionDeclaration};
use crate::types::{ExecutionId, ScopeId};
use std::collections::HashSet;

/// Whether a token at `from` can still arrive at `target`: follows outgoing
/// flows and boundary events, and leaves a scope through its container when
/// an activity has no outgoing flow.
pub(super) fn can_reach(
    definition: &ProcessDefinition,
    from: &str,
    target: &str,
) -> Result<bool, EngineError> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![from.to_string()];
    while let Some(current) = stack.pop() {
        if current == target {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let act = definition.activity(&current)?;
        for flow in &act.outgoing {
            stack.push(definition.flow(flow)?.target.clone());
        }
        stack.extend(act.boundary_events.iter().cloned());
        if act.outgoing.is_empty() {
            if let ScopeId::Activity(container) = &act.flow_scope {
                stack.push(container.clone());
            }
        }
    }
    Ok(false)
}

impl Vm<'_> {
    pub(super) fn parallel_gateway(&mut self, execution: ExecutionId, act: &Activity) -> Result<(), EngineError> {
        if act.incoming.len() <= 1 {
            return self.take_outgoing(execution, &act.id, LeaveOptions::ignoring_conditions());
        }
        self.tree.inactivate(execution)?;
        self.tree.lock_concurrent_root(execution)?;
        self.emit(RuntimeEvent::JoinArrived {
            gateway: act.id.clone(),
            execution,
        });

        let waiting = self.tree.find_inactive_concurrent_siblings(execution, &act.id)?;
        let own_flow = self.tree.get(execution)?.arrived_via.clone();
        let mut joined: Vec<ExecutionId> = Vec::with_capacity(act.incoming.len());
        for flow in &act.incoming {
            let arrival = if own_flow.as_ref() == Some(flow) && !joined.contains(&execution) {
                Some(execution)
            } else {
                waiting.iter().copied().find(|w| {
                    *w != execution
                        && !joined.contains(w)
                        && self
                            .tree
                            .get(*w)
                            .map(|e| e.arrived_via.as_ref() == Some(flow))
                            .unwrap_or(false)
                })
            };
            match arrival {
                Some(e) => joined.push(e),
                None => {
                    tracing::trace!(gateway = %act.id, %flow, "join waiting");
                    self.emit(RuntimeEvent::JoinWaiting {
                        gateway: act.id.clone(),
                        execution,
                    });
                    return Ok(());
                }
            }
        }

        self.emit(RuntimeEvent::JoinFired {
            gateway: act.id.clone(),
            joined: joined.clone(),
        });
        self.tree.activate(execution)?;
        self.take_outgoing(
            execution,
            &act.id,
            LeaveOptions {
                ignore_conditions: true,
                reusable: joined,
                ..LeaveOptions::default()
            },
        )
    }

    /// Fires once no other token in the scope can still reach the gateway.
    pub(super) fn inclusive_gateway(
        &mut self,
        execution: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
    ) -> Result<(), EngineError> {
        let (concurrent, parent) = {
            let exec = self.tree.get(execution)?;
            (exec.is_concurrent, exec.parent)
        };
        // a lone token has nothing to wait for
        if act.incoming.len() <= 1 || !concurrent {
            return self.take_outgoing(execution, &act.id, LeaveOptions::default());
        }
        let parent = parent.ok_or(EngineError::NotAScope(execution))?;
        self.tree.inactivate(execution)?;
        self.tree.lock_concurrent_root(execution)?;
        self.emit(RuntimeEvent::JoinArrived {
            gateway: act.id.clone(),
            execution,
        });

        let joined = self.tree.find_inactive_concurrent_siblings(execution, &act.id)?;
        for leaf in self.tree.leaf_executions(parent)? {
            if joined.contains(&leaf) {
                continue;
            }
            let l = self.tree.get(leaf)?;
            let position = match &l.pending_transition {
                Some(flow) => Some(definition.flow(flow)?.target.clone()),
                None => l.activity.clone(),
            };
            let Some(position) = position else { continue };
            if can_reach(definition, &position, &act.id)? {
                tracing::trace!(gateway = %act.id, %leaf, %position, "join waiting on reachable token");
                self.emit(RuntimeEvent::JoinWaiting {
                    gateway: act.id.clone(),
                    execution,
                });
                return Ok(());
            }
        }

        self.emit(RuntimeEvent::JoinFired {
            gateway: act.id.clone(),
            joined: joined.clone(),
        });
        self.tree.activate(execution)?;
        self.take_outgoing(
            execution,
            &act.id,
            LeaveOptions {
                reusable: joined,
                ..LeaveOptions::default()
            },
        )
    }

    /// Wait for the first of the gateway's successor events. A condition that
    /// already holds or a buffered message fires immediately.
    pub(super) fn event_based_gateway(
        &mut self,
        execution: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
    ) -> Result<(), EngineError> {
        let mut successors = Vec::new();
        for flow in definition.outgoing(&act.id)? {
            let target = definition.activity(&flow.target)?;
            let trigger = match &target.kind {
                ActivityKind::IntermediateCatch { trigger } => trigger.clone(),
                ActivityKind::ReceiveTask { message: Some(name) } => EventTrigger::Message(name.clone()),
                _ => continue,
            };
            successors.push((target.id.clone(), trigger));
        }

        for (target, trigger) in &successors {
            match trigger {
                EventTrigger::Conditional(condition) => {
                    if self.evaluate(execution, condition)?.is_truthy() {
                        self.execute_event_handler(execution, target)?;
                        return Ok(());
                    }
                }
                EventTrigger::Message(name) => {
                    if let Some(message) = self.tree.take_buffered_message(name) {
                        let handler = self.execute_event_handler(execution, target)?;
                        self.write_variables(handler, message.variables)?;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        for (target, trigger) in &successors {
            if let Some(declaration) = SubscriptionDeclaration::from_trigger(target, trigger) {
                self.subscribe(execution, declaration)?;
            }
        }
        Ok(())
    }
}
