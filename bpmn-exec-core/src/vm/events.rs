//! Event subscriptions: triggering catch events, boundary events, event
//! sub-processes and event-based gateway successors.

use super::{Operation, Vm};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::ActivityKind;
use crate::tree::EventType;
use crate::types::{ExecutionId, ScopeId, Value};
use std::collections::BTreeMap;

impl Vm<'_> {
    /// Run the handler activity of an event caught by the scope execution
    /// `owner`. Returns the execution that carries on in the handler.
    pub(super) fn execute_event_handler(
        &mut self,
        owner: ExecutionId,
        handler: &str,
    ) -> Result<ExecutionId, EngineError> {
        let definition = self.definition_of(owner)?;
        let act = definition.activity(handler)?;
        let rejected = || EngineError::SignalRejected {
            execution: owner,
            activity: handler.to_string(),
        };

        match &act.kind {
            ActivityKind::Boundary { cancel_activity, .. } => {
                let parent = self.tree.get(owner)?.parent.ok_or(EngineError::NotAScope(owner))?;
                let target = if *cancel_activity {
                    self.cancel_execution(owner, "interrupted by boundary event")?;
                    self.tree.activate(parent)?;
                    parent
                } else {
                    let scope = self.tree.scope_execution(parent)?;
                    self.tree.create_concurrent_child(scope)?.child
                };
                self.tree.set_activity(target, Some(handler))?;
                self.agenda.push_back(Operation::Leave { execution: target });
                Ok(target)
            }
            ActivityKind::StartEvent { interrupting, .. } => {
                let esp = act.flow_scope.activity_id().ok_or_else(rejected)?.to_string();
                let host = if *interrupting {
                    for child in self.tree.non_event_scope_children(owner)? {
                        self.cancel_execution(child, "interrupted by event sub-process")?;
                    }
                    self.tree.clear_event_subscriptions(owner);
                    owner
                } else {
                    self.tree.create_concurrent_child(owner)?.child
                };
                self.tree.set_activity(host, Some(&esp))?;
                let esp_exec = self.create_scope_execution(host, &esp)?;
                self.tree.set_activity(esp_exec, Some(handler))?;
                self.push_execute(esp_exec, handler);
                Ok(esp_exec)
            }
            ActivityKind::IntermediateCatch { .. } | ActivityKind::ReceiveTask { .. } => {
                // successor of an event-based gateway; `owner` is the gateway's scope execution
                let gateway = self.activity_of(owner)?;
                let flow = definition
                    .outgoing(&gateway)?
                    .into_iter()
                    .find(|f| f.target == handler)
                    .cloned()
                    .ok_or_else(rejected)?;
                let parent = self.tree.get(owner)?.parent.ok_or(EngineError::NotAScope(owner))?;
                self.tree.delete_cascade(owner)?;
                self.tree.activate(parent)?;
                self.tree.set_activity(parent, Some(handler))?;
                self.tree.get_mut(parent)?.arrived_via = Some(flow.id.clone());
                self.emit(RuntimeEvent::FlowTaken {
                    execution: parent,
                    flow: flow.id,
                    source: flow.source,
                    target: flow.target,
                });
                self.agenda.push_back(Operation::Leave { execution: parent });
                Ok(parent)
            }
            _ => Err(rejected()),
        }
    }

    /// Fire a subscription. Interrupting events consume it; non-interrupting
    /// boundary events and event sub-process starts stay subscribed.
    pub fn trigger_subscription(
        &mut self,
        subscription: u64,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        let sub = self.tree.subscription(subscription)?.clone();
        if sub.event_type == EventType::Compensate {
            return Err(EngineError::SignalRejected {
                execution: sub.execution,
                activity: sub.activity,
            });
        }
        let definition = self.definition_of(sub.execution)?;
        let keep = matches!(
            definition.activity(&sub.activity)?.kind,
            ActivityKind::Boundary {
                cancel_activity: false,
                ..
            } | ActivityKind::StartEvent {
                interrupting: false,
                ..
            }
        );
        if !keep {
            self.tree.remove_subscription(subscription);
        }
        self.emit(RuntimeEvent::SubscriptionTriggered {
            subscription,
            activity: sub.activity.clone(),
        });

        let owner_scope = self.tree.get(sub.execution)?.scope.clone();
        if owner_scope.as_ref().and_then(ScopeId::activity_id) == Some(sub.activity.as_str()) {
            // the waiting catch event or receive task itself
            self.write_variables(sub.execution, variables)?;
            self.agenda.push_back(Operation::Leave {
                execution: sub.execution,
            });
            return Ok(());
        }
        let handler = self.execute_event_handler(sub.execution, &sub.activity)?;
        self.write_variables(handler, variables)
    }

    /// Deliver a message to the oldest matching subscription, or buffer it.
    /// Returns whether a subscriber was found.
    pub fn correlate_message(
        &mut self,
        name: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<bool, EngineError> {
        match self.tree.find_subscriptions(EventType::Message, Some(name)).first() {
            Some(sub) => {
                self.trigger_subscription(sub.id, variables)?;
                Ok(true)
            }
            None => {
                tracing::debug!(message = name, "no subscriber; buffering message");
                self.tree.buffer_message(name, variables);
                self.emit(RuntimeEvent::MessageBuffered {
                    name: name.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Deliver a signal to every matching subscription. Returns how many fired.
    pub fn broadcast_signal(
        &mut self,
        name: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<usize, EngineError> {
        let mut fired = 0;
        for sub in self.tree.find_subscriptions(EventType::Signal, Some(name)) {
            // an earlier handler may have cancelled this subscriber
            if self.tree.subscription(sub.id).is_err() {
                continue;
            }
            self.trigger_subscription(sub.id, variables.clone())?;
            fired += 1;
        }
        Ok(fired)
    }

    pub fn fire_timer(&mut self, subscription: u64) -> Result<(), EngineError> {
        let sub = self.tree.subscription(subscription)?;
        if sub.event_type != EventType::Timer {
            return Err(EngineError::SignalRejected {
                execution: sub.execution,
                activity: sub.activity.clone(),
            });
        }
        self.trigger_subscription(subscription, BTreeMap::new())
    }

    /// Fire every conditional subscription whose condition now holds.
    pub(super) fn evaluate_conditional_subscriptions(&mut self) -> Result<(), EngineError> {
        for sub in self.tree.find_subscriptions(EventType::Conditional, None) {
            if self.tree.subscription(sub.id).is_err() || !self.tree.contains(sub.execution) {
                continue;
            }
            let Some(condition) = &sub.condition else {
                continue;
            };
            if self.evaluate(sub.execution, condition)?.is_truthy() {
                self.trigger_subscription(sub.id, BTreeMap::new())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, UnhandledErrorPolicy};
    use crate::delegate::Services;
    use crate::events::RuntimeEvent;
    use crate::model::{EventTrigger, ProcessBuilder, Repository};
    use crate::tree::{EventType, ExecutionTree};
    use crate::types::Value;
    use crate::vm::Vm;
    use std::collections::BTreeMap;

    fn waiting(tree: &ExecutionTree) -> Vec<String> {
        let mut acts: Vec<String> = tree.active_activities().into_iter().map(|(_, a)| a).collect();
        acts.sort();
        acts
    }

    #[test]
    fn test_message_catch_waits_and_resumes() {
        let def = ProcessBuilder::new("p")
            .start_event("start")
            .intermediate_catch_event("wait_payment", EventTrigger::Message("paid".into()))
            .user_task("ship")
            .flow("start", "wait_payment")
            .flow("wait_payment", "ship")
            .build()
            .unwrap();
        let mut repo = Repository::new();
        repo.deploy(def);
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        vm.start("p", BTreeMap::new()).unwrap();
        vm.run().unwrap();
        assert!(!vm.correlate_message("other", BTreeMap::new()).unwrap());
        assert!(vm
            .correlate_message("paid", BTreeMap::from([("amount".to_string(), Value::I64(10))]))
            .unwrap());
        vm.run().unwrap();
        vm.finish();
        assert_eq!(waiting(&tree), vec!["ship"]);
        assert_eq!(tree.buffered_messages().len(), 1);
        assert_eq!(tree.variable(tree.root().unwrap(), "amount"), Some(&Value::I64(10)));
    }

    #[test]
    fn test_non_interrupting_boundary_keeps_host_running() {
        let def = ProcessBuilder::new("p")
            .start_event("start")
            .user_task("review")
            .boundary_event("remind", "review", EventTrigger::Timer("PT1H".into()), false)
            .user_task("nudge")
            .user_task("done")
            .flow("start", "review")
            .flow("review", "done")
            .flow("remind", "nudge")
            .build()
            .unwrap();
        let mut repo = Repository::new();
        repo.deploy(def);
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        vm.start("p", BTreeMap::new()).unwrap();
        vm.run().unwrap();
        let timer = vm.tree().find_subscriptions(EventType::Timer, None)[0].id;
        vm.fire_timer(timer).unwrap();
        vm.run().unwrap();
        let report = vm.finish();
        assert_eq!(waiting(&tree), vec!["nudge", "review"]);
        assert!(tree.subscription(timer).is_ok());
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::SubscriptionTriggered { activity, .. } if activity == "remind")));
    }

    #[test]
    fn test_interrupting_boundary_cancels_host() {
        let def = ProcessBuilder::new("p")
            .start_event("start")
            .user_task("review")
            .boundary_event("deadline", "review", EventTrigger::Signal("stop".into()), true)
            .user_task("escalated")
            .end_event("end")
            .flow("start", "review")
            .flow("review", "end")
            .flow("deadline", "escalated")
            .build()
            .unwrap();
        let mut repo = Repository::new();
        repo.deploy(def);
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        vm.start("p", BTreeMap::new()).unwrap();
        vm.run().unwrap();
        assert_eq!(vm.broadcast_signal("stop", BTreeMap::new()).unwrap(), 1);
        vm.run().unwrap();
        vm.finish();
        assert_eq!(waiting(&tree), vec!["escalated"]);
        assert!(tree.find_subscriptions(EventType::Signal, None).is_empty());
    }

    #[test]
    fn test_conditional_catch_fires_on_variable_update() {
        use crate::expr::{CompareOp, Expression};
        let def = ProcessBuilder::new("p")
            .start_event("start")
            .intermediate_catch_event(
                "until_ready",
                EventTrigger::Conditional(Expression::compare("ready", CompareOp::Eq, true)),
            )
            .user_task("go")
            .flow("start", "until_ready")
            .flow("until_ready", "go")
            .build()
            .unwrap();
        let mut repo = Repository::new();
        repo.deploy(def);
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        vm.start("p", BTreeMap::new()).unwrap();
        vm.run().unwrap();
        vm.set_variables(BTreeMap::from([("ready".to_string(), Value::Bool(false))])).unwrap();
        vm.run().unwrap();
        assert_eq!(waiting(vm.tree()), vec!["until_ready"]);
        vm.set_variables(BTreeMap::from([("ready".to_string(), Value::Bool(true))])).unwrap();
        vm.run().unwrap();
        vm.finish();
        assert_eq!(waiting(&tree), vec!["go"]);
    }
}
