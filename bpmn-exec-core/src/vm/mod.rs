//! The interpreter: drives one trigger against an execution tree.
//!
//! Work is queued as atomic operations on an agenda and processed in order
//! until no operation is left (every token reached a wait state or ended).
//! A queued operation whose execution was removed or pruned in the meantime
//! is redirected to the execution that took over its token, or dropped.

mod compensation;
mod events;
mod gateway;
mod multi_instance;
mod propagation;
mod transition;

pub use multi_instance::{LOOP_COUNTER, NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES, NR_OF_INSTANCES};
pub use propagation::Thrown;
pub use transition::LeaveOptions;

use crate::config::EngineConfig;
use crate::delegate::{HandlerOutcome, Services, TaskContext, TaskFailure};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{
    Activity, ActivityKind, EventTrigger, ProcessDefinition, Repository, ServiceImplementation,
    SubscriptionDeclaration,
};
use crate::tree::ExecutionTree;
use crate::types::{ActivityId, ExecutionId, FlowId, ProcessState, ScopeId, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Result of running one activity behavior. Fatal failures travel as `Err`.
#[derive(Debug)]
pub enum Outcome {
    Continue,
    /// A BPMN error, failure or escalation to hand to propagation.
    Propagate(Thrown),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    /// Run the behavior of `activity` on the execution positioned there.
    Execute {
        execution: ExecutionId,
        activity: ActivityId,
    },
    /// The activity the execution is at has completed.
    Leave { execution: ExecutionId },
    TakeFlow {
        execution: ExecutionId,
        flow: FlowId,
    },
}

/// What a finished run hands back to the caller.
#[derive(Debug)]
pub struct RunReport {
    pub events: Vec<RuntimeEvent>,
    /// Set when the top-level process instance ended during the run.
    pub terminal: Option<ProcessState>,
}

pub struct Vm<'a> {
    tree: &'a mut ExecutionTree,
    repository: &'a Repository,
    services: &'a Services,
    config: &'a EngineConfig,
    agenda: VecDeque<Operation>,
    events: Vec<RuntimeEvent>,
    operations: usize,
    terminal: Option<ProcessState>,
}

impl<'a> Vm<'a> {
    pub fn new(
        tree: &'a mut ExecutionTree,
        repository: &'a Repository,
        services: &'a Services,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            tree,
            repository,
            services,
            config,
            agenda: VecDeque::new(),
            events: Vec::new(),
            operations: 0,
            terminal: None,
        }
    }

    pub fn tree(&self) -> &ExecutionTree {
        &*self.tree
    }

    pub fn finish(self) -> RunReport {
        self.tree.clear_replacements();
        RunReport {
            events: self.events,
            terminal: self.terminal,
        }
    }

    // ─── Triggers ─────────────────────────────────────────────

    /// Create the top-level process instance and queue its start event.
    pub fn start(
        &mut self,
        definition_key: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionId, EngineError> {
        let definition = self.repository.get(definition_key)?;
        let root = self.tree.create_process_instance(&definition.key, None)?;
        self.tree.pin_definition(&definition.key, definition.version);
        self.tree.get_mut(root)?.variables.extend(variables);
        self.enter_process(root, &definition)?;
        Ok(root)
    }

    /// Complete the wait state `execution` is parked in.
    pub fn signal(
        &mut self,
        execution: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        let exec = self.tree.live(execution)?;
        if !exec.is_active {
            return Err(EngineError::ExecutionInactive(execution));
        }
        let activity = exec.activity.clone().unwrap_or_default();
        let rejected = || EngineError::SignalRejected {
            execution,
            activity: activity.clone(),
        };
        if !self.tree.non_event_scope_children(execution)?.is_empty() {
            return Err(rejected());
        }
        let definition = self.definition_of(execution)?;
        let act = definition.activity(&activity).map_err(|_| rejected())?;
        if !matches!(
            act.kind,
            ActivityKind::UserTask
                | ActivityKind::ReceiveTask { .. }
                | ActivityKind::ServiceTask(_)
                | ActivityKind::IntermediateCatch { .. }
        ) {
            return Err(rejected());
        }
        self.write_variables(execution, variables)?;
        self.agenda.push_back(Operation::Leave { execution });
        Ok(())
    }

    /// Signal the first active execution waiting at `activity`.
    pub fn complete_activity(
        &mut self,
        activity: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionId, EngineError> {
        let execution = self
            .tree
            .active_activities()
            .into_iter()
            .find(|(_, a)| a == activity)
            .map(|(e, _)| e)
            .ok_or_else(|| EngineError::NoExecutionAt(activity.to_string()))?;
        self.signal(execution, variables)?;
        Ok(execution)
    }

    /// Cancel the whole process instance family.
    pub fn cancel(&mut self, reason: &str) -> Result<(), EngineError> {
        let root = self
            .tree
            .root()
            .ok_or_else(|| EngineError::Walk("instance has no root execution".into()))?;
        for child in self.tree.get(root)?.children.clone() {
            self.cancel_execution(child, reason)?;
        }
        self.tree.end_process_instance(root)?;
        self.emit(RuntimeEvent::Cancelled {
            reason: reason.to_string(),
        });
        self.terminal = Some(ProcessState::Cancelled {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Write variables on the process instance root and re-evaluate
    /// conditional subscriptions.
    pub fn set_variables(&mut self, variables: BTreeMap<String, Value>) -> Result<(), EngineError> {
        let root = self
            .tree
            .root()
            .ok_or_else(|| EngineError::Walk("instance has no root execution".into()))?;
        self.write_variables(root, variables)?;
        self.evaluate_conditional_subscriptions()
    }

    /// Process queued operations until every token waits or has ended.
    pub fn run(&mut self) -> Result<(), EngineError> {
        while let Some(op) = self.agenda.pop_front() {
            self.operations += 1;
            if self.operations > self.config.max_operations {
                return Err(EngineError::OperationLimit(self.config.max_operations));
            }
            match op {
                Operation::Execute {
                    execution,
                    activity,
                } => {
                    let Some(exec) = self.current(execution) else {
                        continue;
                    };
                    if self.tree.get(exec)?.activity.as_deref() != Some(activity.as_str()) {
                        tracing::trace!(%exec, activity, "execution moved on; skipping");
                        continue;
                    }
                    self.execute_activity(exec, &activity)?;
                }
                Operation::Leave { execution } => {
                    if let Some(exec) = self.current(execution) {
                        self.leave(exec)?;
                    }
                }
                Operation::TakeFlow { execution, flow } => {
                    if let Some(exec) = self.current(execution) {
                        self.take_flow(exec, &flow)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ─── Shared helpers ───────────────────────────────────────

    fn current(&self, execution: ExecutionId) -> Option<ExecutionId> {
        let id = self.tree.resolve(execution);
        match self.tree.get(id) {
            Ok(exec) if !exec.is_ended => Some(id),
            _ => None,
        }
    }

    fn emit(&mut self, event: RuntimeEvent) {
        tracing::debug!(?event, "runtime event");
        self.events.push(event);
    }

    fn definition_of(&self, execution: ExecutionId) -> Result<Arc<ProcessDefinition>, EngineError> {
        let key = &self.tree.get(execution)?.definition_key;
        self.repository.get(key)
    }

    fn activity_of(&self, execution: ExecutionId) -> Result<ActivityId, EngineError> {
        self.tree
            .get(execution)?
            .activity
            .clone()
            .ok_or_else(|| EngineError::SignalRejected {
                execution,
                activity: String::new(),
            })
    }

    fn write_variables(
        &mut self,
        execution: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        for (name, value) in variables {
            self.tree.set_variable(execution, &name, value)?;
        }
        Ok(())
    }

    fn evaluate(&self, execution: ExecutionId, expr: &crate::expr::Expression) -> Result<Value, EngineError> {
        let services = self.services;
        Ok(services
            .evaluator()
            .evaluate(expr, &self.tree.scope_view(execution))?)
    }

    fn push_execute(&mut self, execution: ExecutionId, activity: &str) {
        self.agenda.push_back(Operation::Execute {
            execution,
            activity: activity.to_string(),
        });
    }

    fn subscribe(
        &mut self,
        execution: ExecutionId,
        declaration: SubscriptionDeclaration,
    ) -> Result<u64, EngineError> {
        let id = self.tree.add_subscription(
            execution,
            declaration.event_type,
            &declaration.activity,
            declaration.event_name,
            declaration.condition,
            None,
        )?;
        let owner = self.tree.subscription(id)?.execution;
        self.emit(RuntimeEvent::SubscriptionCreated {
            subscription: id,
            execution: owner,
            event_type: format!("{:?}", declaration.event_type),
            activity: declaration.activity,
        });
        Ok(id)
    }

    /// Register process-level subscriptions and queue the none start event.
    fn enter_process(
        &mut self,
        root: ExecutionId,
        definition: &ProcessDefinition,
    ) -> Result<(), EngineError> {
        for declaration in definition.subscription_declarations(&ScopeId::Process)? {
            self.subscribe(root, declaration)?;
        }
        let start = definition.start_event(&ScopeId::Process)?;
        self.tree.set_activity(root, Some(&start.id))?;
        self.push_execute(root, &start.id);
        Ok(())
    }

    /// Create the scope execution for `activity` below `parent`, which waits
    /// inactive at the activity until the scope is left.
    fn create_scope_execution(
        &mut self,
        parent: ExecutionId,
        activity: &str,
    ) -> Result<ExecutionId, EngineError> {
        let definition = self.definition_of(parent)?;
        let scope = ScopeId::Activity(activity.to_string());
        let arrived_via = self.tree.get(parent)?.arrived_via.clone();
        let execution = self.tree.create_child(parent, false, Some(scope.clone()))?;
        {
            let exec = self.tree.get_mut(execution)?;
            exec.activity = Some(activity.to_string());
            exec.arrived_via = arrived_via;
        }
        self.tree.set_activity(parent, Some(activity))?;
        self.tree.inactivate(parent)?;
        for declaration in definition.subscription_declarations(&scope)? {
            self.subscribe(execution, declaration)?;
        }
        Ok(execution)
    }

    fn cancel_execution(&mut self, execution: ExecutionId, reason: &str) -> Result<(), EngineError> {
        let removed = self.tree.delete_cascade(execution)?;
        tracing::debug!(%execution, removed = removed.len(), reason, "scope cancelled");
        self.emit(RuntimeEvent::ScopeCancelled {
            execution,
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ─── Behavior dispatch ────────────────────────────────────

    /// Enter `activity` with `execution` (creating its scope execution when
    /// the activity is a scope) and run its behavior.
    fn execute_activity(&mut self, execution: ExecutionId, activity: &str) -> Result<(), EngineError> {
        let definition = self.definition_of(execution)?;
        let act = definition.activity(activity)?;
        let entered = self.tree.get(execution)?.scope.as_ref().and_then(ScopeId::activity_id)
            == Some(activity);
        let target = if act.is_scope && !entered {
            self.create_scope_execution(execution, activity)?
        } else {
            execution
        };
        self.emit(RuntimeEvent::ActivityStarted {
            execution: target,
            activity: activity.to_string(),
        });
        match self.run_behavior(target, &definition, act)? {
            Outcome::Continue => Ok(()),
            Outcome::Propagate(thrown) => self.propagate(target, activity, thrown),
        }
    }

    fn run_behavior(
        &mut self,
        exec: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
    ) -> Result<Outcome, EngineError> {
        match &act.kind {
            ActivityKind::StartEvent { .. }
            | ActivityKind::NoneEndEvent
            | ActivityKind::Task
            | ActivityKind::Boundary { .. } => {
                self.leave(exec)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::TerminateEndEvent => {
                self.terminate(exec, act)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::ErrorEndEvent { code, message } => Ok(Outcome::Propagate(Thrown::Error {
                code: code.clone(),
                message: message.clone(),
            })),
            ActivityKind::EscalationThrow { code, .. } => {
                Ok(Outcome::Propagate(Thrown::Escalation { code: code.clone() }))
            }
            ActivityKind::CompensationThrow { activity_ref, .. } => {
                self.throw_compensation(exec, definition, act, activity_ref.as_deref())?;
                Ok(Outcome::Continue)
            }
            ActivityKind::UserTask => Ok(Outcome::Continue),
            ActivityKind::ReceiveTask { message } => {
                if let Some(name) = message {
                    let declaration =
                        SubscriptionDeclaration::from_trigger(&act.id, &EventTrigger::Message(name.clone()));
                    if let Some(declaration) = declaration {
                        self.subscribe(exec, declaration)?;
                    }
                }
                Ok(Outcome::Continue)
            }
            ActivityKind::ServiceTask(implementation) => {
                self.execute_service_task(exec, act, implementation)
            }
            ActivityKind::ExclusiveGateway => {
                self.take_outgoing(exec, &act.id, LeaveOptions::exclusive())?;
                Ok(Outcome::Continue)
            }
            ActivityKind::ParallelGateway => {
                self.parallel_gateway(exec, act)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::InclusiveGateway => {
                self.inclusive_gateway(exec, definition, act)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::EventBasedGateway => {
                self.event_based_gateway(exec, definition, act)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::IntermediateCatch { trigger } => {
                self.intermediate_catch(exec, act, trigger)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::SubProcess => {
                let start = definition.start_event(&ScopeId::Activity(act.id.clone()))?;
                self.tree.set_activity(exec, Some(&start.id))?;
                self.push_execute(exec, &start.id);
                Ok(Outcome::Continue)
            }
            ActivityKind::EventSubProcess => {
                let start = definition.event_sub_process_start(&act.id)?;
                self.tree.set_activity(exec, Some(&start.id))?;
                self.push_execute(exec, &start.id);
                Ok(Outcome::Continue)
            }
            ActivityKind::CallActivity {
                called_element,
                pass_variables,
            } => {
                self.call_activity(exec, act, called_element, *pass_variables)?;
                Ok(Outcome::Continue)
            }
            ActivityKind::MultiInstanceBody { spec, inner } => {
                self.start_multi_instance(exec, act, spec, inner)?;
                Ok(Outcome::Continue)
            }
        }
    }

    fn intermediate_catch(
        &mut self,
        exec: ExecutionId,
        act: &Activity,
        trigger: &EventTrigger,
    ) -> Result<(), EngineError> {
        if let EventTrigger::Conditional(condition) = trigger {
            if self.evaluate(exec, condition)?.is_truthy() {
                return self.leave(exec);
            }
        }
        match SubscriptionDeclaration::from_trigger(&act.id, trigger) {
            Some(declaration) => {
                self.subscribe(exec, declaration)?;
                Ok(())
            }
            // nothing to wait for
            None => self.leave(exec),
        }
    }

    fn execute_service_task(
        &mut self,
        exec: ExecutionId,
        act: &Activity,
        implementation: &ServiceImplementation,
    ) -> Result<Outcome, EngineError> {
        match implementation {
            ServiceImplementation::Delegate(name) => {
                let handler = self.services.handler(name)?;
                let mut ctx = TaskContext {
                    activity: act.id.clone(),
                    execution: exec,
                    variables: self.tree.visible_variables(exec),
                    outputs: BTreeMap::new(),
                };
                match handler.execute(&mut ctx) {
                    Ok(outcome) => {
                        self.write_variables(exec, ctx.outputs)?;
                        match outcome {
                            HandlerOutcome::Complete => {
                                self.leave(exec)?;
                                Ok(Outcome::Continue)
                            }
                            HandlerOutcome::Wait => Ok(Outcome::Continue),
                            HandlerOutcome::BpmnError { code, message } => {
                                Ok(Outcome::Propagate(Thrown::Error { code, message }))
                            }
                            HandlerOutcome::Escalation { code } => {
                                Ok(Outcome::Propagate(Thrown::Escalation { code }))
                            }
                        }
                    }
                    Err(source) => {
                        let code = source.downcast_ref::<TaskFailure>().map(|f| f.code.clone());
                        tracing::debug!(activity = %act.id, error = %source, "service task failed");
                        Ok(Outcome::Propagate(Thrown::Failure { code, source }))
                    }
                }
            }
            ServiceImplementation::Expression {
                expression,
                result_variable,
            } => {
                let value = self.evaluate(exec, expression)?;
                if let Some(name) = result_variable {
                    self.tree.set_variable(exec, name, value)?;
                }
                self.leave(exec)?;
                Ok(Outcome::Continue)
            }
        }
    }

    fn call_activity(
        &mut self,
        exec: ExecutionId,
        act: &Activity,
        called_element: &str,
        pass_variables: bool,
    ) -> Result<(), EngineError> {
        let called = self.repository.get(called_element)?;
        let sub_instance = self.tree.create_process_instance(&called.key, Some(exec))?;
        self.tree.pin_definition(&called.key, called.version);
        if pass_variables {
            let variables = self.tree.visible_variables(exec);
            self.tree.get_mut(sub_instance)?.variables.extend(variables);
        }
        self.emit(RuntimeEvent::CallActivityStarted {
            activity: act.id.clone(),
            called_element: called.key.clone(),
            sub_instance,
        });
        self.enter_process(sub_instance, &called)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnhandledErrorPolicy;
    use crate::model::ProcessBuilder;

    fn deploy(def: ProcessDefinition) -> Repository {
        let mut repo = Repository::new();
        repo.deploy(def);
        repo
    }

    #[test]
    fn test_linear_process_waits_at_user_task() {
        let repo = deploy(
            ProcessBuilder::new("p")
                .start_event("start")
                .user_task("review")
                .end_event("end")
                .flow("start", "review")
                .flow("review", "end")
                .build()
                .unwrap(),
        );
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();

        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        let root = vm.start("p", BTreeMap::new()).unwrap();
        vm.run().unwrap();
        assert_eq!(vm.tree().active_activities(), vec![(root, "review".to_string())]);

        vm.complete_activity("review", BTreeMap::from([("ok".to_string(), Value::Bool(true))]))
            .unwrap();
        vm.run().unwrap();
        let report = vm.finish();
        assert_eq!(report.terminal, Some(ProcessState::Completed));
        assert!(tree.get(root).unwrap().is_ended);
        assert_eq!(tree.local_variable(root, "ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_signal_rejected_for_non_wait_state() {
        let repo = deploy(
            ProcessBuilder::new("p")
                .start_event("start")
                .user_task("review")
                .end_event("end")
                .flow("start", "review")
                .flow("review", "end")
                .build()
                .unwrap(),
        );
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        let root = vm.start("p", BTreeMap::new()).unwrap();
        // still positioned at the start event
        assert!(matches!(
            vm.signal(root, BTreeMap::new()),
            Err(EngineError::SignalRejected { .. })
        ));
    }

    #[test]
    fn test_operation_limit_stops_endless_loops() {
        let repo = deploy(
            ProcessBuilder::new("loop")
                .start_event("start")
                .task("a")
                .task("b")
                .flow("start", "a")
                .flow("a", "b")
                .flow("b", "a")
                .build()
                .unwrap(),
        );
        let services = Services::new();
        let mut config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        config.max_operations = 50;
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        vm.start("loop", BTreeMap::new()).unwrap();
        assert!(matches!(vm.run(), Err(EngineError::OperationLimit(50))));
    }
}
