//! Compensation.
//!
//! Completing an activity with a compensation handler leaves a `Compensate`
//! subscription on its scope execution. Completed containers holding such
//! subscriptions stay in the tree as event-scope executions. A compensation
//! throw consumes the subscriptions of its scope newest first and waits until
//! every handler (and every nested scope's handlers) has finished.

use super::Vm;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{Activity, ActivityKind, ProcessDefinition};
use crate::tree::{EventSubscription, EventType};
use crate::types::{ExecutionId, ScopeId};
use std::cmp::Reverse;

impl Vm<'_> {
    pub(super) fn throw_compensation(
        &mut self,
        execution: ExecutionId,
        definition: &ProcessDefinition,
        act: &Activity,
        activity_ref: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut scope_exec = self.tree.flow_scope_execution(execution, &act.flow_scope)?;
        // inside a compensation event sub-process: compensate the scope it belongs to
        if let ScopeId::Activity(container) = &act.flow_scope {
            let esp = definition.activity(container)?;
            let is_compensation_esp = esp.is_event_sub_process()
                && definition
                    .compensation_event_sub_process(&esp.flow_scope)
                    .is_some_and(|c| c.id == esp.id);
            if is_compensation_esp {
                let parent = self
                    .tree
                    .get(scope_exec)?
                    .parent
                    .ok_or(EngineError::NotAScope(scope_exec))?;
                scope_exec = self.tree.scope_execution(parent)?;
            }
        }

        let subscriptions: Vec<EventSubscription> = self
            .tree
            .subscriptions_of(scope_exec)
            .into_iter()
            .filter(|s| s.event_type == EventType::Compensate)
            .filter(|s| activity_ref.is_none() || s.event_name.as_deref() == activity_ref)
            .collect();
        if subscriptions.is_empty() {
            tracing::debug!(%execution, activity = %act.id, "nothing to compensate");
            return self.leave(execution);
        }

        let handlers = subscriptions.iter().map(|s| s.activity.clone()).collect();
        self.tree.inactivate(execution)?;
        self.emit(RuntimeEvent::CompensationThrown { execution, handlers });
        self.spawn_compensation(execution, subscriptions)
    }

    /// Start one compensation per subscription below `thrower`, newest first.
    fn spawn_compensation(
        &mut self,
        thrower: ExecutionId,
        mut subscriptions: Vec<EventSubscription>,
    ) -> Result<(), EngineError> {
        subscriptions.sort_by_key(|s| Reverse(s.created_seq));
        for sub in subscriptions {
            self.tree.remove_subscription(sub.id);
            match sub.configuration {
                Some(event_scope) => {
                    if !self.tree.contains(event_scope) {
                        continue;
                    }
                    self.tree.set_parent(event_scope, thrower)?;
                    {
                        let es = self.tree.get_mut(event_scope)?;
                        es.is_event_scope = false;
                        es.is_concurrent = true;
                    }
                    self.compensate_scope(event_scope, &sub)?;
                }
                None => {
                    let child = self.tree.create_child(thrower, true, None)?;
                    self.tree.set_activity(child, Some(&sub.activity))?;
                    self.push_execute(child, &sub.activity);
                }
            }
        }
        Ok(())
    }

    /// Compensate a completed container kept as `event_scope`: run its
    /// compensation event sub-process, or else compensate its own content.
    fn compensate_scope(&mut self, event_scope: ExecutionId, sub: &EventSubscription) -> Result<(), EngineError> {
        let definition = self.definition_of(event_scope)?;
        let scope = ScopeId::Activity(sub.activity.clone());
        if let Some(esp) = definition.compensation_event_sub_process(&scope) {
            let start = definition.event_sub_process_start(&esp.id)?;
            self.tree.activate(event_scope)?;
            self.tree.set_activity(event_scope, Some(&esp.id))?;
            let esp_exec = self.create_scope_execution(event_scope, &esp.id)?;
            self.tree.set_activity(esp_exec, Some(&start.id))?;
            self.push_execute(esp_exec, &start.id);
            return Ok(());
        }

        let inner: Vec<EventSubscription> = self
            .tree
            .subscriptions_of(event_scope)
            .into_iter()
            .filter(|s| s.event_type == EventType::Compensate)
            .collect();
        if inner.is_empty() {
            return self.compensation_done(event_scope);
        }
        self.spawn_compensation(event_scope, inner)
    }

    /// A compensation below `execution` finished. Once nothing is left
    /// running, either resume the throwing event or close the compensated
    /// scope and report upward.
    pub(super) fn compensation_done(&mut self, execution: ExecutionId) -> Result<(), EngineError> {
        let Ok(exec) = self.tree.live(execution) else {
            return Ok(());
        };
        if !self.tree.non_event_scope_children(execution)?.is_empty() {
            return Ok(());
        }
        let definition = self.definition_of(execution)?;
        let is_thrower = exec
            .activity
            .as_deref()
            .and_then(|a| definition.activity(a).ok())
            .is_some_and(|a| matches!(a.kind, ActivityKind::CompensationThrow { .. }));
        if is_thrower {
            self.emit(RuntimeEvent::CompensationCompleted { execution });
            self.tree.activate(execution)?;
            return self.leave(execution);
        }
        if !exec.is_concurrent {
            return Ok(());
        }
        let parent = exec.parent;
        self.tree.remove(execution)?;
        match parent {
            Some(parent) => self.compensation_done(parent),
            None => Ok(()),
        }
    }

    /// A compensation handler ran out of outgoing flows.
    pub(super) fn end_compensation(&mut self, execution: ExecutionId) -> Result<(), EngineError> {
        let parent = self.tree.get(execution)?.parent;
        self.tree.remove(execution)?;
        match parent {
            Some(parent) => self.compensation_done(parent),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, UnhandledErrorPolicy};
    use crate::delegate::Services;
    use crate::events::RuntimeEvent;
    use crate::model::{ProcessBuilder, Repository};
    use crate::tree::{EventType, ExecutionTree};
    use crate::vm::Vm;
    use std::collections::BTreeMap;

    #[test]
    fn test_throw_without_subscriptions_passes_through() {
        let def = ProcessBuilder::new("p")
            .start_event("start")
            .compensation_throw_event("undo_all", None)
            .user_task("after")
            .flow("start", "undo_all")
            .flow("undo_all", "after")
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
        let report = vm.finish();
        assert!(!report
            .events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::CompensationThrown { .. })));
        let waiting: Vec<String> = tree.active_activities().into_iter().map(|(_, a)| a).collect();
        assert_eq!(waiting, vec!["after".to_string()]);
    }

    #[test]
    fn test_completed_sub_process_is_kept_as_event_scope() {
        let def = ProcessBuilder::new("p")
            .start_event("start")
            .sub_process("sp")
            .start_event("sp_start")
            .task("book")
            .user_task("cancel_booking")
            .end_event("sp_end")
            .flow("sp_start", "book")
            .flow("book", "sp_end")
            .compensation_handler("book", "cancel_booking")
            .end_sub_process()
            .user_task("after")
            .flow("start", "sp")
            .flow("sp", "after")
            .build()
            .unwrap();
        let mut repo = Repository::new();
        repo.deploy(def);
        let services = Services::new();
        let config = EngineConfig::new(UnhandledErrorPolicy::Fail);
        let mut tree = ExecutionTree::new();
        let mut vm = Vm::new(&mut tree, &repo, &services, &config);
        let root = vm.start("p", BTreeMap::new()).unwrap();
        vm.run().unwrap();
        vm.finish();

        let kept: Vec<_> = tree.executions().filter(|e| e.is_event_scope).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].parent, Some(root));
        assert_eq!(kept[0].activity.as_deref(), Some("sp"));
        let on_root = tree.subscriptions_of(root);
        assert_eq!(on_root.len(), 1);
        assert_eq!(on_root[0].event_type, EventType::Compensate);
        assert_eq!(on_root[0].configuration, Some(kept[0].id));
        let inner = tree.subscriptions_of(kept[0].id);
        assert_eq!(inner[0].activity, "cancel_booking");
        assert_eq!(inner[0].event_name.as_deref(), Some("book"));
    }
}
