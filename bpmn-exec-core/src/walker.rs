//! Dual-chain traversal of static scopes and the executions representing them.
//!
//! Starting at an activity and the execution positioned there, the walker
//! yields each enclosing static scope (innermost first) together with the
//! execution that represents it. At the top of a called process instance it
//! continues with the calling call activity in the caller's chain.

use crate::error::EngineError;
use crate::model::{ProcessDefinition, Repository};
use crate::tree::ExecutionTree;
use crate::types::{ExecutionId, ScopeId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// One position of the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkStep {
    pub definition_key: String,
    pub scope: ScopeId,
    pub execution: ExecutionId,
}

/// Callback invoked at every step of a walk.
pub trait ScopeVisitor {
    fn visit(&mut self, step: &WalkStep, definition: &ProcessDefinition) -> Result<(), EngineError>;

    /// Stop the walk after the current step.
    fn satisfied(&self) -> bool {
        false
    }
}

/// Records which execution represents each visited scope.
#[derive(Debug, Default)]
pub struct ScopeExecutionMapping {
    mapping: BTreeMap<(String, ScopeId), ExecutionId>,
}

impl ScopeExecutionMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_for(&self, definition_key: &str, scope: &ScopeId) -> Option<ExecutionId> {
        self.mapping
            .get(&(definition_key.to_string(), scope.clone()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

impl ScopeVisitor for ScopeExecutionMapping {
    fn visit(&mut self, step: &WalkStep, _definition: &ProcessDefinition) -> Result<(), EngineError> {
        self.mapping
            .entry((step.definition_key.clone(), step.scope.clone()))
            .or_insert(step.execution);
        Ok(())
    }
}

pub struct HierarchyWalker<'a> {
    tree: &'a ExecutionTree,
    repository: &'a Repository,
    definition: Arc<ProcessDefinition>,
    anchor: ExecutionId,
    pending: VecDeque<ScopeId>,
}

impl<'a> HierarchyWalker<'a> {
    /// Start at `activity`, occupied by `execution`. The activity itself is the
    /// first step when it is a scope.
    pub fn new(
        tree: &'a ExecutionTree,
        repository: &'a Repository,
        execution: ExecutionId,
        activity: &str,
    ) -> Result<Self, EngineError> {
        let key = tree.get(execution)?.definition_key.clone();
        let definition = repository.get(&key)?;
        let pending = scopes_from(&definition, activity)?;
        Ok(Self {
            tree,
            repository,
            definition,
            anchor: execution,
            pending,
        })
    }

    /// Advance one step; `None` once the top-level process has been visited.
    pub fn next_step(&mut self) -> Result<Option<WalkStep>, EngineError> {
        loop {
            if let Some(scope) = self.pending.pop_front() {
                let execution = self
                    .tree
                    .flow_scope_execution(self.anchor, &scope)
                    .map_err(walk_error)?;
                self.anchor = execution;
                return Ok(Some(WalkStep {
                    definition_key: self.definition.key.clone(),
                    scope,
                    execution,
                }));
            }

            let instance = self.tree.get(self.anchor).map_err(walk_error)?.process_instance;
            let Some(caller) = self.tree.get(instance).map_err(walk_error)?.super_execution else {
                return Ok(None);
            };
            let call = self.tree.get(caller).map_err(walk_error)?;
            let activity = call.activity.clone().ok_or_else(|| {
                EngineError::Walk(format!("calling execution {caller} has no activity"))
            })?;
            self.definition = self.repository.get(&call.definition_key).map_err(walk_error)?;
            self.pending = scopes_from(&self.definition, &activity).map_err(walk_error)?;
            self.anchor = caller;
        }
    }

    /// Walk until `until` holds for a step or a visitor is satisfied; returns
    /// the step the walk stopped at, or `None` when the chains ran out.
    pub fn walk_until(
        &mut self,
        visitors: &mut [&mut dyn ScopeVisitor],
        until: impl Fn(&WalkStep) -> bool,
    ) -> Result<Option<WalkStep>, EngineError> {
        while let Some(step) = self.next_step()? {
            for visitor in visitors.iter_mut() {
                visitor.visit(&step, &self.definition)?;
            }
            if until(&step) || visitors.iter().any(|v| v.satisfied()) {
                return Ok(Some(step));
            }
        }
        Ok(None)
    }
}

fn walk_error(e: EngineError) -> EngineError {
    match e {
        EngineError::Walk(_) => e,
        other => EngineError::Walk(other.to_string()),
    }
}

fn scopes_from(definition: &ProcessDefinition, activity: &str) -> Result<VecDeque<ScopeId>, EngineError> {
    let mut scopes = VecDeque::new();
    if definition.activity(activity)?.is_scope {
        scopes.push_back(ScopeId::Activity(activity.to_string()));
    }
    scopes.extend(definition.scope_chain(activity)?);
    Ok(scopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessBuilder;

    fn repository() -> Repository {
        let outer = ProcessBuilder::new("outer")
            .start_event("start")
            .sub_process("sp")
            .start_event("sp_start")
            .call_activity("call", "inner", true)
            .end_event("sp_end")
            .flow("sp_start", "call")
            .flow("call", "sp_end")
            .end_sub_process()
            .end_event("end")
            .flow("start", "sp")
            .flow("sp", "end")
            .build()
            .unwrap();
        let inner = ProcessBuilder::new("inner")
            .start_event("start")
            .task("work")
            .end_event("end")
            .flow("start", "work")
            .flow("work", "end")
            .build()
            .unwrap();
        let mut repo = Repository::new();
        repo.deploy(outer);
        repo.deploy(inner);
        repo
    }

    /// outer root -> sp scope -> call scope -> inner root (at `work`)
    fn tree() -> (ExecutionTree, Vec<ExecutionId>) {
        let mut tree = ExecutionTree::new();
        let root = tree.create_process_instance("outer", None).unwrap();
        let sp = tree
            .create_child(root, false, Some(ScopeId::Activity("sp".into())))
            .unwrap();
        let call = tree
            .create_child(sp, false, Some(ScopeId::Activity("call".into())))
            .unwrap();
        tree.set_activity(call, Some("call")).unwrap();
        let inner = tree.create_process_instance("inner", Some(call)).unwrap();
        tree.set_activity(inner, Some("work")).unwrap();
        (tree, vec![root, sp, call, inner])
    }

    #[test]
    fn test_walk_crosses_into_caller() {
        let repo = repository();
        let (tree, ids) = tree();
        let mut walker = HierarchyWalker::new(&tree, &repo, ids[3], "work").unwrap();
        let mut steps = Vec::new();
        while let Some(step) = walker.next_step().unwrap() {
            steps.push((step.definition_key, step.scope, step.execution));
        }
        assert_eq!(
            steps,
            vec![
                ("inner".to_string(), ScopeId::Process, ids[3]),
                ("outer".to_string(), ScopeId::Activity("call".into()), ids[2]),
                ("outer".to_string(), ScopeId::Activity("sp".into()), ids[1]),
                ("outer".to_string(), ScopeId::Process, ids[0]),
            ]
        );
    }

    #[test]
    fn test_walk_until_records_mapping() {
        let repo = repository();
        let (tree, ids) = tree();
        let mut mapping = ScopeExecutionMapping::new();
        let mut walker = HierarchyWalker::new(&tree, &repo, ids[3], "work").unwrap();
        let stop = walker
            .walk_until(&mut [&mut mapping], |step| step.scope == ScopeId::Activity("sp".into()))
            .unwrap()
            .unwrap();
        assert_eq!(stop.execution, ids[1]);
        assert_eq!(mapping.len(), 3);
        assert_eq!(
            mapping.execution_for("outer", &ScopeId::Activity("call".into())),
            Some(ids[2])
        );
        assert_eq!(mapping.execution_for("outer", &ScopeId::Process), None);
    }

    #[test]
    fn test_missing_scope_execution_is_a_walk_error() {
        let repo = repository();
        let mut tree = ExecutionTree::new();
        let root = tree.create_process_instance("outer", None).unwrap();
        // token inside `sp` without the sub-process scope execution
        let stray = tree.create_child(root, true, None).unwrap();
        let mut walker = HierarchyWalker::new(&tree, &repo, stray, "sp_end").unwrap();
        assert!(matches!(walker.next_step(), Err(EngineError::Walk(_))));
    }
}
