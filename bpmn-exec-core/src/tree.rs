//! Runtime execution tree.
//!
//! A process instance is an arena of [`Execution`] nodes addressed by
//! [`ExecutionId`]. Parent/child links are ids, never owning pointers. Event
//! subscriptions and buffered messages of the instance family live next to
//! the arena so one snapshot captures the complete runtime state.

use crate::error::EngineError;
use crate::expr::{Expression, VariableScope};
use crate::types::{ActivityId, ExecutionId, FlowId, ScopeId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Nodes ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Root execution of the (possibly called) process instance this node belongs to.
    pub process_instance: ExecutionId,
    pub definition_key: String,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    /// Call-activity execution that started this process instance (roots only).
    pub super_execution: Option<ExecutionId>,
    /// Root of the process instance started by this call-activity execution.
    pub sub_process_instance: Option<ExecutionId>,
    pub activity: Option<ActivityId>,
    /// `Some` for scope executions; names the static scope represented.
    pub scope: Option<ScopeId>,
    pub is_concurrent: bool,
    pub is_active: bool,
    pub is_ended: bool,
    pub is_event_scope: bool,
    pub pending_transition: Option<FlowId>,
    /// Last sequence flow this execution arrived through.
    pub arrived_via: Option<FlowId>,
    pub variables: BTreeMap<String, Value>,
    pub revision: u64,
    /// Creation order; compensation runs newest first.
    pub created_seq: u64,
}

impl Execution {
    pub fn is_scope(&self) -> bool {
        self.scope.is_some()
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent.is_none()
    }
}

// ─── Event subscriptions ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Message,
    Signal,
    Timer,
    Conditional,
    Compensate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: u64,
    /// Owning scope execution.
    pub execution: ExecutionId,
    pub event_type: EventType,
    /// Activity triggered when the event arrives (catch event, boundary
    /// event, event sub-process start, or compensation handler).
    pub activity: ActivityId,
    /// Message/signal name, timer definition, or compensated activity.
    pub event_name: Option<String>,
    pub condition: Option<Expression>,
    /// Compensation: event-scope execution holding the completed scope's state.
    pub configuration: Option<ExecutionId>,
    pub created_seq: u64,
}

/// A message that arrived while nobody was subscribed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub name: String,
    pub variables: BTreeMap<String, Value>,
}

/// Outcome of [`ExecutionTree::create_concurrent_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentExpansion {
    /// The new concurrent execution to run the additional branch.
    pub child: ExecutionId,
    /// When the scope execution was compacted, the concurrent execution that
    /// took over its position.
    pub replacement: Option<ExecutionId>,
}

// ─── Tree ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    executions: BTreeMap<ExecutionId, Execution>,
    subscriptions: BTreeMap<u64, EventSubscription>,
    buffered_messages: Vec<BufferedMessage>,
    root: Option<ExecutionId>,
    /// Definition version each process key of this family runs on, fixed
    /// when its first process instance execution is created.
    #[serde(default)]
    definition_versions: BTreeMap<String, [u8; 32]>,
    next_id: u32,
    next_seq: u64,
    /// Removed concurrent executions and the scope execution that took over
    /// their token. Only meaningful within one trigger.
    #[serde(skip)]
    replaced_by: BTreeMap<ExecutionId, ExecutionId>,
    /// Compacted scope executions whose token moved to a concurrent child
    /// when the scope was expanded.
    #[serde(skip)]
    relocated: BTreeMap<ExecutionId, ExecutionId>,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn alloc(&mut self, template: Execution) -> ExecutionId {
        let id = ExecutionId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq();
        self.executions.insert(
            id,
            Execution {
                id,
                created_seq: seq,
                ..template
            },
        );
        id
    }

    /// Create the root execution of a process instance. The first root created
    /// is the top-level instance; later roots are called instances.
    pub fn create_process_instance(
        &mut self,
        definition_key: &str,
        super_execution: Option<ExecutionId>,
    ) -> Result<ExecutionId, EngineError> {
        if let Some(sup) = super_execution {
            self.live(sup)?;
        }
        let id = ExecutionId(self.next_id);
        let root = self.alloc(Execution {
            id,
            process_instance: id,
            definition_key: definition_key.to_string(),
            parent: None,
            children: Vec::new(),
            super_execution,
            sub_process_instance: None,
            activity: None,
            scope: Some(ScopeId::Process),
            is_concurrent: false,
            is_active: true,
            is_ended: false,
            is_event_scope: false,
            pending_transition: None,
            arrived_via: None,
            variables: BTreeMap::new(),
            revision: 0,
            created_seq: 0,
        });
        match super_execution {
            Some(sup) => self.get_mut(sup)?.sub_process_instance = Some(root),
            None => {
                if self.root.is_none() {
                    self.root = Some(root);
                }
            }
        }
        Ok(root)
    }

    /// Record the version `definition_key` runs on unless one is already set.
    pub fn pin_definition(&mut self, definition_key: &str, version: [u8; 32]) {
        self.definition_versions
            .entry(definition_key.to_string())
            .or_insert(version);
    }

    pub fn pinned_definitions(&self) -> impl Iterator<Item = (&str, [u8; 32])> {
        self.definition_versions.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// The top-level process instance execution.
    pub fn root(&self) -> Option<ExecutionId> {
        self.root
    }

    // ── Lookup ──

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Result<&Execution, EngineError> {
        self.executions
            .get(&id)
            .ok_or(EngineError::UnknownExecution(id))
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution, EngineError> {
        self.executions
            .get_mut(&id)
            .ok_or(EngineError::UnknownExecution(id))
    }

    /// Like [`get`](Self::get) but fails fast on ended executions.
    pub fn live(&self, id: ExecutionId) -> Result<&Execution, EngineError> {
        let exec = self.get(id)?;
        if exec.is_ended {
            return Err(EngineError::ExecutionEnded(id));
        }
        Ok(exec)
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    /// Find the execution currently carrying the token that `id` carried:
    /// follows tokens moved out of an expanded scope and pruned concurrent
    /// executions replaced by their scope.
    pub fn resolve(&self, mut id: ExecutionId) -> ExecutionId {
        for _ in 0..=self.executions.len() {
            if let Some(next) = self.relocated.get(&id) {
                id = *next;
                continue;
            }
            if self.executions.contains_key(&id) {
                break;
            }
            match self.replaced_by.get(&id) {
                Some(next) => id = *next,
                None => break,
            }
        }
        id
    }

    /// Forget replacement bookkeeping at the end of a trigger.
    pub fn clear_replacements(&mut self) {
        self.replaced_by.clear();
        self.relocated.clear();
    }

    // ── Structure ──

    /// Allocate a new node under `parent`.
    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        concurrent: bool,
        scope: Option<ScopeId>,
    ) -> Result<ExecutionId, EngineError> {
        let p = self.live(parent)?;
        let template = Execution {
            id: parent,
            process_instance: p.process_instance,
            definition_key: p.definition_key.clone(),
            parent: Some(parent),
            children: Vec::new(),
            super_execution: None,
            sub_process_instance: None,
            activity: None,
            scope,
            is_concurrent: concurrent,
            is_active: true,
            is_ended: false,
            is_event_scope: false,
            pending_transition: None,
            arrived_via: None,
            variables: BTreeMap::new(),
            revision: 0,
            created_seq: 0,
        };
        let child = self.alloc(template);
        self.get_mut(parent)?.children.push(child);
        Ok(child)
    }

    /// Create a concurrent child of a scope execution, expanding the tree
    /// first when needed:
    ///
    /// 1. compacted scope (no children): a concurrent child takes over the
    ///    scope's own position, then the new branch is added next to it;
    /// 2. single scope child: it is moved under a new concurrent child;
    /// 3. existing concurrent children: the new branch is simply added.
    pub fn create_concurrent_child(
        &mut self,
        scope_exec: ExecutionId,
    ) -> Result<ConcurrentExpansion, EngineError> {
        if !self.live(scope_exec)?.is_scope() {
            return Err(EngineError::NotAScope(scope_exec));
        }
        let children = self.non_event_scope_children(scope_exec)?;
        let mut replacement = None;

        if children.is_empty() {
            let r = self.create_child(scope_exec, true, None)?;
            let (activity, active, transition, arrived) = {
                let s = self.get(scope_exec)?;
                (s.activity.clone(), s.is_active, s.pending_transition.clone(), s.arrived_via.clone())
            };
            {
                let rep = self.get_mut(r)?;
                rep.activity = activity;
                rep.is_active = active;
                rep.pending_transition = transition;
                rep.arrived_via = arrived;
            }
            let s = self.get_mut(scope_exec)?;
            s.activity = None;
            s.is_active = false;
            s.pending_transition = None;
            self.relocated.insert(scope_exec, r);
            replacement = Some(r);
        } else if children.len() == 1 && !self.get(children[0])?.is_concurrent {
            let only = children[0];
            let c = self.create_child(scope_exec, true, None)?;
            let activity = self.get(scope_exec)?.activity.clone();
            {
                let rep = self.get_mut(c)?;
                rep.activity = activity;
                rep.is_active = false;
            }
            self.reparent(only, c)?;
            self.get_mut(scope_exec)?.activity = None;
        }

        let child = self.create_child(scope_exec, true, None)?;
        Ok(ConcurrentExpansion { child, replacement })
    }

    fn reparent(&mut self, child: ExecutionId, new_parent: ExecutionId) -> Result<(), EngineError> {
        if let Some(old) = self.get(child)?.parent {
            self.get_mut(old)?.children.retain(|c| *c != child);
        }
        self.get_mut(child)?.parent = Some(new_parent);
        self.get_mut(new_parent)?.children.push(child);
        Ok(())
    }

    pub fn set_parent(&mut self, child: ExecutionId, new_parent: ExecutionId) -> Result<(), EngineError> {
        self.live(new_parent)?;
        self.reparent(child, new_parent)
    }

    pub fn inactivate(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        self.live(id)?;
        self.get_mut(id)?.is_active = false;
        Ok(())
    }

    pub fn activate(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        self.live(id)?;
        self.get_mut(id)?.is_active = true;
        Ok(())
    }

    pub fn set_activity(&mut self, id: ExecutionId, activity: Option<&str>) -> Result<(), EngineError> {
        self.live(id)?;
        self.get_mut(id)?.activity = activity.map(str::to_string);
        Ok(())
    }

    /// Detach a node that has no live children left. Its event-scope children,
    /// subscriptions and variables are released with it.
    pub fn remove(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let exec = self.get(id)?;
        let mut event_scopes = Vec::new();
        for child in &exec.children {
            if self.get(*child)?.is_event_scope {
                event_scopes.push(*child);
            } else {
                return Err(EngineError::LiveChildren { execution: id });
            }
        }
        for es in event_scopes {
            self.delete_cascade(es)?;
        }
        self.detach(id)
    }

    fn detach(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let exec = self.get(id)?;
        let parent = exec.parent;
        let sup = exec.super_execution;
        if let Some(p) = parent {
            if let Ok(pe) = self.get_mut(p) {
                pe.children.retain(|c| *c != id);
            }
        }
        if let Some(s) = sup {
            if let Ok(se) = self.get_mut(s) {
                se.sub_process_instance = None;
            }
        }
        self.subscriptions.retain(|_, s| s.execution != id);
        self.relocated.retain(|_, to| *to != id);
        self.executions.remove(&id);
        if self.root == Some(id) {
            self.root = None;
        }
        Ok(())
    }

    /// Remove a node and every descendant, post-order, including process
    /// instances called from inside it. Returns the removed ids.
    pub fn delete_cascade(&mut self, id: ExecutionId) -> Result<Vec<ExecutionId>, EngineError> {
        self.get(id)?;
        let mut removed = Vec::new();
        // (id, children_pushed)
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if let Ok(exec) = self.get_mut(current) {
                    exec.is_ended = true;
                    exec.is_active = false;
                }
                self.detach(current)?;
                removed.push(current);
                continue;
            }
            stack.push((current, true));
            let exec = self.get(current)?;
            if let Some(sub) = exec.sub_process_instance {
                stack.push((sub, false));
            }
            for child in exec.children.iter().rev() {
                stack.push((*child, false));
            }
        }
        Ok(removed)
    }

    /// Mark a top-level process instance ended without removing it, so the
    /// final variables stay readable.
    pub fn end_process_instance(&mut self, root: ExecutionId) -> Result<(), EngineError> {
        let children = self.get(root)?.children.clone();
        for child in children {
            self.delete_cascade(child)?;
        }
        self.subscriptions.retain(|_, s| s.execution != root);
        let exec = self.get_mut(root)?;
        exec.is_ended = true;
        exec.is_active = false;
        exec.activity = None;
        Ok(())
    }

    /// Inactive executions positioned at `activity` that share `exec`'s
    /// concurrent parent (the whole subtree below it), or `exec` alone when
    /// it is not concurrent.
    pub fn find_inactive_concurrent_siblings(
        &self,
        exec: ExecutionId,
        activity: &str,
    ) -> Result<Vec<ExecutionId>, EngineError> {
        let e = self.live(exec)?;
        if e.is_concurrent {
            let parent = e.parent.ok_or(EngineError::NotAScope(exec))?;
            Ok(self
                .descendants(parent)?
                .into_iter()
                .filter(|id| {
                    self.executions
                        .get(id)
                        .map(|x| {
                            !x.is_active
                                && !x.is_event_scope
                                && x.activity.as_deref() == Some(activity)
                        })
                        .unwrap_or(false)
                })
                .collect())
        } else if !e.is_active && e.activity.as_deref() == Some(activity) {
            Ok(vec![exec])
        } else {
            Ok(Vec::new())
        }
    }

    /// All descendants in pre-order, skipping event-scope subtrees.
    pub fn descendants(&self, id: ExecutionId) -> Result<Vec<ExecutionId>, EngineError> {
        let mut out = Vec::new();
        let mut stack: Vec<ExecutionId> = self.get(id)?.children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            let exec = self.get(current)?;
            if exec.is_event_scope {
                continue;
            }
            out.push(current);
            stack.extend(exec.children.iter().rev().copied());
        }
        Ok(out)
    }

    /// Leaf executions below (or equal to) `id`, ignoring event scopes.
    pub fn leaf_executions(&self, id: ExecutionId) -> Result<Vec<ExecutionId>, EngineError> {
        let mut leaves = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let exec = self.get(current)?;
            let live: Vec<ExecutionId> = exec
                .children
                .iter()
                .copied()
                .filter(|c| self.executions.get(c).map(|x| !x.is_event_scope).unwrap_or(false))
                .collect();
            if live.is_empty() {
                leaves.push(current);
            } else {
                stack.extend(live.into_iter().rev());
            }
        }
        Ok(leaves)
    }

    pub fn non_event_scope_children(&self, id: ExecutionId) -> Result<Vec<ExecutionId>, EngineError> {
        Ok(self
            .get(id)?
            .children
            .iter()
            .copied()
            .filter(|c| self.executions.get(c).map(|x| !x.is_event_scope).unwrap_or(false))
            .collect())
    }

    /// Signal that the structure around `id` changed; bumps its revision.
    pub fn force_update(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let exec = self.get_mut(id)?;
        exec.revision += 1;
        Ok(())
    }

    /// Claim the concurrent root shared by `exec` and its siblings: the
    /// parent of a concurrent execution, or the execution itself.
    pub fn lock_concurrent_root(&mut self, exec: ExecutionId) -> Result<ExecutionId, EngineError> {
        let e = self.live(exec)?;
        let root = if e.is_concurrent {
            e.parent.ok_or(EngineError::NotAScope(exec))?
        } else {
            exec
        };
        self.force_update(root)?;
        Ok(root)
    }

    /// Collapse a scope's last remaining concurrent child into the scope.
    /// Returns the pruned child, which is now replaced by `scope_exec`.
    pub fn try_prune_last_concurrent_child(
        &mut self,
        scope_exec: ExecutionId,
    ) -> Result<Option<ExecutionId>, EngineError> {
        let children = self.non_event_scope_children(scope_exec)?;
        if children.len() != 1 {
            return Ok(None);
        }
        let last = children[0];
        let l = self.get(last)?;
        if !l.is_concurrent || l.is_scope() {
            return Ok(None);
        }
        let activity = l.activity.clone();
        let transition = l.pending_transition.clone();
        let arrived = l.arrived_via.clone();
        let active = l.is_active;
        let grandchildren = l.children.clone();
        let locals = l.variables.clone();

        for gc in grandchildren {
            self.reparent(gc, scope_exec)?;
        }
        {
            let s = self.get_mut(scope_exec)?;
            s.activity = activity;
            s.pending_transition = transition;
            s.arrived_via = arrived;
            s.variables.extend(locals);
            s.is_active = active;
        }
        self.detach(last)?;
        self.relocated.remove(&scope_exec);
        self.replaced_by.insert(last, scope_exec);
        Ok(Some(last))
    }

    /// Nearest ancestor-or-self that is a scope execution.
    pub fn scope_execution(&self, id: ExecutionId) -> Result<ExecutionId, EngineError> {
        let mut current = id;
        loop {
            let exec = self.get(current)?;
            if exec.is_scope() {
                return Ok(current);
            }
            current = exec.parent.ok_or(EngineError::NotAScope(id))?;
        }
    }

    /// Nearest ancestor-or-self representing the static scope `scope`,
    /// within the same process instance.
    pub fn flow_scope_execution(
        &self,
        id: ExecutionId,
        scope: &ScopeId,
    ) -> Result<ExecutionId, EngineError> {
        let mut current = Some(id);
        while let Some(c) = current {
            let exec = self.get(c)?;
            if exec.scope.as_ref() == Some(scope) && !exec.is_event_scope {
                return Ok(c);
            }
            current = exec.parent;
        }
        Err(EngineError::Walk(format!(
            "no execution for scope {scope} above {id}"
        )))
    }

    /// The scope execution enclosing `id`'s own scope; for a process instance
    /// root, optionally the calling execution's scope.
    pub fn parent_scope_execution(
        &self,
        id: ExecutionId,
        consider_super: bool,
    ) -> Result<Option<ExecutionId>, EngineError> {
        let scope = self.scope_execution(id)?;
        let exec = self.get(scope)?;
        match (exec.parent, exec.super_execution) {
            (Some(p), _) => Ok(Some(self.scope_execution(p)?)),
            (None, Some(sup)) if consider_super => Ok(Some(sup)),
            _ => Ok(None),
        }
    }

    /// Active leaf executions of the whole family, with their activity. A call
    /// activity waiting on its called instance is not listed.
    pub fn active_activities(&self) -> Vec<(ExecutionId, ActivityId)> {
        self.executions
            .values()
            .filter(|e| e.is_active && !e.is_ended && !e.is_event_scope)
            .filter(|e| e.sub_process_instance.is_none())
            .filter(|e| {
                !e.children.iter().any(|c| {
                    self.executions
                        .get(c)
                        .map(|x| !x.is_event_scope)
                        .unwrap_or(false)
                })
            })
            .filter_map(|e| e.activity.clone().map(|a| (e.id, a)))
            .collect()
    }

    // ── Variables ──

    /// Look a variable up from `id` through its scope chain (stopping at the
    /// process instance root).
    pub fn variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        let mut current = Some(id);
        while let Some(c) = current {
            let exec = self.executions.get(&c)?;
            if let Some(v) = exec.variables.get(name) {
                return Some(v);
            }
            current = exec.parent;
        }
        None
    }

    /// All variables visible from `id`; inner scopes shadow outer ones.
    pub fn visible_variables(&self, id: ExecutionId) -> BTreeMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            match self.executions.get(&c) {
                Some(exec) => {
                    chain.push(exec);
                    current = exec.parent;
                }
                None => break,
            }
        }
        let mut vars = BTreeMap::new();
        for exec in chain.into_iter().rev() {
            vars.extend(exec.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        vars
    }

    /// Write a local variable on the nearest scope execution of `id`.
    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let scope = self.scope_execution(id)?;
        self.live(scope)?;
        self.get_mut(scope)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Overwrite a variable where it is already defined along the scope
    /// chain, otherwise create it on the process instance root.
    pub fn set_variable(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<(), EngineError> {
        let mut current = Some(id);
        let mut last = id;
        while let Some(c) = current {
            let exec = self.get(c)?;
            if exec.variables.contains_key(name) {
                self.get_mut(c)?.variables.insert(name.to_string(), value);
                return Ok(());
            }
            last = c;
            current = exec.parent;
        }
        self.get_mut(last)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn local_variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        self.executions.get(&id).and_then(|e| e.variables.get(name))
    }

    /// A [`VariableScope`] view rooted at `id`.
    pub fn scope_view(&self, id: ExecutionId) -> ExecutionVariables<'_> {
        ExecutionVariables { tree: self, id }
    }

    // ── Subscriptions ──

    /// Register a subscription on the nearest scope execution of `exec`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_subscription(
        &mut self,
        exec: ExecutionId,
        event_type: EventType,
        activity: &str,
        event_name: Option<String>,
        condition: Option<Expression>,
        configuration: Option<ExecutionId>,
    ) -> Result<u64, EngineError> {
        let owner = self.scope_execution(exec)?;
        self.live(owner)?;
        let id = self.next_seq();
        self.subscriptions.insert(
            id,
            EventSubscription {
                id,
                execution: owner,
                event_type,
                activity: activity.to_string(),
                event_name,
                condition,
                configuration,
                created_seq: id,
            },
        );
        Ok(id)
    }

    pub fn subscription(&self, id: u64) -> Result<&EventSubscription, EngineError> {
        self.subscriptions
            .get(&id)
            .ok_or(EngineError::UnknownSubscription(id))
    }

    pub fn remove_subscription(&mut self, id: u64) -> Option<EventSubscription> {
        self.subscriptions.remove(&id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &EventSubscription> {
        self.subscriptions.values()
    }

    pub fn subscriptions_of(&self, exec: ExecutionId) -> Vec<EventSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.execution == exec)
            .cloned()
            .collect()
    }

    /// Subscriptions of a type, optionally filtered by event name, oldest first.
    pub fn find_subscriptions(&self, event_type: EventType, name: Option<&str>) -> Vec<EventSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.event_type == event_type)
            .filter(|s| name.is_none() || s.event_name.as_deref() == name)
            .cloned()
            .collect()
    }

    /// Drop every subscription owned by `exec` except compensation ones.
    pub fn clear_event_subscriptions(&mut self, exec: ExecutionId) {
        self.subscriptions
            .retain(|_, s| s.execution != exec || s.event_type == EventType::Compensate);
    }

    // ── Buffered messages ──

    pub fn buffer_message(&mut self, name: &str, variables: BTreeMap<String, Value>) {
        self.buffered_messages.push(BufferedMessage {
            name: name.to_string(),
            variables,
        });
    }

    /// Consume the oldest buffered message with this name.
    pub fn take_buffered_message(&mut self, name: &str) -> Option<BufferedMessage> {
        let pos = self.buffered_messages.iter().position(|m| m.name == name)?;
        Some(self.buffered_messages.remove(pos))
    }

    pub fn buffered_messages(&self) -> &[BufferedMessage] {
        &self.buffered_messages
    }
}

/// Variables visible from one execution.
pub struct ExecutionVariables<'a> {
    tree: &'a ExecutionTree,
    id: ExecutionId,
}

impl VariableScope for ExecutionVariables<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.tree.variable(self.id, name).cloned()
    }
}
