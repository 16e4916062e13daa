use super::*;
use crate::error::ValidationError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

fn err(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Validate a fully derived definition. Returns all errors found.
///
/// Default-flow references are deliberately left to the runtime, which
/// reports them as configuration errors when the flow is actually needed.
pub(super) fn validate_definition(def: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // M2 + M3: flow endpoints exist and stay inside one scope
    for flow in def.flows.values() {
        let src = def.activities.get(&flow.source);
        let tgt = def.activities.get(&flow.target);
        if src.is_none() {
            errors.push(err("M2", format!("Flow {} source not found: {}", flow.id, flow.source)));
        }
        if tgt.is_none() {
            errors.push(err("M2", format!("Flow {} target not found: {}", flow.id, flow.target)));
        }
        if let (Some(s), Some(t)) = (src, tgt) {
            if s.flow_scope != t.flow_scope {
                errors.push(err(
                    "M3",
                    format!(
                        "Flow {} crosses scopes ({} in {}, {} in {})",
                        flow.id, s.id, s.flow_scope, t.id, t.flow_scope
                    ),
                ));
            }
        }
    }

    // M4: event sub-processes are not connected by sequence flows
    for act in def.activities.values().filter(|a| a.is_event_sub_process()) {
        if !act.incoming.is_empty() || !act.outgoing.is_empty() {
            errors.push(err(
                "M4",
                format!("Event sub-process {} must not have sequence flows", act.id),
            ));
        }
    }

    // M5: one none start event per process / sub-process, one start per event sub-process
    let mut scopes = vec![ScopeId::Process];
    scopes.extend(
        def.activities
            .values()
            .filter(|a| a.is_container() && !matches!(a.kind, ActivityKind::MultiInstanceBody { .. }))
            .map(|a| ScopeId::Activity(a.id.clone())),
    );
    for scope in &scopes {
        let esp = scope
            .activity_id()
            .and_then(|id| def.activities.get(id))
            .map(|a| a.is_event_sub_process())
            .unwrap_or(false);
        let starts: Vec<&Activity> = def
            .children_of(scope)
            .filter(|a| match &a.kind {
                ActivityKind::StartEvent { trigger, .. } => esp || *trigger == EventTrigger::None,
                _ => false,
            })
            .collect();
        if starts.len() != 1 {
            errors.push(err(
                "M5",
                format!(
                    "Scope {} needs exactly one {}start event, found {}",
                    scope,
                    if esp { "" } else { "none " },
                    starts.len()
                ),
            ));
        }
    }

    // M6: boundary hosts are real activities
    for act in def.activities.values() {
        if let ActivityKind::Boundary { attached_to, .. } = &act.kind {
            match def.activities.get(attached_to) {
                Some(host)
                    if !matches!(
                        host.kind,
                        ActivityKind::Boundary { .. } | ActivityKind::StartEvent { .. }
                    ) => {}
                _ => errors.push(err(
                    "M6",
                    format!("Boundary event {} has an invalid host {}", act.id, attached_to),
                )),
            }
        }
    }

    // M7: compensation handlers exist and have no outgoing flows
    for act in def.activities.values() {
        if let Some(handler) = &act.compensation_handler {
            match def.activities.get(handler) {
                Some(h) if h.outgoing.is_empty() && h.incoming.is_empty() => {}
                Some(_) => errors.push(err(
                    "M7",
                    format!("Compensation handler {handler} must not have sequence flows"),
                )),
                None => errors.push(err(
                    "M7",
                    format!("Compensation handler {handler} of {} not found", act.id),
                )),
            }
        }
    }

    // M9: call activities name their callee
    for act in def.activities.values() {
        if let ActivityKind::CallActivity { called_element, .. } = &act.kind {
            if called_element.is_empty() {
                errors.push(err("M9", format!("Call activity {} has no called element", act.id)));
            }
        }
    }

    // M8: every activity reachable from a start, a trigger or a containment edge
    errors.extend(check_reachability(def));

    errors
}

fn check_reachability(def: &ProcessDefinition) -> Vec<ValidationError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    let root = graph.add_node("<process>");
    for id in def.activities.keys() {
        index.insert(id.as_str(), graph.add_node(id.as_str()));
    }

    for flow in def.flows.values() {
        if let (Some(&s), Some(&t)) = (index.get(flow.source.as_str()), index.get(flow.target.as_str())) {
            graph.add_edge(s, t, ());
        }
    }
    for act in def.activities.values() {
        let Some(&node) = index.get(act.id.as_str()) else {
            continue;
        };
        // Containment: scope -> start events and event sub-processes inside it
        let parent = match &act.flow_scope {
            ScopeId::Process => Some(root),
            ScopeId::Activity(id) => index.get(id.as_str()).copied(),
        };
        let entered_by_scope = match &act.kind {
            ActivityKind::StartEvent { .. } | ActivityKind::EventSubProcess => true,
            _ => matches!(
                def.activities.get(act.flow_scope.activity_id().unwrap_or_default()).map(|s| &s.kind),
                Some(ActivityKind::MultiInstanceBody { .. })
            ),
        };
        if let (true, Some(p)) = (entered_by_scope, parent) {
            graph.add_edge(p, node, ());
        }
        for boundary in &act.boundary_events {
            if let Some(&b) = index.get(boundary.as_str()) {
                graph.add_edge(node, b, ());
            }
        }
        if let Some(handler) = &act.compensation_handler {
            if let Some(&h) = index.get(handler.as_str()) {
                graph.add_edge(node, h, ());
            }
        }
    }

    let mut seen = vec![false; graph.node_count()];
    let mut dfs = Dfs::new(&graph, root);
    while let Some(n) = dfs.next(&graph) {
        seen[n.index()] = true;
    }

    def.activities
        .keys()
        .filter(|id| index.get(id.as_str()).map(|n| !seen[n.index()]).unwrap_or(false))
        .map(|id| err("M8", format!("Activity {id} is unreachable")))
        .collect()
}
