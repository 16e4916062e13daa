use super::validate::validate_definition;
use super::*;
use crate::error::{ModelError, ValidationError};
use crate::types::compute_hash;

/// Fluent construction of a [`ProcessDefinition`].
///
/// Activities are added to the scope currently open on the builder
/// (the process, or the innermost `sub_process` / `event_sub_process`).
/// `build()` derives flow lists, scopes and catch tables, wraps
/// multi-instance activities and validates the result.
///
/// ```
/// use bpmn_exec_core::model::ProcessBuilder;
///
/// let def = ProcessBuilder::new("review")
///     .start_event("start")
///     .user_task("approve")
///     .end_event("end")
///     .flow("start", "approve")
///     .flow("approve", "end")
///     .build()
///     .unwrap();
/// assert_eq!(def.activities.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    key: String,
    scopes: Vec<ScopeId>,
    activities: BTreeMap<ActivityId, Activity>,
    flows: Vec<SequenceFlow>,
    multi_instance: Vec<(ActivityId, MultiInstanceSpec)>,
    catch_variables: BTreeMap<ActivityId, (Option<String>, Option<String>)>,
    errors: Vec<ValidationError>,
}

impl ProcessBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            scopes: vec![ScopeId::Process],
            activities: BTreeMap::new(),
            flows: Vec::new(),
            multi_instance: Vec::new(),
            catch_variables: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    fn current_scope(&self) -> ScopeId {
        self.scopes.last().cloned().unwrap_or(ScopeId::Process)
    }

    /// Add an activity of any kind to the current scope.
    pub fn activity(mut self, id: &str, kind: ActivityKind) -> Self {
        if self.activities.contains_key(id) {
            self.errors.push(ValidationError {
                rule: "M1".to_string(),
                message: format!("Duplicate activity id: {id}"),
            });
            return self;
        }
        let activity = Activity {
            id: id.to_string(),
            kind,
            flow_scope: self.current_scope(),
            is_scope: false,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            default_flow: None,
            compensation_handler: None,
            is_compensation_handler: false,
            boundary_events: Vec::new(),
            catches: Vec::new(),
        };
        self.activities.insert(id.to_string(), activity);
        self
    }

    // ── Events ──

    pub fn start_event(self, id: &str) -> Self {
        self.start_event_with(id, EventTrigger::None, true)
    }

    pub fn start_event_with(self, id: &str, trigger: EventTrigger, interrupting: bool) -> Self {
        self.activity(
            id,
            ActivityKind::StartEvent {
                trigger,
                interrupting,
            },
        )
    }

    pub fn end_event(self, id: &str) -> Self {
        self.activity(id, ActivityKind::NoneEndEvent)
    }

    pub fn terminate_end_event(self, id: &str) -> Self {
        self.activity(id, ActivityKind::TerminateEndEvent)
    }

    pub fn error_end_event(self, id: &str, code: &str) -> Self {
        self.activity(
            id,
            ActivityKind::ErrorEndEvent {
                code: code.to_string(),
                message: None,
            },
        )
    }

    pub fn escalation_throw_event(self, id: &str, code: &str) -> Self {
        self.activity(
            id,
            ActivityKind::EscalationThrow {
                code: code.to_string(),
                end: false,
            },
        )
    }

    pub fn escalation_end_event(self, id: &str, code: &str) -> Self {
        self.activity(
            id,
            ActivityKind::EscalationThrow {
                code: code.to_string(),
                end: true,
            },
        )
    }

    /// Intermediate compensation throw; `activity_ref == None` compensates the whole scope.
    pub fn compensation_throw_event(self, id: &str, activity_ref: Option<&str>) -> Self {
        self.activity(
            id,
            ActivityKind::CompensationThrow {
                activity_ref: activity_ref.map(str::to_string),
                end: false,
            },
        )
    }

    pub fn compensation_end_event(self, id: &str, activity_ref: Option<&str>) -> Self {
        self.activity(
            id,
            ActivityKind::CompensationThrow {
                activity_ref: activity_ref.map(str::to_string),
                end: true,
            },
        )
    }

    pub fn intermediate_catch_event(self, id: &str, trigger: EventTrigger) -> Self {
        self.activity(id, ActivityKind::IntermediateCatch { trigger })
    }

    pub fn boundary_event(
        self,
        id: &str,
        attached_to: &str,
        trigger: EventTrigger,
        cancel_activity: bool,
    ) -> Self {
        self.activity(
            id,
            ActivityKind::Boundary {
                attached_to: attached_to.to_string(),
                trigger,
                cancel_activity,
            },
        )
    }

    /// Bind the caught error/escalation code and message to variables on the
    /// handler's scope execution.
    pub fn catch_variables(
        mut self,
        handler: &str,
        code_variable: Option<&str>,
        message_variable: Option<&str>,
    ) -> Self {
        self.catch_variables.insert(
            handler.to_string(),
            (
                code_variable.map(str::to_string),
                message_variable.map(str::to_string),
            ),
        );
        self
    }

    // ── Tasks ──

    pub fn task(self, id: &str) -> Self {
        self.activity(id, ActivityKind::Task)
    }

    pub fn user_task(self, id: &str) -> Self {
        self.activity(id, ActivityKind::UserTask)
    }

    pub fn receive_task(self, id: &str, message: Option<&str>) -> Self {
        self.activity(
            id,
            ActivityKind::ReceiveTask {
                message: message.map(str::to_string),
            },
        )
    }

    pub fn service_task(self, id: &str, delegate: &str) -> Self {
        self.activity(
            id,
            ActivityKind::ServiceTask(ServiceImplementation::Delegate(delegate.to_string())),
        )
    }

    pub fn expression_task(
        self,
        id: &str,
        expression: Expression,
        result_variable: Option<&str>,
    ) -> Self {
        self.activity(
            id,
            ActivityKind::ServiceTask(ServiceImplementation::Expression {
                expression,
                result_variable: result_variable.map(str::to_string),
            }),
        )
    }

    pub fn call_activity(self, id: &str, called_element: &str, pass_variables: bool) -> Self {
        self.activity(
            id,
            ActivityKind::CallActivity {
                called_element: called_element.to_string(),
                pass_variables,
            },
        )
    }

    // ── Gateways ──

    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.activity(id, ActivityKind::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.activity(id, ActivityKind::ParallelGateway)
    }

    pub fn inclusive_gateway(self, id: &str) -> Self {
        self.activity(id, ActivityKind::InclusiveGateway)
    }

    pub fn event_based_gateway(self, id: &str) -> Self {
        self.activity(id, ActivityKind::EventBasedGateway)
    }

    // ── Scopes ──

    /// Open an embedded sub-process; following activities go inside it.
    pub fn sub_process(mut self, id: &str) -> Self {
        self = self.activity(id, ActivityKind::SubProcess);
        self.scopes.push(ScopeId::Activity(id.to_string()));
        self
    }

    /// Open an event sub-process; following activities go inside it.
    pub fn event_sub_process(mut self, id: &str) -> Self {
        self = self.activity(id, ActivityKind::EventSubProcess);
        self.scopes.push(ScopeId::Activity(id.to_string()));
        self
    }

    /// Close the innermost open sub-process or event sub-process.
    pub fn end_sub_process(mut self) -> Self {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        } else {
            self.errors.push(ValidationError {
                rule: "M0".to_string(),
                message: "end_sub_process() without an open sub-process".to_string(),
            });
        }
        self
    }

    // ── Flows ──

    pub fn flow(self, source: &str, target: &str) -> Self {
        self.push_flow(source, target, None)
    }

    pub fn conditional_flow(self, source: &str, target: &str, condition: Expression) -> Self {
        self.push_flow(source, target, Some(condition))
    }

    /// Add a flow and mark it as the source's default flow.
    pub fn default_flow(mut self, source: &str, target: &str) -> Self {
        self = self.push_flow(source, target, None);
        if let Some(id) = self.flows.last().map(|f| f.id.clone()) {
            self = self.default_flow_id(source, &id);
        }
        self
    }

    /// Designate a default flow by id without checking that it exists.
    pub fn default_flow_id(mut self, source: &str, flow: &str) -> Self {
        match self.activities.get_mut(source) {
            Some(act) => act.default_flow = Some(flow.to_string()),
            None => self.errors.push(ValidationError {
                rule: "M2".to_string(),
                message: format!("Default flow source not found: {source}"),
            }),
        }
        self
    }

    fn push_flow(mut self, source: &str, target: &str, condition: Option<Expression>) -> Self {
        let base = format!("{source}->{target}");
        let mut id = base.clone();
        let mut n = 1;
        while self.flows.iter().any(|f| f.id == id) {
            n += 1;
            id = format!("{base}#{n}");
        }
        self.flows.push(SequenceFlow {
            id,
            source: source.to_string(),
            target: target.to_string(),
            condition,
        });
        self
    }

    // ── Markers ──

    /// Associate a compensation handler with an activity.
    pub fn compensation_handler(mut self, activity: &str, handler: &str) -> Self {
        match self.activities.get_mut(activity) {
            Some(act) => act.compensation_handler = Some(handler.to_string()),
            None => self.errors.push(ValidationError {
                rule: "M7".to_string(),
                message: format!("Compensated activity not found: {activity}"),
            }),
        }
        self
    }

    /// Mark an activity as multi-instance.
    pub fn multi_instance(mut self, activity: &str, spec: MultiInstanceSpec) -> Self {
        self.multi_instance.push((activity.to_string(), spec));
        self
    }

    // ── Build ──

    pub fn build(self) -> Result<ProcessDefinition, ModelError> {
        let ProcessBuilder {
            key,
            mut activities,
            mut flows,
            multi_instance,
            catch_variables,
            mut errors,
            ..
        } = self;

        for (inner_id, spec) in multi_instance {
            wrap_multi_instance(&mut activities, &mut flows, &inner_id, spec, &mut errors);
        }

        let flow_map: BTreeMap<FlowId, SequenceFlow> =
            flows.iter().map(|f| (f.id.clone(), f.clone())).collect();
        for flow in &flows {
            if let Some(src) = activities.get_mut(&flow.source) {
                src.outgoing.push(flow.id.clone());
            }
            if let Some(tgt) = activities.get_mut(&flow.target) {
                tgt.incoming.push(flow.id.clone());
            }
        }

        let handlers: Vec<ActivityId> = activities
            .values()
            .filter_map(|a| a.compensation_handler.clone())
            .collect();
        for handler in handlers {
            if let Some(h) = activities.get_mut(&handler) {
                h.is_compensation_handler = true;
            }
        }

        attach_boundaries(&mut activities, &mut errors);
        let process_catches = collect_catches(&mut activities, &catch_variables);
        mark_scopes(&mut activities);

        let mut definition = ProcessDefinition {
            key,
            version: [0u8; 32],
            activities,
            flows: flow_map,
            process_catches,
        };

        errors.extend(validate_definition(&definition));
        if !errors.is_empty() {
            return Err(ModelError {
                process: definition.key,
                errors,
            });
        }

        let canonical = serde_json::to_vec(&(
            &definition.key,
            &definition.activities,
            &definition.flows,
            &definition.process_catches,
        ))
        .unwrap_or_default();
        definition.version = compute_hash(&canonical);
        Ok(definition)
    }
}

/// Replace `inner_id` in the flow graph with a synthetic body activity and
/// move the original activity inside it.
fn wrap_multi_instance(
    activities: &mut BTreeMap<ActivityId, Activity>,
    flows: &mut [SequenceFlow],
    inner_id: &str,
    spec: MultiInstanceSpec,
    errors: &mut Vec<ValidationError>,
) {
    let body_id = format!("{inner_id}{MULTI_INSTANCE_BODY_SUFFIX}");
    let Some(inner) = activities.get_mut(inner_id) else {
        errors.push(ValidationError {
            rule: "M9".to_string(),
            message: format!("Multi-instance activity not found: {inner_id}"),
        });
        return;
    };
    let flow_scope = std::mem::replace(&mut inner.flow_scope, ScopeId::Activity(body_id.clone()));
    let default_flow = inner.default_flow.take();

    for flow in flows.iter_mut() {
        if flow.source == inner_id {
            flow.source = body_id.clone();
        }
        if flow.target == inner_id {
            flow.target = body_id.clone();
        }
    }
    for act in activities.values_mut() {
        if let ActivityKind::Boundary { attached_to, .. } = &mut act.kind {
            if attached_to == inner_id {
                *attached_to = body_id.clone();
            }
        }
    }

    activities.insert(
        body_id.clone(),
        Activity {
            id: body_id,
            kind: ActivityKind::MultiInstanceBody {
                spec,
                inner: inner_id.to_string(),
            },
            flow_scope,
            is_scope: true,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            default_flow,
            compensation_handler: None,
            is_compensation_handler: false,
            boundary_events: Vec::new(),
            catches: Vec::new(),
        },
    );
}

fn attach_boundaries(
    activities: &mut BTreeMap<ActivityId, Activity>,
    errors: &mut Vec<ValidationError>,
) {
    let boundaries: Vec<(ActivityId, ActivityId)> = activities
        .values()
        .filter_map(|a| match &a.kind {
            ActivityKind::Boundary { attached_to, .. } => Some((a.id.clone(), attached_to.clone())),
            _ => None,
        })
        .collect();
    for (boundary, host) in boundaries {
        let Some(host_scope) = activities.get(&host).map(|h| h.flow_scope.clone()) else {
            errors.push(ValidationError {
                rule: "M6".to_string(),
                message: format!("Boundary event {boundary} is attached to unknown activity {host}"),
            });
            continue;
        };
        if let Some(b) = activities.get_mut(&boundary) {
            b.flow_scope = host_scope;
        }
        if let Some(h) = activities.get_mut(&host) {
            h.boundary_events.push(boundary);
        }
    }
}

/// Build the per-scope catch tables; returns the process-level table.
fn collect_catches(
    activities: &mut BTreeMap<ActivityId, Activity>,
    variables: &BTreeMap<ActivityId, (Option<String>, Option<String>)>,
) -> Vec<CatchDefinition> {
    let mut declared: Vec<(ScopeId, CatchDefinition)> = Vec::new();
    for act in activities.values() {
        let (scope, trigger, cancel) = match &act.kind {
            ActivityKind::Boundary {
                attached_to,
                trigger,
                cancel_activity,
            } => (ScopeId::Activity(attached_to.clone()), trigger, *cancel_activity),
            ActivityKind::StartEvent {
                trigger,
                interrupting,
            } => {
                let ScopeId::Activity(esp) = &act.flow_scope else {
                    continue;
                };
                let esp_scope = match activities.get(esp) {
                    Some(e) if e.is_event_sub_process() => e.flow_scope.clone(),
                    _ => continue,
                };
                (esp_scope, trigger, *interrupting)
            }
            _ => continue,
        };
        let (kind, code, cancel_activity) = match trigger {
            // Errors always interrupt the scope that caught them.
            EventTrigger::Error(code) => (CatchKind::Error, code.clone(), true),
            EventTrigger::Escalation(code) => (CatchKind::Escalation, code.clone(), cancel),
            _ => continue,
        };
        let (code_variable, message_variable) = variables.get(&act.id).cloned().unwrap_or_default();
        declared.push((
            scope,
            CatchDefinition {
                kind,
                handler: act.id.clone(),
                code,
                cancel_activity,
                code_variable,
                message_variable,
            },
        ));
    }
    // Specific codes before catch-alls, declaration order otherwise.
    declared.sort_by_key(|(_, c)| c.code.is_none());

    let mut process = Vec::new();
    for (scope, catch) in declared {
        match scope {
            ScopeId::Process => process.push(catch),
            ScopeId::Activity(id) => {
                if let Some(a) = activities.get_mut(&id) {
                    a.catches.push(catch);
                }
            }
        }
    }
    process
}

fn mark_scopes(activities: &mut BTreeMap<ActivityId, Activity>) {
    let bodies: Vec<ActivityId> = activities
        .values()
        .filter(|a| matches!(a.kind, ActivityKind::MultiInstanceBody { .. }))
        .map(|a| a.id.clone())
        .collect();
    for act in activities.values_mut() {
        let inside_body = matches!(&act.flow_scope, ScopeId::Activity(s) if bodies.contains(s));
        act.is_scope = inside_body
            || !act.boundary_events.is_empty()
            || !act.catches.is_empty()
            || match &act.kind {
                ActivityKind::SubProcess
                | ActivityKind::EventSubProcess
                | ActivityKind::CallActivity { .. }
                | ActivityKind::MultiInstanceBody { .. }
                | ActivityKind::EventBasedGateway => true,
                ActivityKind::ReceiveTask { message } => message.is_some(),
                ActivityKind::IntermediateCatch { trigger } => !matches!(trigger, EventTrigger::None),
                _ => false,
            };
    }
}
