//! YAML authoring format for process definitions.
//!
//! ```yaml
//! id: order
//! nodes:
//!   - kind: StartEvent
//!     id: start
//!   - kind: UserTask
//!     id: review
//!   - kind: EndEvent
//!     id: end
//! edges:
//!   - from: start
//!     to: review
//!   - from: review
//!     to: end
//! ```

use super::{EventTrigger, MultiInstanceSpec, ProcessBuilder, ProcessDefinition};
use crate::expr::Expression;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_trigger() -> EventTrigger {
    EventTrigger::None
}

// ── Top-level DTO ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDto {
    pub id: String,
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub edges: Vec<EdgeDto>,
    #[serde(default)]
    pub multi_instance: Vec<MultiInstanceDto>,
    #[serde(default)]
    pub compensation: Vec<CompensationDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDto {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstanceDto {
    pub activity: String,
    #[serde(flatten)]
    pub spec: MultiInstanceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationDto {
    pub activity: String,
    pub handler: String,
}

// ── Nodes ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeDto {
    StartEvent {
        id: String,
        #[serde(default = "default_trigger")]
        trigger: EventTrigger,
        #[serde(default = "default_true")]
        interrupting: bool,
    },
    EndEvent {
        id: String,
        #[serde(default)]
        terminate: bool,
    },
    ErrorEndEvent {
        id: String,
        code: String,
    },
    EscalationEvent {
        id: String,
        code: String,
        #[serde(default)]
        end: bool,
    },
    CompensationEvent {
        id: String,
        #[serde(default)]
        activity: Option<String>,
        #[serde(default)]
        end: bool,
    },
    Task {
        id: String,
    },
    UserTask {
        id: String,
    },
    ReceiveTask {
        id: String,
        #[serde(default)]
        message: Option<String>,
    },
    ServiceTask {
        id: String,
        #[serde(default)]
        delegate: Option<String>,
        #[serde(default)]
        expression: Option<Expression>,
        #[serde(default)]
        result_variable: Option<String>,
    },
    ExclusiveGateway {
        id: String,
    },
    ParallelGateway {
        id: String,
    },
    InclusiveGateway {
        id: String,
    },
    EventBasedGateway {
        id: String,
    },
    IntermediateCatch {
        id: String,
        trigger: EventTrigger,
    },
    Boundary {
        id: String,
        attached_to: String,
        trigger: EventTrigger,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        #[serde(default)]
        code_variable: Option<String>,
        #[serde(default)]
        message_variable: Option<String>,
    },
    SubProcess {
        id: String,
        nodes: Vec<NodeDto>,
        #[serde(default)]
        edges: Vec<EdgeDto>,
    },
    EventSubProcess {
        id: String,
        nodes: Vec<NodeDto>,
        #[serde(default)]
        edges: Vec<EdgeDto>,
        #[serde(default)]
        code_variable: Option<String>,
        #[serde(default)]
        message_variable: Option<String>,
    },
    CallActivity {
        id: String,
        called_element: String,
        #[serde(default = "default_true")]
        pass_variables: bool,
    },
}

/// Parse a YAML string into a [`ProcessDto`] without building it.
///
/// Enum values such as guards and triggers are written as single-key maps
/// (`compare: {...}`, `Message: paid`) rather than YAML `!tags`.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessDto> {
    let dto: ProcessDto =
        serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(yaml_str))
            .context("parsing process YAML")?;
    Ok(dto)
}

/// Parse and build a definition from YAML.
pub fn compile_process_yaml(yaml_str: &str) -> Result<ProcessDefinition> {
    let dto = parse_process_yaml(yaml_str)?;
    dto_to_definition(&dto)
}

pub fn dto_to_definition(dto: &ProcessDto) -> Result<ProcessDefinition> {
    let mut builder = add_scope(ProcessBuilder::new(&dto.id), &dto.nodes, &dto.edges);
    for mi in &dto.multi_instance {
        builder = builder.multi_instance(&mi.activity, mi.spec.clone());
    }
    for comp in &dto.compensation {
        builder = builder.compensation_handler(&comp.activity, &comp.handler);
    }
    builder
        .build()
        .with_context(|| format!("building process '{}' from YAML", dto.id))
}

fn add_scope(mut b: ProcessBuilder, nodes: &[NodeDto], edges: &[EdgeDto]) -> ProcessBuilder {
    for node in nodes {
        b = match node {
            NodeDto::StartEvent {
                id,
                trigger,
                interrupting,
            } => b.start_event_with(id, trigger.clone(), *interrupting),
            NodeDto::EndEvent { id, terminate } => {
                if *terminate {
                    b.terminate_end_event(id)
                } else {
                    b.end_event(id)
                }
            }
            NodeDto::ErrorEndEvent { id, code } => b.error_end_event(id, code),
            NodeDto::EscalationEvent { id, code, end } => {
                if *end {
                    b.escalation_end_event(id, code)
                } else {
                    b.escalation_throw_event(id, code)
                }
            }
            NodeDto::CompensationEvent { id, activity, end } => {
                if *end {
                    b.compensation_end_event(id, activity.as_deref())
                } else {
                    b.compensation_throw_event(id, activity.as_deref())
                }
            }
            NodeDto::Task { id } => b.task(id),
            NodeDto::UserTask { id } => b.user_task(id),
            NodeDto::ReceiveTask { id, message } => b.receive_task(id, message.as_deref()),
            NodeDto::ServiceTask {
                id,
                delegate,
                expression,
                result_variable,
            } => match (delegate, expression) {
                (Some(name), _) => b.service_task(id, name),
                (None, Some(expr)) => b.expression_task(id, expr.clone(), result_variable.as_deref()),
                (None, None) => b.task(id),
            },
            NodeDto::ExclusiveGateway { id } => b.exclusive_gateway(id),
            NodeDto::ParallelGateway { id } => b.parallel_gateway(id),
            NodeDto::InclusiveGateway { id } => b.inclusive_gateway(id),
            NodeDto::EventBasedGateway { id } => b.event_based_gateway(id),
            NodeDto::IntermediateCatch { id, trigger } => {
                b.intermediate_catch_event(id, trigger.clone())
            }
            NodeDto::Boundary {
                id,
                attached_to,
                trigger,
                cancel_activity,
                code_variable,
                message_variable,
            } => b
                .boundary_event(id, attached_to, trigger.clone(), *cancel_activity)
                .catch_variables(id, code_variable.as_deref(), message_variable.as_deref()),
            NodeDto::SubProcess { id, nodes, edges } => {
                add_scope(b.sub_process(id), nodes, edges).end_sub_process()
            }
            NodeDto::EventSubProcess {
                id,
                nodes,
                edges,
                code_variable,
                message_variable,
            } => {
                let inner = add_scope(b.event_sub_process(id), nodes, edges).end_sub_process();
                // The start event is the handler that receives the bindings.
                match nodes.iter().find_map(|n| match n {
                    NodeDto::StartEvent { id, .. } => Some(id.as_str()),
                    _ => None,
                }) {
                    Some(start) => {
                        inner.catch_variables(start, code_variable.as_deref(), message_variable.as_deref())
                    }
                    None => inner,
                }
            }
            NodeDto::CallActivity {
                id,
                called_element,
                pass_variables,
            } => b.call_activity(id, called_element, *pass_variables),
        };
    }
    for edge in edges {
        b = match (&edge.condition, edge.is_default) {
            (_, true) => b.default_flow(&edge.from, &edge.to),
            (Some(cond), false) => b.conditional_flow(&edge.from, &edge.to, cond.clone()),
            (None, false) => b.flow(&edge.from, &edge.to),
        };
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityKind;
    use crate::types::ScopeId;

    #[test]
    fn test_basic_yaml_build() {
        let yaml = r#"
id: order
nodes:
  - kind: StartEvent
    id: start
  - kind: ServiceTask
    id: charge
    delegate: charge_card
  - kind: ExclusiveGateway
    id: gw
  - kind: UserTask
    id: review
  - kind: EndEvent
    id: end
edges:
  - from: start
    to: charge
  - from: charge
    to: gw
  - from: gw
    to: review
    condition:
      compare: { variable: amount, op: ">", value: 1000 }
  - from: gw
    to: end
    is_default: true
  - from: review
    to: end
"#;
        let def = compile_process_yaml(yaml).unwrap();
        assert_eq!(def.key, "order");
        let gw = def.activity("gw").unwrap();
        assert_eq!(gw.outgoing.len(), 2);
        assert_eq!(gw.default_flow.as_deref(), Some("gw->end"));
        assert!(def.flow("gw->review").unwrap().condition.is_some());
    }

    #[test]
    fn test_yaml_sub_process_and_boundary() {
        let yaml = r#"
id: nested
nodes:
  - kind: StartEvent
    id: start
  - kind: SubProcess
    id: sp
    nodes:
      - kind: StartEvent
        id: sp_start
      - kind: ErrorEndEvent
        id: fail
        code: BROKEN
    edges:
      - from: sp_start
        to: fail
  - kind: Boundary
    id: on_broken
    attached_to: sp
    trigger: { Error: BROKEN }
    code_variable: errorCode
  - kind: EndEvent
    id: end
  - kind: EndEvent
    id: handled
edges:
  - from: start
    to: sp
  - from: sp
    to: end
  - from: on_broken
    to: handled
"#;
        let def = compile_process_yaml(yaml).unwrap();
        assert_eq!(
            def.activity("fail").unwrap().flow_scope,
            ScopeId::Activity("sp".into())
        );
        let sp = def.activity("sp").unwrap();
        assert_eq!(sp.catches.len(), 1);
        assert_eq!(sp.catches[0].code_variable.as_deref(), Some("errorCode"));
        assert!(matches!(
            def.activity("on_broken").unwrap().kind,
            ActivityKind::Boundary { cancel_activity: true, .. }
        ));
    }

    #[test]
    fn test_yaml_guards_and_multi_instance_expressions() {
        let yaml = r#"
id: approvals
nodes:
  - kind: StartEvent
    id: start
  - kind: UserTask
    id: approve
  - kind: ExclusiveGateway
    id: gw
  - kind: EndEvent
    id: done
  - kind: EndEvent
    id: rejected
edges:
  - from: start
    to: approve
  - from: approve
    to: gw
  - from: gw
    to: done
    condition:
      not:
        variable: vetoed
  - from: gw
    to: rejected
    is_default: true
multi_instance:
  - activity: approve
    sequential: false
    cardinality:
      literal: 3
    completion_condition:
      compare: { variable: nrOfCompletedInstances, op: ">=", value: 2 }
"#;
        let def = compile_process_yaml(yaml).unwrap();
        assert_eq!(
            def.flow("gw->done").unwrap().condition,
            Some(Expression::Not(Box::new(Expression::variable("vetoed"))))
        );
        let ActivityKind::MultiInstanceBody { spec, .. } =
            &def.activity("approve#multiInstanceBody").unwrap().kind
        else {
            panic!("approve is not wrapped in a multi-instance body");
        };
        assert_eq!(spec.cardinality, Some(Expression::literal(3)));
        assert!(spec.completion_condition.is_some());
    }

    #[test]
    fn test_yaml_validation_error_surfaces() {
        let yaml = r#"
id: broken
nodes:
  - kind: Task
    id: a
edges: []
"#;
        let err = compile_process_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("M5"));
    }
}
