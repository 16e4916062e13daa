use bpmn_exec_core::expr::{DefaultEvaluator, EvalError, ExpressionEvaluator, VariableScope};
use bpmn_exec_core::model::EventTrigger;
use bpmn_exec_core::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine() -> Engine {
    Engine::new(
        Arc::new(MemoryStore::new()),
        Services::new(),
        EngineConfig::new(UnhandledErrorPolicy::Fail),
    )
}

async fn waiting(engine: &Engine, id: Uuid) -> Vec<String> {
    let mut activities: Vec<String> = engine
        .instance(id)
        .await
        .unwrap()
        .tree
        .active_activities()
        .into_iter()
        .map(|(_, a)| a)
        .collect();
    activities.sort();
    activities
}

async fn count_events(engine: &Engine, id: Uuid, pred: impl Fn(&RuntimeEvent) -> bool) -> usize {
    engine
        .events(id, 0)
        .await
        .unwrap()
        .iter()
        .filter(|(_, e)| pred(e))
        .count()
}

fn three_way_parallel() -> ProcessDefinition {
    ProcessBuilder::new("fan_out")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .parallel_gateway("join")
        .user_task("after")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("fork", "c")
        .flow("a", "join")
        .flow("b", "join")
        .flow("c", "join")
        .flow("join", "after")
        .build()
        .unwrap()
}

#[tokio::test]
async fn parallel_join_fires_once_whatever_the_arrival_order() {
    init_tracing();
    for order in [["a", "b", "c"], ["c", "a", "b"], ["b", "c", "a"]] {
        let engine = engine();
        engine.deploy(three_way_parallel()).await.unwrap();
        let id = engine.start("fan_out", BTreeMap::new()).await.unwrap();
        assert_eq!(waiting(&engine, id).await, vec!["a", "b", "c"]);

        for (i, task) in order.iter().enumerate() {
            engine.complete_activity(id, task, BTreeMap::new()).await.unwrap();
            let fired = count_events(&engine, id, |e| {
                matches!(e, RuntimeEvent::JoinFired { gateway, .. } if gateway == "join")
            })
            .await;
            assert_eq!(fired, usize::from(i == 2), "after completing {task}");
        }

        assert_eq!(waiting(&engine, id).await, vec!["after"]);
        let inst = engine.instance(id).await.unwrap();
        // root plus the single execution waiting at `after`
        assert!(inst.tree.executions().count() <= 2);
    }
}

#[tokio::test]
async fn inclusive_join_waits_for_branches_that_can_still_arrive() {
    init_tracing();
    // `b` reaches the join through `c`, so both incoming flows of the join
    // can hold arrivals while `b` is still pending.
    let def = ProcessBuilder::new("inclusive")
        .start_event("start")
        .inclusive_gateway("fork")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .inclusive_gateway("join")
        .user_task("after")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("fork", "c")
        .flow("b", "c")
        .flow("a", "join")
        .flow("c", "join")
        .flow("join", "after")
        .build()
        .unwrap();
    let engine = engine();
    engine.deploy(def).await.unwrap();
    let id = engine.start("inclusive", BTreeMap::new()).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["a", "b", "c"]);

    engine.complete_activity(id, "a", BTreeMap::new()).await.unwrap();
    engine.complete_activity(id, "c", BTreeMap::new()).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["b"]);
    let fired = |e: &RuntimeEvent| matches!(e, RuntimeEvent::JoinFired { gateway, .. } if gateway == "join");
    let arrived = |e: &RuntimeEvent| matches!(e, RuntimeEvent::JoinArrived { gateway, .. } if gateway == "join");
    assert_eq!(count_events(&engine, id, arrived).await, 2);
    assert_eq!(count_events(&engine, id, fired).await, 0);

    engine.complete_activity(id, "b", BTreeMap::new()).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["c"]);
    engine.complete_activity(id, "c", BTreeMap::new()).await.unwrap();

    assert_eq!(waiting(&engine, id).await, vec!["after"]);
    assert_eq!(count_events(&engine, id, fired).await, 1);
}

#[tokio::test]
async fn inclusive_fork_follows_only_passing_conditions() {
    init_tracing();
    use bpmn_exec_core::expr::{CompareOp, Expression};
    let def = ProcessBuilder::new("routing")
        .start_event("start")
        .inclusive_gateway("fork")
        .user_task("legal")
        .user_task("finance")
        .user_task("ops")
        .inclusive_gateway("join")
        .end_event("end")
        .flow("start", "fork")
        .conditional_flow("fork", "legal", Expression::compare("amount", CompareOp::Gt, 1000))
        .conditional_flow("fork", "finance", Expression::compare("amount", CompareOp::Gt, 100))
        .default_flow("fork", "ops")
        .flow("legal", "join")
        .flow("finance", "join")
        .flow("ops", "join")
        .flow("join", "end")
        .build()
        .unwrap();
    let engine = engine();
    engine.deploy(def).await.unwrap();

    let vars = BTreeMap::from([("amount".to_string(), Value::I64(500))]);
    let id = engine.start("routing", vars).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["finance"]);
    engine.complete_activity(id, "finance", BTreeMap::new()).await.unwrap();
    assert_eq!(engine.instance(id).await.unwrap().state, ProcessState::Completed);
    // a single branch passes both gateways without any join bookkeeping
    let joins = count_events(&engine, id, |e| {
        matches!(e, RuntimeEvent::JoinArrived { .. } | RuntimeEvent::JoinFired { .. })
    })
    .await;
    assert_eq!(joins, 0);

    let id = engine.start("routing", BTreeMap::from([("amount".to_string(), Value::I64(5))])).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["ops"]);
}

fn order_with_deadline() -> ProcessDefinition {
    ProcessBuilder::new("order")
        .start_event("start")
        .user_task("prepare")
        .event_based_gateway("choose")
        .intermediate_catch_event("paid", EventTrigger::Message("payment".into()))
        .intermediate_catch_event("expired", EventTrigger::Timer("P1D".into()))
        .user_task("ship")
        .user_task("cancel_order")
        .flow("start", "prepare")
        .flow("prepare", "choose")
        .flow("choose", "paid")
        .flow("choose", "expired")
        .flow("paid", "ship")
        .flow("expired", "cancel_order")
        .build()
        .unwrap()
}

#[tokio::test]
async fn event_based_gateway_takes_the_first_event() {
    init_tracing();
    let engine = engine();
    engine.deploy(order_with_deadline()).await.unwrap();
    let id = engine.start("order", BTreeMap::new()).await.unwrap();
    engine.complete_activity(id, "prepare", BTreeMap::new()).await.unwrap();

    let timers = engine.pending_timers(id).await.unwrap();
    assert_eq!(timers.len(), 1);
    engine.fire_timer(id, timers[0].id).await.unwrap();

    assert_eq!(waiting(&engine, id).await, vec!["cancel_order"]);
    // the losing message subscription is gone with the gateway
    assert!(!engine
        .correlate_message(id, "payment", BTreeMap::new())
        .await
        .unwrap());
    assert_eq!(waiting(&engine, id).await, vec!["cancel_order"]);
}

#[tokio::test]
async fn event_based_gateway_consumes_a_buffered_message() {
    init_tracing();
    let engine = engine();
    engine.deploy(order_with_deadline()).await.unwrap();
    let id = engine.start("order", BTreeMap::new()).await.unwrap();

    let vars = BTreeMap::from([("receipt".to_string(), Value::from("R-17"))]);
    assert!(!engine.correlate_message(id, "payment", vars).await.unwrap());
    assert_eq!(
        count_events(&engine, id, |e| matches!(e, RuntimeEvent::MessageBuffered { .. })).await,
        1
    );

    engine.complete_activity(id, "prepare", BTreeMap::new()).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["ship"]);
    let inst = engine.instance(id).await.unwrap();
    assert!(inst.tree.buffered_messages().is_empty());
    assert!(engine.pending_timers(id).await.unwrap().is_empty());
    let root = inst.tree.root().unwrap();
    assert_eq!(inst.tree.variable(root, "receipt"), Some(&Value::from("R-17")));
}

/// Answers `is_gold` scripts; everything else goes to the built-in evaluator.
struct TierScripts;

impl ExpressionEvaluator for TierScripts {
    fn evaluate(
        &self,
        expr: &bpmn_exec_core::expr::Expression,
        scope: &dyn VariableScope,
    ) -> Result<Value, EvalError> {
        match expr {
            bpmn_exec_core::expr::Expression::Script(text) if text == "is_gold" => {
                Ok(Value::Bool(scope.variable("tier") == Some(Value::from("gold"))))
            }
            other => DefaultEvaluator.evaluate(other, scope),
        }
    }
}

#[tokio::test]
async fn script_guards_use_the_injected_evaluator() {
    init_tracing();
    use bpmn_exec_core::expr::Expression;
    let def = ProcessBuilder::new("support")
        .start_event("start")
        .exclusive_gateway("route")
        .user_task("priority_desk")
        .user_task("standard_desk")
        .flow("start", "route")
        .conditional_flow("route", "priority_desk", Expression::Script("is_gold".into()))
        .default_flow("route", "standard_desk")
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        Services::new().with_evaluator(Arc::new(TierScripts)),
        EngineConfig::new(UnhandledErrorPolicy::Fail),
    );
    engine.deploy(def).await.unwrap();

    let gold = BTreeMap::from([("tier".to_string(), Value::from("gold"))]);
    let id = engine.start("support", gold).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["priority_desk"]);

    let id = engine.start("support", BTreeMap::new()).await.unwrap();
    assert_eq!(waiting(&engine, id).await, vec!["standard_desk"]);
}
