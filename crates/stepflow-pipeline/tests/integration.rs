use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use stepflow_pipeline::{
    parse, plan, EchoWorkload, EventEmitter, ExecutionContext, ExecutorConfig,
    MemoryCheckpointStore, SessionContext, StepNode, StepWorkload, WorkflowEvent,
    WorkflowExecutor, WorkloadRegistry,
};
use stepflow_types::{Phase, Result, StepflowError};

// ---------------------------------------------------------------------------
// Scripted workload
// ---------------------------------------------------------------------------

type Respond = dyn Fn(&str, &Map<String, Value>, usize) -> Result<Value> + Send + Sync;

/// Answers every call through `respond(step_id, input, call_index)` and
/// records what it saw.
struct Scripted {
    workload_type: String,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    counter: AtomicUsize,
    respond: Box<Respond>,
}

impl Scripted {
    fn new(
        workload_type: &str,
        respond: impl Fn(&str, &Map<String, Value>, usize) -> Result<Value> + Send + Sync + 'static,
    ) -> (Self, Arc<Mutex<Vec<(String, Value)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Scripted {
                workload_type: workload_type.to_string(),
                calls: calls.clone(),
                counter: AtomicUsize::new(0),
                respond: Box::new(respond),
            },
            calls,
        )
    }
}

#[async_trait]
impl StepWorkload for Scripted {
    fn workload_type(&self) -> &str {
        &self.workload_type
    }

    async fn invoke(
        &self,
        step: &StepNode,
        input: &Map<String, Value>,
        _session: &SessionContext,
    ) -> Result<Value> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((step.id.clone(), Value::Object(input.clone())));
        (self.respond)(&step.id, input, n)
    }
}

struct Sleepy;

#[async_trait]
impl StepWorkload for Sleepy {
    fn workload_type(&self) -> &str {
        "sleepy"
    }

    async fn invoke(
        &self,
        _step: &StepNode,
        _input: &Map<String, Value>,
        _session: &SessionContext,
    ) -> Result<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    }
}

struct SettingsReport;

#[async_trait]
impl StepWorkload for SettingsReport {
    fn workload_type(&self) -> &str {
        "settings"
    }

    async fn invoke(
        &self,
        _step: &StepNode,
        _input: &Map<String, Value>,
        session: &SessionContext,
    ) -> Result<Value> {
        Ok(json!({
            "model": session.settings.get("MODEL").cloned().unwrap_or(Value::Null),
            "namespace": session.namespace,
            "thread": session.thread_id,
        }))
    }
}

fn registry_with(workload: impl StepWorkload + 'static) -> WorkloadRegistry {
    let mut reg = WorkloadRegistry::new();
    reg.register(workload);
    reg.with_fallback(EchoWorkload)
}

fn planned(definition: Value) -> ExecutionContext {
    let mut ctx = parse(definition, &IndexMap::new()).unwrap();
    plan(&mut ctx).unwrap();
    ctx
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_step_output_reference() {
    let mut ctx = planned(json!({
        "agent": {
            "id": "greeter",
            "input": {"msg": {"value_type": "str", "required": true}},
            "output": {"result": {"source": "reference", "reference": "p1_output.result"}}
        },
        "nodes": [{
            "id": "p1",
            "type": "sdk",
            "input": {"text": {"source": "reference", "reference": "workflow_input.msg"}}
        }]
    }));
    let (sdk, calls) = Scripted::new("sdk", |_, _, _| Ok(json!({"result": "hi!"})));
    let executor = WorkflowExecutor::new(registry_with(sdk));

    let output = executor.execute(&mut ctx, json!({"msg": "hi"})).await.unwrap();

    assert_eq!(output, json!({"result": "hi!"}));
    assert_eq!(ctx.phase(), Phase::Executed);
    assert_eq!(calls.lock().unwrap()[0], ("p1".to_string(), json!({"text": "hi"})));

    let state = ctx.final_state().unwrap();
    assert_eq!(state.value("p1_input"), Some(&json!({"text": "hi"})));
    assert_eq!(state.value("workflow_output"), Some(&json!({"result": "hi!"})));
    assert!(uuid::Uuid::parse_str(ctx.run_id().unwrap()).is_ok());
}

#[tokio::test]
async fn yaml_definition_runs() {
    let yaml = r#"
agent:
  id: yaml-flow
  output: p1_output
nodes:
  - id: p1
    input:
      greeting:
        value: hello
"#;
    let mut ctx = parse(stepflow_definition::DefinitionSource::Text(yaml.into()), &IndexMap::new()).unwrap();
    plan(&mut ctx).unwrap();
    let executor = WorkflowExecutor::new(stepflow_pipeline::default_registry());
    let output = executor.execute(&mut ctx, Value::Null).await.unwrap();
    assert_eq!(output, json!({"greeting": "hello"}));
}

#[tokio::test]
async fn non_mapping_result_is_wrapped() {
    let mut ctx = planned(json!({
        "agent": {"output": {"answer": {"reference": "p1_output._result", "value_type": "int"}}},
        "nodes": [{"id": "p1", "type": "sdk"}]
    }));
    let (sdk, _) = Scripted::new("sdk", |_, _, _| Ok(json!("42")));
    let output = WorkflowExecutor::new(registry_with(sdk))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap();
    assert_eq!(output, json!({"answer": 42}));
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

fn review_flow() -> Value {
    json!({
        "agent": {
            "id": "review",
            "input": {"score": {"value_type": "int", "required": true}},
            "output": "decision_output"
        },
        "nodes": [
            {"id": "draft", "type": "sdk", "next_type": "condition",
             "input": {"score": {"reference": "workflow_input.score", "value_type": "int"}}},
            {"id": "gate", "type": "condition", "prev": "draft",
             "if": {"logic_operator": "and", "condition": [
                 {"operator": "ge", "operand": "draft_output.score", "value": 8}
             ], "next": "approve"},
             "elif": [{"logic_operator": "or", "condition": [
                 {"operator": "ge", "operand": "draft_output.score", "value": 5},
                 {"operator": "ct", "operand": "draft_output.tag", "value": "urgent vip"}
             ], "next": "revise"}],
             "else": "reject"},
            {"id": "approve", "type": "sdk", "next": "decision"},
            {"id": "revise", "type": "sdk", "next": "decision"},
            {"id": "reject", "type": "sdk", "next": "decision"},
            {"id": "decision", "type": "rag"}
        ]
    })
}

fn review_registry() -> WorkloadRegistry {
    let (sdk, _) = Scripted::new("sdk", |step, input, _| {
        Ok(match step {
            "draft" => json!({"score": input["score"], "tag": if input["score"] == json!(1) { "vip" } else { "none" }}),
            other => json!({"verdict": other}),
        })
    });
    let mut reg = WorkloadRegistry::new();
    reg.register(sdk);
    reg.with_fallback(EchoWorkload)
}

fn review_flow_with_verdicts() -> Value {
    let mut flow = review_flow();
    flow["agent"]["output"] = json!({
        "approved": {"reference": "approve_output.verdict"}
    });
    flow
}

#[tokio::test]
async fn if_branch_is_taken() {
    let mut ctx = planned(review_flow_with_verdicts());
    let output = WorkflowExecutor::new(review_registry())
        .execute(&mut ctx, json!({"score": 9}))
        .await
        .unwrap();
    assert_eq!(output, json!({"approved": "approve"}));
    let state = ctx.final_state().unwrap();
    assert_eq!(state.value("revise_output"), Some(&Value::Null));
    assert_eq!(state.value("reject_output"), Some(&Value::Null));
}

#[tokio::test]
async fn elif_and_else_branches() {
    let executor = WorkflowExecutor::new(review_registry());
    let mut flow = review_flow_with_verdicts();
    flow["agent"]["output"] = json!({"v": {"reference": "revise_output.verdict"}});
    let mut ctx = planned(flow);
    let output = executor.execute(&mut ctx, json!({"score": "6"})).await.unwrap();
    assert_eq!(output, json!({"v": "revise"}));

    // score 1 tags the draft "vip", which the `or` branch's second clause
    // finds inside "urgent vip".
    let output = executor.execute(&mut ctx, json!({"score": 1})).await.unwrap();
    assert_eq!(output, json!({"v": "revise"}));

    let mut flow = review_flow_with_verdicts();
    flow["agent"]["output"] = json!({"v": {"reference": "reject_output.verdict"}});
    let mut ctx = planned(flow);
    let output = executor.execute(&mut ctx, json!({"score": 2})).await.unwrap();
    assert_eq!(output, json!({"v": "reject"}));
}

#[tokio::test]
async fn output_from_untaken_branch_is_reference_error() {
    let mut ctx = planned(review_flow_with_verdicts());
    let emitter = EventEmitter::new(64);
    let mut rx = emitter.subscribe();
    let executor = WorkflowExecutor::new(review_registry()).with_config(ExecutorConfig {
        events: Some(emitter),
        ..Default::default()
    });

    let err = executor.execute(&mut ctx, json!({"score": 2})).await.unwrap_err();
    assert!(matches!(err, StepflowError::Reference { .. }), "{err:?}");
    assert!(err.to_string().contains("approve_output"), "{err}");
    assert_eq!(ctx.phase(), Phase::Planned);
    assert!(ctx.output().is_none());

    let mut branch = None;
    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            WorkflowEvent::BranchSelected { branch: b, targets, .. } => {
                branch = Some((b, targets));
            }
            WorkflowEvent::RunFailed { .. } => failed = true,
            _ => {}
        }
    }
    assert_eq!(branch, Some(("else".to_string(), vec!["reject".to_string()])));
    assert!(failed);
}

#[tokio::test]
async fn else_may_end_the_run() {
    let mut ctx = planned(json!({
        "agent": {"output": {"score": {"reference": "p1_output.score"}}},
        "nodes": [
            {"id": "p1", "type": "sdk", "next_type": "condition"},
            {"id": "c1", "type": "condition", "prev": "p1",
             "if": {"logic_operator": "and",
                    "condition": [{"operator": "gt", "operand": "p1_output.score", "value": 100}],
                    "next": "p2"}},
            {"id": "p2", "type": "sdk"}
        ]
    }));
    let (sdk, calls) = Scripted::new("sdk", |_, _, _| Ok(json!({"score": 3})));
    let output = WorkflowExecutor::new(registry_with(sdk))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap();
    assert_eq!(output, json!({"score": 3}));
    assert_eq!(calls.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Loop aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loop_aggregation_accumulates_across_visits() {
    let mut ctx = planned(json!({
        "agent": {
            "id": "loop",
            "output": {
                "total": {"reference": "L_output.aggregation.total", "value_type": "int"},
                "visits": {"reference": "L_output.counter", "value_type": "int"}
            }
        },
        "nodes": [
            {"id": "p", "type": "sdk", "next": "L"},
            {"id": "L", "type": "loop_aggregation", "next": "check",
             "aggregation": {"total": {"reference": "p_output.x", "agg_type": "sum"}}},
            {"id": "check", "type": "rag", "next_type": "condition",
             "input": {"seen": {"reference": "L_output.aggregation.total", "value_type": "int"}}},
            {"id": "again", "type": "condition", "prev": "check",
             "if": {"logic_operator": "and",
                    "condition": [{"operator": "lt", "operand": "L_output.counter", "value": 2}],
                    "next": "p"}}
        ]
    }));
    let (sdk, _) = Scripted::new("sdk", |_, _, n| Ok(json!({"x": n + 1})));
    let (rag, seen) = Scripted::new("rag", |_, _, _| Ok(json!({})));
    let mut reg = WorkloadRegistry::new();
    reg.register(sdk);
    reg.register(rag);

    let output = WorkflowExecutor::new(reg).execute(&mut ctx, json!({})).await.unwrap();
    assert_eq!(output, json!({"total": 6, "visits": 2}));

    let totals: Vec<Value> = seen.lock().unwrap().iter().map(|(_, input)| input["seen"].clone()).collect();
    assert_eq!(totals, vec![json!(1), json!(3), json!(6)]);
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fan_out_runs_every_successor_before_join() {
    let mut ctx = planned(json!({
        "agent": {"output": {
            "left": {"reference": "B_output.from"},
            "right": {"reference": "C_output.from"},
            "joined": {"reference": "D_output.seen"}
        }},
        "nodes": [
            {"id": "A", "type": "sdk", "next": ["B", "C"]},
            {"id": "B", "type": "sdk", "next": "D"},
            {"id": "C", "type": "sdk", "next": "D"},
            {"id": "D", "type": "sdk", "input": {
                "b": {"reference": "B_output.from"},
                "c": {"reference": "C_output.from"}
            }}
        ]
    }));
    let (sdk, calls) = Scripted::new("sdk", |step, input, _| {
        Ok(match step {
            "D" => json!({"seen": format!("{}+{}", input["b"].as_str().unwrap_or(""), input["c"].as_str().unwrap_or(""))}),
            other => json!({"from": other}),
        })
    });
    let output = WorkflowExecutor::new(registry_with(sdk))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap();
    assert_eq!(output, json!({"left": "B", "right": "C", "joined": "B+C"}));
    let order: Vec<String> = calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(order, vec!["A", "B", "C", "D"]);
}

#[tokio::test]
async fn join_waits_for_a_branch_that_is_still_running() {
    let mut ctx = planned(json!({
        "agent": {"output": {"joined": {"reference": "D_output.seen", "value_type": "int"}}},
        "nodes": [
            {"id": "A", "type": "sdk", "next": ["B", "C"]},
            {"id": "B", "type": "sdk", "next": "D"},
            {"id": "C", "type": "sdk", "next": "E"},
            {"id": "E", "type": "sdk", "next": "D"},
            {"id": "D", "type": "sdk", "input": {
                "x": {"reference": "E_output.x", "value_type": "int"}
            }}
        ]
    }));
    let (sdk, calls) = Scripted::new("sdk", |step, input, _| {
        Ok(match step {
            "E" => json!({"x": 7}),
            "D" => json!({"seen": input["x"].clone()}),
            other => json!({"from": other}),
        })
    });
    let output = WorkflowExecutor::new(registry_with(sdk))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap();
    assert_eq!(output, json!({"joined": 7}));
    let order: Vec<String> = calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(order, vec!["A", "B", "C", "E", "D"]);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn config_error_surfaces_before_any_step_runs() {
    let mut ctx = parse(
        json!({"agent": {}, "nodes": [{"id": "A", "next": "B"}, {"id": "B"}, {"id": "B"}]}),
        &IndexMap::new(),
    )
    .unwrap();
    let err = plan(&mut ctx).unwrap_err();
    assert!(matches!(err, StepflowError::Config(_)));

    let (sdk, calls) = Scripted::new("base_agent", |_, _, _| Ok(json!({})));
    let err = WorkflowExecutor::new(registry_with(sdk))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("plan it first"));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn step_named_workflow_is_rejected_at_plan_time() {
    let mut ctx = parse(
        json!({"agent": {}, "nodes": [{"id": "A", "next": "workflow"}, {"id": "workflow"}]}),
        &IndexMap::new(),
    )
    .unwrap();
    let err = plan(&mut ctx).unwrap_err();
    assert!(
        matches!(err, StepflowError::Config(ref m) if m.contains("'workflow_output'")),
        "{err}"
    );
}

#[tokio::test]
async fn workload_failure_names_the_step() {
    let mut ctx = planned(json!({
        "agent": {},
        "nodes": [{"id": "A", "type": "sdk", "next": "B"}, {"id": "B", "type": "sdk"}]
    }));
    let (sdk, _) = Scripted::new("sdk", |step, _, _| {
        if step == "B" {
            Err(StepflowError::Other("model unavailable".into()))
        } else {
            Ok(json!({}))
        }
    });
    let err = WorkflowExecutor::new(registry_with(sdk))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap_err();
    match err {
        StepflowError::Workload { step, message } => {
            assert_eq!(step, "B");
            assert_eq!(message, "model unavailable");
        }
        other => panic!("expected workload error, got {other:?}"),
    }
    assert!(ctx.final_state().is_none());
}

#[tokio::test]
async fn step_timeout_fails_the_run() {
    let mut ctx = planned(json!({
        "agent": {},
        "nodes": [{"id": "slow", "type": "sdk", "timeout": 0.05}]
    }));
    let mut reg = WorkloadRegistry::new();
    reg.register_as("sdk", Arc::new(Sleepy));
    let err = WorkflowExecutor::new(reg)
        .execute(&mut ctx, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, StepflowError::Workload { ref step, .. } if step == "slow"), "{err:?}");
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn unregistered_workload_type_fails() {
    let mut ctx = planned(json!({"agent": {}, "nodes": [{"id": "r", "type": "rag"}]}));
    let err = WorkflowExecutor::new(WorkloadRegistry::new())
        .execute(&mut ctx, json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no workload registered for type 'rag'"), "{err}");
}

#[tokio::test]
async fn missing_required_input_is_coercion_error() {
    let mut ctx = planned(review_flow());
    let err = WorkflowExecutor::new(review_registry())
        .execute(&mut ctx, json!({}))
        .await
        .unwrap_err();
    match err {
        StepflowError::Coercion { field, .. } => assert_eq!(field.as_deref(), Some("score")),
        other => panic!("expected coercion error, got {other:?}"),
    }
}

#[tokio::test]
async fn runaway_loop_hits_step_limit() {
    let mut ctx = planned(json!({
        "agent": {},
        "nodes": [{"id": "A", "next": "B"}, {"id": "B", "next": "A"}]
    }));
    let executor = WorkflowExecutor::new(stepflow_pipeline::default_registry()).with_config(ExecutorConfig {
        max_steps: 10,
        ..Default::default()
    });
    let err = executor.execute(&mut ctx, json!({})).await.unwrap_err();
    assert!(matches!(err, StepflowError::StepLimitExceeded { limit: 10 }));
}

// ---------------------------------------------------------------------------
// Sessions, settings, reuse
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkpointed_session_carries_aggregates_between_runs() {
    let definition = json!({
        "agent": {
            "id": "tally",
            "input": {"n": {"value_type": "int"}},
            "output": {
                "total": {"reference": "L_output.aggregation.total", "value_type": "int"},
                "runs": {"reference": "L_output.counter", "value_type": "int"}
            }
        },
        "nodes": [
            {"id": "L", "type": "loop_aggregation", "next": "done",
             "aggregation": {"total": {"reference": "workflow_input.n", "agg_type": "sum"}}},
            {"id": "done"}
        ]
    });
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = WorkflowExecutor::new(stepflow_pipeline::default_registry()).with_config(ExecutorConfig {
        checkpoints: Some(store.clone()),
        session_id: Some("session-1".into()),
        ..Default::default()
    });

    let mut first = planned(definition.clone());
    let out = executor.execute(&mut first, json!({"n": 2})).await.unwrap();
    assert_eq!(out, json!({"total": 2, "runs": 0}));

    let mut second = planned(definition.clone());
    let out = executor.execute(&mut second, json!({"n": "3"})).await.unwrap();
    assert_eq!(out, json!({"total": 5, "runs": 1}));

    // A different workflow never picks up this session's state.
    let mut other_def = definition;
    other_def["agent"]["id"] = json!("other");
    let mut other = planned(other_def);
    let out = executor.execute(&mut other, json!({"n": 4})).await.unwrap();
    assert_eq!(out, json!({"total": 4, "runs": 0}));
}

#[tokio::test]
async fn settings_and_session_reach_the_workload() {
    let mut overrides = IndexMap::new();
    overrides.insert("M".to_string(), json!("large"));
    let mut ctx = parse(
        json!({
            "agent": {"id": "settings-flow", "env": {"MODEL": {"value": "small", "alias": "M"}},
                      "output": "p_output"},
            "nodes": [{"id": "p", "type": "settings"}]
        }),
        &overrides,
    )
    .unwrap();
    ctx.set_session_id("fixed-thread");
    plan(&mut ctx).unwrap();

    let output = WorkflowExecutor::new(registry_with(SettingsReport))
        .execute(&mut ctx, json!({}))
        .await
        .unwrap();
    assert_eq!(
        output,
        json!({"model": "large", "namespace": "settings-flow", "thread": "fixed-thread"})
    );
}

#[tokio::test]
async fn context_can_execute_again_after_success() {
    let mut ctx = planned(json!({
        "agent": {"output": {"echo": {"reference": "p_input.m"}}},
        "nodes": [{"id": "p", "input": {"m": {"reference": "workflow_input.m"}}}]
    }));
    let executor = WorkflowExecutor::new(stepflow_pipeline::default_registry());
    assert_eq!(executor.execute(&mut ctx, json!({"m": "one"})).await.unwrap(), json!({"echo": "one"}));
    let first_run = ctx.run_id().unwrap().to_string();
    assert_eq!(executor.execute(&mut ctx, json!({"m": "two"})).await.unwrap(), json!({"echo": "two"}));
    assert_ne!(ctx.run_id().unwrap(), first_run);

    ctx.finish();
    assert!(executor.execute(&mut ctx, json!({"m": "three"})).await.is_err());
}
