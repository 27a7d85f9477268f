//! End-to-end execution scenarios: routing, parallelism, iteration,
//! failure recovery, approvals, cancellation and crash resume.

use async_trait::async_trait;
use cascade_engine::{
    Engine, ExecutionEvent, ExecutionOptions, ExecutionSnapshot, ExecutionStatus, NodeState,
    TenantContext, fdl,
};
use cascade_gml::{Object, Value};
use cascade_tools::{InvokeContext, ToolError, ToolHandler, ToolMetadata, ToolResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tool that sleeps then answers with its service name.
struct SleepyTool {
    delay: Duration,
}

#[async_trait]
impl ToolHandler for SleepyTool {
    async fn invoke(
        &self,
        service: &str,
        _config: &serde_json::Value,
        _path: &str,
        _args: serde_json::Value,
        _ctx: &InvokeContext,
    ) -> ToolResult<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({ "name": service }))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "sleepy".to_string(),
            description: "test tool".to_string(),
        }
    }
}

/// Tool that always fails with a non-retriable error.
struct BrokenTool;

#[async_trait]
impl ToolHandler for BrokenTool {
    async fn invoke(
        &self,
        _service: &str,
        _config: &serde_json::Value,
        _path: &str,
        _args: serde_json::Value,
        _ctx: &InvokeContext,
    ) -> ToolResult<serde_json::Value> {
        Err(ToolError::Http {
            status: 400,
            message: "boom".to_string(),
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "broken".to_string(),
            description: "test tool".to_string(),
        }
    }
}

fn inputs(pairs: &[(&str, Value)]) -> Object {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

const CLASSIFY_FLOW: &str = r#"
flow:
    name: classify
    node:
        multiply:
            with: in_x * 2
            next: classify
        classify:
            when: multiply > 0
            then: pos
            else: nonpos
        pos:
            with: "'positive'"
        nonpos:
            with: "'non-positive'"
"#;

#[tokio::test]
async fn linear_map_condition_positive_branch() {
    let engine = Engine::new();
    let handle = engine
        .execute_yaml(
            CLASSIFY_FLOW,
            inputs(&[("in_x", Value::Int(3))]),
            TenantContext::new("t1"),
        )
        .unwrap();
    let (result, events) = handle.wait_with_events().await;
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.get("pos"), Some(&Value::string("positive")));
    assert!(result.output.get("nonpos").is_none());

    // The untaken branch is reported skipped.
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::NodeSkipped { node_id, .. } if node_id == "nonpos"
    )));
}

#[tokio::test]
async fn linear_map_condition_negative_branch() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            CLASSIFY_FLOW,
            inputs(&[("in_x", Value::Int(-1))]),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        result.output.get("nonpos"),
        Some(&Value::string("non-positive"))
    );
    assert!(result.output.get("pos").is_none());
}

#[tokio::test]
async fn dependency_order_respected_in_event_stream() {
    let engine = Engine::new();
    let (result, events) = engine
        .execute_yaml(
            r#"
flow:
    name: ordered
    node:
        a:
            with: "1"
            next: b
        b:
            with: a + 1
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait_with_events()
        .await;
    assert_eq!(result.unwrap().status, ExecutionStatus::Completed);

    let complete_a = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::NodeComplete { node_id, .. } if node_id == "a"))
        .unwrap();
    let start_b = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::NodeStart { node_id, .. } if node_id == "b"))
        .unwrap();
    assert!(complete_a < start_b, "a must complete before b starts");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_roots_are_not_serialised() {
    let engine = Engine::new();
    engine.tools().register(
        "api",
        Arc::new(SleepyTool {
            delay: Duration::from_millis(100),
        }),
    );

    let started = Instant::now();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: fan-out
    node:
        a:
            exec: api://svc-a/run
        b:
            exec: api://svc-b/run
        c:
            exec: api://svc-c/run
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(
        result.output.get("a").and_then(|v| v.get("name")),
        Some(&Value::string("svc-a"))
    );
    assert!(
        elapsed < Duration::from_millis(250),
        "three 100ms tools took {:?}; scheduler serialised them",
        elapsed
    );
}

#[tokio::test]
async fn each_collects_iteration_outputs_in_order() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: each-aggregation
    vars: "items = [{price: 10}, {price: 20}, {price: 30}]"
    node:
        prices:
            each: "items => it"
            node:
                pick:
                    with: it.price
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        result.output.get("prices"),
        Some(&Value::array([
            Value::Int(10),
            Value::Int(20),
            Value::Int(30)
        ]))
    );
}

#[tokio::test]
async fn each_sequential_mode_matches_parallel() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: each-seq
    vars: "items = [1, 2, 3, 4]"
    node:
        squared:
            each: "items => n, i"
            mode: sequential
            node:
                sq:
                    with: n * n
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        result.output.get("squared"),
        Some(&Value::array([
            Value::Int(1),
            Value::Int(4),
            Value::Int(9),
            Value::Int(16)
        ]))
    );
}

#[tokio::test]
async fn loop_accumulator_terminates_with_expected_state() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: loop-accumulator
    node:
        summing:
            vars: "i = 0; sum = 0"
            when: "i < 5"
            node:
                step:
                    sets: "sum = sum + i; i = i + 1"
                    with: "null"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    let summing = result.output.get("summing").unwrap();
    assert_eq!(summing.get("sum"), Some(&Value::Int(10)));
    assert_eq!(summing.get("i"), Some(&Value::Int(5)));
}

#[tokio::test]
async fn loop_bound_exceeded_fails_execution() {
    let engine = Engine::new().with_options(ExecutionOptions {
        loop_max_iterations: 25,
        ..ExecutionOptions::default()
    });
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: runaway
    node:
        forever:
            vars: "i = 0"
            when: "true"
            node:
                spin:
                    sets: "i = i + 1"
                    with: "null"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().contains("loop bound exceeded"));
}

#[tokio::test]
async fn fail_edge_recovers_the_execution() {
    let engine = Engine::new();
    engine.tools().register("api", Arc::new(BrokenTool));

    let (result, events) = engine
        .execute_yaml(
            r#"
flow:
    name: fail-edge
    node:
        risky:
            exec: api://billing/charge
            fail: handler
        handler:
            with: "'handled'"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait_with_events()
        .await;
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.get("handler"), Some(&Value::string("handled")));
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::NodeFailed { node_id, .. } if node_id == "risky"
    )));

    // History shows the node as failed-but-handled.
    let snapshot = load_snapshot(&engine, result.execution_id).await;
    let risky = snapshot
        .history
        .iter()
        .find(|r| r.node_id == "risky")
        .unwrap();
    assert_eq!(risky.state, NodeState::FailedHandled);
}

#[tokio::test]
async fn unhandled_tool_failure_fails_the_execution() {
    let engine = Engine::new();
    engine.tools().register("api", Arc::new(BrokenTool));

    let result = engine
        .execute_yaml(
            r#"
flow:
    name: no-handler
    node:
        risky:
            exec: api://billing/charge
            next: after
        after:
            with: "'unreachable'"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error_node.as_deref(), Some("risky"));
    assert!(result.output.get("after").is_none());
}

async fn load_snapshot(engine: &Engine, execution_id: uuid::Uuid) -> ExecutionSnapshot {
    engine
        .persistence()
        .load(execution_id)
        .await
        .unwrap()
        .expect("snapshot persisted")
}

#[tokio::test]
async fn approval_suspends_and_resumes() {
    let engine = Engine::new();
    let mut handle = engine
        .execute_yaml(
            r#"
flow:
    name: approval-flow
    node:
        prepare:
            with: "'ready'"
            next: app
        app:
            approval:
                title: release?
                options:
                    - id: ok
                    - id: no
            then: released
            else: held
        released:
            with: "'released'"
        held:
            with: "'held'"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap();
    let execution_id = handle.execution_id;

    // Wait for the pause, then check the persisted paused snapshot.
    loop {
        match handle.next_event().await.expect("stream open") {
            ExecutionEvent::Paused { node_id, .. } => {
                assert_eq!(node_id, "app");
                break;
            }
            _ => continue,
        }
    }
    let paused = load_snapshot(&engine, execution_id).await;
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert!(paused.invariants_hold());
    assert_eq!(
        engine
            .persistence()
            .list_approvals(execution_id)
            .await
            .unwrap()
            .len(),
        1
    );

    engine.resolve_approval(execution_id, "app", "ok").unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.get("app"), Some(&Value::string("ok")));
    assert_eq!(
        result.output.get("released"),
        Some(&Value::string("released"))
    );
    assert!(result.output.get("held").is_none());

    let final_snapshot = load_snapshot(&engine, execution_id).await;
    assert!(final_snapshot.invariants_hold());
    assert!(
        engine
            .persistence()
            .list_approvals(execution_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn approval_timeout_takes_configured_branch() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: approval-timeout
    node:
        app:
            approval:
                title: expires fast
                options:
                    - id: ok
                timeout: "50"
                timeout_action: reject
            then: released
            else: held
        released:
            with: "'released'"
        held:
            with: "'held'"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.get("held"), Some(&Value::string("held")));
    assert!(result.output.get("released").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_is_bounded_and_stops_dispatch() {
    let engine = Engine::new();
    let handle = engine
        .execute_yaml(
            r#"
flow:
    name: cancellable
    node:
        slow:
            wait: 30s
            next: after
        after:
            with: "'late'"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap();

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let (result, events) = handle.wait_with_events().await;
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));

    // No node may start after the cancelled event.
    let cancelled_at = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::Cancelled { .. }))
        .unwrap();
    assert!(!events[cancelled_at..]
        .iter()
        .any(|e| matches!(e, ExecutionEvent::NodeStart { .. })));
}

#[tokio::test]
async fn execution_timeout_cancels() {
    let engine = Engine::new().with_options(ExecutionOptions {
        timeout: Some(Duration::from_millis(50)),
        ..ExecutionOptions::default()
    });
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: too-slow
    node:
        slow:
            wait: 30s
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn resume_reaches_same_terminal_state() {
    const FLOW: &str = r#"
flow:
    name: resumable
    node:
        a:
            with: value = 7
            next: b
        b:
            with: doubled = a.value * 2
            next: c
        c:
            with: result = b.doubled + 1
"#;
    let flow = fdl::parse_flow(FLOW).unwrap();

    // Uninterrupted run for the expected result.
    let engine = Engine::new();
    let expected = engine
        .execute(flow.clone(), Object::new(), TenantContext::new("t1"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Simulate a crash after node `a`: persist a mid-run snapshot, then
    // resume it on a fresh engine run.
    let crashed = Engine::new();
    let execution_id = uuid::Uuid::new_v4();
    let mut snapshot =
        ExecutionSnapshot::new(execution_id, "resumable", "t1", Value::Null);
    snapshot.status = ExecutionStatus::Running;
    snapshot.completed.insert("a".to_string());
    snapshot.variables.insert(
        "a".to_string(),
        Value::object([("value", Value::Int(7))]),
    );
    snapshot.history.push(cascade_engine::NodeExecutionRecord {
        node_id: "a".to_string(),
        started_at: chrono::Utc::now(),
        ended_at: Some(chrono::Utc::now()),
        state: NodeState::Completed,
        input: Value::Null,
        output: Some(Value::object([("value", Value::Int(7))])),
        error: None,
    });
    crashed.persistence().save(&snapshot).await.unwrap();

    let (resumed, events) = crashed
        .resume(flow, execution_id, TenantContext::new("t1"))
        .await
        .unwrap()
        .wait_with_events()
        .await;
    let resumed = resumed.unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(
        resumed.output.get("c"),
        expected.output.get("c"),
        "resumed run must converge with the uninterrupted one"
    );
    // Node `a` did not run again.
    assert!(!events.iter().any(|e| matches!(
        e,
        ExecutionEvent::NodeStart { node_id, .. } if node_id == "a"
    )));
}

#[tokio::test]
async fn snapshot_invariants_hold_mid_execution() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: many-nodes
    node:
        n1:
            with: "1"
            next: n2
        n2:
            with: "2"
            next: n3
        n3:
            with: "3"
            next: n4
        n4:
            with: "4"
            next: n5
        n5:
            with: "5"
            next: n6
        n6:
            with: "6"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    let snapshot = load_snapshot(&engine, result.execution_id).await;
    assert!(snapshot.invariants_hold());
    assert_eq!(snapshot.completed.len(), 6);
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn guard_blocks_to_else_branch() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: guarded
    vars: "order = { total: 50000 }"
    node:
        check:
            guard:
                types: [custom]
                action: block
                expression: "order.total > 10000"
            then: proceed
            else: reject
        proceed:
            with: "'proceeded'"
        reject:
            with: "'rejected'"
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.get("reject"), Some(&Value::string("rejected")));
    assert!(result.output.get("proceed").is_none());
    assert_eq!(
        result.output.get("check").and_then(|v| v.get("passed")),
        Some(&Value::Bool(false))
    );
}

#[tokio::test]
async fn guard_redacts_and_continues() {
    let engine = Engine::new();
    let result = engine
        .execute_yaml(
            r#"
flow:
    name: redacting
    node:
        scrub:
            guard:
                types: [pii]
                action: redact
            args: "note = 'reach me at ada@example.com'"
            then: use_it
        use_it:
            with: scrub.input.note
"#,
            Object::new(),
            TenantContext::new("t1"),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(
        result.output.get("use_it"),
        Some(&Value::string("reach me at ***"))
    );
}
