//! End-to-end engine scenarios
//!
//! Exercises the public engine surface: linear and diamond DAGs,
//! condition skips, switch dispatch, bounded forEach, binary response
//! storage, deployment gating, and the dry-run/trace agreement - all
//! against the scripted mock dispatcher (one test drives the real HTTP
//! dispatcher against a wiremock server).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strata::context::TaskStatus;
use strata::dispatch::{Dispatcher, MockDispatcher, MockResponse};
use strata::engine::WorkflowEngine;
use strata::repository::InMemoryRepository;
use strata::EngineConfig;

// ============================================================================
// HELPERS
// ============================================================================

fn engine_with_mock() -> (WorkflowEngine, Arc<MockDispatcher>) {
    let mock = Arc::new(MockDispatcher::echo());
    let engine = WorkflowEngine::new(
        Arc::clone(&mock) as Arc<dyn Dispatcher>,
        Arc::new(InMemoryRepository::new()),
        EngineConfig::testing(),
    );
    (engine, mock)
}

fn register_task(engine: &WorkflowEngine, name: &str, url: &str, method: &str) {
    engine
        .register_task_yaml(&format!(
            r#"
apiVersion: strata.io/v1
kind: WorkflowTask
metadata: {{ name: {name} }}
spec:
  http: {{ url: "{url}", method: {method} }}
"#
        ))
        .unwrap();
}

fn register_workflow(engine: &WorkflowEngine, yaml: &str) -> String {
    let result = engine.register_workflow_yaml(yaml).unwrap();
    assert!(result.is_valid(), "validation failed: {:?}", result.errors);
    result.workflow
}

// ============================================================================
// S1 - LINEAR DAG, SUCCESS
// ============================================================================

#[tokio::test]
async fn s1_linear_dag_success() {
    let (engine, mock) = engine_with_mock();
    register_task(&engine, "echo", "http://t/echo", "POST");

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: linear }
spec:
  input:
    x: { type: integer, required: true }
  tasks:
    - id: a
      taskRef: echo
      input: { value: "{{ input.x }}" }
    - id: b
      taskRef: echo
      dependsOn: [a]
      input: { value: "{{ tasks.a.output.value }}" }
    - id: c
      taskRef: echo
      dependsOn: [b]
      input: { value: "{{ tasks.b.output.value }}" }
  output:
    result: "{{ tasks.c.output.value }}"
"#,
    );

    let report = engine.execute("linear", json!({"x": 1})).await.unwrap();

    assert!(report.success);
    assert_eq!(report.task_details.len(), 3);
    // Output type preservation: the integer is an integer, not "1".
    assert_eq!(report.output, Some(json!({"result": 1})));

    let trace = engine.trace(&report.execution_id).unwrap();
    assert_eq!(
        trace.planned_groups,
        vec![vec!["a"], vec!["b"], vec!["c"]]
    );

    // One HTTP request per step, in dependency order.
    assert_eq!(mock.requests().len(), 3);

    // Causality: A completes before B starts, B before C.
    let detail = |id: &str| {
        report
            .task_details
            .iter()
            .find(|d| d.step_id == id)
            .unwrap()
    };
    assert!(detail("a").completed_at.unwrap() <= detail("b").started_at.unwrap());
    assert!(detail("b").completed_at.unwrap() <= detail("c").started_at.unwrap());
}

// ============================================================================
// S2 - DIAMOND WITH PARALLELISM
// ============================================================================

#[tokio::test]
async fn s2_diamond_parallelism() {
    let (engine, mock) = engine_with_mock();
    register_task(&engine, "fast", "http://t/fast", "POST");
    register_task(&engine, "slow", "http://t/slow", "POST");

    // B and C each take ~500ms.
    for _ in 0..2 {
        mock.enqueue(
            "POST",
            "http://t/slow",
            MockResponse::json(200, json!({"ok": true})).with_delay(Duration::from_millis(500)),
        );
    }

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: diamond }
spec:
  tasks:
    - id: a
      taskRef: fast
      input: { v: "1" }
    - id: b
      taskRef: slow
      dependsOn: [a]
      input: { v: "2" }
    - id: c
      taskRef: slow
      dependsOn: [a]
      input: { v: "3" }
    - id: d
      taskRef: fast
      dependsOn: [b, c]
      input: { v: "4" }
"#,
    );

    let report = engine.execute("diamond", json!({})).await.unwrap();
    assert!(report.success);

    let trace = engine.trace(&report.execution_id).unwrap();
    assert_eq!(
        trace.planned_groups,
        vec![vec!["a"], vec!["b", "c"], vec!["d"]]
    );

    // Actual groups contain a {b, c} group with substantial overlap.
    let group = trace
        .actual_groups
        .iter()
        .find(|g| g.steps.contains(&"b".to_string()) && g.steps.contains(&"c".to_string()))
        .expect("b and c should overlap");
    assert!(
        group.overlap_ms >= 400,
        "overlap was only {}ms",
        group.overlap_ms
    );

    // Level barrier: d started after both b and c completed.
    let detail = |id: &str| {
        report
            .task_details
            .iter()
            .find(|d| d.step_id == id)
            .unwrap()
    };
    assert!(detail("b").completed_at.unwrap() <= detail("d").started_at.unwrap());
    assert!(detail("c").completed_at.unwrap() <= detail("d").started_at.unwrap());
}

// ============================================================================
// S3 - CONDITION SKIPS
// ============================================================================

#[tokio::test]
async fn s3_condition_skip_and_downstream_failure() {
    let (engine, mock) = engine_with_mock();
    register_task(&engine, "charge", "http://t/charge", "POST");
    register_task(&engine, "receipt", "http://t/receipt", "POST");

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: billing }
spec:
  input:
    kind: { type: string, required: true }
  tasks:
    - id: pay
      taskRef: charge
      condition:
        if: '{{ input.kind }} == "free"'
      input: { amount: "10" }
    - id: receipt
      taskRef: receipt
      dependsOn: [pay]
      input: { ref: "{{ tasks.pay.output.amount }}" }
"#,
    );

    // "paid" falsifies the condition: pay is skipped without HTTP...
    let report = engine.execute("billing", json!({"kind": "paid"})).await.unwrap();
    assert!(!report.success);

    let detail = |id: &str| {
        report
            .task_details
            .iter()
            .find(|d| d.step_id == id)
            .unwrap()
    };
    let pay = detail("pay");
    assert_eq!(pay.status, TaskStatus::Skipped);
    assert_eq!(
        pay.skip_reason.as_deref(),
        Some("condition evaluated to false")
    );
    // Skip purity: the skipped step issued no request.
    assert_eq!(mock.hits("http://t/charge"), 0);

    // ...and the downstream reference fails with TemplateUnresolved.
    let receipt = detail("receipt");
    assert_eq!(receipt.status, TaskStatus::Failed);
    assert_eq!(receipt.error_kind.as_deref(), Some("TemplateUnresolved"));
    assert!(receipt
        .error
        .as_ref()
        .unwrap()
        .contains("tasks.pay.output.amount"));
}

// ============================================================================
// S4 - SWITCH DEFAULT
// ============================================================================

#[tokio::test]
async fn s4_switch_without_match_skips_non_fatally() {
    let (engine, _mock) = engine_with_mock();
    register_task(&engine, "route-a", "http://t/a", "POST");
    register_task(&engine, "route-b", "http://t/b", "POST");
    register_task(&engine, "after", "http://t/after", "POST");

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: tiers }
spec:
  input:
    tier: { type: string, required: true }
  tasks:
    - id: route
      taskRef: route-a
      switch:
        value: "{{ input.tier }}"
        cases:
          - { match: gold, taskRef: route-a }
          - { match: silver, taskRef: route-b }
      input: { tier: "{{ input.tier }}" }
    - id: done
      taskRef: after
      input: { ok: "1" }
"#,
    );

    let report = engine.execute("tiers", json!({"tier": "bronze"})).await.unwrap();

    // Execution continues; only the unmatched step is skipped.
    assert!(report.success);
    let route = report
        .task_details
        .iter()
        .find(|d| d.step_id == "route")
        .unwrap();
    assert_eq!(route.status, TaskStatus::Skipped);
    assert_eq!(route.skip_reason.as_deref(), Some("NoCaseMatched"));
    let done = report
        .task_details
        .iter()
        .find(|d| d.step_id == "done")
        .unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
}

// ============================================================================
// S5 - FOREACH BOUNDED PARALLELISM
// ============================================================================

#[tokio::test]
async fn s5_for_each_bounded_parallelism() {
    let (engine, mock) = engine_with_mock();
    register_task(&engine, "notify", "http://t/notify", "POST");

    // Four elements, 60ms each, bounded to 2 at a time: the step cannot
    // finish faster than two sequential waves.
    for _ in 0..4 {
        mock.enqueue(
            "POST",
            "http://t/notify",
            MockResponse::json(200, json!({"sent": true})).with_delay(Duration::from_millis(60)),
        );
    }

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: fanout }
spec:
  input:
    ids: { type: array, required: true }
  tasks:
    - id: fan
      taskRef: notify
      forEach:
        items: "{{ input.ids }}"
        itemVar: id
        maxParallel: 2
      input: { target: "{{ id }}" }
"#,
    );

    let report = engine
        .execute("fanout", json!({"ids": ["a", "b", "c", "d"]}))
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(mock.requests().len(), 4);

    // Four substep rows plus the aggregate.
    let subs: Vec<_> = report
        .task_details
        .iter()
        .filter(|d| d.step_id.starts_with("fan["))
        .collect();
    assert_eq!(subs.len(), 4);
    assert!(subs.iter().all(|d| d.status == TaskStatus::Succeeded));

    let fan = report
        .task_details
        .iter()
        .find(|d| d.step_id == "fan")
        .unwrap();
    assert_eq!(fan.status, TaskStatus::Succeeded);
    // Two waves of two: the bound kept at least one wave waiting.
    assert!(
        fan.duration_ms >= 110,
        "forEach finished too fast for maxParallel=2: {}ms",
        fan.duration_ms
    );
}

// ============================================================================
// S6 - BINARY RESPONSE HYBRID
// ============================================================================

#[tokio::test]
async fn s6_binary_hybrid_storage() {
    let (engine, mock) = engine_with_mock();
    register_task(&engine, "render-pdf", "http://t/pdf", "POST");

    // Testing profile inlines below 1 KiB.
    mock.enqueue(
        "POST",
        "http://t/pdf",
        MockResponse::binary("application/pdf", vec![0x25u8; 300]),
    );
    mock.enqueue(
        "POST",
        "http://t/pdf",
        MockResponse::binary("application/pdf", vec![0x25u8; 64 * 1024]),
    );

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: render }
spec:
  tasks:
    - id: pdf
      taskRef: render-pdf
      input: { doc: "invoice" }
"#,
    );

    // Small body: inlined as base64.
    let report = engine.execute("render", json!({})).await.unwrap();
    let output = report.task_details[0].output.as_ref().unwrap();
    assert_eq!(output["encoding"], json!("base64"));
    assert_eq!(output["content_type"], json!("application/pdf"));
    assert_eq!(output["size_bytes"], json!(300));

    // Large body: spilled to a temp file, deleted once the run settles.
    let report = engine.execute("render", json!({})).await.unwrap();
    let output = report.task_details[0].output.as_ref().unwrap();
    assert_eq!(output["encoding"], json!("file"));
    let path = std::path::PathBuf::from(output["file_path"].as_str().unwrap());
    assert!(
        !path.exists(),
        "temp file should be cleaned up after the run"
    );
}

// ============================================================================
// S7 - CAN-DEPLOY CHAIN
// ============================================================================

#[test]
fn s7_can_deploy_promotion_chain() {
    let (engine, _mock) = engine_with_mock();

    engine.record_deployment("t", "dev", "v1.2").unwrap();
    engine.record_deployment("t", "staging", "v1.2").unwrap();

    assert!(engine.can_deploy("t", "v1.2", "prod").can_deploy);
    assert!(engine.can_deploy("t", "v1.2", "staging").can_deploy);

    let check = engine.can_deploy("t", "v1.3", "staging");
    assert!(!check.can_deploy);
    assert!(check.reason.unwrap().contains("dev"));
}

// ============================================================================
// RETRY ACCOUNTING
// ============================================================================

#[tokio::test]
async fn retry_count_matches_mock_observations() {
    let (engine, mock) = engine_with_mock();
    register_task(&engine, "flaky", "http://t/flaky", "POST");

    mock.enqueue("POST", "http://t/flaky", MockResponse::json(503, json!({})));
    mock.enqueue("POST", "http://t/flaky", MockResponse::json(200, json!({"ok": 1})));

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: retried }
spec:
  tasks:
    - id: s
      taskRef: flaky
      input: { v: "1" }
"#,
    );

    let report = engine.execute("retried", json!({})).await.unwrap();
    assert!(report.success);

    let detail = &report.task_details[0];
    // One failed attempt before success; two requests on the wire.
    assert_eq!(detail.retry_count, 1);
    assert_eq!(mock.hits("http://t/flaky"), 2);
}

// ============================================================================
// DRY RUN = PLAN
// ============================================================================

#[tokio::test]
async fn dry_run_lists_the_same_levels_as_execute() {
    let (engine, _mock) = engine_with_mock();
    register_task(&engine, "echo", "http://t/echo", "POST");

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: planned }
spec:
  input:
    x: { type: integer, required: true }
  tasks:
    - id: a
      taskRef: echo
      input: { v: "{{ input.x }}" }
    - id: b
      taskRef: echo
      dependsOn: [a]
      input: { v: "{{ tasks.a.output.v }}" }
    - id: c
      taskRef: echo
      dependsOn: [a]
      input: { v: "{{ tasks.a.output.v }}" }
"#,
    );

    let dry = engine.dry_run("planned", json!({"x": 5})).unwrap();
    assert!(dry.valid);
    let plan = dry.execution_plan.unwrap();

    let report = engine.execute("planned", json!({"x": 5})).await.unwrap();
    let trace = engine.trace(&report.execution_id).unwrap();

    assert_eq!(plan.parallel_groups, trace.planned_groups);
    // Dry run issued no HTTP beyond the three execution requests.
    assert_eq!(plan.tasks.len(), report.task_details.len());
    // Sample input resolved where possible.
    assert_eq!(plan.tasks[0].resolved_input, json!({"v": 5}));
}

// ============================================================================
// VALIDATION IS PURE
// ============================================================================

#[test]
fn validate_is_idempotent() {
    let (engine, _mock) = engine_with_mock();
    register_task(&engine, "echo", "http://t/echo", "POST");

    let yaml = r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: v }
spec:
  tasks:
    - id: a
      taskRef: echo
      input: { v: "{{ input.missing }}" }
"#;

    let first = engine.validate_yaml(yaml).unwrap();
    let second = engine.validate_yaml(yaml).unwrap();
    assert_eq!(first.errors, second.errors);
    assert_eq!(first.warnings, second.warnings);
    assert!(!first.is_valid());
}

// ============================================================================
// LIVE HTTP DISPATCH (wiremock)
// ============================================================================

#[tokio::test]
async fn http_dispatcher_end_to_end() {
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/u-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "ada", "plan": "pro"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/welcome"))
        .and(body_json(json!({"to": "ada"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sent": true})))
        .mount(&server)
        .await;

    let engine = WorkflowEngine::new(
        strata::dispatch::create_dispatcher("http").unwrap(),
        Arc::new(InMemoryRepository::new()),
        EngineConfig::testing(),
    );
    register_task(
        &engine,
        "get-user",
        &format!("{}/users/{{{{ id }}}}", server.uri()),
        "GET",
    );
    register_task(&engine, "welcome", &format!("{}/welcome", server.uri()), "POST");

    register_workflow(
        &engine,
        r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: onboard }
spec:
  input:
    userId: { type: string, required: true }
  tasks:
    - id: fetch
      taskRef: get-user
      input: { id: "{{ input.userId }}" }
    - id: send
      taskRef: welcome
      dependsOn: [fetch]
      input: { to: "{{ tasks.fetch.output.name }}" }
  output:
    sent: "{{ tasks.send.output.sent }}"
"#,
    );

    let report = engine.execute("onboard", json!({"userId": "u-1"})).await.unwrap();
    assert!(report.success, "error: {:?}", report.error);
    assert_eq!(report.output, Some(json!({"sent": true})));

    let fetch = report
        .task_details
        .iter()
        .find(|d| d.step_id == "fetch")
        .unwrap();
    assert_eq!(
        fetch.resolved_url.as_deref(),
        Some(format!("{}/users/u-1", server.uri()).as_str())
    );
}

// ============================================================================
// LIFECYCLE GATES EXECUTION
// ============================================================================

#[tokio::test]
async fn deprecated_task_blocks_registration() {
    let (engine, _mock) = engine_with_mock();
    register_task(&engine, "old", "http://t/old", "POST");
    engine
        .deprecate("old", chrono::Utc::now() - chrono::Duration::days(1))
        .unwrap();

    let result = engine
        .register_workflow_yaml(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: stale }
spec:
  tasks:
    - id: a
      taskRef: old
      input: { v: "1" }
"#,
        )
        .unwrap();

    assert!(!result.is_valid());
    assert!(engine.workflow("stale").is_none());
}
