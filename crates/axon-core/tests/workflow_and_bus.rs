use std::sync::{Arc, Mutex};

use axon_core::config::WorkflowSettings;
use axon_core::events::{handler_fn, DispatchMode, DispatchTarget};
use axon_core::workflow::{ActionRegistry, JsonlSnapshotStore, StepStatus};
use axon_core::{EventBus, FieldSpec, FieldType, RuntimeSettings, Signal, TopicRegistry, WorkflowEngine, WorkflowSpec};
use serde_json::{json, Value};

const TRIAGE: &str = r#"
name: triage
steps:
  - id: fetch
    action: fetch
    params: { path: "${input.path}" }
  - id: lint
    action: lint
    requires: [fetch]
    params: "${results.fetch}"
  - id: flaky_report
    action: explode
    requires: [fetch]
    retry: { max_attempts: 3 }
    on_error: continue
  - id: publish
    action: record
    requires: [flaky_report]
  - id: summarize
    action: record
    requires: [lint]
    params: "${workflow.name}: ${results.lint.issues.0}"
outputs:
  issue_count: { step: lint, path: issues, transform: count }
  headline: { step: summarize }
  never: { step: publish }
"#;

fn actions(calls: Arc<Mutex<Vec<String>>>) -> Arc<ActionRegistry> {
    let actions = Arc::new(ActionRegistry::new());
    actions
        .register_fn("fetch", |params, _| async move {
            Ok(json!({"source": format!("contents of {}", params["path"].as_str().unwrap_or("?"))}))
        })
        .unwrap();
    actions
        .register_fn("lint", |params, _| async move {
            let source = params["source"].as_str().unwrap_or_default().to_string();
            Ok(json!({"issues": [format!("long line in {}", source), "unused import"]}))
        })
        .unwrap();
    actions
        .register_fn("explode", |_, _| async { Err("report service unavailable".to_string()) })
        .unwrap();
    let recorded = calls.clone();
    actions
        .register_fn("record", move |params, env| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(env.step_id.clone());
                Ok(params)
            }
        })
        .unwrap();
    actions
}

#[tokio::test]
async fn test_yaml_workflow_runs_with_continue_and_outputs() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::new(actions(calls.clone()), WorkflowSettings::default());
    let spec = WorkflowSpec::from_yaml(TRIAGE).unwrap();

    let execution = engine
        .execute(&spec, json!({"path": "src/main.rs"}), json!({}))
        .await
        .unwrap();

    assert_eq!(execution.outputs["issue_count"], 2);
    assert_eq!(
        execution.outputs["headline"],
        "triage: long line in contents of src/main.rs"
    );
    assert!(!execution.outputs.contains_key("never"));

    let flaky = execution.audit("flaky_report").unwrap();
    assert_eq!(flaky.status, StepStatus::Failed);
    assert_eq!(flaky.attempts, 3);
    assert_eq!(execution.audit("publish").unwrap().status, StepStatus::Skipped);
    assert_eq!(*calls.lock().unwrap(), vec!["summarize".to_string()]);
}

#[tokio::test]
async fn test_jsonl_snapshots_written_per_step() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::new(actions(calls), WorkflowSettings::default())
        .with_persistence(Arc::new(JsonlSnapshotStore::new(dir.path())), "request_id");
    let spec = WorkflowSpec::from_yaml(
        r#"
name: two-steps
steps:
  - { id: fetch, action: fetch, params: { path: "a.rs" } }
  - { id: lint, action: lint, requires: [fetch], params: "${results.fetch}" }
"#,
    )
    .unwrap();

    let missing = engine.execute(&spec, json!({}), json!({})).await.unwrap_err();
    assert_eq!(missing.error.kind(), "configuration");
    assert!(missing.failed_step.is_none());

    let execution = engine
        .execute(&spec, json!({}), json!({"request_id": "req-7"}))
        .await
        .unwrap();

    let mut lines = Vec::new();
    for day in std::fs::read_dir(dir.path()).unwrap() {
        for file in std::fs::read_dir(day.unwrap().path()).unwrap() {
            let content = std::fs::read_to_string(file.unwrap().path()).unwrap();
            lines.extend(content.lines().map(|l| serde_json::from_str::<Value>(l).unwrap()));
        }
    }
    assert_eq!(lines.len(), 4);
    assert!(lines
        .iter()
        .all(|l| l["execution_id"] == execution.execution_id.as_str()));
    assert_eq!(lines[0]["phase"], "before");
    assert_eq!(lines[3]["phase"], "after");
    assert_eq!(lines[3]["correlation_id"], "req-7");
}

#[tokio::test]
async fn test_bus_validates_then_delivers_in_order() {
    let topics = Arc::new(TopicRegistry::new());
    topics
        .register(
            "metric",
            "metric.sample",
            vec![
                FieldSpec::required("seq", FieldType::Integer),
                FieldSpec::optional("unit", FieldType::String)
                    .with_default(json!("ms"))
                    .one_of(["ms", "s"]),
                FieldSpec::optional("value", FieldType::Float),
            ],
        )
        .unwrap();
    let bus = EventBus::new(topics.clone(), RuntimeSettings::default().bus);

    // validation is idempotent
    let once = topics.validate("metric", &json!({"seq": 1, "value": 3})).unwrap();
    let twice = topics.validate("metric", &once).unwrap();
    assert_eq!(once, twice);
    assert_eq!(once["unit"], "ms");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(
        "metric.*",
        DispatchTarget::Handler(handler_fn(move |signal: Signal| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(signal.data()["seq"].as_i64().unwrap_or(-1));
                Ok(())
            }
        })),
        DispatchMode::Async,
    )
    .await
    .unwrap();

    assert!(bus
        .publish(Signal::new("metric.sample", json!({"seq": 0, "unit": "hours"})))
        .await
        .is_err());
    assert!(bus
        .publish(Signal::new("metric.unknown", json!({"seq": 0})))
        .await
        .is_err());

    for seq in 0..50 {
        let report = bus
            .publish(Signal::new("metric.sample", json!({"seq": seq})))
            .await
            .unwrap();
        assert_eq!(report.queued.len(), 1);
    }

    for _ in 0..100 {
        if seen.lock().unwrap().len() == 50 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..50).collect::<Vec<i64>>());
}
