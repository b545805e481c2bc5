use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axon_core::orchestration::{
    default_classify, OrchestrationSpec, OrchestrationStrategy, SpawnSpecialists, SEVERITY_STRATEGY,
};
use axon_core::workflow::RetryPolicy;
use axon_core::{AgentConfig, AxonState, AxonStateInner, FieldSpec, FieldType, OrchestratorRuntime, RuntimeSettings, Signal};
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

fn review_state(task_timeout_ms: u64) -> AxonState {
    let mut settings = RuntimeSettings::default();
    settings.orchestration.task_timeout_ms = task_timeout_ms;
    let state = Arc::new(AxonStateInner::new(settings));

    state
        .topics
        .register(
            "review_request",
            "review.request",
            vec![
                FieldSpec::required("code", FieldType::String),
                FieldSpec::optional("label", FieldType::String),
            ],
        )
        .unwrap();
    state
        .topics
        .register(
            "review_result",
            "review.result",
            vec![FieldSpec::required("agent_id", FieldType::String)],
        )
        .unwrap();
    state
        .topics
        .register(
            "review_summary",
            "review.summary",
            vec![FieldSpec::required("task_id", FieldType::String)],
        )
        .unwrap();

    state
        .actions
        .register_fn("scan_secrets", |_, _| async { Ok(json!({"severity": "high"})) })
        .unwrap();
    state
        .actions
        .register_fn("profile", |_, _| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!({"severity": "low"}))
        })
        .unwrap();
    state
        .actions
        .register_fn("daydream", |_, _| async {
            tokio::time::sleep(Duration::from_millis(600)).await;
            Ok(json!({"severity": "medium"}))
        })
        .unwrap();
    state
}

fn specialist(id: &str, action: &str) -> AgentConfig {
    AgentConfig::specialist(id)
        .with_actions([action])
        .subscribes(["review_request"])
        .emits(["review_result"])
}

fn reviewer(spawn: SpawnSpecialists) -> AgentConfig {
    reviewer_with(OrchestrationSpec {
        spawn_specialists: Some(spawn),
        ..OrchestrationSpec::default()
    })
}

fn reviewer_with(spec: OrchestrationSpec) -> AgentConfig {
    AgentConfig::orchestrator(
        "reviewer",
        OrchestrationSpec {
            aggregation_fn: SEVERITY_STRATEGY.to_string(),
            negotiate_fn: SEVERITY_STRATEGY.to_string(),
            ..spec
        },
    )
    .subscribes(["review_request", "review_result"])
    .emits(["review_summary"])
}

fn review_routes() -> SpawnSpecialists {
    by_label(&[
        ("security", &["sec", "perf"]),
        ("trivial", &[]),
        ("stuck", &["sec", "dreamer"]),
    ])
}

/// Fails the first `failures` classifications of security requests.
struct FlakyClassifier {
    failures: usize,
    calls: AtomicUsize,
}

impl OrchestrationStrategy for FlakyClassifier {
    fn classify(&self, payload: &Value) -> Result<Value, String> {
        if payload["label"] == "security" && self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err("classifier warming up".to_string());
        }
        default_classify(payload)
    }
}

struct BrokenClassifier;

impl OrchestrationStrategy for BrokenClassifier {
    fn classify(&self, _payload: &Value) -> Result<Value, String> {
        Err("classifier offline".to_string())
    }
}

fn by_label(entries: &[(&str, &[&str])]) -> SpawnSpecialists {
    SpawnSpecialists::ByLabel(
        entries
            .iter()
            .map(|(label, ids)| (label.to_string(), ids.iter().map(|s| s.to_string()).collect()))
            .collect(),
    )
}

fn agents() -> Vec<AgentConfig> {
    vec![
        specialist("sec", "scan_secrets"),
        specialist("perf", "profile"),
        specialist("dreamer", "daydream"),
        reviewer(review_routes()),
    ]
}

fn agents_with(spec: OrchestrationSpec) -> Vec<AgentConfig> {
    let mut configs = agents();
    configs.pop();
    configs.push(reviewer_with(OrchestrationSpec {
        spawn_specialists: Some(review_routes()),
        ..spec
    }));
    configs
}

async fn next_summary(summaries: &mut UnboundedReceiverStream<Signal>) -> Signal {
    tokio::time::timeout(Duration::from_secs(2), summaries.next())
        .await
        .expect("summary in time")
        .expect("summary stream open")
}

fn request(label: &str, task_id: &str) -> Signal {
    Signal::new("review.request", json!({"code": "let x = 1;", "label": label}))
        .with_subject(task_id)
        .with_source("tests")
}

#[tokio::test]
async fn test_conflicting_severities_negotiate_to_highest() {
    let runtime = OrchestratorRuntime::new(review_state(5_000));
    runtime.start(agents()).await.unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    bus.publish(request("security", "task-1")).await.unwrap();
    let summary = summaries.next().await.unwrap();
    let data = summary.data();

    assert_eq!(summary.subject(), Some("task-1"));
    assert_eq!(data["task_id"], "task-1");
    assert_eq!(data["severity"], "high");
    assert_eq!(data["result_count"], 2);

    let negotiations = data["metadata"]["negotiations"].as_array().unwrap();
    assert_eq!(negotiations.len(), 1);
    let record = &negotiations[0];
    assert_eq!(record["field"], "severity");
    assert_eq!(record["winner"], "sec");
    let agents: Vec<&str> = record["agents"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(agents.contains(&"sec"));
    assert!(agents.contains(&"perf"));
    assert_eq!(data["metadata"]["timed_out"], false);

    assert_eq!(runtime.active_task_count().await, 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_zero_specialists_summarizes_immediately() {
    let runtime = OrchestratorRuntime::new(review_state(5_000));
    runtime.start(agents()).await.unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    bus.publish(request("trivial", "task-fast")).await.unwrap();
    let summary = tokio::time::timeout(Duration::from_millis(500), summaries.next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.data()["results"], json!([]));
    assert_eq!(summary.data()["severity"], "low");
    let path = summary.data()["metadata"]["decision_path"].as_array().unwrap();
    assert!(path.contains(&json!("fast_path")));
    assert_eq!(runtime.active_task_count().await, 0);

    // nobody was spawned for it
    assert!(runtime.state().agents.lookup("sec").await.is_err());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_specialist_times_out_and_straggler_is_dropped() {
    let runtime = OrchestratorRuntime::new(review_state(150));
    runtime.start(agents()).await.unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();
    let (_id, mut results) = bus.subscribe_stream("review.result").await.unwrap();

    bus.publish(request("stuck", "task-slow")).await.unwrap();
    let summary = summaries.next().await.unwrap();
    let data = summary.data();

    assert_eq!(data["result_count"], 1);
    assert_eq!(data["results"][0]["agent_id"], "sec");
    assert_eq!(data["metadata"]["timed_out"], true);
    assert_eq!(data["metadata"]["missing"], json!(["dreamer"]));
    assert!(data["metadata"]["failed"]
        .as_array()
        .unwrap()
        .contains(&json!("dreamer")));
    assert_eq!(runtime.active_task_count().await, 0);

    // the late result still reaches the bus, but produces no second summary
    let mut late = None;
    while let Some(result) = results.next().await {
        if result.data()["agent_id"] == "dreamer" {
            late = Some(result);
            break;
        }
    }
    assert_eq!(late.unwrap().subject(), Some("task-slow"));
    let again = tokio::time::timeout(Duration::from_millis(300), summaries.next()).await;
    assert!(again.is_err(), "late result must not re-emit a summary");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_set() {
    let runtime = OrchestratorRuntime::new(review_state(5_000));
    runtime.start(agents()).await.unwrap();
    let before = runtime.state().agents.lookup("reviewer").await.unwrap();

    let mut next = agents();
    next.push(specialist("broken", "scan_secrets").subscribes(["no_such_topic"]));
    let err = runtime.reload(next).await.unwrap_err();
    assert_eq!(err.kind(), "configuration");

    let ids: Vec<String> = runtime
        .active_configs()
        .await
        .iter()
        .map(|c| c.id.clone())
        .collect();
    assert_eq!(ids, vec!["sec", "perf", "dreamer", "reviewer"]);
    let after = runtime.state().agents.lookup("reviewer").await.unwrap();
    assert_eq!(before, after);

    // the old set still serves requests
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();
    bus.publish(request("security", "task-after")).await.unwrap();
    assert_eq!(summaries.next().await.unwrap().data()["severity"], "high");
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_reload_from_directory() {
    let runtime = OrchestratorRuntime::new(review_state(5_000));
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("specialists.yaml"),
        r#"
- id: sec
  type: specialist
  actions: [scan_secrets]
  signals: { subscribes: [review_request], emits: [review_result] }
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("reviewer.yml"),
        r#"
id: reviewer
type: orchestrator
signals:
  subscribes: [review_request, review_result]
  emits: [review_summary]
orchestration:
  spawn_specialists: [sec]
  aggregation_fn: severity
"#,
    )
    .unwrap();

    runtime
        .reload_from_dir(&dir.path().to_string_lossy())
        .await
        .unwrap();
    assert_eq!(runtime.active_configs().await.len(), 2);

    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.*").await.unwrap();
    bus.publish(request("anything", "task-dir")).await.unwrap();
    loop {
        let signal = summaries.next().await.unwrap();
        if signal.wire_type() == "review.summary" {
            assert_eq!(signal.data()["severity"], "high");
            break;
        }
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_reload_summarizes_open_tasks_before_replacing_set() {
    let runtime = OrchestratorRuntime::new(review_state(5_000));
    runtime.start(agents()).await.unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    bus.publish(request("stuck", "task-inflight")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.active_task_count().await, 1);

    runtime.reload(agents()).await.unwrap();
    let summary = tokio::time::timeout(Duration::from_millis(1_000), summaries.next())
        .await
        .expect("open task summarized during reload")
        .unwrap();
    let data = summary.data();
    assert_eq!(summary.subject(), Some("task-inflight"));
    assert_eq!(data["results"][0]["agent_id"], "sec");
    assert_eq!(data["metadata"]["timed_out"], true);
    assert_eq!(data["metadata"]["missing"], json!(["dreamer"]));
    let path = data["metadata"]["decision_path"].as_array().unwrap();
    assert!(path.contains(&json!("shutdown")));
    assert_eq!(runtime.active_task_count().await, 0);

    // the new set picks up where the old one left off
    bus.publish(request("security", "task-next")).await.unwrap();
    let next = next_summary(&mut summaries).await;
    assert_eq!(next.subject(), Some("task-next"));
    assert_eq!(next.data()["severity"], "high");
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_summarizes_open_tasks() {
    let runtime = OrchestratorRuntime::new(review_state(5_000));
    runtime.start(agents()).await.unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    bus.publish(request("stuck", "task-left")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await;

    let summary = next_summary(&mut summaries).await;
    assert_eq!(summary.subject(), Some("task-left"));
    assert_eq!(summary.data()["metadata"]["timed_out"], true);
    assert!(runtime.state().agents.is_empty().await);
}

#[tokio::test]
async fn test_flaky_classifier_recovers_without_blocking_other_tasks() {
    let state = review_state(5_000);
    state
        .strategies
        .register(
            "flaky",
            Arc::new(FlakyClassifier {
                failures: 2,
                calls: AtomicUsize::new(0),
            }),
        )
        .unwrap();
    let runtime = OrchestratorRuntime::new(state);
    runtime
        .start(agents_with(OrchestrationSpec {
            classify_fn: "flaky".to_string(),
            classify_retry: RetryPolicy::attempts(3).with_backoff(150, 1.0),
            ..OrchestrationSpec::default()
        }))
        .await
        .unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    bus.publish(request("security", "task-flaky")).await.unwrap();
    bus.publish(request("trivial", "task-quick")).await.unwrap();

    // the retrying classification does not hold up the fast path
    let first = next_summary(&mut summaries).await;
    assert_eq!(first.subject(), Some("task-quick"));
    assert_eq!(first.data()["metadata"]["classify_attempts"], 1);

    let second = next_summary(&mut summaries).await;
    let data = second.data();
    assert_eq!(second.subject(), Some("task-flaky"));
    assert_eq!(data["metadata"]["classify_attempts"], 3);
    assert_eq!(data["severity"], "high");
    assert!(data["metadata"].get("error").is_none());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failing_classifier_summarizes_with_error() {
    let state = review_state(5_000);
    state.strategies.register("broken", Arc::new(BrokenClassifier)).unwrap();
    let runtime = OrchestratorRuntime::new(state);
    runtime
        .start(agents_with(OrchestrationSpec {
            classify_fn: "broken".to_string(),
            classify_retry: RetryPolicy::attempts(2),
            ..OrchestrationSpec::default()
        }))
        .await
        .unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    bus.publish(request("security", "task-unclassified")).await.unwrap();
    let summary = next_summary(&mut summaries).await;
    let metadata = &summary.data()["metadata"];

    assert_eq!(summary.data()["results"], json!([]));
    assert_eq!(metadata["classify_attempts"], 2);
    assert!(metadata["error"].as_str().unwrap().contains("classifier offline"));
    let path = metadata["decision_path"].as_array().unwrap();
    assert!(path.contains(&json!("classify_failed")));
    assert!(runtime.state().agents.lookup("sec").await.is_err());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_orchestrator_timeout_overrides_settings() {
    let runtime = OrchestratorRuntime::new(review_state(60_000));
    runtime
        .start(agents_with(OrchestrationSpec {
            timeout_ms: Some(150),
            ..OrchestrationSpec::default()
        }))
        .await
        .unwrap();
    let bus = runtime.state().event_bus.clone();
    let (_id, mut summaries) = bus.subscribe_stream("review.summary").await.unwrap();

    let started = std::time::Instant::now();
    bus.publish(request("stuck", "task-short")).await.unwrap();
    let summary = next_summary(&mut summaries).await;

    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(summary.data()["metadata"]["timed_out"], true);
    assert_eq!(summary.data()["metadata"]["missing"], json!(["dreamer"]));
    runtime.shutdown().await;
}
