use std::sync::Arc;

use opsbench::{
    load_scenarios,
    providers::scripted::ScriptedProvider,
    score, DriverOptions, EvalConfig, EvalRunner, ModelDriver, PromptSet, ScenarioSpec,
    ScoreWeights, Status, Termination, Variant,
};

fn scenario(id: &str) -> Arc<ScenarioSpec> {
    let scenarios = load_scenarios(concat!(env!("CARGO_MANIFEST_DIR"), "/data/scenarios"))
        .expect("shipped scenarios should load");
    let spec = scenarios
        .into_iter()
        .find(|s| s.id == id)
        .expect("scenario present");
    Arc::new(spec)
}

async fn drive(spec: Arc<ScenarioSpec>, replies: &[&str]) -> opsbench::ScoreResult {
    let provider = Arc::new(ScriptedProvider::from_texts(replies.iter().copied()));
    let driver = ModelDriver::new(provider, Arc::new(PromptSet::default()), DriverOptions::default());
    let run = driver.run(spec.clone(), Variant::Improved).await.expect("run completes");
    score(&spec, &run.state, &run.history, &run.termination, ScoreWeights::default())
}

#[tokio::test]
async fn error_spike_scale_resolve_and_log_succeeds() {
    let result = drive(
        scenario("error-spike"),
        &[
            r#"{"tool_call": {"name": "k8s_scale", "arguments": {"target_replicas": 6}}}"#,
            r#"{"tool_call": {"name": "ticket_update", "arguments": {"status": "resolved"}}}"#,
            r#"{"tool_call": {"name": "incident_log", "arguments": {"message": "closed"}}}"#,
            r#"{"final_answer": "scaled to 6 replicas"}"#,
        ],
    )
    .await;
    assert!(result.technical_success, "{:?}", result.technical_failures);
    assert!(result.administrative_success, "{:?}", result.administrative_failures);
    assert_eq!(result.step_count, 3);
}

#[tokio::test]
async fn error_spike_immediate_resolution_fails_both_verdicts() {
    let result = drive(
        scenario("error-spike"),
        &[
            r#"{"tool_call": {"name": "ticket_update", "arguments": {"status": "resolved"}}}"#,
            r#"{"final_answer": "ticket closed"}"#,
        ],
    )
    .await;
    assert!(!result.technical_success);
    assert!(!result.administrative_success);
}

#[tokio::test]
async fn first_query_reports_configured_initial_values() {
    for id in ["error-spike", "latency-regression", "throughput-saturation"] {
        let spec = scenario(id);
        let mut runtime = opsbench::ScenarioRuntime::new(spec.clone()).unwrap();
        let result = runtime
            .apply(opsbench::ToolCall::new(
                "metrics_query",
                serde_json::json!({ "metric_name": spec.primary_metric }),
            ))
            .unwrap();
        let initial = spec.metrics[&spec.primary_metric].initial;
        assert_eq!(result.value["value"].as_f64(), Some(initial), "{id}");
        assert_eq!(result.status, Status::Critical, "{id}");
    }
}

#[tokio::test]
async fn ground_truth_batch_writes_a_clean_report() {
    let scenarios = load_scenarios(concat!(env!("CARGO_MANIFEST_DIR"), "/data/scenarios")).unwrap();
    let count = scenarios.len();
    let report = EvalRunner::new(EvalConfig::new(scenarios).with_concurrency(2)).run().await;

    assert_eq!(report.cases.len(), count);
    assert_eq!(report.model_error_count(), 0);
    let summary = &report.summaries[0];
    assert_eq!(summary.full_passed, count);
    assert!((summary.average_score - 100.0).abs() < 1e-9);

    let markdown = report.render_markdown();
    assert!(markdown.contains("| ground-truth | ground-truth |"));
    for case in &report.cases {
        assert!(matches!(case.termination, Some(Termination::Completed { .. })));
    }
}
