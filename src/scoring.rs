use serde::{Deserialize, Serialize};

use crate::{
    error::ToolError,
    eval::scenario::ScenarioSpec,
    sim::{ActionHistory, ScenarioState, Status, TicketStatus, ToolKind},
};

/// Checks a run must pass. Empty lists fall back to the defaults described
/// on [`TechnicalCheck`] and [`AdministrativeCheck`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceCriteria {
    pub technical: Vec<TechnicalCheck>,
    pub administrative: Vec<AdministrativeCheck>,
}

/// Assertions about the simulated system. Default: every thresholded metric
/// is `good`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum TechnicalCheck {
    MetricStatus { metric: String, status: Status },
    MetricAtMost { metric: String, value: f64 },
    MetricAtLeast { metric: String, value: f64 },
    ReplicasAtLeast { replicas: u32 },
}

/// Assertions about the bookkeeping. Default: `resolved_after_recovery`
/// plus `closing_log_entry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum AdministrativeCheck {
    TicketStatus { status: TicketStatus },
    ResolvedAfterRecovery,
    IncidentLogContains { text: String },
    ClosingLogEntry {
        #[serde(default)]
        contains: Option<String>,
    },
}

/// How the driver loop ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Completed { final_answer: String },
    BudgetExceeded { budget: usize },
    ModelError { message: String },
}

impl Termination {
    pub fn label(&self) -> &'static str {
        match self {
            Termination::Completed { .. } => "completed",
            Termination::BudgetExceeded { .. } => "budget_exceeded",
            Termination::ModelError { .. } => "model_error",
        }
    }

    pub fn is_model_error(&self) -> bool {
        matches!(self, Termination::ModelError { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCredit {
    /// No call was rejected for a malformed name or arguments.
    pub tool_syntax_ok: bool,
    /// A `metrics_query` followed a `k8s_scale`.
    pub verification_performed: bool,
    pub incident_logged: bool,
    pub ticket_updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub technical: f64,
    pub ticket: f64,
    pub incident_log: f64,
    pub verification: f64,
    pub syntax: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            technical: 0.60,
            ticket: 0.15,
            incident_log: 0.15,
            verification: 0.05,
            syntax: 0.05,
        }
    }
}

impl ScoreWeights {
    /// Scales the weights to sum to one. All-zero weights fall back to the
    /// defaults.
    pub fn normalized(self) -> Self {
        let total = self.technical + self.ticket + self.incident_log + self.verification + self.syntax;
        if !total.is_finite() || total <= 0.0 {
            return Self::default();
        }
        Self {
            technical: self.technical / total,
            ticket: self.ticket / total,
            incident_log: self.incident_log / total,
            verification: self.verification / total,
            syntax: self.syntax / total,
        }
    }
}

/// Weighted score in percent, with the per-component contributions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    pub total: f64,
    pub technical: f64,
    pub ticket: f64,
    pub incident_log: f64,
    pub verification: f64,
    pub syntax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub scenario_id: String,
    pub technical_success: bool,
    pub administrative_success: bool,
    pub step_count: usize,
    pub technical_failures: Vec<String>,
    pub administrative_failures: Vec<String>,
    pub partial: PartialCredit,
    pub weighted: WeightedScore,
}

impl ScoreResult {
    pub fn full_success(&self) -> bool {
        self.technical_success && self.administrative_success
    }
}

/// Scores a finished run. Pure: the same inputs always give the same result.
pub fn score(
    spec: &ScenarioSpec,
    state: &ScenarioState,
    history: &ActionHistory,
    termination: &Termination,
    weights: ScoreWeights,
) -> ScoreResult {
    let mut technical_failures = technical_failures(spec, state);
    match termination {
        Termination::Completed { .. } => {}
        Termination::BudgetExceeded { budget } => {
            technical_failures.push(format!("step budget of {budget} tool calls exhausted"));
        }
        Termination::ModelError { message } => {
            technical_failures.push(format!("model error: {message}"));
        }
    }
    let administrative_failures = administrative_failures(spec, state, history);
    let partial = partial_credit(history);
    let technical_success = technical_failures.is_empty();

    ScoreResult {
        scenario_id: spec.id.clone(),
        technical_success,
        administrative_success: administrative_failures.is_empty(),
        step_count: history.len(),
        technical_failures,
        administrative_failures,
        partial,
        weighted: weighted_score(technical_success, &partial, weights),
    }
}

fn technical_failures(spec: &ScenarioSpec, state: &ScenarioState) -> Vec<String> {
    let checks = &spec.acceptance.technical;
    if checks.is_empty() {
        return spec
            .unhealthy_metrics(state.metrics())
            .into_iter()
            .map(|(metric, status)| {
                let value = state.metric(&metric).unwrap_or_default();
                format!("{metric} is {status} ({value})")
            })
            .collect();
    }

    let mut failures = Vec::new();
    for check in checks {
        match check {
            TechnicalCheck::MetricStatus { metric, status } => {
                let actual = spec
                    .metrics
                    .get(metric)
                    .zip(state.metric(metric))
                    .map(|(m, v)| m.classify(v));
                match actual {
                    Some(actual) if actual == *status => {}
                    Some(actual) => failures.push(format!("{metric} is {actual}, expected {status}")),
                    None => failures.push(format!("unknown metric {metric}")),
                }
            }
            TechnicalCheck::MetricAtMost { metric, value } => match state.metric(metric) {
                Some(actual) if actual <= *value => {}
                Some(actual) => failures.push(format!("{metric} is {actual}, expected at most {value}")),
                None => failures.push(format!("unknown metric {metric}")),
            },
            TechnicalCheck::MetricAtLeast { metric, value } => match state.metric(metric) {
                Some(actual) if actual >= *value => {}
                Some(actual) => failures.push(format!("{metric} is {actual}, expected at least {value}")),
                None => failures.push(format!("unknown metric {metric}")),
            },
            TechnicalCheck::ReplicasAtLeast { replicas } => {
                if state.replicas() < *replicas {
                    failures.push(format!(
                        "replicas is {}, expected at least {replicas}",
                        state.replicas()
                    ));
                }
            }
        }
    }
    failures
}

/// Step after which the system was healthy for good: `None` if no tracked
/// metric was ever unhealthy, `Some(0)` if only the initial state was.
fn last_unhealthy_step(spec: &ScenarioSpec, history: &ActionHistory) -> Option<usize> {
    let during_run = history
        .iter()
        .filter(|record| !spec.unhealthy_metrics(&record.metrics_after).is_empty())
        .map(|record| record.step)
        .max();
    during_run.or_else(|| {
        let initial = spec.initial_metrics();
        (!spec.unhealthy_metrics(&initial).is_empty()).then_some(0)
    })
}

fn administrative_failures(
    spec: &ScenarioSpec,
    state: &ScenarioState,
    history: &ActionHistory,
) -> Vec<String> {
    let default_checks = [
        AdministrativeCheck::ResolvedAfterRecovery,
        AdministrativeCheck::ClosingLogEntry { contains: None },
    ];
    let checks = if spec.acceptance.administrative.is_empty() {
        &default_checks[..]
    } else {
        &spec.acceptance.administrative[..]
    };

    let recovered_after = last_unhealthy_step(spec, history);
    let healthy_now = spec.unhealthy_metrics(state.metrics()).is_empty();
    let after_recovery = |step: usize| recovered_after.map_or(true, |last| step > last);

    let mut failures = Vec::new();
    for check in checks {
        match check {
            AdministrativeCheck::TicketStatus { status } => {
                let actual = state.ticket().status;
                if actual != *status {
                    failures.push(format!("ticket is {actual}, expected {status}"));
                }
            }
            AdministrativeCheck::ResolvedAfterRecovery => {
                if state.ticket().status != TicketStatus::Resolved {
                    failures.push(format!("ticket is {}, expected resolved", state.ticket().status));
                    continue;
                }
                let last_resolved = history
                    .iter()
                    .filter(|r| r.succeeded() && r.tool() == Some(ToolKind::TicketUpdate))
                    .filter(|r| r.ticket_after.status == TicketStatus::Resolved)
                    .map(|r| r.step)
                    .max();
                match last_resolved {
                    Some(step) if healthy_now && after_recovery(step) => {}
                    Some(step) => failures.push(format!(
                        "ticket resolved at step {step} before the metrics recovered"
                    )),
                    None if state.ticket().status == spec.initial_ticket && recovered_after.is_none() => {}
                    None => failures.push("ticket was never resolved during the run".to_string()),
                }
            }
            AdministrativeCheck::IncidentLogContains { text } => {
                let needle = text.to_lowercase();
                let found = state
                    .incident_log()
                    .iter()
                    .any(|entry| entry.message.to_lowercase().contains(&needle));
                if !found {
                    failures.push(format!("no incident log entry mentions '{text}'"));
                }
            }
            AdministrativeCheck::ClosingLogEntry { contains } => {
                let needle = contains.as_deref().map(str::to_lowercase);
                let closing = history
                    .iter()
                    .filter(|r| r.succeeded() && r.tool() == Some(ToolKind::IncidentLog))
                    .filter(|r| after_recovery(r.step))
                    .any(|r| {
                        let message = r
                            .call
                            .arguments
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or_default()
                            .to_lowercase();
                        needle.as_deref().map_or(true, |n| message.contains(n))
                    });
                if !healthy_now {
                    failures.push("incident is not mitigated, so no closing log entry can count".to_string());
                } else if !closing {
                    failures.push(match contains {
                        Some(text) => format!("no incident log entry mentioning '{text}' after recovery"),
                        None => "no incident log entry recorded after recovery".to_string(),
                    });
                }
            }
        }
    }
    failures
}

fn partial_credit(history: &ActionHistory) -> PartialCredit {
    let succeeded = |kind: ToolKind| {
        history
            .iter()
            .any(|r| r.succeeded() && r.tool() == Some(kind))
    };
    let tool_syntax_ok = !history.iter().any(|r| {
        matches!(
            r.error,
            Some(ToolError::UnknownTool { .. } | ToolError::InvalidArguments { .. })
        )
    });

    let mut scaled = false;
    let mut verification_performed = false;
    for record in history.iter().filter(|r| r.succeeded()) {
        match record.tool() {
            Some(ToolKind::K8sScale) => scaled = true,
            Some(ToolKind::MetricsQuery) if scaled => verification_performed = true,
            _ => {}
        }
    }

    PartialCredit {
        tool_syntax_ok,
        verification_performed,
        incident_logged: succeeded(ToolKind::IncidentLog),
        ticket_updated: succeeded(ToolKind::TicketUpdate),
    }
}

fn weighted_score(technical_success: bool, partial: &PartialCredit, weights: ScoreWeights) -> WeightedScore {
    let w = weights.normalized();
    let part = |earned: bool, weight: f64| if earned { round1(weight * 100.0) } else { 0.0 };
    let technical = part(technical_success, w.technical);
    let ticket = part(partial.ticket_updated, w.ticket);
    let incident_log = part(partial.incident_logged, w.incident_log);
    let verification = part(partial.verification_performed, w.verification);
    let syntax = part(partial.tool_syntax_ok, w.syntax);
    WeightedScore {
        total: round1(technical + ticket + incident_log + verification + syntax),
        technical,
        ticket,
        incident_log,
        verification,
        syntax,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::sim::{ScenarioRuntime, ToolCall};

    const ERROR_SPIKE: &str = r#"
id: error-spike
user_prompt: Checkout is throwing errors.
primary_metric: error_rate
initial_replicas: 2
max_replicas: 10
max_steps: 6
metrics:
  error_rate:
    initial: 0.12
    thresholds: { good: 0.02, concerning: 0.05 }
    curve: { kind: inverse_power, floor: 0.006, exponent: 2.0 }
"#;

    fn spec(yaml: &str) -> Arc<ScenarioSpec> {
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn play(spec: &Arc<ScenarioSpec>, calls: &[(&str, serde_json::Value)]) -> ScoreResult {
        let mut rt = ScenarioRuntime::new(spec.clone()).unwrap();
        for (name, args) in calls {
            rt.apply(ToolCall::new(*name, args.clone())).unwrap();
        }
        let (state, history) = rt.into_parts();
        let done = Termination::Completed {
            final_answer: "done".into(),
        };
        score(spec, &state, &history, &done, ScoreWeights::default())
    }

    #[test]
    fn scale_then_resolve_and_log_succeeds() {
        let spec = spec(ERROR_SPIKE);
        let result = play(
            &spec,
            &[
                ("metrics_query", json!({"metric_name": "error_rate"})),
                ("k8s_scale", json!({"target_replicas": 6})),
                ("metrics_query", json!({"metric_name": "error_rate"})),
                ("ticket_update", json!({"status": "resolved"})),
                ("incident_log", json!({"message": "scaled to 6 replicas, closed"})),
            ],
        );
        assert!(result.technical_success, "{:?}", result.technical_failures);
        assert!(result.administrative_success, "{:?}", result.administrative_failures);
        assert_eq!(result.step_count, 5);
        assert!(result.partial.verification_performed);
        assert_eq!(result.weighted.total, 100.0);
    }

    #[test]
    fn premature_resolution_fails_both() {
        let spec = spec(ERROR_SPIKE);
        let result = play(
            &spec,
            &[
                ("ticket_update", json!({"status": "resolved"})),
                ("incident_log", json!({"message": "closed"})),
            ],
        );
        assert!(!result.technical_success);
        assert!(!result.administrative_success);
        assert!(result.technical_failures[0].starts_with("error_rate is critical"));
        assert_eq!(result.weighted.total, 35.0);
    }

    #[test]
    fn resolving_before_scaling_is_not_rescued_by_later_fix() {
        let spec = spec(ERROR_SPIKE);
        let result = play(
            &spec,
            &[
                ("ticket_update", json!({"status": "resolved"})),
                ("k8s_scale", json!({"target_replicas": 6})),
                ("incident_log", json!({"message": "closed"})),
            ],
        );
        assert!(result.technical_success);
        assert!(!result.administrative_success);
        assert!(result.administrative_failures[0].contains("before the metrics recovered"));
    }

    #[test]
    fn partial_scaling_is_not_technical_success() {
        let spec = spec(ERROR_SPIKE);
        let result = play(&spec, &[("k8s_scale", json!({"target_replicas": 4}))]);
        assert!(!result.technical_success);
        assert_eq!(result.technical_failures.len(), 1);
        assert!(result.technical_failures[0].contains("concerning"));
    }

    #[test]
    fn budget_exhaustion_forces_technical_failure() {
        let spec = spec(ERROR_SPIKE);
        let mut rt = ScenarioRuntime::new(spec.clone()).unwrap();
        rt.apply(ToolCall::new("k8s_scale", json!({"target_replicas": 8})))
            .unwrap();
        let (state, history) = rt.into_parts();
        let result = score(
            &spec,
            &state,
            &history,
            &Termination::BudgetExceeded { budget: 6 },
            ScoreWeights::default(),
        );
        assert!(!result.technical_success);
        assert!(result.technical_failures[0].contains("budget"));
    }

    #[test]
    fn rejected_arguments_cost_syntax_credit() {
        let spec = spec(ERROR_SPIKE);
        let result = play(
            &spec,
            &[
                ("k8s_scale", json!({"replicas": 6})),
                ("k8s_scale", json!({"target_replicas": 6})),
            ],
        );
        assert!(!result.partial.tool_syntax_ok);
        assert!(result.technical_success);
        assert_eq!(result.weighted.syntax, 0.0);
    }

    #[test]
    fn custom_checks_replace_defaults() {
        let yaml = format!(
            "{ERROR_SPIKE}acceptance:\n  technical:\n    - {{ check: replicas_at_least, replicas: 5 }}\n  administrative:\n    - {{ check: ticket_status, status: mitigated }}\n    - {{ check: incident_log_contains, text: ROLLBACK }}\n"
        );
        let spec = spec(&yaml);
        let result = play(
            &spec,
            &[
                ("k8s_scale", json!({"target_replicas": 5})),
                ("ticket_update", json!({"status": "mitigated"})),
                ("incident_log", json!({"message": "Rollback not needed"})),
            ],
        );
        assert!(result.technical_success, "{:?}", result.technical_failures);
        assert!(result.administrative_success, "{:?}", result.administrative_failures);
    }

    #[test]
    fn scoring_twice_gives_identical_results() {
        let spec = spec(ERROR_SPIKE);
        let mut rt = ScenarioRuntime::new(spec.clone()).unwrap();
        rt.apply(ToolCall::new("k8s_scale", json!({"target_replicas": 5})))
            .unwrap();
        rt.apply(ToolCall::new("ticket_update", json!({"status": "resolved"})))
            .unwrap();
        let (state, history) = rt.into_parts();
        let done = Termination::Completed {
            final_answer: "ok".into(),
        };
        let first = score(&spec, &state, &history, &done, ScoreWeights::default());
        let second = score(&spec, &state, &history, &done, ScoreWeights::default());
        assert_eq!(first, second);
    }

    #[test]
    fn weights_are_normalized() {
        let w = ScoreWeights {
            technical: 6.0,
            ticket: 1.5,
            incident_log: 1.5,
            verification: 0.5,
            syntax: 0.5,
        }
        .normalized();
        assert!((w.technical - 0.6).abs() < 1e-12);
        let zero = ScoreWeights {
            technical: 0.0,
            ticket: 0.0,
            incident_log: 0.0,
            verification: 0.0,
            syntax: 0.0,
        };
        assert_eq!(zero.normalized(), ScoreWeights::default());
    }
}
