use std::{fmt, str::FromStr};

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::ToolError,
    eval::scenario::{CurveTable, ScenarioSpec},
    functions::FunctionDefinition,
    sim::state::{ScenarioState, Severity, TicketStatus},
};

/// Status tier attached to every tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Good,
    Concerning,
    Critical,
    /// Metric without thresholds.
    Info,
    Acknowledged,
    /// Dispatch failed; the recommendation explains how to fix the call.
    Rejected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Good => "good",
            Status::Concerning => "concerning",
            Status::Critical => "critical",
            Status::Info => "info",
            Status::Acknowledged => "acknowledged",
            Status::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action requested by the model. The name stays a string so calls to
/// tools that do not exist can still be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub status: Status,
    pub value: Value,
    pub recommendation: String,
}

impl ToolResult {
    pub fn is_rejected(&self) -> bool {
        self.status == Status::Rejected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    MetricsQuery,
    K8sScale,
    IncidentLog,
    TicketUpdate,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::MetricsQuery,
        ToolKind::K8sScale,
        ToolKind::IncidentLog,
        ToolKind::TicketUpdate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::MetricsQuery => "metrics_query",
            ToolKind::K8sScale => "k8s_scale",
            ToolKind::IncidentLog => "incident_log",
            ToolKind::TicketUpdate => "ticket_update",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::MetricsQuery => {
                "Read the current value of a service metric. Returns value, status (good|concerning|critical|info) and a recommendation."
            }
            ToolKind::K8sScale => {
                "Scale the service deployment to the given replica count. Returns the primary metric after scaling."
            }
            ToolKind::IncidentLog => "Append an entry to the incident log.",
            ToolKind::TicketUpdate => {
                "Update the incident ticket status (open|investigating|in_progress|mitigated|resolved)."
            }
        }
    }

    pub fn definition(&self) -> FunctionDefinition {
        let definition = FunctionDefinition::new(self.name()).with_description(self.description());
        match self {
            ToolKind::MetricsQuery => definition.with_arguments::<MetricsQueryArgs>(),
            ToolKind::K8sScale => definition.with_arguments::<K8sScaleArgs>(),
            ToolKind::IncidentLog => definition.with_arguments::<IncidentLogArgs>(),
            ToolKind::TicketUpdate => definition.with_arguments::<TicketUpdateArgs>(),
        }
    }

    pub fn definitions() -> Vec<FunctionDefinition> {
        Self::ALL.iter().map(ToolKind::definition).collect()
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ToolKind {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if let Some(kind) = Self::ALL.into_iter().find(|kind| kind.name() == name) {
            return Ok(kind);
        }
        let suggestion = Self::ALL
            .iter()
            .map(|kind| (strsim::levenshtein(&name.to_ascii_lowercase(), kind.name()), kind))
            .filter(|(distance, _)| *distance <= 4)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, kind)| kind.name().to_string());
        Err(ToolError::UnknownTool {
            name: name.to_string(),
            suggestion,
        })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MetricsQueryArgs {
    /// Metric to read, e.g. error_rate.
    pub metric_name: String,
    /// Deployment name; defaults to the incident's service.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Lookback window in minutes (1-120).
    #[serde(default)]
    pub minutes: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct K8sScaleArgs {
    /// Desired replica count.
    pub target_replicas: i64,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IncidentLogArgs {
    pub message: String,
    #[serde(default)]
    pub severity: Option<Severity>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TicketUpdateArgs {
    /// One of open, investigating, in_progress, mitigated, resolved.
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

const MAX_WINDOW_MINUTES: u32 = 120;
const DEFAULT_WINDOW_MINUTES: u32 = 5;

/// Read-only scenario data a tool needs next to the state it mutates.
pub struct ToolContext<'a> {
    pub spec: &'a ScenarioSpec,
    pub curves: &'a CurveTable,
}

/// Routes a call to its handler. The state is left untouched on `Err`.
pub fn execute(
    kind: ToolKind,
    ctx: &ToolContext<'_>,
    state: &mut ScenarioState,
    arguments: Value,
) -> Result<ToolResult, ToolError> {
    match kind {
        ToolKind::MetricsQuery => metrics_query(ctx, state, decode(kind, arguments)?),
        ToolKind::K8sScale => k8s_scale(ctx, state, decode(kind, arguments)?),
        ToolKind::IncidentLog => incident_log(ctx, state, decode(kind, arguments)?),
        ToolKind::TicketUpdate => ticket_update(ctx, state, decode(kind, arguments)?),
    }
}

fn decode<T: DeserializeOwned>(kind: ToolKind, arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|err| ToolError::InvalidArguments {
        tool: kind.name().to_string(),
        message: err.to_string(),
    })
}

pub fn metrics_query(
    ctx: &ToolContext<'_>,
    state: &ScenarioState,
    args: MetricsQueryArgs,
) -> Result<ToolResult, ToolError> {
    check_deployment(ctx.spec, ToolKind::MetricsQuery, &args.service, &args.namespace)?;
    let minutes = args.minutes.unwrap_or(DEFAULT_WINDOW_MINUTES);
    if minutes == 0 || minutes > MAX_WINDOW_MINUTES {
        return Err(ToolError::InvalidArguments {
            tool: ToolKind::MetricsQuery.name().to_string(),
            message: format!("minutes must be within 1..={MAX_WINDOW_MINUTES}, got {minutes}"),
        });
    }

    let name = args.metric_name.trim();
    let (metric, value) = ctx
        .spec
        .metrics
        .get(name)
        .zip(state.metric(name))
        .ok_or_else(|| ToolError::UnknownMetric {
            metric: name.to_string(),
            known: ctx.spec.metrics.keys().cloned().collect(),
        })?;

    let status = metric.classify(value);
    let recommendation = recommend(
        ctx.spec.guidance.recommendation(ToolKind::MetricsQuery, status),
        &json!({
            "metric": name,
            "value": format_value(value),
            "replicas": state.replicas(),
            "tier": status.as_str(),
        }),
    );

    Ok(ToolResult {
        tool: ToolKind::MetricsQuery.name().to_string(),
        status,
        value: json!({
            "metric": name,
            "value": value,
            "unit": metric.unit,
            "window_minutes": minutes,
            "replicas": state.replicas(),
        }),
        recommendation,
    })
}

pub fn k8s_scale(
    ctx: &ToolContext<'_>,
    state: &mut ScenarioState,
    args: K8sScaleArgs,
) -> Result<ToolResult, ToolError> {
    check_deployment(ctx.spec, ToolKind::K8sScale, &args.service, &args.namespace)?;
    let max = ctx.spec.max_replicas;
    let replicas = u32::try_from(args.target_replicas)
        .ok()
        .filter(|r| (1..=max).contains(r))
        .ok_or(ToolError::InvalidScaleRequest {
            requested: args.target_replicas,
            max,
        })?;

    // Resolve every new value before touching the state.
    let updates = ctx
        .spec
        .metrics
        .keys()
        .map(|name| {
            ctx.curves
                .value(name, replicas)
                .map(|value| (name.clone(), value))
                .ok_or(ToolError::InvalidScaleRequest {
                    requested: args.target_replicas,
                    max,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let previous = state.replicas();
    state.set_replicas(replicas);
    for (name, value) in &updates {
        state.set_metric(name, *value);
    }

    let primary = &ctx.spec.primary_metric;
    let value = state.metric(primary).unwrap_or_default();
    let status = ctx
        .spec
        .metrics
        .get(primary)
        .map(|metric| metric.classify(value))
        .unwrap_or(Status::Info);
    let recommendation = recommend(
        ctx.spec.guidance.recommendation(ToolKind::K8sScale, status),
        &json!({
            "metric": primary,
            "value": format_value(value),
            "replicas": replicas,
            "tier": status.as_str(),
        }),
    );

    Ok(ToolResult {
        tool: ToolKind::K8sScale.name().to_string(),
        status,
        value: json!({
            "service": ctx.spec.service,
            "namespace": ctx.spec.namespace,
            "previous_replicas": previous,
            "replicas": replicas,
            "metric": primary,
            "value": value,
        }),
        recommendation,
    })
}

pub fn incident_log(
    ctx: &ToolContext<'_>,
    state: &mut ScenarioState,
    args: IncidentLogArgs,
) -> Result<ToolResult, ToolError> {
    let entry = state.append_log(args.severity.unwrap_or_default(), args.message);
    let value = json!({
        "ordinal": entry.ordinal,
        "severity": entry.severity,
        "message": entry.message,
    });
    let recommendation = recommend(
        ctx.spec
            .guidance
            .recommendation(ToolKind::IncidentLog, Status::Acknowledged),
        &json!({ "ordinal": entry.ordinal }),
    );

    Ok(ToolResult {
        tool: ToolKind::IncidentLog.name().to_string(),
        status: Status::Acknowledged,
        value,
        recommendation,
    })
}

pub fn ticket_update(
    ctx: &ToolContext<'_>,
    state: &mut ScenarioState,
    args: TicketUpdateArgs,
) -> Result<ToolResult, ToolError> {
    let status: TicketStatus = args.status.parse()?;
    let unhealthy = if status == TicketStatus::Resolved {
        ctx.spec.unhealthy_metrics(state.metrics())
    } else {
        Vec::new()
    };

    state.set_ticket(status, args.notes);

    let recommendation = match unhealthy.first() {
        Some((metric, tier)) => recommend(
            ctx.spec.guidance.premature_resolution(),
            &json!({
                "metric": metric,
                "tier": tier.as_str(),
                "value": state.metric(metric).map(format_value),
                "status": status.as_str(),
            }),
        ),
        None => recommend(
            ctx.spec
                .guidance
                .recommendation(ToolKind::TicketUpdate, Status::Acknowledged),
            &json!({ "status": status.as_str() }),
        ),
    };

    Ok(ToolResult {
        tool: ToolKind::TicketUpdate.name().to_string(),
        status: Status::Acknowledged,
        value: json!({
            "status": status,
            "notes": state.ticket().notes,
            "premature": !unhealthy.is_empty(),
            "unhealthy_metrics": unhealthy
                .iter()
                .map(|(metric, tier)| json!({ "metric": metric, "status": tier }))
                .collect::<Vec<_>>(),
        }),
        recommendation,
    })
}

/// Observation returned to the model when dispatch fails.
pub fn rejection(tool: &str, error: &ToolError) -> ToolResult {
    let recommendation = match error {
        ToolError::UnknownMetric { known, .. } => {
            format!("Query one of the known metrics: {}.", known.join(", "))
        }
        ToolError::InvalidScaleRequest { max, .. } => {
            format!("Choose a whole number of replicas between 1 and {max}.")
        }
        ToolError::InvalidStatus { .. } => format!(
            "Use one of: {}.",
            TicketStatus::ALL
                .iter()
                .map(TicketStatus::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        ToolError::UnknownTool { suggestion, .. } => {
            let available = ToolKind::ALL
                .iter()
                .map(ToolKind::name)
                .collect::<Vec<_>>()
                .join(", ");
            match suggestion {
                Some(s) => format!("Did you mean {s}? Available tools: {available}."),
                None => format!("Available tools: {available}."),
            }
        }
        ToolError::InvalidArguments { tool, .. } => match tool.parse::<ToolKind>() {
            Ok(kind) => format!(
                "Call it again with arguments matching {}.",
                kind.definition().signature()
            ),
            Err(_) => "Check the argument names and types against the tool schema.".to_string(),
        },
    };

    ToolResult {
        tool: tool.to_string(),
        status: Status::Rejected,
        value: json!({ "error": error.to_string() }),
        recommendation,
    }
}

fn check_deployment(
    spec: &ScenarioSpec,
    tool: ToolKind,
    service: &Option<String>,
    namespace: &Option<String>,
) -> Result<(), ToolError> {
    let service_ok = service.as_deref().map_or(true, |s| s == spec.service);
    let namespace_ok = namespace.as_deref().map_or(true, |n| n == spec.namespace);
    if service_ok && namespace_ok {
        return Ok(());
    }
    Err(ToolError::InvalidArguments {
        tool: tool.name().to_string(),
        message: format!(
            "unknown deployment {}/{}; the affected deployment is {}/{}",
            namespace.as_deref().unwrap_or(&spec.namespace),
            service.as_deref().unwrap_or(&spec.service),
            spec.namespace,
            spec.service
        ),
    })
}

static RENDERER: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb
});

pub fn render_guidance(template: &str, data: &Value) -> Result<String, handlebars::RenderError> {
    RENDERER.render_template(template, data)
}

// Templates are checked when the scenario loads; fall back to the raw text anyway.
fn recommend(template: &str, data: &Value) -> String {
    render_guidance(template, data).unwrap_or_else(|_| template.to_string())
}

fn format_value(value: f64) -> String {
    if value.abs() >= 100.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.4}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::scenario::ScenarioSpec;

    const SPEC: &str = r#"
id: error-spike
user_prompt: Checkout is throwing errors.
service: checkout
namespace: prod
primary_metric: error_rate
initial_replicas: 2
max_replicas: 10
max_steps: 6
metrics:
  error_rate:
    initial: 0.12
    thresholds: { good: 0.02, concerning: 0.05 }
    curve: { kind: inverse_power, floor: 0.006, exponent: 2.0 }
  qps:
    initial: 100.0
    direction: higher_is_better
    curve: { kind: proportional }
"#;

    fn fixture() -> (ScenarioSpec, CurveTable) {
        let spec: ScenarioSpec = serde_yaml::from_str(SPEC).unwrap();
        let curves = spec.tabulate_curves().unwrap();
        (spec, curves)
    }

    fn run(
        spec: &ScenarioSpec,
        curves: &CurveTable,
        state: &mut ScenarioState,
        name: &str,
        args: Value,
    ) -> Result<ToolResult, ToolError> {
        let ctx = ToolContext { spec, curves };
        execute(name.parse()?, &ctx, state, args)
    }

    #[test]
    fn metrics_query_reports_initial_value_and_tier() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let result = run(&spec, &curves, &mut state, "metrics_query", json!({"metric_name": "error_rate"})).unwrap();
        assert_eq!(result.value["value"], json!(0.12));
        assert_eq!(result.status, Status::Critical);
        assert!(result.recommendation.contains("error_rate is critical"));

        let qps = run(&spec, &curves, &mut state, "metrics_query", json!({"metric_name": "qps"})).unwrap();
        assert_eq!(qps.status, Status::Info);
        assert!(qps.recommendation.contains("2 replicas"));
    }

    #[test]
    fn metrics_query_rejects_unknown_metric() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let err = run(&spec, &curves, &mut state, "metrics_query", json!({"metric_name": "cpu"})).unwrap_err();
        assert!(matches!(err, ToolError::UnknownMetric { ref metric, .. } if metric == "cpu"));
    }

    #[test]
    fn metrics_query_checks_window_and_deployment() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let window = run(
            &spec,
            &curves,
            &mut state,
            "metrics_query",
            json!({"metric_name": "error_rate", "minutes": 500}),
        );
        assert!(matches!(window, Err(ToolError::InvalidArguments { .. })));

        let deployment = run(
            &spec,
            &curves,
            &mut state,
            "metrics_query",
            json!({"metric_name": "error_rate", "service": "payments"}),
        );
        assert!(matches!(deployment, Err(ToolError::InvalidArguments { ref message, .. }) if message.contains("prod/checkout")));
    }

    #[test]
    fn scaling_is_monotonic_with_diminishing_returns() {
        let (spec, curves) = fixture();
        let mut previous = f64::INFINITY;
        let mut previous_gain = f64::INFINITY;
        for replicas in 1..=spec.max_replicas {
            let mut state = ScenarioState::from_spec(&spec);
            let result = run(&spec, &curves, &mut state, "k8s_scale", json!({"target_replicas": replicas})).unwrap();
            let value = result.value["value"].as_f64().unwrap();
            assert!(value <= previous, "error rate rose at {replicas} replicas");
            if previous.is_finite() {
                let gain = previous - value;
                assert!(gain <= previous_gain + 1e-12);
                previous_gain = gain;
            }
            previous = value;
        }
    }

    #[test]
    fn partial_scaling_stays_concerning() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let result = run(&spec, &curves, &mut state, "k8s_scale", json!({"target_replicas": 4})).unwrap();
        assert_eq!(result.status, Status::Concerning);
        assert!(result.recommendation.contains("scale further"));

        let result = run(&spec, &curves, &mut state, "k8s_scale", json!({"target_replicas": 6})).unwrap();
        assert_eq!(result.status, Status::Good);
        assert!((state.metric("error_rate").unwrap() - 0.018_667).abs() < 1e-5);
        assert_eq!(state.metric("qps"), Some(300.0));
    }

    #[test]
    fn rejected_scale_leaves_state_unchanged() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let before = state.clone();
        for bad in [json!(0), json!(-3), json!(11)] {
            let err = run(&spec, &curves, &mut state, "k8s_scale", json!({"target_replicas": bad})).unwrap_err();
            assert!(matches!(err, ToolError::InvalidScaleRequest { max: 10, .. }));
        }
        assert_eq!(state, before);
    }

    #[test]
    fn invalid_ticket_status_leaves_state_unchanged() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let before = state.clone();
        let err = run(&spec, &curves, &mut state, "ticket_update", json!({"status": "closed"})).unwrap_err();
        assert_eq!(err, ToolError::InvalidStatus { status: "closed".into() });
        assert_eq!(state, before);
    }

    #[test]
    fn premature_resolution_is_flagged() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let result = run(&spec, &curves, &mut state, "ticket_update", json!({"status": "resolved"})).unwrap();
        assert_eq!(result.value["premature"], json!(true));
        assert!(result.recommendation.contains("error_rate is still critical"));
        assert_eq!(state.ticket().status, TicketStatus::Resolved);

        run(&spec, &curves, &mut state, "k8s_scale", json!({"target_replicas": 6})).unwrap();
        let result = run(&spec, &curves, &mut state, "ticket_update", json!({"status": "resolved", "notes": "scaled"})).unwrap();
        assert_eq!(result.value["premature"], json!(false));
        assert_eq!(result.recommendation, "Ticket status set to resolved.");
        assert_eq!(state.ticket().notes, "scaled");
    }

    #[test]
    fn incident_log_acknowledges_with_ordinal() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let result = run(&spec, &curves, &mut state, "incident_log", json!({"message": "scaling out", "severity": "warning"})).unwrap();
        assert_eq!(result.status, Status::Acknowledged);
        assert_eq!(result.value["ordinal"], json!(1));
        assert_eq!(state.incident_log()[0].severity, Severity::Warning);
    }

    #[test]
    fn unknown_tool_suggests_closest_name() {
        let err = "k8s_scael".parse::<ToolKind>().unwrap_err();
        assert_eq!(
            err,
            ToolError::UnknownTool {
                name: "k8s_scael".into(),
                suggestion: Some("k8s_scale".into())
            }
        );
        let rejected = rejection("k8s_scael", &err);
        assert!(rejected.is_rejected());
        assert!(rejected.recommendation.starts_with("Did you mean k8s_scale?"));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let (spec, curves) = fixture();
        let mut state = ScenarioState::from_spec(&spec);
        let err = run(&spec, &curves, &mut state, "k8s_scale", json!({"replicas": 4})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref tool, .. } if tool == "k8s_scale"));
        let rejected = rejection("k8s_scale", &err);
        assert!(rejected.recommendation.contains("k8s_scale("));
    }
}
